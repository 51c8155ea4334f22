//! chip-gpio - SPI and GPIO edge interrupts for C.H.I.P.-class boards
//!
//! This library drives an SPI bus either through the kernel `spidev`
//! controller or by bit-banging sysfs GPIO lines, and delivers edge
//! notifications from GPIO inputs to callbacks without busy-polling.

pub mod board;
pub mod command;
pub mod config;
pub mod daemon;
pub mod error;
pub mod hardware;
pub mod interrupt;
pub mod packer;
pub mod pin;
pub mod soft;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use board::{Board, PinName};
pub use error::{GpioError, Result};
pub use hardware::{BusConfig, HardwareSpi};
pub use interrupt::InterruptDispatcher;
pub use pin::{Direction, Edge, PinDevice, SysfsPin};
pub use soft::SoftSpi;
