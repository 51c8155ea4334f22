//! Error types for bus transfers, pin access and interrupt dispatch.

use std::io;
use thiserror::Error;

/// Errors reported by the SPI engines, pin devices and the interrupt dispatcher.
#[derive(Error, Debug)]
pub enum GpioError {
    /// Invalid construction arguments or a device that could not be opened
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single transfer was asked to move more bytes than one chunk allows
    #[error("Chunk of {len} bytes exceeds the {max} byte transfer limit")]
    Size { len: usize, max: usize },

    /// The pin is in the wrong direction or state for the operation
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Underlying file or ioctl failure
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The operation needs a pin that was not configured
    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl GpioError {
    /// Returns a closure that wraps an `io::Error` with what we were doing.
    ///
    /// Meant for `map_err`: `file.read(..).map_err(GpioError::io("reading value"))?`
    pub fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> GpioError {
        let context = context.into();
        move |source| GpioError::Io { context, source }
    }

    /// Builds an `Io` error for file contents we could not make sense of.
    pub fn invalid_data(context: impl Into<String>, detail: impl Into<String>) -> GpioError {
        GpioError::Io {
            context: context.into(),
            source: io::Error::new(io::ErrorKind::InvalidData, detail.into()),
        }
    }
}

/// Convenient Result type for this crate.
pub type Result<T> = std::result::Result<T, GpioError>;
