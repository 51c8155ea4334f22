//! Hardware SPI through the kernel `spidev` interface
//!
//! Configuration and data exchange both go through ioctls on the character
//! device. Words are packed into bytes, split into chunks of at most
//! `MAX_CHUNK_BYTES`, and each chunk is one full-duplex `SPI_IOC_MESSAGE(1)`.

use crate::error::{GpioError, Result};
use crate::packer::{self, MAX_CHUNK_BYTES};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub const DEFAULT_DEVICE: &str = "/dev/spidev32766.0";
pub const DEFAULT_SPEED_HZ: u32 = 1_000_000;

// Request codes from linux/spi/spidev.h
pub const SPI_IOC_RD_MODE: u32 = 0x8001_6b01;
pub const SPI_IOC_WR_MODE: u32 = 0x4001_6b01;
pub const SPI_IOC_RD_LSB_FIRST: u32 = 0x8001_6b02;
pub const SPI_IOC_WR_LSB_FIRST: u32 = 0x4001_6b02;
pub const SPI_IOC_RD_MAX_SPEED_HZ: u32 = 0x8004_6b04;
pub const SPI_IOC_WR_MAX_SPEED_HZ: u32 = 0x4004_6b04;
/// Carries exactly one `SpiIocTransfer`
pub const SPI_IOC_MESSAGE_1: u32 = 0x4020_6b00;

pub const SPI_CPHA: u8 = 0x01;
pub const SPI_CPOL: u8 = 0x02;

/// Bus settings fixed for the lifetime of an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub device: PathBuf,
    pub polarity: u8,
    pub phase: u8,
    pub word_size: u8,
    pub lsb_first: bool,
    pub speed_hz: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            polarity: 0,
            phase: 0,
            word_size: 8,
            lsb_first: false,
            speed_hz: DEFAULT_SPEED_HZ,
        }
    }
}

impl BusConfig {
    /// Controller mode byte: CPHA in bit 0, CPOL in bit 1.
    pub fn mode(&self) -> u8 {
        let mut mode = 0;
        if self.phase == 1 {
            mode |= SPI_CPHA;
        }
        if self.polarity == 1 {
            mode |= SPI_CPOL;
        }
        mode
    }

    fn validate(&self) -> Result<()> {
        if self.polarity > 1 {
            return Err(GpioError::Configuration(
                "polarity must be either 0 or 1".to_string(),
            ));
        }
        if self.phase > 1 {
            return Err(GpioError::Configuration(
                "phase must be either 0 or 1".to_string(),
            ));
        }
        // Nibble alignment is left to the caller; odd nibbles are dropped.
        if !(1..=32).contains(&self.word_size) {
            return Err(GpioError::Configuration(format!(
                "word size must be between 1 and 32, got {}",
                self.word_size
            )));
        }
        Ok(())
    }
}

/// The kernel's `struct spi_ioc_transfer`. Layout must match bit for bit.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SpiIocTransfer {
    pub tx_buf: u64,
    pub rx_buf: u64,
    pub len: u32,
    pub speed_hz: u32,
    pub delay_usecs: u16,
    pub bits_per_word: u8,
    pub cs_change: u8,
    pub tx_nbits: u8,
    pub rx_nbits: u8,
    pub pad: u16,
}

impl SpiIocTransfer {
    /// Describe one exchange of `tx.len()` bytes. `rx` must be the same length.
    pub fn new(tx: &[u8], rx: &mut [u8], speed_hz: u32) -> Self {
        debug_assert_eq!(tx.len(), rx.len());
        SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: tx.len() as u32,
            speed_hz,
            delay_usecs: 0,
            bits_per_word: 8,
            cs_change: 0,
            tx_nbits: 0,
            rx_nbits: 0,
            pad: 0,
        }
    }
}

/// What the engine needs from a controller.
pub trait SpiTransport {
    fn write_mode(&mut self, mode: u8) -> Result<()>;
    fn write_lsb_first(&mut self, lsb_first: bool) -> Result<()>;
    fn write_max_speed_hz(&mut self, speed_hz: u32) -> Result<()>;

    /// Clock out `tx` while clocking `rx.len() == tx.len()` bytes in.
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8], speed_hz: u32) -> Result<()>;

    /// Human readable name of the underlying device.
    fn describe(&self) -> String;
}

/// An open `/dev/spidevB.C` node.
#[derive(Debug)]
pub struct Spidev {
    file: File,
    path: PathBuf,
}

impl Spidev {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Spidev { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ioctl<T>(&self, request: u32, arg: &mut T, what: &str) -> Result<()> {
        // SAFETY: `arg` is live for the call and its type is the one encoded
        // in `request`.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg as *mut T) };
        if ret < 0 {
            return Err(GpioError::io(format!(
                "{} on {}",
                what,
                self.path.display()
            ))(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn write_u8(&self, request: u32, value: u8, what: &str) -> Result<()> {
        let mut value = value;
        self.ioctl(request, &mut value, what)
    }

    fn read_u8(&self, request: u32, what: &str) -> Result<u8> {
        let mut value = 0u8;
        self.ioctl(request, &mut value, what)?;
        Ok(value)
    }

    fn write_u32(&self, request: u32, value: u32, what: &str) -> Result<()> {
        let mut value = value;
        self.ioctl(request, &mut value, what)
    }

    fn read_u32(&self, request: u32, what: &str) -> Result<u32> {
        let mut value = 0u32;
        self.ioctl(request, &mut value, what)?;
        Ok(value)
    }

    pub fn read_mode(&self) -> Result<u8> {
        self.read_u8(SPI_IOC_RD_MODE, "reading SPI mode")
    }

    pub fn read_lsb_first(&self) -> Result<bool> {
        Ok(self.read_u8(SPI_IOC_RD_LSB_FIRST, "reading LSB-first flag")? != 0)
    }

    pub fn read_max_speed_hz(&self) -> Result<u32> {
        self.read_u32(SPI_IOC_RD_MAX_SPEED_HZ, "reading max speed")
    }
}

impl SpiTransport for Spidev {
    fn write_mode(&mut self, mode: u8) -> Result<()> {
        self.write_u8(SPI_IOC_WR_MODE, mode, "setting SPI mode")
    }

    fn write_lsb_first(&mut self, lsb_first: bool) -> Result<()> {
        self.write_u8(
            SPI_IOC_WR_LSB_FIRST,
            u8::from(lsb_first),
            "setting LSB-first flag",
        )
    }

    fn write_max_speed_hz(&mut self, speed_hz: u32) -> Result<()> {
        self.write_u32(SPI_IOC_WR_MAX_SPEED_HZ, speed_hz, "setting max speed")
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8], speed_hz: u32) -> Result<()> {
        let mut transfer = SpiIocTransfer::new(tx, rx, speed_hz);
        self.ioctl(SPI_IOC_MESSAGE_1, &mut transfer, "transferring SPI message")
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Word-oriented engine on top of a byte-oriented SPI controller.
///
/// Not synchronised: one caller at a time.
pub struct HardwareSpi<T: SpiTransport = Spidev> {
    transport: T,
    config: BusConfig,
}

impl HardwareSpi<Spidev> {
    /// Open the configured device and program mode, bit order and speed.
    pub fn configure(config: BusConfig) -> Result<Self> {
        let spidev = Spidev::open(&config.device).map_err(|e| {
            GpioError::Configuration(format!(
                "failed to open SPI device {}: {}",
                config.device.display(),
                e
            ))
        })?;
        Self::with_transport(config, spidev)
    }
}

impl<T: SpiTransport> HardwareSpi<T> {
    pub fn with_transport(config: BusConfig, mut transport: T) -> Result<Self> {
        config.validate()?;

        transport.write_mode(config.mode())?;
        transport.write_lsb_first(config.lsb_first)?;
        transport.write_max_speed_hz(config.speed_hz)?;

        let spi = HardwareSpi { transport, config };
        info!("Configured {}", spi);
        Ok(spi)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn mode(&self) -> u8 {
        self.config.mode()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// One full-duplex exchange of at most `MAX_CHUNK_BYTES` bytes.
    pub fn transfer_chunk(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() > MAX_CHUNK_BYTES {
            return Err(GpioError::Size {
                len: bytes.len(),
                max: MAX_CHUNK_BYTES,
            });
        }

        let mut rx = vec![0u8; bytes.len()];
        debug!("SPI exchange of {} bytes: {:02x?}", bytes.len(), bytes);
        self.transport
            .exchange(bytes, &mut rx, self.config.speed_hz)?;
        Ok(rx)
    }

    /// Pack `words`, send them chunk by chunk and return every byte received,
    /// in order. Received bytes are not reassembled into words.
    pub fn transfer(&mut self, words: &[u32]) -> Result<Vec<u8>> {
        let bytes = packer::pack_words(words, self.config.word_size);
        debug!(
            "Transferring {} words as {} bytes",
            words.len(),
            bytes.len()
        );

        let mut received = Vec::with_capacity(bytes.len());
        for chunk in packer::chunks(&bytes) {
            received.extend(self.transfer_chunk(chunk)?);
        }
        Ok(received)
    }

    /// Release the device.
    pub fn close(self) {
        debug!("Closing {}", self.transport.describe());
    }
}

impl<T: SpiTransport> fmt::Display for HardwareSpi<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HardwareSpi(mode={} device={} word_size={} lsb_first={})",
            self.config.mode(),
            self.transport.describe(),
            self.config.word_size,
            self.config.lsb_first
        )
    }
}
