//! GPIO pin access through the sysfs class interface
//!
//! Every attribute of a line (`direction`, `value`, `edge`, `active_low`) is a
//! plain file under `/sys/class/gpio/gpio<N>/`. The SPI engines and the
//! interrupt dispatcher only see the `PinDevice` trait, so tests can swap in
//! a recording pin.

use crate::error::{GpioError, Result};
use log::debug;
use regex::Regex;
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Input => "in",
            Direction::Output => "out",
        }
    }
}

impl FromStr for Direction {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "in" => Ok(Direction::Input),
            "out" => Ok(Direction::Output),
            other => Err(GpioError::invalid_data(
                "parsing direction",
                format!("unexpected direction {:?}", other),
            )),
        }
    }
}

/// Which transitions of an input line raise an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    None,
    Rising,
    Falling,
    #[default]
    Both,
}

impl Edge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Edge::None => "none",
            Edge::Rising => "rising",
            Edge::Falling => "falling",
            Edge::Both => "both",
        }
    }
}

impl FromStr for Edge {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "none" => Ok(Edge::None),
            "rising" => Ok(Edge::Rising),
            "falling" => Ok(Edge::Falling),
            "both" => Ok(Edge::Both),
            other => Err(GpioError::invalid_data(
                "parsing edge",
                format!("unexpected edge {:?}", other),
            )),
        }
    }
}

/// Something the interrupt dispatcher can block on with `poll(2)`.
pub trait EdgeSource: Send {
    fn raw_fd(&self) -> RawFd;

    /// Events that mean "the line changed". Sysfs value files report
    /// transitions as exceptional conditions.
    fn poll_events(&self) -> libc::c_short {
        libc::POLLPRI | libc::POLLERR
    }

    /// Read the current value, trailing newline stripped.
    fn read_value(&mut self) -> Result<String>;
}

/// Capability contract for a single GPIO line.
pub trait PinDevice {
    /// Kernel line number
    fn number(&self) -> u32;

    /// Board name of the line, e.g. `XIO3`
    fn name(&self) -> &str;

    fn exists(&self) -> bool;
    fn export(&self) -> Result<()>;
    fn unexport(&self) -> Result<()>;

    fn direction(&self) -> Result<Direction>;
    fn set_direction(&self, direction: Direction) -> Result<()>;

    fn value(&self) -> Result<u8>;
    fn set_value(&self, value: u8) -> Result<()>;

    fn edge(&self) -> Result<Edge>;
    fn set_edge(&self, edge: Edge) -> Result<()>;

    fn active_low(&self) -> Result<bool>;
    fn set_active_low(&self, active_low: bool) -> Result<()>;

    /// Open the line's value source for edge waiting.
    fn open_edge_source(&self) -> Result<Box<dyn EdgeSource>>;
}

/// A GPIO line exposed under a sysfs root.
#[derive(Debug, Clone)]
pub struct SysfsPin {
    number: u32,
    name: String,
    root: PathBuf,
    base_path: PathBuf,
}

impl SysfsPin {
    pub fn new(number: u32, name: impl Into<String>) -> Self {
        Self::with_root(DEFAULT_SYSFS_ROOT, number, name)
    }

    /// Build a pin under a custom sysfs root (useful for tests and chroots).
    pub fn with_root(root: impl AsRef<Path>, number: u32, name: impl Into<String>) -> Self {
        let root = root.as_ref().to_path_buf();
        let base_path = root.join(format!("gpio{}", number));
        SysfsPin {
            number,
            name: name.into(),
            root,
            base_path,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn attribute(&self, attr: &str) -> PathBuf {
        self.base_path.join(attr)
    }

    fn read_attribute(&self, attr: &str) -> Result<String> {
        let path = self.attribute(attr);
        fs::read_to_string(&path).map_err(GpioError::io(format!("reading {}", path.display())))
    }

    fn write_attribute(&self, attr: &str, value: &str) -> Result<()> {
        let path = self.attribute(attr);
        debug!("{}: {} <- {}", self.name, attr, value);
        fs::write(&path, value).map_err(GpioError::io(format!("writing {}", path.display())))
    }

    fn write_control(&self, file: &str) -> Result<()> {
        let path = self.root.join(file);
        fs::write(&path, self.number.to_string())
            .map_err(GpioError::io(format!("writing {}", path.display())))
    }

    fn ensure_available(&self) -> Result<()> {
        if self.exists() {
            Ok(())
        } else {
            Err(GpioError::Precondition(format!(
                "pin {} (gpio{}) is not currently available",
                self.name, self.number
            )))
        }
    }
}

/// Pull the first run of digits out of a value file; anything else reads as 0.
fn parse_value(raw: &str) -> u8 {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    let re = DIGITS.get_or_init(|| Regex::new(r"([0-9]+)").expect("static regex"));
    re.captures(raw)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .unwrap_or(0)
}

impl PinDevice for SysfsPin {
    fn number(&self) -> u32 {
        self.number
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> bool {
        self.base_path.exists()
    }

    fn export(&self) -> Result<()> {
        debug!("Exporting gpio{} ({})", self.number, self.name);
        self.write_control("export")
    }

    fn unexport(&self) -> Result<()> {
        debug!("Unexporting gpio{} ({})", self.number, self.name);
        self.write_control("unexport")
    }

    fn direction(&self) -> Result<Direction> {
        self.read_attribute("direction")?.parse()
    }

    fn set_direction(&self, direction: Direction) -> Result<()> {
        self.write_attribute("direction", direction.as_str())
    }

    fn value(&self) -> Result<u8> {
        self.ensure_available()?;
        Ok(parse_value(&self.read_attribute("value")?))
    }

    fn set_value(&self, value: u8) -> Result<()> {
        self.ensure_available()?;
        self.write_attribute("value", &value.to_string())
    }

    fn edge(&self) -> Result<Edge> {
        self.read_attribute("edge")?.parse()
    }

    fn set_edge(&self, edge: Edge) -> Result<()> {
        self.write_attribute("edge", edge.as_str())
    }

    fn active_low(&self) -> Result<bool> {
        Ok(parse_value(&self.read_attribute("active_low")?) != 0)
    }

    fn set_active_low(&self, active_low: bool) -> Result<()> {
        self.write_attribute("active_low", if active_low { "1" } else { "0" })
    }

    fn open_edge_source(&self) -> Result<Box<dyn EdgeSource>> {
        let path = self.attribute("value");
        let file =
            File::open(&path).map_err(GpioError::io(format!("opening {}", path.display())))?;
        Ok(Box::new(SysfsEdgeSource { file, path }))
    }
}

impl fmt::Display for SysfsPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (gpio{})", self.name, self.number)
    }
}

/// An open `value` file. The kernel flags it with `POLLPRI` on every
/// configured edge, and it must be re-read from offset 0 to clear the flag.
pub struct SysfsEdgeSource {
    file: File,
    path: PathBuf,
}

impl EdgeSource for SysfsEdgeSource {
    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn read_value(&mut self) -> Result<String> {
        let context = format!("reading {}", self.path.display());
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(GpioError::io(context.clone()))?;
        let mut value = String::new();
        self.file
            .read_to_string(&mut value)
            .map_err(GpioError::io(context))?;
        Ok(value.trim_end_matches('\n').to_string())
    }
}
