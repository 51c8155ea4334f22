//! Board topology for C.H.I.P.-style boards
//!
//! Maps the silkscreen line names to kernel GPIO numbers. The CSI header
//! lines sit at a fixed offset; the XIO lines live on a PCF8574A expander
//! whose base depends on the kernel, so we look for the chip's label in
//! sysfs first and fall back to a per-kernel table.

use crate::error::{GpioError, Result};
use crate::pin::{SysfsPin, DEFAULT_SYSFS_ROOT};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_PROC_VERSION: &str = "/proc/version";

/// Label the XIO expander registers under `gpiochip*/label`
pub const EXPANDER_LABEL: &str = "pcf8574a";

const CSI_BASE: u32 = 132;
const LINES_PER_HEADER: u8 = 8;

/// Which header a line is broken out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Header {
    Csi,
    Xio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PinName {
    Csi0,
    Csi1,
    Csi2,
    Csi3,
    Csi4,
    Csi5,
    Csi6,
    Csi7,
    Xio0,
    Xio1,
    Xio2,
    Xio3,
    Xio4,
    Xio5,
    Xio6,
    Xio7,
}

impl PinName {
    pub const ALL: [PinName; 16] = [
        PinName::Csi0,
        PinName::Csi1,
        PinName::Csi2,
        PinName::Csi3,
        PinName::Csi4,
        PinName::Csi5,
        PinName::Csi6,
        PinName::Csi7,
        PinName::Xio0,
        PinName::Xio1,
        PinName::Xio2,
        PinName::Xio3,
        PinName::Xio4,
        PinName::Xio5,
        PinName::Xio6,
        PinName::Xio7,
    ];

    /// Line `index` of `header`, if the header has that many lines.
    pub fn new(header: Header, index: u8) -> Option<Self> {
        if index >= LINES_PER_HEADER {
            return None;
        }
        let offset = match header {
            Header::Csi => 0,
            Header::Xio => LINES_PER_HEADER,
        };
        Some(PinName::ALL[usize::from(offset + index)])
    }

    pub fn header(&self) -> Header {
        if (*self as u8) < LINES_PER_HEADER {
            Header::Csi
        } else {
            Header::Xio
        }
    }

    /// Position on its header, 0..8.
    pub fn index(&self) -> u8 {
        *self as u8 % LINES_PER_HEADER
    }
}

impl fmt::Display for PinName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.header() {
            Header::Csi => "CSI",
            Header::Xio => "XIO",
        };
        write!(f, "{}{}", prefix, self.index())
    }
}

impl FromStr for PinName {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self> {
        let unknown = || GpioError::Configuration(format!("unknown pin name {:?}", s));
        let upper = s.trim().to_ascii_uppercase();
        let (prefix, index) = match (upper.get(..3), upper.get(3..)) {
            (Some(prefix), Some(index)) => (prefix, index),
            _ => return Err(unknown()),
        };
        let header = match prefix {
            "CSI" => Header::Csi,
            "XIO" => Header::Xio,
            _ => return Err(unknown()),
        };
        index
            .parse()
            .ok()
            .and_then(|i| PinName::new(header, i))
            .ok_or_else(unknown)
    }
}

impl TryFrom<String> for PinName {
    type Error = GpioError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PinName> for String {
    fn from(name: PinName) -> String {
        name.to_string()
    }
}

/// Kernel builds the board ships with; they number the expander differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelVersion {
    V4_3,
    V4_4,
}

impl KernelVersion {
    /// XIO base used by this kernel when the expander can't be found in sysfs.
    pub fn xio_base(&self) -> u32 {
        match self {
            KernelVersion::V4_3 => 408,
            KernelVersion::V4_4 => 1016,
        }
    }

    /// Parse a `/proc/version` line. Only the vendor (`-ntc`) builds are
    /// recognised; custom kernels number things however they like.
    pub fn parse(version: &str) -> Result<Self> {
        let re = Regex::new(r"Linux version ([0-9]+)\.([0-9]+).+-ntc")
            .map_err(|e| GpioError::Configuration(e.to_string()))?;
        let caps = re.captures(version).ok_or_else(|| {
            GpioError::Configuration("unable to parse kernel version string".to_string())
        })?;
        match (&caps[1], &caps[2]) {
            ("4", "3") => Ok(KernelVersion::V4_3),
            ("4", "4") => Ok(KernelVersion::V4_4),
            (major, minor) => Err(GpioError::Configuration(format!(
                "unrecognized kernel version {}.{}",
                major, minor
            ))),
        }
    }

    /// Read the running kernel's version, defaulting to 4.4 when it can't be
    /// determined.
    pub fn detect(proc_version: &Path) -> Self {
        let default = KernelVersion::V4_4;
        let parsed = fs::read_to_string(proc_version)
            .map_err(GpioError::io(format!("reading {}", proc_version.display())))
            .and_then(|v| KernelVersion::parse(&v));
        match parsed {
            Ok(version) => version,
            Err(e) => {
                warn!(
                    "Unable to read version from {} ({}); using {:?} as default",
                    proc_version.display(),
                    e,
                    default
                );
                default
            }
        }
    }
}

/// Where to look for board information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub sysfs_root: PathBuf,
    pub proc_version: PathBuf,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            proc_version: PathBuf::from(DEFAULT_PROC_VERSION),
        }
    }
}

/// Resolved line numbering for one board.
#[derive(Debug, Clone)]
pub struct Board {
    sysfs_root: PathBuf,
    csi_base: u32,
    xio_base: u32,
}

impl Board {
    pub fn detect(config: &BoardConfig) -> Result<Self> {
        let xio_base = match find_expander_base(&config.sysfs_root, EXPANDER_LABEL)? {
            Some(base) => {
                debug!("Found {} expander at base {}", EXPANDER_LABEL, base);
                base
            }
            None => {
                let version = KernelVersion::detect(&config.proc_version);
                debug!(
                    "No {} expander label under {}, using {:?} table",
                    EXPANDER_LABEL,
                    config.sysfs_root.display(),
                    version
                );
                version.xio_base()
            }
        };

        info!("Board detected: CSI base {}, XIO base {}", CSI_BASE, xio_base);
        Ok(Board {
            sysfs_root: config.sysfs_root.clone(),
            csi_base: CSI_BASE,
            xio_base,
        })
    }

    pub fn xio_base(&self) -> u32 {
        self.xio_base
    }

    /// Kernel GPIO number for a named line.
    pub fn line(&self, name: PinName) -> u32 {
        let base = match name.header() {
            Header::Csi => self.csi_base,
            Header::Xio => self.xio_base,
        };
        base + u32::from(name.index())
    }

    pub fn pin(&self, name: PinName) -> SysfsPin {
        SysfsPin::with_root(&self.sysfs_root, self.line(name), name.to_string())
    }

    pub fn pins(&self) -> Vec<(PinName, SysfsPin)> {
        PinName::ALL.iter().map(|n| (*n, self.pin(*n))).collect()
    }
}

/// Scan `<root>/gpiochip*/label` for `label`, returning that chip's `base`.
fn find_expander_base(root: &Path, label: &str) -> Result<Option<u32>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Unable to scan {}: {}", root.display(), e);
            return Ok(None);
        }
    };

    for entry in entries.flatten() {
        let chip = entry.path();
        let is_chip = chip
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with("gpiochip"));
        if !is_chip {
            continue;
        }

        let chip_label = match fs::read_to_string(chip.join("label")) {
            Ok(l) => l,
            Err(_) => continue,
        };
        if chip_label.trim() != label {
            continue;
        }

        let base_path = chip.join("base");
        let base = fs::read_to_string(&base_path)
            .map_err(GpioError::io(format!("reading {}", base_path.display())))?;
        let base = base.trim().parse::<u32>().map_err(|e| {
            GpioError::invalid_data(format!("parsing {}", base_path.display()), e.to_string())
        })?;
        return Ok(Some(base));
    }

    Ok(None)
}
