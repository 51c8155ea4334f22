use crate::board::{BoardConfig, PinName};
use crate::hardware::BusConfig;
use crate::pin::Edge;
use crate::soft::SoftSpiConfig;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/chip-gpio/config.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub spi: Option<SpiConfig>,
    #[serde(default)]
    pub interrupts: Vec<InterruptMapping>,
}

/// Exactly one of `hardware` or `soft` selects the transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpiConfig {
    #[serde(default)]
    pub hardware: Option<BusConfig>,
    #[serde(default)]
    pub soft: Option<SoftSpiConfig>,
    /// Words sent once at start-up (and on every reload)
    #[serde(default)]
    pub startup_words: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptMapping {
    pub pin: PinName,
    #[serde(default)]
    pub edge: Edge,
    #[serde(default)]
    pub active_low: bool,
    /// Shell command run for every edge
    pub command: Option<String>,
    /// Kill the command after this many seconds
    pub timeout_secs: Option<u64>,
    pub description: Option<String>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).context("Failed to parse configuration file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(spi) = &self.spi {
            match (&spi.hardware, &spi.soft) {
                (Some(_), Some(_)) => bail!("spi: configure either `hardware` or `soft`, not both"),
                (None, None) => bail!("spi: one of `hardware` or `soft` is required"),
                _ => {}
            }
        }

        let mut seen = Vec::new();
        for mapping in &self.interrupts {
            if seen.contains(&mapping.pin) {
                bail!("interrupts: pin {} is listed more than once", mapping.pin);
            }
            seen.push(mapping.pin);
        }
        Ok(())
    }
}
