//! Scheduler Simulation Configuration
//!
//! One file holds the cell, the UEs admitted at start-up and the traffic and
//! feedback model of the simulated PHY. YAML and TOML are both accepted.

use anyhow::{anyhow, Context};
use common::types::{Bandwidth, Pci, Rnti};
use common::utils::calculate_nrb;
use layers::mac::{MacConfig, UeSchedConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GnbConfig {
    /// MAC scheduler configuration
    pub mac: MacConfig,
    /// Channel bandwidth in MHz; derives the carrier size when set
    #[serde(rename = "channel_bandwidth_MHz", default)]
    pub channel_bandwidth_mhz: Option<u32>,
    /// UEs admitted at start-up
    #[serde(default)]
    pub ues: Vec<UeEntry>,
    /// Traffic and feedback model
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// A UE admitted at start-up
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UeEntry {
    /// C-RNTI
    pub rnti: u16,
    /// Scheduling configuration
    pub config: UeSchedConfig,
}

impl UeEntry {
    pub fn rnti(&self) -> Rnti {
        Rnti::new(self.rnti)
    }
}

/// Synthetic traffic and channel model
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Probability that a transmission is acknowledged
    #[serde(default = "default_ack_probability")]
    pub ack_probability: f64,
    /// Probability that a downlink DCI is missed (reported as DTX)
    #[serde(default)]
    pub dtx_probability: f64,
    /// Downlink bytes added to every UE buffer per refill
    #[serde(default = "default_dl_bytes")]
    pub dl_bytes: u32,
    /// Uplink bytes reported per refill
    #[serde(default = "default_ul_bytes")]
    pub ul_bytes: u32,
    /// Slots between buffer refills
    #[serde(default = "default_refill_period")]
    pub refill_period_slots: u32,
    /// Slots between synthetic PRACH detections, 0 disables random access
    #[serde(default)]
    pub rach_period_slots: u32,
}

fn default_ack_probability() -> f64 {
    0.9
}

fn default_dl_bytes() -> u32 {
    2000
}

fn default_ul_bytes() -> u32 {
    500
}

fn default_refill_period() -> u32 {
    10
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ack_probability: default_ack_probability(),
            dtx_probability: 0.0,
            dl_bytes: default_dl_bytes(),
            ul_bytes: default_ul_bytes(),
            refill_period_slots: default_refill_period(),
            rach_period_slots: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GnbConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        let config: GnbConfig = serde_yaml::from_str(contents)?;
        config.finish()
    }

    /// Load configuration from TOML file
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: GnbConfig = toml::from_str(contents)?;
        config.finish()
    }

    /// Load by file extension: `.toml` is TOML, anything else YAML
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            _ => Self::from_yaml_file(path),
        }
    }

    // Derive the carrier size from the channel bandwidth and check the model
    fn finish(mut self) -> anyhow::Result<Self> {
        let pci = self.mac.cell.pci.0;
        Pci::new(pci).ok_or_else(|| anyhow!("Invalid PCI: {}", pci))?;

        if let Some(mhz) = self.channel_bandwidth_mhz {
            let bandwidth = Bandwidth::from_mhz(mhz).ok_or_else(|| anyhow!("Invalid bandwidth: {} MHz", mhz))?;
            let scs_khz = self.mac.cell.scs as u16;
            self.mac.cell.carrier_rbs = calculate_nrb(bandwidth.as_hz(), scs_khz);
        }

        let sim = &self.simulation;
        for (name, p) in [("ack_probability", sim.ack_probability), ("dtx_probability", sim.dtx_probability)] {
            if !(0.0..=1.0).contains(&p) {
                return Err(anyhow!("{} {} outside [0, 1]", name, p));
            }
        }
        Ok(self)
    }
}
