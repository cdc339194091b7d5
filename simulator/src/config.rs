//! Scenario Configuration
//!
//! YAML or TOML scenario files, selected by file extension. Every field has
//! a default so a scenario only lists what it changes.

use anyhow::{anyhow, Context};
use common::types::{CellId, SubcarrierSpacing, TddPattern};
use layers::mac::{
    ArbiterConfig, BroadcastConfig, BwpConfig, BwpSpan, MacConfig, PrachConfigurationIndex, RachConfigCommon,
    SearchSpaceSet,
};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main scenario structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimConfig {
    /// Cell configuration
    #[serde(default)]
    pub cell: CellConfig,
    /// Bandwidth parts
    #[serde(default = "default_bwps")]
    pub bwps: Vec<BwpConfig>,
    /// PRACH configuration
    #[serde(default)]
    pub prach: PrachConfig,
    /// RAR and Msg3 resources
    #[serde(default)]
    pub rar: ArbiterConfig,
    /// Terminal population and run length
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            cell: CellConfig::default(),
            bwps: default_bwps(),
            prach: PrachConfig::default(),
            rar: ArbiterConfig::default(),
            simulation: SimulationConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Cell configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CellConfig {
    #[serde(default = "default_cell_id")]
    pub cell_id: u16,
    /// Common subcarrier spacing in kHz
    #[serde(default = "default_common_scs")]
    pub common_scs: u32,
    /// Carrier width in resource blocks
    #[serde(default = "default_carrier_rbs")]
    pub carrier_rbs: u16,
    /// TDD slot pattern, e.g. "DL|DL|S|UL|UL"
    #[serde(default = "default_tdd_pattern")]
    pub tdd_pattern: String,
    /// Look-ahead window of the resource grid in slots
    #[serde(default = "default_window_slots")]
    pub window_slots: usize,
    /// PUCCH symbols at the end of uplink slots
    #[serde(default = "default_uplink_control_symbols")]
    pub uplink_control_symbols: u8,
    /// SS/PBCH block placement
    #[serde(default)]
    pub ssb: BroadcastConfig,
}

fn default_cell_id() -> u16 {
    1
}

fn default_common_scs() -> u32 {
    30
}

fn default_carrier_rbs() -> u16 {
    106 // 40 MHz at 30 kHz
}

fn default_tdd_pattern() -> String {
    "DL|DL|S|UL|UL".to_string()
}

fn default_window_slots() -> usize {
    160
}

fn default_uplink_control_symbols() -> u8 {
    1
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            cell_id: default_cell_id(),
            common_scs: default_common_scs(),
            carrier_rbs: default_carrier_rbs(),
            tdd_pattern: default_tdd_pattern(),
            window_slots: default_window_slots(),
            uplink_control_symbols: default_uplink_control_symbols(),
            ssb: BroadcastConfig::default(),
        }
    }
}

fn default_bwps() -> Vec<BwpConfig> {
    vec![BwpConfig { id: 0, span: BwpSpan::Cumulative { num_rbs: 51 }, coreset_symbols: 2 }]
}

/// PRACH configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PrachConfig {
    #[serde(flatten)]
    pub rach: RachConfigCommon,
    /// Rows added to or replacing the built-in configuration table
    #[serde(default)]
    pub custom_rows: Vec<CustomPrachRow>,
}

/// PRACH table row keyed by its configuration index
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CustomPrachRow {
    pub index: u8,
    #[serde(flatten)]
    pub row: PrachConfigurationIndex,
}

/// Terminal population and run length
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Seed of every random choice in the run
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Number of terminals
    #[serde(default = "default_num_ues")]
    pub num_ues: usize,
    /// Terminals using a dedicated preamble; the rest contend
    #[serde(default)]
    pub contention_free_ues: usize,
    /// Terminals start uniformly within this many milliseconds
    #[serde(default = "default_arrival_spread_ms")]
    pub arrival_spread_ms: u64,
    /// Simulated time
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Probability that a preamble is not detected
    #[serde(default)]
    pub preamble_loss_probability: f64,
    /// Time a terminal stays admitted after random access
    #[serde(default = "default_connected_hold_ms")]
    pub connected_hold_ms: u64,
    /// Search space of admitted terminals
    #[serde(default = "default_search_space")]
    pub search_space: SearchSpaceSet,
    /// Aggregation level of admitted terminals' PDCCH
    #[serde(default = "default_aggregation_level")]
    pub aggregation_level: u8,
}

fn default_seed() -> u64 {
    1
}

fn default_num_ues() -> usize {
    20
}

fn default_arrival_spread_ms() -> u64 {
    100
}

fn default_duration_ms() -> u64 {
    1000
}

fn default_connected_hold_ms() -> u64 {
    50
}

fn default_search_space() -> SearchSpaceSet {
    SearchSpaceSet { slot_periodicity: 4, slot_offset: 0, duration: 1 }
}

fn default_aggregation_level() -> u8 {
    2
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            num_ues: default_num_ues(),
            contention_free_ues: 0,
            arrival_spread_ms: default_arrival_spread_ms(),
            duration_ms: default_duration_ms(),
            preamble_loss_probability: 0.0,
            connected_hold_ms: default_connected_hold_ms(),
            search_space: default_search_space(),
            aggregation_level: default_aggregation_level(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Default filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl SimConfig {
    /// Load a scenario from a `.yaml`/`.yml` or `.toml` file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
        let extension = Path::new(path).extension().and_then(|ext| ext.to_str()).unwrap_or("");
        let config = match extension {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "toml" => toml::from_str(&contents)?,
            other => return Err(anyhow!("Unsupported configuration format: '{}'", other)),
        };
        Ok(config)
    }

    pub fn numerology(&self) -> anyhow::Result<u8> {
        Ok(self.subcarrier_spacing()?.numerology())
    }

    fn subcarrier_spacing(&self) -> anyhow::Result<SubcarrierSpacing> {
        SubcarrierSpacing::from_u32(self.cell.common_scs)
            .ok_or_else(|| anyhow!("Invalid subcarrier spacing: {} kHz", self.cell.common_scs))
    }

    /// Check ranges the library does not see
    pub fn validate(&self) -> anyhow::Result<()> {
        let sim = &self.simulation;
        if !(0.0..=1.0).contains(&sim.preamble_loss_probability) {
            return Err(anyhow!("Preamble loss probability {} not in [0, 1]", sim.preamble_loss_probability));
        }
        if sim.contention_free_ues > sim.num_ues {
            return Err(anyhow!(
                "{} contention-free terminals out of {}",
                sim.contention_free_ues,
                sim.num_ues
            ));
        }
        if sim.contention_free_ues > 0 && self.prach.rach.cb_preambles_per_occasion >= self.prach.rach.total_num_ra_preambles {
            return Err(anyhow!("Contention-free terminals need preambles outside the contention-based set"));
        }
        if sim.duration_ms == 0 {
            return Err(anyhow!("Simulation duration must be positive"));
        }
        SearchSpaceSet::new(sim.search_space.slot_periodicity, sim.search_space.slot_offset, sim.search_space.duration)?;
        Ok(())
    }

    /// MAC configuration of the simulated cell
    pub fn mac_config(&self) -> anyhow::Result<MacConfig> {
        let tdd_pattern: TddPattern = self
            .cell
            .tdd_pattern
            .parse()
            .with_context(|| format!("TDD pattern '{}'", self.cell.tdd_pattern))?;
        let prach = self
            .prach
            .custom_rows
            .iter()
            .find(|custom| custom.index == self.prach.rach.prach_config_index)
            .map(|custom| custom.row.clone());

        Ok(MacConfig {
            cell_id: CellId(self.cell.cell_id),
            scs: self.subcarrier_spacing()?,
            carrier_rbs: self.cell.carrier_rbs,
            tdd_pattern,
            window_slots: self.cell.window_slots,
            broadcast: self.cell.ssb,
            uplink_control_symbols: self.cell.uplink_control_symbols,
            bwps: self.bwps.clone(),
            rach: self.prach.rach.clone(),
            prach,
            arbiter: self.rar,
        })
    }
}
