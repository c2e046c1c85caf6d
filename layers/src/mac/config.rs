//! Scheduler configuration snapshots
//!
//! Cell and UE configuration consumed by the scheduler. These are built by
//! the configuration collaborator and applied only between slots.

use super::beam::BeamConfig;
use super::link_adaptation::LinkAdaptationConfig;
use super::tbs::McsTable;
use bitflags::bitflags;
use common::types::{CellId, CyclicPrefix, Pci, SubcarrierSpacing};
use serde::{Deserialize, Serialize};

/// Number of aggregation levels (1, 2, 4, 8, 16)
pub const NUM_AGGREGATION_LEVELS: usize = 5;

bitflags! {
    /// DCI formats monitored in a search space
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DciFormats: u8 {
        /// Fallback formats 0_0 and 1_0
        const FALLBACK = 0b01;
        /// Non-fallback formats 0_1 and 1_1
        const NON_FALLBACK = 0b10;
    }
}

/// Bandwidth part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BwpConfig {
    /// BWP id (0 = initial BWP)
    #[serde(default)]
    pub id: u8,
    /// First common RB of the BWP
    pub start_rb: u16,
    /// Number of RBs
    pub num_rbs: u16,
    /// Subcarrier spacing
    pub scs: SubcarrierSpacing,
    /// Cyclic prefix
    #[serde(default)]
    pub cyclic_prefix: CyclicPrefix,
}

/// CCE-to-REG mapping of a CORESET
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CceRegMapping {
    NonInterleaved,
    Interleaved {
        /// REG bundle size L (2, 3 or 6)
        reg_bundle_size: u8,
        /// Interleaver size R (2, 3 or 6)
        interleaver_size: u8,
        /// Shift index n_shift (0-274)
        shift_index: u16,
    },
}

/// Control resource set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoresetConfig {
    /// CORESET id (0 = CORESET#0)
    pub id: u8,
    /// 45-bit frequency domain resources, MSB = first group of 6 RBs
    pub frequency_domain_resources: u64,
    /// Duration in symbols (1-3)
    pub duration: u8,
    /// CCE-to-REG mapping
    pub cce_reg_mapping: CceRegMapping,
}

/// Search space type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchSpaceKind {
    Common,
    UeSpecific,
}

/// Search space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpaceConfig {
    /// Search space id
    pub id: u8,
    /// Associated CORESET
    pub coreset_id: u8,
    /// Common or UE-specific
    pub kind: SearchSpaceKind,
    /// First monitored symbol within the slot
    #[serde(default)]
    pub first_symbol: u8,
    /// Number of candidates for aggregation levels 1, 2, 4, 8, 16
    pub num_candidates: [u8; NUM_AGGREGATION_LEVELS],
    /// Monitored DCI formats
    #[serde(default = "default_dci_formats")]
    pub formats: DciFormats,
}

fn default_dci_formats() -> DciFormats {
    DciFormats::FALLBACK
}

/// Time domain allocation of a shared channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeAllocation {
    /// First symbol
    pub start_symbol: u8,
    /// Number of symbols
    pub num_symbols: u8,
    /// DMRS REs per PRB
    #[serde(default = "default_dmrs_re_per_prb")]
    pub dmrs_re_per_prb: u16,
}

fn default_dmrs_re_per_prb() -> u16 {
    12
}

/// Per-UE scheduling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UeSchedConfig {
    /// Downlink HARQ processes
    #[serde(default = "default_harq_processes")]
    pub num_dl_harq: usize,
    /// Uplink HARQ processes
    #[serde(default = "default_harq_processes")]
    pub num_ul_harq: usize,
    /// Maximum transmissions per TB
    #[serde(default = "default_max_harq_rounds")]
    pub max_harq_rounds: u8,
    /// Active downlink BWP
    pub dl_bwp: BwpConfig,
    /// Active uplink BWP
    pub ul_bwp: BwpConfig,
    /// Dedicated DL BWPs besides the initial one (sizes the BWP indicator)
    #[serde(default = "default_one")]
    pub num_dl_bwps: u8,
    /// Dedicated UL BWPs besides the initial one
    #[serde(default = "default_one")]
    pub num_ul_bwps: u8,
    /// UE-specific CORESET
    pub coreset: CoresetConfig,
    /// UE-specific search space
    pub search_space: SearchSpaceConfig,
    /// PDSCH time allocation
    pub pdsch_time: TimeAllocation,
    /// PUSCH time allocation
    pub pusch_time: TimeAllocation,
    /// PDSCH MCS table
    #[serde(default = "default_mcs_table")]
    pub dl_mcs_table: McsTable,
    /// PUSCH MCS table
    #[serde(default = "default_mcs_table")]
    pub ul_mcs_table: McsTable,
    /// PUSCH transform precoding
    #[serde(default)]
    pub transform_precoding: bool,
    /// Downlink link adaptation
    #[serde(default)]
    pub dl_link_adaptation: LinkAdaptationConfig,
    /// Uplink link adaptation
    #[serde(default)]
    pub ul_link_adaptation: LinkAdaptationConfig,
    /// PDSCH-to-HARQ feedback delay in slots
    #[serde(default = "default_k1")]
    pub k1: u8,
    /// PDCCH-to-PUSCH delay in slots
    #[serde(default = "default_k2")]
    pub k2: u8,
    /// Dedicated PUCCH resources; empty means the implicit common resource
    #[serde(default)]
    pub pucch_resources: Vec<u8>,
    /// Beam the UE is served on
    #[serde(default)]
    pub beam: u16,
}

fn default_harq_processes() -> usize {
    16
}

fn default_max_harq_rounds() -> u8 {
    super::harq::DEFAULT_MAX_ROUNDS
}

fn default_one() -> u8 {
    1
}

fn default_mcs_table() -> McsTable {
    McsTable::Qam64
}

fn default_k1() -> u8 {
    4
}

fn default_k2() -> u8 {
    4
}

impl UeSchedConfig {
    /// Whether the UE-specific search space carries the non-fallback formats
    pub fn uses_non_fallback(&self) -> bool {
        self.search_space.formats.contains(DciFormats::NON_FALLBACK)
    }
}

/// Per-cell scheduling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSchedConfig {
    /// Cell ID
    pub cell_id: CellId,
    /// Physical cell ID
    pub pci: Pci,
    /// Common subcarrier spacing
    pub scs: SubcarrierSpacing,
    /// Carrier bandwidth in RBs
    pub carrier_rbs: u16,
    /// Initial downlink BWP
    pub initial_dl_bwp: BwpConfig,
    /// Initial uplink BWP
    pub initial_ul_bwp: BwpConfig,
    /// CORESET#0 table index from the MIB
    #[serde(default = "default_coreset0_index")]
    pub coreset0_index: u8,
    /// Common search space used for SI, RA and paging
    pub common_search_space: SearchSpaceConfig,
    /// PDSCH time allocation for broadcast and RAR
    pub common_pdsch_time: TimeAllocation,
    /// SSB periodicity in ms
    #[serde(default = "default_ssb_period_ms")]
    pub ssb_period_ms: u32,
    /// SIB1 periodicity in ms
    #[serde(default = "default_sib1_period_ms")]
    pub sib1_period_ms: u32,
    /// SIB1 payload size in bytes
    #[serde(default = "default_sib1_bytes")]
    pub sib1_payload_bytes: u32,
    /// MCS for SIB1, RAR and paging
    #[serde(default = "default_common_mcs")]
    pub common_mcs: u8,
    /// pucch-ResourceCommon index (0-15)
    #[serde(default)]
    pub pucch_resource_common: u8,
    /// Beam management
    #[serde(default)]
    pub beams: BeamConfig,
    /// Maximum admitted UEs
    #[serde(default = "default_max_ues")]
    pub max_ues: u16,
}

fn default_coreset0_index() -> u8 {
    1
}

fn default_ssb_period_ms() -> u32 {
    20
}

fn default_sib1_period_ms() -> u32 {
    160
}

fn default_sib1_bytes() -> u32 {
    100
}

fn default_common_mcs() -> u8 {
    2
}

fn default_max_ues() -> u16 {
    32
}
