//! Per-UE Scheduling State
//!
//! Everything the scheduler keeps for one admitted UE: HARQ pools, link
//! adaptation per direction, the UE-specific CORESET layout and pending
//! buffer sizes. Created on admission, dropped on release, and only touched
//! while the cell scheduler lock is held.

use super::config::{BwpConfig, CellSchedConfig, UeSchedConfig};
use super::dci::{self, DciFormat, DciSizeConfig};
use super::harq::HarqProcessPool;
use super::link_adaptation::{LinkAdaptation, RoundStats};
use super::pdcch::CoresetLayout;
use super::MacError;
use common::types::{Direction, Rnti};

/// Weight of the previous PDCCH adjustment value
const PDCCH_ADJUST_ALPHA: f32 = 0.9;

/// HARQ processes addressable by the 4-bit process number of the fallback formats
const FALLBACK_HARQ_PROCESSES: usize = 16;

/// Dedicated BWPs per direction
const MAX_DEDICATED_BWPS: u8 = 4;

/// Scheduling state of one direction
#[derive(Debug)]
pub struct LinkState {
    pub harq: HarqProcessPool,
    pub link_adaptation: LinkAdaptation,
    pub stats: RoundStats,
    /// Bytes waiting for a new transmission
    pub pending_bytes: u32,
}

impl LinkState {
    fn new(num_harq: usize, max_rounds: u8, la: LinkAdaptation) -> Result<Self, MacError> {
        Ok(Self {
            harq: HarqProcessPool::new(num_harq, max_rounds)?,
            link_adaptation: la,
            stats: RoundStats::default(),
            pending_bytes: 0,
        })
    }
}

/// Borrowed view of a UE used while building one grant
pub struct GrantParts<'a> {
    pub rnti: Rnti,
    pub config: &'a UeSchedConfig,
    pub layout: &'a CoresetLayout,
    pub dci_sizes: &'a DciSizeConfig,
    pub pdcch_adjust: f32,
    pub link: &'a mut LinkState,
}

/// Scheduling context of one UE
#[derive(Debug)]
pub struct UeContext {
    rnti: Rnti,
    config: UeSchedConfig,
    layout: CoresetLayout,
    dci_sizes: DciSizeConfig,
    pub dl: LinkState,
    pub ul: LinkState,
    /// PDCCH channel adjustment in [0, 1]; higher selects larger aggregation levels
    pdcch_adjust: f32,
}

fn check_bwp(bwp: &BwpConfig, carrier_rbs: u16, what: &str) -> Result<(), MacError> {
    if bwp.num_rbs == 0 || bwp.start_rb as u32 + bwp.num_rbs as u32 > carrier_rbs as u32 {
        return Err(MacError::InvalidConfiguration(format!(
            "{} BWP {} (RBs {}..{}) outside the {}-RB carrier",
            what,
            bwp.id,
            bwp.start_rb,
            bwp.start_rb as u32 + bwp.num_rbs as u32,
            carrier_rbs
        )));
    }
    Ok(())
}

impl UeContext {
    /// Admit a UE with `config` in `cell`
    pub fn new(rnti: Rnti, config: UeSchedConfig, cell: &CellSchedConfig) -> Result<Self, MacError> {
        let (layout, dci_sizes) = Self::derive(&config, cell)?;
        let dl = LinkState::new(
            config.num_dl_harq,
            config.max_harq_rounds,
            LinkAdaptation::new(config.dl_link_adaptation.clone()),
        )?;
        let ul = LinkState::new(
            config.num_ul_harq,
            config.max_harq_rounds,
            LinkAdaptation::new(config.ul_link_adaptation.clone()),
        )?;

        Ok(Self { rnti, config, layout, dci_sizes, dl, ul, pdcch_adjust: 0.0 })
    }

    // Validate a configuration and derive its layout and DCI widths
    fn derive(config: &UeSchedConfig, cell: &CellSchedConfig) -> Result<(CoresetLayout, DciSizeConfig), MacError> {
        check_bwp(&config.dl_bwp, cell.carrier_rbs, "DL")?;
        check_bwp(&config.ul_bwp, cell.carrier_rbs, "UL")?;
        if config.k1 as usize >= super::scheduler::UL_RING_SLOTS || config.k2 as usize >= super::scheduler::UL_RING_SLOTS {
            return Err(MacError::InvalidConfiguration(format!(
                "k1 {} / k2 {} must be below {} slots",
                config.k1,
                config.k2,
                super::scheduler::UL_RING_SLOTS
            )));
        }
        if config.num_dl_bwps > MAX_DEDICATED_BWPS || config.num_ul_bwps > MAX_DEDICATED_BWPS {
            return Err(MacError::InvalidConfiguration(format!(
                "{} DL / {} UL dedicated BWPs, at most {}",
                config.num_dl_bwps, config.num_ul_bwps, MAX_DEDICATED_BWPS
            )));
        }
        for (direction, la) in [(Direction::Downlink, &config.dl_link_adaptation), (Direction::Uplink, &config.ul_link_adaptation)] {
            let table = match direction {
                Direction::Downlink => config.dl_mcs_table,
                Direction::Uplink => config.ul_mcs_table,
            };
            if la.min_mcs > la.max_mcs || la.max_mcs > table.max_mcs() {
                return Err(MacError::InvalidConfiguration(format!(
                    "{:?} MCS bounds {}..={} invalid for {:?}",
                    direction, la.min_mcs, la.max_mcs, table
                )));
            }
        }

        for (name, time, bwp) in [("PDSCH", &config.pdsch_time, &config.dl_bwp), ("PUSCH", &config.pusch_time, &config.ul_bwp)] {
            let symbols = bwp.cyclic_prefix.symbols_per_slot();
            if time.num_symbols == 0 || time.start_symbol as u16 + time.num_symbols as u16 > symbols as u16 {
                return Err(MacError::InvalidConfiguration(format!(
                    "{} symbols {}+{} exceed the {}-symbol slot",
                    name, time.start_symbol, time.num_symbols, symbols
                )));
            }
        }

        let num_harq = config.num_dl_harq.max(config.num_ul_harq);
        if num_harq > FALLBACK_HARQ_PROCESSES && !config.uses_non_fallback() {
            return Err(MacError::InvalidConfiguration(format!(
                "{} HARQ processes need formats 0_1/1_1, fallback DCI addresses {}",
                num_harq, FALLBACK_HARQ_PROCESSES
            )));
        }

        let layout = CoresetLayout::new(&config.coreset, &config.search_space, &config.dl_bwp)?;
        let dci_sizes = DciSizeConfig {
            dl_rbs: config.dl_bwp.num_rbs,
            ul_rbs: config.ul_bwp.num_rbs,
            num_dl_bwps: config.num_dl_bwps,
            num_ul_bwps: config.num_ul_bwps,
            transform_precoding: config.transform_precoding,
            harq_bits: if num_harq > FALLBACK_HARQ_PROCESSES { 5 } else { 4 },
        };
        // Every format the UE can be sent must fit the payload limit
        let (dl_format, ul_format) = Self::formats_for(config);
        dci::aligned_size(dl_format, &dci_sizes)?;
        dci::aligned_size(ul_format, &dci_sizes)?;
        Ok((layout, dci_sizes))
    }

    fn formats_for(config: &UeSchedConfig) -> (DciFormat, DciFormat) {
        if config.uses_non_fallback() {
            (DciFormat::Format1_1, DciFormat::Format0_1)
        } else {
            (DciFormat::Format1_0, DciFormat::Format0_0)
        }
    }

    pub fn rnti(&self) -> Rnti {
        self.rnti
    }

    pub fn config(&self) -> &UeSchedConfig {
        &self.config
    }

    pub fn layout(&self) -> &CoresetLayout {
        &self.layout
    }

    pub fn dci_sizes(&self) -> &DciSizeConfig {
        &self.dci_sizes
    }

    /// DCI formats used for downlink and uplink grants
    pub fn dci_formats(&self) -> (DciFormat, DciFormat) {
        Self::formats_for(&self.config)
    }

    pub fn link(&self, direction: Direction) -> &LinkState {
        match direction {
            Direction::Downlink => &self.dl,
            Direction::Uplink => &self.ul,
        }
    }

    pub fn link_mut(&mut self, direction: Direction) -> &mut LinkState {
        match direction {
            Direction::Downlink => &mut self.dl,
            Direction::Uplink => &mut self.ul,
        }
    }

    /// Split the context for building a grant in `direction`
    pub fn grant_parts(&mut self, direction: Direction) -> GrantParts<'_> {
        let link = match direction {
            Direction::Downlink => &mut self.dl,
            Direction::Uplink => &mut self.ul,
        };
        GrantParts {
            rnti: self.rnti,
            config: &self.config,
            layout: &self.layout,
            dci_sizes: &self.dci_sizes,
            pdcch_adjust: self.pdcch_adjust,
            link,
        }
    }

    pub fn pdcch_adjust(&self) -> f32 {
        self.pdcch_adjust
    }

    /// Update the PDCCH adjustment from a detection outcome of a sent DCI
    pub fn on_pdcch_detection(&mut self, detected: bool) {
        let sample = if detected { 0.0 } else { 1.0 };
        self.pdcch_adjust = PDCCH_ADJUST_ALPHA * self.pdcch_adjust + (1.0 - PDCCH_ADJUST_ALPHA) * sample;
    }

    /// Whether anything is waiting to be scheduled in `direction`
    pub fn has_work(&self, direction: Direction) -> bool {
        let link = self.link(direction);
        link.pending_bytes > 0 || link.harq.len(super::harq::HarqQueue::AwaitingRetransmission) > 0
    }

    /// Apply a new configuration snapshot.
    ///
    /// HARQ pools may only grow. The CORESET layout is rebuilt; link
    /// adaptation restarts when its configuration changed. On error nothing
    /// is applied.
    pub fn reconfigure(&mut self, config: UeSchedConfig, cell: &CellSchedConfig) -> Result<(), MacError> {
        let (layout, dci_sizes) = Self::derive(&config, cell)?;
        self.dl.harq.check_resize(config.num_dl_harq)?;
        self.ul.harq.check_resize(config.num_ul_harq)?;
        self.dl.harq.resize(config.num_dl_harq)?;
        self.ul.harq.resize(config.num_ul_harq)?;

        if config.dl_link_adaptation != self.config.dl_link_adaptation {
            self.dl.link_adaptation = LinkAdaptation::new(config.dl_link_adaptation.clone());
        }
        if config.ul_link_adaptation != self.config.ul_link_adaptation {
            self.ul.link_adaptation = LinkAdaptation::new(config.ul_link_adaptation.clone());
        }

        self.layout = layout;
        self.dci_sizes = dci_sizes;
        self.config = config;
        Ok(())
    }

    /// Switch the active BWPs; the layout follows the new downlink BWP
    pub fn switch_bwp(&mut self, dl_bwp: BwpConfig, ul_bwp: BwpConfig, cell: &CellSchedConfig) -> Result<(), MacError> {
        let config = UeSchedConfig { dl_bwp, ul_bwp, ..self.config.clone() };
        self.reconfigure(config, cell)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mac::beam::BeamConfig;
    use crate::mac::config::{
        CceRegMapping, CoresetConfig, DciFormats, SearchSpaceConfig, SearchSpaceKind, TimeAllocation,
    };
    use crate::mac::harq::HarqQueue;
    use crate::mac::link_adaptation::LinkAdaptationConfig;
    use crate::mac::tbs::McsTable;
    use common::types::{CellId, CyclicPrefix, Pci, SubcarrierSpacing};

    pub(crate) fn bwp(id: u8, start_rb: u16, num_rbs: u16) -> BwpConfig {
        BwpConfig { id, start_rb, num_rbs, scs: SubcarrierSpacing::Scs30, cyclic_prefix: CyclicPrefix::Normal }
    }

    pub(crate) fn cell_config() -> CellSchedConfig {
        CellSchedConfig {
            cell_id: CellId(1),
            pci: Pci(1),
            scs: SubcarrierSpacing::Scs30,
            carrier_rbs: 51,
            initial_dl_bwp: bwp(0, 0, 48),
            initial_ul_bwp: bwp(0, 0, 48),
            coreset0_index: 1,
            common_search_space: SearchSpaceConfig {
                id: 0,
                coreset_id: 0,
                kind: SearchSpaceKind::Common,
                first_symbol: 0,
                num_candidates: [0, 0, 4, 2, 1],
                formats: DciFormats::FALLBACK,
            },
            common_pdsch_time: TimeAllocation { start_symbol: 2, num_symbols: 12, dmrs_re_per_prb: 12 },
            ssb_period_ms: 20,
            sib1_period_ms: 160,
            sib1_payload_bytes: 100,
            common_mcs: 2,
            pucch_resource_common: 11,
            beams: BeamConfig::default(),
            max_ues: 4,
        }
    }

    pub(crate) fn ue_config() -> UeSchedConfig {
        UeSchedConfig {
            num_dl_harq: 8,
            num_ul_harq: 8,
            max_harq_rounds: 4,
            dl_bwp: bwp(1, 0, 48),
            ul_bwp: bwp(1, 0, 48),
            num_dl_bwps: 1,
            num_ul_bwps: 1,
            coreset: CoresetConfig {
                id: 1,
                frequency_domain_resources: 0xFF << (45 - 8),
                duration: 1,
                cce_reg_mapping: CceRegMapping::NonInterleaved,
            },
            search_space: SearchSpaceConfig {
                id: 2,
                coreset_id: 1,
                kind: SearchSpaceKind::UeSpecific,
                first_symbol: 0,
                num_candidates: [0, 2, 2, 1, 0],
                formats: DciFormats::FALLBACK,
            },
            pdsch_time: TimeAllocation { start_symbol: 1, num_symbols: 13, dmrs_re_per_prb: 12 },
            pusch_time: TimeAllocation { start_symbol: 0, num_symbols: 14, dmrs_re_per_prb: 12 },
            dl_mcs_table: McsTable::Qam64,
            ul_mcs_table: McsTable::Qam64,
            transform_precoding: false,
            dl_link_adaptation: LinkAdaptationConfig::default(),
            ul_link_adaptation: LinkAdaptationConfig::default(),
            k1: 4,
            k2: 4,
            pucch_resources: Vec::new(),
            beam: 0,
        }
    }

    #[test]
    fn test_admission_builds_layout() {
        let ue = UeContext::new(Rnti(0x4601), ue_config(), &cell_config()).unwrap();
        // 8 groups x 6 RBs x 1 symbol = 48 REGs = 8 CCEs
        assert_eq!(ue.layout().num_cces, 8);
        assert_eq!(ue.dci_formats(), (DciFormat::Format1_0, DciFormat::Format0_0));
        assert_eq!(ue.dl.harq.len(HarqQueue::Available), 8);
        assert!(!ue.has_work(Direction::Downlink));
    }

    #[test]
    fn test_admission_rejects_bwp_outside_carrier() {
        let config = UeSchedConfig { dl_bwp: bwp(1, 10, 48), ..ue_config() };
        assert!(UeContext::new(Rnti(0x4601), config, &cell_config()).is_err());
    }

    #[test]
    fn test_admission_rejects_time_allocation_past_slot() {
        let mut config = ue_config();
        config.pdsch_time = TimeAllocation { start_symbol: 0, num_symbols: 14, dmrs_re_per_prb: 12 };
        assert!(UeContext::new(Rnti(0x4601), config.clone(), &cell_config()).is_ok());

        config.pdsch_time.start_symbol = 1;
        assert!(UeContext::new(Rnti(0x4601), config, &cell_config()).is_err());
    }

    #[test]
    fn test_admission_rejects_too_many_bwps() {
        let config = UeSchedConfig { num_ul_bwps: 5, ..ue_config() };
        assert!(UeContext::new(Rnti(0x4601), config, &cell_config()).is_err());
    }

    #[test]
    fn test_admission_rejects_bad_mcs_bounds() {
        let mut config = ue_config();
        config.dl_link_adaptation.max_mcs = 28;
        config.dl_mcs_table = McsTable::Qam256;
        assert!(UeContext::new(Rnti(0x4601), config, &cell_config()).is_err());
    }

    #[test]
    fn test_many_harq_processes_need_non_fallback() {
        let cell = cell_config();
        let config = UeSchedConfig { num_dl_harq: 32, ..ue_config() };
        assert!(UeContext::new(Rnti(0x4601), config.clone(), &cell).is_err());

        let mut config = config;
        config.search_space.formats = DciFormats::FALLBACK | DciFormats::NON_FALLBACK;
        let ue = UeContext::new(Rnti(0x4601), config, &cell).unwrap();
        assert_eq!(ue.dci_sizes().harq_bits, 5);
        assert_eq!(ue.dci_formats(), (DciFormat::Format1_1, DciFormat::Format0_1));
    }

    #[test]
    fn test_reconfigure_grows_harq_and_rejects_shrink() {
        let cell = cell_config();
        let mut ue = UeContext::new(Rnti(0x4601), ue_config(), &cell).unwrap();

        let grown = UeSchedConfig { num_dl_harq: 16, ..ue_config() };
        ue.reconfigure(grown, &cell).unwrap();
        assert_eq!(ue.dl.harq.capacity(), 16);

        let shrunk = UeSchedConfig { num_dl_harq: 8, ..ue_config() };
        assert!(matches!(ue.reconfigure(shrunk, &cell), Err(MacError::InvalidHarqResize { .. })));
        assert_eq!(ue.config().num_dl_harq, 16);
    }

    #[test]
    fn test_rejected_reconfigure_leaves_ue_unchanged() {
        let cell = cell_config();
        let mut ue = UeContext::new(Rnti(0x4601), ue_config(), &cell).unwrap();

        // Downlink growth is valid on its own, the uplink shrink is not
        let mut config = UeSchedConfig { num_dl_harq: 32, num_ul_harq: 4, ..ue_config() };
        config.search_space.formats = DciFormats::FALLBACK | DciFormats::NON_FALLBACK;
        assert!(matches!(
            ue.reconfigure(config, &cell),
            Err(MacError::InvalidHarqResize { current: 8, requested: 4 })
        ));

        assert_eq!(ue.dl.harq.capacity(), 8);
        assert_eq!(ue.ul.harq.capacity(), 8);
        assert_eq!(ue.config().num_dl_harq, 8);
        assert_eq!(ue.dci_sizes().harq_bits, 4);
        assert_eq!(ue.dci_formats(), (DciFormat::Format1_0, DciFormat::Format0_0));
    }

    #[test]
    fn test_bwp_switch_rebuilds_layout() {
        let cell = cell_config();
        let mut ue = UeContext::new(Rnti(0x4601), ue_config(), &cell).unwrap();
        ue.switch_bwp(bwp(2, 0, 24), bwp(2, 0, 24), &cell).unwrap_err();

        // A BWP of 48 RBs starting at RB 1 moves the 6-RB grid to RB 6
        let mut config = ue_config();
        config.coreset.frequency_domain_resources = 0x3F << (45 - 6);
        ue.reconfigure(config, &cell).unwrap();
        ue.switch_bwp(bwp(2, 1, 48), bwp(2, 0, 48), &cell).unwrap();
        assert_eq!(ue.layout().rb_range(), (6, 42));
        assert_eq!(ue.dci_sizes().dl_rbs, 48);
    }

    #[test]
    fn test_pdcch_adjust_filter() {
        let mut ue = UeContext::new(Rnti(0x4601), ue_config(), &cell_config()).unwrap();
        for _ in 0..10 {
            ue.on_pdcch_detection(false);
        }
        let missed = ue.pdcch_adjust();
        assert!(missed > 0.6 && missed < 0.7);
        ue.on_pdcch_detection(true);
        assert!(ue.pdcch_adjust() < missed);
    }
}
