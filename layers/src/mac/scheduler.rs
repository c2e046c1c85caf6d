//! MAC Scheduler Implementation
//!
//! Handles scheduling of system information (SSB, SIB1), random access
//! responses, paging and user data for one cell. [`MacScheduler::run_slot`]
//! decides one whole slot; everything it touches is owned by the scheduler,
//! so the caller's lock guard is the only synchronization needed.

use super::beam::BeamAllocator;
use super::config::{BwpConfig, SearchSpaceKind, TimeAllocation, UeSchedConfig};
use super::dci::{self, DciField, DciFields, DciFormat, DciPayload, DciSizeConfig, RntiType};
use super::harq::{FeedbackOutcome, HarqId, HarqProcess};
use super::occupancy::{SymbolMask, VrbMap};
use super::pdcch::{self, Coreset0Config, CoresetLayout, PdcchAllocation};
use super::pucch::{self, PucchResource, NUM_PRI_VALUES};
use super::tbs::{self, McsTable, TbsParams};
use super::ue_context::{GrantParts, UeContext};
use super::{MacConfig, MacError};
use common::types::{Direction, Rnti, SlotPoint};
use std::collections::{BTreeMap, VecDeque};
use tracing::info;

/// Uplink slots tracked ahead of the current slot
pub const UL_RING_SLOTS: usize = 16;

/// PRBs of an SS/PBCH block
const SSB_RBS: u16 = 20;

/// SS/PBCH block occupies symbols 2-5 of its slot
const SSB_FIRST_SYMBOL: u8 = 2;
const SSB_SYMBOLS: u8 = 4;

/// SIB1 is sent this many slots after the SSB
const SIB1_SLOT_OFFSET: u32 = 2;

/// MAC subheader plus RAR for one detected preamble
const RAR_BYTES: u32 = 8;

/// Msg3 transport block (RRC setup request plus MAC header)
const MSG3_BYTES: u32 = 11;

/// Msg3 is allocated over the whole uplink slot
const MSG3_TIME: TimeAllocation = TimeAllocation { start_symbol: 0, num_symbols: 14, dmrs_re_per_prb: 12 };

/// Redundancy version per HARQ round
const RV_SEQUENCE: [u32; 4] = [0, 2, 3, 1];

/// TPC command for 0 dB
const TPC_NO_CHANGE: u32 = 1;

/// First TC-RNTI handed out, just above the largest RA-RNTI (TS 38.321 Section 5.1.3)
const FIRST_TC_RNTI: u16 = 0x4601;

/// Last RNTI value usable as C-RNTI
const MAX_C_RNTI: u16 = 0xFFEF;

/// SSB scheduling information
#[derive(Debug, Clone)]
pub struct SsbScheduleInfo {
    /// SSB index (0-7 for FR1)
    pub ssb_index: u8,
    /// Starting symbol
    pub start_symbol: u8,
    /// First common RB
    pub start_rb: u16,
}

/// A DCI placed on the PDCCH
#[derive(Debug, Clone)]
pub struct DciMessage {
    pub rnti: Rnti,
    pub rnti_type: RntiType,
    pub format: DciFormat,
    pub coreset_id: u8,
    pub pdcch: PdcchAllocation,
    /// Beam track the PDCCH is sent on
    pub beam: usize,
    pub fields: DciFields,
    pub payload: DciPayload,
}

/// What a downlink grant carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlGrantKind {
    Sib1,
    Rar { tc_rnti: Rnti, preamble: u8 },
    Paging,
    Data { harq_id: HarqId, round: u8, ndi: bool },
}

/// PDSCH allocation with its scheduling DCI
#[derive(Debug, Clone)]
pub struct DlGrant {
    pub rnti: Rnti,
    pub kind: DlGrantKind,
    pub beam: usize,
    /// First common RB
    pub start_rb: u16,
    pub num_rbs: u16,
    pub time: TimeAllocation,
    pub mcs: u8,
    pub tbs_bytes: u32,
    pub dci: DciMessage,
    /// HARQ-ACK resource, data grants only
    pub pucch: Option<PucchResource>,
    /// Slot carrying the HARQ-ACK, data grants only
    pub feedback_slot: Option<SlotPoint>,
}

/// What an uplink grant is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UlGrantKind {
    /// Granted by a RAR rather than a DCI
    Msg3,
    Data { harq_id: HarqId, round: u8, ndi: bool },
}

/// PUSCH allocation
#[derive(Debug, Clone)]
pub struct UlGrant {
    pub rnti: Rnti,
    pub kind: UlGrantKind,
    pub beam: usize,
    /// First common RB
    pub start_rb: u16,
    pub num_rbs: u16,
    pub time: TimeAllocation,
    pub mcs: u8,
    pub tbs_bytes: u32,
    /// Slot the PUSCH is received in
    pub pusch_slot: SlotPoint,
    /// Scheduling DCI, `None` for Msg3
    pub dci: Option<DciMessage>,
}

/// Why a UE with pending work got nothing this slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoBeam,
    HarqExhausted,
    NoPdcchCandidate,
    NoResources,
    NoPucchResource,
}

/// A UE left out of the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedUe {
    pub rnti: Rnti,
    pub direction: Direction,
    pub reason: SkipReason,
}

/// Scheduling decisions of one slot
#[derive(Debug, Clone)]
pub struct SlotSchedule {
    pub slot: SlotPoint,
    /// SSB transmission info if scheduled
    pub ssb_info: Option<SsbScheduleInfo>,
    pub dl_grants: Vec<DlGrant>,
    pub ul_grants: Vec<UlGrant>,
    pub skipped: Vec<SkippedUe>,
}

impl SlotSchedule {
    fn new(slot: SlotPoint) -> Self {
        Self { slot, ssb_info: None, dl_grants: Vec::new(), ul_grants: Vec::new(), skipped: Vec::new() }
    }

    /// SIB1 grant if scheduled
    pub fn sib1(&self) -> Option<&DlGrant> {
        self.dl_grants.iter().find(|grant| grant.kind == DlGrantKind::Sib1)
    }

    pub fn is_empty(&self) -> bool {
        self.ssb_info.is_none() && self.dl_grants.is_empty() && self.ul_grants.is_empty()
    }
}

/// Something that happened while the scheduler was locked.
///
/// The scheduler only records these; its owner drains them with
/// [`MacScheduler::take_events`] and logs them after releasing the lock.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedEvent {
    UeAdmitted { rnti: Rnti, dl_harq: usize, ul_harq: usize, num_cces: u16 },
    UeReleased { rnti: Rnti },
    UeReconfigured { rnti: Rnti, num_cces: u16 },
    BwpSwitched { rnti: Rnti, dl_bwp: u8, ul_bwp: u8 },
    RachDetected { indication: RachIndication, tc_rnti: Rnti },
    RarWindowMissed { preamble: u8, tc_rnti: Rnti },
    Sib1Missed { slot: SlotPoint },
    FeedbackTimeout { rnti: Rnti, direction: Direction, harq_id: HarqId, outcome: FeedbackOutcome },
    McsChanged { rnti: Rnti, direction: Direction, from: u8, to: u8, bler: f32 },
}

/// Random access preamble detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RachIndication {
    /// Slot of the PRACH occasion
    pub slot: SlotPoint,
    pub preamble: u8,
    /// RA-RNTI of the PRACH occasion
    pub ra_rnti: u16,
    pub timing_advance: u16,
}

/// Paging message waiting for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingRequest {
    /// Paging message size in bytes
    pub payload_bytes: u32,
    /// Short message sent along with the scheduling information
    pub short_message: Option<u8>,
}

#[derive(Debug, Clone, Copy)]
struct PendingRar {
    indication: RachIndication,
    tc_rnti: Rnti,
}

enum GrantOutcome<T> {
    Scheduled(T),
    Skipped(SkipReason),
}

/// Resources shared by all grants of a slot
struct SlotResources<'a> {
    now: SlotPoint,
    slots_per_frame: u16,
    pucch_resource_common: u8,
    common_ul_rbs: u16,
    feedback_timeout: u32,
    vrb_map: &'a mut VrbMap,
    ul_maps: &'a mut [VrbMap],
    /// HARQ-ACK resources taken by this slot's grants
    pucch_used: &'a mut Vec<(SlotPoint, PucchResource)>,
}

/// First value in `[first, last]` not `taken`, searching from `start` and wrapping once
fn next_free_rnti(start: u16, first: u16, last: u16, taken: impl Fn(u16) -> bool) -> Option<u16> {
    (start..=last).chain(first..start).find(|&value| !taken(value))
}

fn ul_index(slot: SlotPoint, slots_per_frame: u16) -> usize {
    slot.count(slots_per_frame) as usize % UL_RING_SLOTS
}

/// Largest allocation on `track` within `bwp`: the HARQ process size for a
/// retransmission, otherwise the smallest fit for `pending` bytes
fn size_allocation(
    map: &VrbMap,
    track: usize,
    bwp: &BwpConfig,
    mask: SymbolMask,
    params: &TbsParams,
    retx: Option<&HarqProcess>,
    pending: u32,
) -> Option<(u16, u16, u32)> {
    let (start, len) = map.largest_free_run(track, bwp.start_rb, bwp.start_rb + bwp.num_rbs, mask)?;
    match retx {
        Some(process) => (len >= process.num_rbs).then_some((start, process.num_rbs, process.tb_bytes)),
        None => {
            let fit = tbs::fit(pending, 1, len, params);
            (fit.tbs_bytes > 0).then_some((start, fit.num_rbs, fit.tbs_bytes))
        }
    }
}

fn time_params(mcs: u8, table: McsTable, time: &TimeAllocation) -> TbsParams {
    TbsParams {
        num_symbols: time.num_symbols,
        dmrs_re_per_prb: time.dmrs_re_per_prb,
        ..TbsParams::with_mcs(mcs, table)
    }
}

fn take_harq(ue: &mut GrantParts<'_>) -> Option<(HarqId, bool)> {
    if let Some(id) = ue.link.harq.take_retransmission() {
        return Some((id, true));
    }
    ue.link.harq.take_available().ok().map(|id| (id, false))
}

/// Build a grant with a taken HARQ id, giving the id back on any failure
fn with_harq<T>(
    mut ue: GrantParts<'_>,
    res: &mut SlotResources<'_>,
    track: usize,
    build: fn(&mut GrantParts<'_>, &mut SlotResources<'_>, usize, HarqId, bool) -> Result<GrantOutcome<T>, MacError>,
) -> Result<GrantOutcome<T>, MacError> {
    let Some((harq_id, retx)) = take_harq(&mut ue) else {
        return Ok(GrantOutcome::Skipped(SkipReason::HarqExhausted));
    };
    match build(&mut ue, res, track, harq_id, retx) {
        Ok(GrantOutcome::Scheduled(grant)) => Ok(GrantOutcome::Scheduled(grant)),
        Ok(GrantOutcome::Skipped(reason)) => {
            ue.link.harq.abort(harq_id)?;
            Ok(GrantOutcome::Skipped(reason))
        }
        Err(e) => {
            ue.link.harq.abort(harq_id)?;
            Err(e)
        }
    }
}

/// Place the UE's PDCCH on `track` and finish the grant with it.
///
/// The candidate is given back unless `finish` schedules the grant.
fn with_pdcch<T>(
    ue: &mut GrantParts<'_>,
    res: &mut SlotResources<'_>,
    track: usize,
    finish: impl FnOnce(&mut GrantParts<'_>, &mut SlotResources<'_>, PdcchAllocation) -> Result<GrantOutcome<T>, MacError>,
) -> Result<GrantOutcome<T>, MacError> {
    let config = ue.config;
    let layout = ue.layout;
    let hash = pdcch::pdcch_hash(config.search_space.kind, layout.coreset_id, ue.rnti, res.now.slot);
    let Some(allocation) = pdcch::place(layout, &config.search_space, ue.pdcch_adjust, track, res.vrb_map, hash) else {
        return Ok(GrantOutcome::Skipped(SkipReason::NoPdcchCandidate));
    };
    let outcome = finish(ue, res, allocation);
    if !matches!(outcome, Ok(GrantOutcome::Scheduled(_))) {
        pdcch::release(layout, allocation, track, res.vrb_map);
    }
    outcome
}

fn build_dl(
    ue: &mut GrantParts<'_>,
    res: &mut SlotResources<'_>,
    track: usize,
    harq_id: HarqId,
    retx: bool,
) -> Result<GrantOutcome<DlGrant>, MacError> {
    let config: &UeSchedConfig = ue.config;
    let process = ue.link.harq.process(harq_id).cloned().unwrap_or_default();
    let mcs = if retx { process.mcs } else { ue.link.link_adaptation.mcs() };
    let bwp = &config.dl_bwp;
    let time = config.pdsch_time;
    let mask = SymbolMask::range(time.start_symbol, time.num_symbols);
    let params = time_params(mcs, config.dl_mcs_table, &time);
    let retx_process = retx.then_some(&process);

    if size_allocation(res.vrb_map, track, bwp, mask, &params, retx_process, ue.link.pending_bytes).is_none() {
        return Ok(GrantOutcome::Skipped(SkipReason::NoResources));
    }
    with_pdcch(ue, res, track, |ue, res, pdcch| {
        // The CORESET may overlap the data symbols
        let Some((start_rb, num_rbs, tbs_bytes)) =
            size_allocation(res.vrb_map, track, bwp, mask, &params, retx_process, ue.link.pending_bytes)
        else {
            return Ok(GrantOutcome::Skipped(SkipReason::NoResources));
        };

        let feedback_slot = res.now.advance(config.k1 as u32, res.slots_per_frame);
        let mut selected = None;
        for pri in 0..NUM_PRI_VALUES {
            let resource = pucch::derive(
                &config.pucch_resources,
                res.pucch_resource_common,
                pdcch.first_cce,
                ue.layout.num_cces,
                pri,
                res.common_ul_rbs,
            )?;
            if let Some(resource) = resource.filter(|r| !res.pucch_used.contains(&(feedback_slot, *r))) {
                selected = Some((pri, resource));
                break;
            }
        }
        let Some((pri, pucch)) = selected else {
            return Ok(GrantOutcome::Skipped(SkipReason::NoPucchResource));
        };

        let format = if config.uses_non_fallback() { DciFormat::Format1_1 } else { DciFormat::Format1_0 };
        let mut fields = DciFields::for_format(format);
        fields
            .set(DciField::FreqDomainAssignment, dci::riv(bwp.num_rbs, start_rb - bwp.start_rb, num_rbs))
            .set(DciField::TimeDomainAssignment, 0)
            .set(DciField::Mcs, mcs as u32)
            .set(DciField::Ndi, process.ndi as u32)
            .set(DciField::RedundancyVersion, RV_SEQUENCE[process.round as usize % RV_SEQUENCE.len()])
            .set(DciField::HarqProcess, harq_id as u32)
            .set(DciField::Tpc, TPC_NO_CHANGE)
            .set(DciField::PucchResourceIndicator, pri as u32)
            .set(DciField::HarqFeedbackTiming, config.k1.saturating_sub(1).min(7) as u32);
        let aligned = dci::aligned_size(format, ue.dci_sizes)?;
        let payload = dci::encode(format, RntiType::C, &fields, ue.dci_sizes, aligned)?;

        let due = feedback_slot.advance(res.feedback_timeout, res.slots_per_frame);
        ue.link.harq.mark_awaiting_feedback(harq_id, due)?;
        ue.link.harq.record_transmission(harq_id, tbs_bytes, mcs, num_rbs);
        ue.link.stats.record(process.round);
        if !retx {
            ue.link.pending_bytes = ue.link.pending_bytes.saturating_sub(tbs_bytes);
        }
        res.vrb_map.mark_range(track, start_rb, num_rbs, mask);
        res.pucch_used.push((feedback_slot, pucch));

        Ok(GrantOutcome::Scheduled(DlGrant {
            rnti: ue.rnti,
            kind: DlGrantKind::Data { harq_id, round: process.round, ndi: process.ndi },
            beam: track,
            start_rb,
            num_rbs,
            time,
            mcs,
            tbs_bytes,
            dci: DciMessage {
                rnti: ue.rnti,
                rnti_type: RntiType::C,
                format,
                coreset_id: ue.layout.coreset_id,
                pdcch,
                beam: track,
                fields,
                payload,
            },
            pucch: Some(pucch),
            feedback_slot: Some(feedback_slot),
        }))
    })
}

fn build_ul(
    ue: &mut GrantParts<'_>,
    res: &mut SlotResources<'_>,
    track: usize,
    harq_id: HarqId,
    retx: bool,
) -> Result<GrantOutcome<UlGrant>, MacError> {
    let config: &UeSchedConfig = ue.config;
    let process = ue.link.harq.process(harq_id).cloned().unwrap_or_default();
    let mcs = if retx { process.mcs } else { ue.link.link_adaptation.mcs() };
    let bwp = &config.ul_bwp;
    let time = config.pusch_time;
    let mask = SymbolMask::range(time.start_symbol, time.num_symbols);
    let params = TbsParams {
        transform_precoding: config.transform_precoding,
        ..time_params(mcs, config.ul_mcs_table, &time)
    };
    let retx_process = retx.then_some(&process);
    let pusch_slot = res.now.advance(config.k2 as u32, res.slots_per_frame);
    let ul_slot = ul_index(pusch_slot, res.slots_per_frame);

    let Some((start_rb, num_rbs, tbs_bytes)) =
        size_allocation(&res.ul_maps[ul_slot], track, bwp, mask, &params, retx_process, ue.link.pending_bytes)
    else {
        return Ok(GrantOutcome::Skipped(SkipReason::NoResources));
    };
    with_pdcch(ue, res, track, |ue, res, pdcch| {
        let format = if config.uses_non_fallback() { DciFormat::Format0_1 } else { DciFormat::Format0_0 };
        let mut fields = DciFields::for_format(format);
        fields
            .set(DciField::FreqDomainAssignment, dci::riv(bwp.num_rbs, start_rb - bwp.start_rb, num_rbs))
            .set(DciField::TimeDomainAssignment, 0)
            .set(DciField::Mcs, mcs as u32)
            .set(DciField::Ndi, process.ndi as u32)
            .set(DciField::RedundancyVersion, RV_SEQUENCE[process.round as usize % RV_SEQUENCE.len()])
            .set(DciField::HarqProcess, harq_id as u32)
            .set(DciField::Tpc, TPC_NO_CHANGE)
            .set(DciField::UlSchIndicator, 1);
        let aligned = dci::aligned_size(format, ue.dci_sizes)?;
        let payload = dci::encode(format, RntiType::C, &fields, ue.dci_sizes, aligned)?;

        let due = pusch_slot.advance(res.feedback_timeout, res.slots_per_frame);
        ue.link.harq.mark_awaiting_feedback(harq_id, due)?;
        ue.link.harq.record_transmission(harq_id, tbs_bytes, mcs, num_rbs);
        ue.link.stats.record(process.round);
        if !retx {
            ue.link.pending_bytes = ue.link.pending_bytes.saturating_sub(tbs_bytes);
        }
        res.ul_maps[ul_slot].mark_range(track, start_rb, num_rbs, mask);

        Ok(GrantOutcome::Scheduled(UlGrant {
            rnti: ue.rnti,
            kind: UlGrantKind::Data { harq_id, round: process.round, ndi: process.ndi },
            beam: track,
            start_rb,
            num_rbs,
            time,
            mcs,
            tbs_bytes,
            pusch_slot,
            dci: Some(DciMessage {
                rnti: ue.rnti,
                rnti_type: RntiType::C,
                format,
                coreset_id: ue.layout.coreset_id,
                pdcch,
                beam: track,
                fields,
                payload,
            }),
        }))
    })
}

/// MAC scheduler of one cell
pub struct MacScheduler {
    config: MacConfig,
    slots_per_frame: u16,
    /// CORESET#0 configuration
    coreset0_config: Coreset0Config,
    common_layout: CoresetLayout,
    common_dci: DciSizeConfig,
    ssb_start_rb: u16,
    vrb_map: VrbMap,
    ul_maps: Vec<VrbMap>,
    beams: BeamAllocator,
    ues: BTreeMap<Rnti, UeContext>,
    round_robin: usize,
    pending_rars: VecDeque<PendingRar>,
    pending_paging: VecDeque<PagingRequest>,
    next_tc_rnti: u16,
    events: Vec<SchedEvent>,
}

impl MacScheduler {
    /// Create a new MAC scheduler
    pub fn new(config: MacConfig) -> Result<Self, MacError> {
        let cell = &config.cell;
        let slots_per_frame = cell.scs.slots_per_frame();

        // Get CORESET#0 configuration from MIB pdcch_config_sib1
        let coreset0_config = Coreset0Config::from_index(cell.coreset0_index)?;
        let bwp = &cell.initial_dl_bwp;
        if bwp.start_rb as u32 + bwp.num_rbs as u32 > cell.carrier_rbs as u32
            || (bwp.num_rbs as u32) < coreset0_config.num_rbs
        {
            return Err(MacError::InvalidConfiguration(format!(
                "initial DL BWP {}+{} must hold the {}-RB CORESET#0 inside the {}-RB carrier",
                bwp.start_rb, bwp.num_rbs, coreset0_config.num_rbs, cell.carrier_rbs
            )));
        }
        let ul_bwp = &cell.initial_ul_bwp;
        if ul_bwp.num_rbs == 0 || ul_bwp.start_rb as u32 + ul_bwp.num_rbs as u32 > cell.carrier_rbs as u32 {
            return Err(MacError::InvalidConfiguration(format!(
                "initial UL BWP {}+{} outside the {}-RB carrier",
                ul_bwp.start_rb, ul_bwp.num_rbs, cell.carrier_rbs
            )));
        }
        let ssb_start_rb = bwp.start_rb + coreset0_config.rb_offset as u16;
        if ssb_start_rb + SSB_RBS > cell.carrier_rbs {
            return Err(MacError::InvalidConfiguration(format!(
                "SSB at RB {} does not fit the {}-RB carrier",
                ssb_start_rb, cell.carrier_rbs
            )));
        }

        let ss = &cell.common_search_space;
        if ss.coreset_id != 0 || ss.kind != SearchSpaceKind::Common {
            return Err(MacError::InvalidConfiguration(format!(
                "common search space {} must be a common search space on CORESET#0",
                ss.id
            )));
        }
        if cell.common_mcs > McsTable::Qam64.max_mcs() {
            return Err(MacError::InvalidConfiguration(format!("common MCS {} above 28", cell.common_mcs)));
        }
        if cell.pucch_resource_common > 15 {
            return Err(MacError::InvalidConfiguration(format!(
                "pucch-ResourceCommon {} outside 0..16",
                cell.pucch_resource_common
            )));
        }
        if config.msg3_delay as usize >= UL_RING_SLOTS {
            return Err(MacError::InvalidConfiguration(format!(
                "Msg3 delay {} must be below {} slots",
                config.msg3_delay, UL_RING_SLOTS
            )));
        }

        let common_layout = CoresetLayout::coreset0(&coreset0_config, bwp.start_rb, ss.first_symbol, cell.pci.0)?;
        let common_dci = DciSizeConfig {
            dl_rbs: coreset0_config.num_rbs as u16,
            ul_rbs: ul_bwp.num_rbs,
            num_dl_bwps: 0,
            num_ul_bwps: 0,
            transform_precoding: false,
            harq_bits: 4,
        };
        dci::aligned_size(DciFormat::Format1_0, &common_dci)?;

        let beams = BeamAllocator::new(cell.beams.clone());
        let vrb_map = VrbMap::new(beams.num_tracks(), cell.carrier_rbs);
        let ul_maps = (0..UL_RING_SLOTS).map(|_| VrbMap::new(beams.num_tracks(), cell.carrier_rbs)).collect();

        info!(
            "MAC scheduler for cell {}: {} RBs, {} slots/frame, CORESET#0 {} RBs x {} symbols ({} CCEs)",
            cell.cell_id.0,
            cell.carrier_rbs,
            slots_per_frame,
            coreset0_config.num_rbs,
            coreset0_config.num_symbols,
            common_layout.num_cces
        );

        Ok(Self {
            config,
            slots_per_frame,
            coreset0_config,
            common_layout,
            common_dci,
            ssb_start_rb,
            vrb_map,
            ul_maps,
            beams,
            ues: BTreeMap::new(),
            round_robin: 0,
            pending_rars: VecDeque::new(),
            pending_paging: VecDeque::new(),
            next_tc_rnti: FIRST_TC_RNTI,
            events: Vec::new(),
        })
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    pub fn slots_per_frame(&self) -> u16 {
        self.slots_per_frame
    }

    /// Occupancy of the slot decided last, for data channel consumers
    pub fn vrb_map(&self) -> &VrbMap {
        &self.vrb_map
    }

    pub fn ue(&self, rnti: Rnti) -> Option<&UeContext> {
        self.ues.get(&rnti)
    }

    pub fn num_ues(&self) -> usize {
        self.ues.len()
    }

    pub fn rntis(&self) -> impl Iterator<Item = Rnti> + '_ {
        self.ues.keys().copied()
    }

    pub fn pending_rars(&self) -> usize {
        self.pending_rars.len()
    }

    /// Drain the events recorded since the last call
    pub fn take_events(&mut self) -> Vec<SchedEvent> {
        std::mem::take(&mut self.events)
    }

    /// Admit a UE
    pub fn add_ue(&mut self, rnti: Rnti, config: UeSchedConfig) -> Result<(), MacError> {
        if self.ues.contains_key(&rnti) {
            return Err(MacError::DuplicateUe(rnti));
        }
        if self.ues.len() >= self.config.cell.max_ues as usize {
            return Err(MacError::CellFull { max: self.config.cell.max_ues });
        }
        let ue = UeContext::new(rnti, config, &self.config.cell)?;
        self.events.push(SchedEvent::UeAdmitted {
            rnti,
            dl_harq: ue.config().num_dl_harq,
            ul_harq: ue.config().num_ul_harq,
            num_cces: ue.layout().num_cces,
        });
        self.ues.insert(rnti, ue);
        Ok(())
    }

    /// Release a UE and everything it holds
    pub fn remove_ue(&mut self, rnti: Rnti) -> Result<(), MacError> {
        self.ues.remove(&rnti).ok_or(MacError::UnknownUe(rnti))?;
        self.events.push(SchedEvent::UeReleased { rnti });
        Ok(())
    }

    pub fn reconfigure_ue(&mut self, rnti: Rnti, config: UeSchedConfig) -> Result<(), MacError> {
        let ue = self.ues.get_mut(&rnti).ok_or(MacError::UnknownUe(rnti))?;
        ue.reconfigure(config, &self.config.cell)?;
        self.events.push(SchedEvent::UeReconfigured { rnti, num_cces: ue.layout().num_cces });
        Ok(())
    }

    pub fn switch_bwp(&mut self, rnti: Rnti, dl_bwp: BwpConfig, ul_bwp: BwpConfig) -> Result<(), MacError> {
        let ue = self.ues.get_mut(&rnti).ok_or(MacError::UnknownUe(rnti))?;
        let (dl_id, ul_id) = (dl_bwp.id, ul_bwp.id);
        ue.switch_bwp(dl_bwp, ul_bwp, &self.config.cell)?;
        self.events.push(SchedEvent::BwpSwitched { rnti, dl_bwp: dl_id, ul_bwp: ul_id });
        Ok(())
    }

    /// Bytes waiting in the downlink buffers of a UE
    pub fn on_dl_buffer_status(&mut self, rnti: Rnti, bytes: u32) -> Result<(), MacError> {
        let ue = self.ues.get_mut(&rnti).ok_or(MacError::UnknownUe(rnti))?;
        ue.dl.pending_bytes = bytes;
        Ok(())
    }

    /// Buffer status report of a UE
    pub fn on_bsr(&mut self, rnti: Rnti, bytes: u32) -> Result<(), MacError> {
        let ue = self.ues.get_mut(&rnti).ok_or(MacError::UnknownUe(rnti))?;
        ue.ul.pending_bytes = bytes;
        Ok(())
    }

    /// Downlink HARQ-ACK; `None` is DTX, which also means the PDCCH was missed
    pub fn on_harq_feedback(&mut self, rnti: Rnti, harq_id: HarqId, ack: Option<bool>) -> Result<FeedbackOutcome, MacError> {
        let ue = self.ues.get_mut(&rnti).ok_or(MacError::UnknownUe(rnti))?;
        let outcome = ue.dl.harq.on_feedback(harq_id, ack.unwrap_or(false))?;
        ue.on_pdcch_detection(ack.is_some());
        Ok(outcome)
    }

    /// PUSCH decoding result
    pub fn on_crc(&mut self, rnti: Rnti, harq_id: HarqId, ok: bool) -> Result<FeedbackOutcome, MacError> {
        let ue = self.ues.get_mut(&rnti).ok_or(MacError::UnknownUe(rnti))?;
        ue.ul.harq.on_feedback(harq_id, ok)
    }

    /// Queue a RAR for a detected preamble and return the TC-RNTI it assigns
    pub fn on_rach(&mut self, indication: RachIndication) -> Result<Rnti, MacError> {
        let tc_rnti = self.allocate_tc_rnti()?;
        self.events.push(SchedEvent::RachDetected { indication, tc_rnti });
        self.pending_rars.push_back(PendingRar { indication, tc_rnti });
        Ok(tc_rnti)
    }

    /// Queue a paging message
    pub fn page(&mut self, request: PagingRequest) {
        self.pending_paging.push_back(request);
    }

    fn allocate_tc_rnti(&mut self) -> Result<Rnti, MacError> {
        let start = self.next_tc_rnti.clamp(FIRST_TC_RNTI, MAX_C_RNTI);
        let taken = |value: u16| {
            let candidate = Rnti(value);
            self.ues.contains_key(&candidate) || self.pending_rars.iter().any(|rar| rar.tc_rnti == candidate)
        };
        let value = next_free_rnti(start, FIRST_TC_RNTI, MAX_C_RNTI, taken).ok_or(MacError::NoFreeRnti)?;
        self.next_tc_rnti = if value >= MAX_C_RNTI { FIRST_TC_RNTI } else { value + 1 };
        Ok(Rnti(value))
    }

    /// Decide slot `now`
    pub fn run_slot(&mut self, now: SlotPoint) -> Result<SlotSchedule, MacError> {
        let spf = self.slots_per_frame;
        let mut schedule = SlotSchedule::new(now);

        self.vrb_map.clear();
        let previous = (now.count(spf) as usize + UL_RING_SLOTS - 1) % UL_RING_SLOTS;
        self.ul_maps[previous].clear();
        self.beams.reset_period(now.frame, now.slot, spf);

        self.expire_feedback(now)?;
        for ue in self.ues.values_mut() {
            let rnti = ue.rnti();
            for direction in [Direction::Downlink, Direction::Uplink] {
                let link = ue.link_mut(direction);
                let from = link.link_adaptation.mcs();
                let to = link.link_adaptation.evaluate(now.frame, &link.stats);
                if to != from {
                    let bler = link.link_adaptation.bler();
                    self.events.push(SchedEvent::McsChanged { rnti, direction, from, to, bler });
                }
            }
        }

        // Check if this slot should have SSB
        if self.is_ssb_slot(now) {
            self.vrb_map.mark_range(
                0,
                self.ssb_start_rb,
                SSB_RBS,
                SymbolMask::range(SSB_FIRST_SYMBOL, SSB_SYMBOLS),
            );
            schedule.ssb_info = Some(SsbScheduleInfo {
                ssb_index: 0,
                start_symbol: SSB_FIRST_SYMBOL,
                start_rb: self.ssb_start_rb,
            });
        }

        // Check if this slot should have SIB1
        if self.is_sib1_slot(now) {
            let bytes = self.config.cell.sib1_payload_bytes;
            match self.schedule_common(Rnti::SI, RntiType::Si, bytes, DciFields::default(), DlGrantKind::Sib1)? {
                Some(grant) => schedule.dl_grants.push(grant),
                None => self.events.push(SchedEvent::Sib1Missed { slot: now }),
            }
        }

        self.schedule_paging(&mut schedule)?;
        self.schedule_rars(now, &mut schedule)?;
        self.schedule_ues(now, &mut schedule)?;
        Ok(schedule)
    }

    /// Check if this slot should contain SSB
    fn is_ssb_slot(&self, now: SlotPoint) -> bool {
        let ssb_period_frames = (self.config.cell.ssb_period_ms / 10).max(1);
        now.frame as u32 % ssb_period_frames == 0 && now.slot == 0
    }

    /// Check if this slot should contain SIB1
    fn is_sib1_slot(&self, now: SlotPoint) -> bool {
        let sib1_period_frames = (self.config.cell.sib1_period_ms / 10).max(1);
        let sib1_period_slots = sib1_period_frames * self.slots_per_frame as u32;
        now.count(self.slots_per_frame) % sib1_period_slots == SIB1_SLOT_OFFSET
    }

    /// Time out HARQ processes whose feedback never arrived
    fn expire_feedback(&mut self, now: SlotPoint) -> Result<(), MacError> {
        let spf = self.slots_per_frame;
        for ue in self.ues.values_mut() {
            let rnti = ue.rnti();
            for direction in [Direction::Downlink, Direction::Uplink] {
                let link = ue.link_mut(direction);
                let overdue: Vec<HarqId> = link.harq.overdue(now, spf).collect();
                for harq_id in overdue {
                    let outcome = link.harq.on_feedback(harq_id, false)?;
                    self.events.push(SchedEvent::FeedbackTimeout { rnti, direction, harq_id, outcome });
                }
            }
        }
        Ok(())
    }

    /// PDSCH in the CORESET#0 bandwidth with a DCI 1_0 in the common search space
    fn schedule_common(
        &mut self,
        rnti: Rnti,
        rnti_type: RntiType,
        payload_bytes: u32,
        mut fields: DciFields,
        kind: DlGrantKind,
    ) -> Result<Option<DlGrant>, MacError> {
        let cell = &self.config.cell;
        let time = cell.common_pdsch_time;
        let mask = SymbolMask::range(time.start_symbol, time.num_symbols);
        let start = cell.initial_dl_bwp.start_rb;
        let size = self.coreset0_config.num_rbs as u16;
        let params = time_params(cell.common_mcs, McsTable::Qam64, &time);

        let Some((_, run_len)) = self.vrb_map.largest_free_run(0, start, start + size, mask) else {
            return Ok(None);
        };
        if !tbs::fit(payload_bytes, 1, run_len, &params).fits {
            return Ok(None);
        }
        let Some(pdcch) = pdcch::place(&self.common_layout, &cell.common_search_space, 1.0, 0, &mut self.vrb_map, 0) else {
            return Ok(None);
        };
        let sized = self
            .vrb_map
            .largest_free_run(0, start, start + size, mask)
            .map(|(run_start, run_len)| (run_start, tbs::fit(payload_bytes, 1, run_len, &params)))
            .filter(|(_, fit)| fit.fits);
        let Some((run_start, fit)) = sized else {
            pdcch::release(&self.common_layout, pdcch, 0, &mut self.vrb_map);
            return Ok(None);
        };

        fields
            .set(DciField::FreqDomainAssignment, dci::riv(size, run_start - start, fit.num_rbs))
            .set(DciField::TimeDomainAssignment, 0)
            .set(DciField::Mcs, cell.common_mcs as u32);
        let payload = match dci::aligned_size(DciFormat::Format1_0, &self.common_dci)
            .and_then(|aligned| dci::encode(DciFormat::Format1_0, rnti_type, &fields, &self.common_dci, aligned))
        {
            Ok(payload) => payload,
            Err(e) => {
                pdcch::release(&self.common_layout, pdcch, 0, &mut self.vrb_map);
                return Err(e);
            }
        };
        self.vrb_map.mark_range(0, run_start, fit.num_rbs, mask);

        Ok(Some(DlGrant {
            rnti,
            kind,
            beam: 0,
            start_rb: run_start,
            num_rbs: fit.num_rbs,
            time,
            mcs: cell.common_mcs,
            tbs_bytes: fit.tbs_bytes,
            dci: DciMessage {
                rnti,
                rnti_type,
                format: DciFormat::Format1_0,
                coreset_id: 0,
                pdcch,
                beam: 0,
                fields,
                payload,
            },
            pucch: None,
            feedback_slot: None,
        }))
    }

    fn schedule_paging(&mut self, schedule: &mut SlotSchedule) -> Result<(), MacError> {
        while let Some(request) = self.pending_paging.front().copied() {
            let mut fields = DciFields::default();
            let indicator = if request.short_message.is_some() { 0b11 } else { 0b01 };
            fields
                .set(DciField::ShortMessageIndicator, indicator)
                .set(DciField::ShortMessages, request.short_message.unwrap_or(0) as u32);
            match self.schedule_common(Rnti::P, RntiType::P, request.payload_bytes, fields, DlGrantKind::Paging)? {
                Some(grant) => {
                    self.pending_paging.pop_front();
                    schedule.dl_grants.push(grant);
                }
                None => break,
            }
        }
        Ok(())
    }

    fn schedule_rars(&mut self, now: SlotPoint, schedule: &mut SlotSchedule) -> Result<(), MacError> {
        let mut waiting = VecDeque::with_capacity(self.pending_rars.len());
        while let Some(rar) = self.pending_rars.pop_front() {
            let elapsed = now.slots_since(rar.indication.slot, self.slots_per_frame);
            if elapsed > self.config.ra_response_window as u32 {
                self.events.push(SchedEvent::RarWindowMissed { preamble: rar.indication.preamble, tc_rnti: rar.tc_rnti });
                continue;
            }
            match self.schedule_rar(now, &rar)? {
                Some((rar_grant, msg3)) => {
                    schedule.dl_grants.push(rar_grant);
                    schedule.ul_grants.push(msg3);
                }
                None => waiting.push_back(rar),
            }
        }
        self.pending_rars = waiting;
        Ok(())
    }

    fn schedule_rar(&mut self, now: SlotPoint, rar: &PendingRar) -> Result<Option<(DlGrant, UlGrant)>, MacError> {
        let spf = self.slots_per_frame;
        let cell = &self.config.cell;
        let bwp = &cell.initial_ul_bwp;
        let mask = SymbolMask::range(MSG3_TIME.start_symbol, MSG3_TIME.num_symbols);
        let params = time_params(cell.common_mcs, McsTable::Qam64, &MSG3_TIME);
        let mcs = cell.common_mcs;
        let msg3_slot = now.advance(self.config.msg3_delay as u32, spf);
        let ul_slot = ul_index(msg3_slot, spf);

        let Some((start_rb, run_len)) = self.ul_maps[ul_slot].largest_free_run(0, bwp.start_rb, bwp.start_rb + bwp.num_rbs, mask) else {
            return Ok(None);
        };
        let fit = tbs::fit(MSG3_BYTES, 1, run_len, &params);
        if !fit.fits {
            return Ok(None);
        }

        let kind = DlGrantKind::Rar { tc_rnti: rar.tc_rnti, preamble: rar.indication.preamble };
        let Some(rar_grant) = self.schedule_common(Rnti(rar.indication.ra_rnti), RntiType::Ra, RAR_BYTES, DciFields::default(), kind)? else {
            return Ok(None);
        };
        self.ul_maps[ul_slot].mark_range(0, start_rb, fit.num_rbs, mask);

        let msg3 = UlGrant {
            rnti: rar.tc_rnti,
            kind: UlGrantKind::Msg3,
            beam: 0,
            start_rb,
            num_rbs: fit.num_rbs,
            time: MSG3_TIME,
            mcs,
            tbs_bytes: fit.tbs_bytes,
            pusch_slot: msg3_slot,
            dci: None,
        };
        Ok(Some((rar_grant, msg3)))
    }

    fn schedule_ues(&mut self, now: SlotPoint, schedule: &mut SlotSchedule) -> Result<(), MacError> {
        let spf = self.slots_per_frame;
        let mut order: Vec<Rnti> = self.ues.keys().copied().collect();
        if order.is_empty() {
            return Ok(());
        }
        let offset = self.round_robin % order.len();
        order.rotate_left(offset);
        self.round_robin = self.round_robin.wrapping_add(1);

        let mut pucch_used = Vec::new();
        for rnti in order {
            let Some(ue) = self.ues.get_mut(&rnti) else {
                continue;
            };
            let directions: Vec<Direction> = [Direction::Downlink, Direction::Uplink]
                .into_iter()
                .filter(|&direction| ue.has_work(direction))
                .collect();
            if directions.is_empty() {
                continue;
            }

            let Some(beam) = self.beams.allocate(now.frame, now.slot, ue.config().beam, spf) else {
                for direction in directions {
                    schedule.skipped.push(SkippedUe { rnti, direction, reason: SkipReason::NoBeam });
                }
                continue;
            };

            let mut resources = SlotResources {
                now,
                slots_per_frame: spf,
                pucch_resource_common: self.config.cell.pucch_resource_common,
                common_ul_rbs: self.config.cell.initial_ul_bwp.num_rbs,
                feedback_timeout: self.config.harq_feedback_timeout as u32,
                vrb_map: &mut self.vrb_map,
                ul_maps: &mut self.ul_maps,
                pucch_used: &mut pucch_used,
            };

            let mut used = false;
            for direction in directions {
                let parts = ue.grant_parts(direction);
                let reason = match direction {
                    Direction::Downlink => match with_harq(parts, &mut resources, beam.track, build_dl)? {
                        GrantOutcome::Scheduled(grant) => {
                            schedule.dl_grants.push(grant);
                            None
                        }
                        GrantOutcome::Skipped(reason) => Some(reason),
                    },
                    Direction::Uplink => match with_harq(parts, &mut resources, beam.track, build_ul)? {
                        GrantOutcome::Scheduled(grant) => {
                            schedule.ul_grants.push(grant);
                            None
                        }
                        GrantOutcome::Skipped(reason) => Some(reason),
                    },
                };
                match reason {
                    None => used = true,
                    Some(reason) => schedule.skipped.push(SkippedUe { rnti, direction, reason }),
                }
            }

            if !used {
                self.beams.release(now.frame, now.slot, beam, spf);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::config::DciFormats;
    use crate::mac::harq::HarqQueue;
    use crate::mac::ue_context::tests::{cell_config, ue_config};

    fn mac_config() -> MacConfig {
        MacConfig {
            cell: cell_config(),
            ra_response_window: 10,
            msg3_delay: 6,
            harq_feedback_timeout: 8,
        }
    }

    fn scheduler() -> MacScheduler {
        MacScheduler::new(mac_config()).unwrap()
    }

    fn data_grants(schedule: &SlotSchedule) -> Vec<&DlGrant> {
        schedule
            .dl_grants
            .iter()
            .filter(|grant| matches!(grant.kind, DlGrantKind::Data { .. }))
            .collect()
    }

    fn harq_of(grant: &DlGrant) -> HarqId {
        match grant.kind {
            DlGrantKind::Data { harq_id, .. } => harq_id,
            _ => panic!("not a data grant"),
        }
    }

    #[test]
    fn test_scheduler_ssb_timing() {
        let mut scheduler = scheduler();

        // SSB should be in frame 0, slot 0
        let schedule = scheduler.run_slot(SlotPoint::new(0, 0)).unwrap();
        assert!(schedule.ssb_info.is_some());
        assert!(!scheduler.vrb_map().is_free(0, 2, SymbolMask::range(2, 1)));

        // No SSB in frame 1
        let schedule = scheduler.run_slot(SlotPoint::new(1, 0)).unwrap();
        assert!(schedule.ssb_info.is_none());

        // SSB again in frame 2 (20ms later)
        let schedule = scheduler.run_slot(SlotPoint::new(2, 0)).unwrap();
        assert!(schedule.ssb_info.is_some());
    }

    #[test]
    fn test_sib1_timing_and_dci() {
        let mut scheduler = scheduler();

        let schedule = scheduler.run_slot(SlotPoint::new(0, 2)).unwrap();
        let sib1 = schedule.sib1().expect("SIB1 in slot 2 of the period");
        assert_eq!(sib1.rnti, Rnti::SI);
        assert_eq!(sib1.dci.format, DciFormat::Format1_0);
        assert_eq!(sib1.dci.rnti_type, RntiType::Si);
        assert!(sib1.tbs_bytes >= 100);
        assert!(sib1.start_rb + sib1.num_rbs <= 24);

        let (_, decoded) = dci::decode(DciFormat::Format1_0, RntiType::Si, &sib1.dci.payload, &scheduler.common_dci).unwrap();
        assert_eq!(decoded.get(DciField::Mcs), 2);

        assert!(scheduler.run_slot(SlotPoint::new(0, 3)).unwrap().sib1().is_none());
        assert!(scheduler.run_slot(SlotPoint::new(8, 2)).unwrap().sib1().is_none());
        assert!(scheduler.run_slot(SlotPoint::new(16, 2)).unwrap().sib1().is_some());
    }

    #[test]
    fn test_invalid_cell_configuration() {
        let mut config = mac_config();
        config.cell.coreset0_index = 20;
        assert!(MacScheduler::new(config).is_err());

        let mut config = mac_config();
        config.cell.common_search_space.coreset_id = 1;
        assert!(MacScheduler::new(config).is_err());

        let mut config = mac_config();
        config.cell.initial_dl_bwp.num_rbs = 12;
        assert!(MacScheduler::new(config).is_err());
    }

    #[test]
    fn test_downlink_grant() {
        let mut scheduler = scheduler();
        let rnti = Rnti(0x4601);
        scheduler.add_ue(rnti, ue_config()).unwrap();
        scheduler.on_dl_buffer_status(rnti, 500).unwrap();

        let schedule = scheduler.run_slot(SlotPoint::new(1, 5)).unwrap();
        let grants = data_grants(&schedule);
        assert_eq!(grants.len(), 1);
        let grant = grants[0];

        assert_eq!(grant.rnti, rnti);
        assert!(grant.tbs_bytes >= 500);
        assert_eq!(grant.feedback_slot, Some(SlotPoint::new(1, 9)));
        assert!(matches!(grant.pucch, Some(PucchResource::Common(_))));
        assert_eq!(grant.dci.payload.size, 39);

        // PDSCH RBs are taken for the data symbols
        let mask = SymbolMask::range(grant.time.start_symbol, grant.time.num_symbols);
        assert!(!scheduler.vrb_map().is_range_free(0, grant.start_rb, grant.num_rbs, mask));

        let ue = scheduler.ue(rnti).unwrap();
        assert_eq!(ue.dl.pending_bytes, 0);
        assert_eq!(ue.dl.harq.len(HarqQueue::AwaitingFeedback), 1);

        let sizes = *ue.dci_sizes();
        let (_, decoded) = dci::decode(DciFormat::Format1_0, RntiType::C, &grant.dci.payload, &sizes).unwrap();
        assert_eq!(decoded.get(DciField::HarqProcess), harq_of(grant) as u32);
        assert_eq!(decoded.get(DciField::HarqFeedbackTiming), 3);
        assert_eq!(decoded.get(DciField::Identifier), 1);

        // Nothing left to send
        let schedule = scheduler.run_slot(SlotPoint::new(1, 6)).unwrap();
        assert!(data_grants(&schedule).is_empty());
    }

    #[test]
    fn test_nack_triggers_retransmission() {
        let mut scheduler = scheduler();
        let rnti = Rnti(0x4601);
        scheduler.add_ue(rnti, ue_config()).unwrap();
        scheduler.on_dl_buffer_status(rnti, 300).unwrap();

        let first = scheduler.run_slot(SlotPoint::new(1, 1)).unwrap();
        let initial = data_grants(&first)[0].clone();
        let id = harq_of(&initial);

        let outcome = scheduler.on_harq_feedback(rnti, id, Some(false)).unwrap();
        assert_eq!(outcome, FeedbackOutcome::Retransmit { round: 1 });

        let second = scheduler.run_slot(SlotPoint::new(1, 2)).unwrap();
        let retx = data_grants(&second)[0].clone();
        match (initial.kind, retx.kind) {
            (DlGrantKind::Data { ndi: ndi0, .. }, DlGrantKind::Data { harq_id, round, ndi }) => {
                assert_eq!(harq_id, id);
                assert_eq!(round, 1);
                assert_eq!(ndi, ndi0);
            }
            _ => panic!("expected data grants"),
        }
        assert_eq!(retx.num_rbs, initial.num_rbs);
        assert_eq!(retx.tbs_bytes, initial.tbs_bytes);
        assert_eq!(retx.dci.fields.get(DciField::RedundancyVersion), 2);
    }

    #[test]
    fn test_harq_exhaustion_and_recovery() {
        let mut scheduler = scheduler();
        let rnti = Rnti(0x4601);
        scheduler.add_ue(rnti, ue_config()).unwrap();
        scheduler.on_dl_buffer_status(rnti, u32::MAX).unwrap();

        for slot in 0..8 {
            let schedule = scheduler.run_slot(SlotPoint::new(3, slot)).unwrap();
            assert_eq!(data_grants(&schedule).len(), 1, "slot {}", slot);
        }

        let schedule = scheduler.run_slot(SlotPoint::new(3, 8)).unwrap();
        assert!(data_grants(&schedule).is_empty());
        assert!(schedule.skipped.contains(&SkippedUe {
            rnti,
            direction: Direction::Downlink,
            reason: SkipReason::HarqExhausted
        }));

        assert_eq!(scheduler.on_harq_feedback(rnti, 3, Some(true)).unwrap(), FeedbackOutcome::Released);
        let schedule = scheduler.run_slot(SlotPoint::new(3, 9)).unwrap();
        assert_eq!(harq_of(data_grants(&schedule)[0]), 3);
    }

    #[test]
    fn test_feedback_timeout_retransmits() {
        let mut scheduler = scheduler();
        let rnti = Rnti(0x4601);
        scheduler.add_ue(rnti, ue_config()).unwrap();
        scheduler.on_dl_buffer_status(rnti, 100).unwrap();

        let first = scheduler.run_slot(SlotPoint::new(5, 0)).unwrap();
        let id = harq_of(data_grants(&first)[0]);

        // k1 = 4 plus 8 slots of grace: due at slot 12, overdue at 13
        for slot in 1..=12 {
            let schedule = scheduler.run_slot(SlotPoint::new(5, slot)).unwrap();
            assert!(data_grants(&schedule).is_empty(), "slot {}", slot);
        }
        let schedule = scheduler.run_slot(SlotPoint::new(5, 13)).unwrap();
        let grants = data_grants(&schedule);
        assert_eq!(grants.len(), 1);
        assert!(matches!(grants[0].kind, DlGrantKind::Data { harq_id, round: 1, .. } if harq_id == id));
    }

    #[test]
    fn test_two_ues_disjoint_resources() {
        let mut scheduler = scheduler();
        for rnti in [Rnti(0x4601), Rnti(0x4602)] {
            scheduler.add_ue(rnti, ue_config()).unwrap();
            scheduler.on_dl_buffer_status(rnti, 200).unwrap();
        }

        let schedule = scheduler.run_slot(SlotPoint::new(1, 3)).unwrap();
        let grants = data_grants(&schedule);
        assert_eq!(grants.len(), 2);

        let (a, b) = (grants[0], grants[1]);
        let cces = |g: &DlGrant| g.dci.pdcch.first_cce..g.dci.pdcch.first_cce + g.dci.pdcch.aggregation_level as u16;
        let (ca, cb) = (cces(a), cces(b));
        assert!(ca.end <= cb.start || cb.end <= ca.start);
        assert!(a.start_rb + a.num_rbs <= b.start_rb || b.start_rb + b.num_rbs <= a.start_rb);
        assert_ne!(a.pucch, b.pucch);
    }

    #[test]
    fn test_uplink_grant_and_crc() {
        let mut scheduler = scheduler();
        let rnti = Rnti(0x4601);
        scheduler.add_ue(rnti, ue_config()).unwrap();
        scheduler.on_bsr(rnti, 400).unwrap();

        let schedule = scheduler.run_slot(SlotPoint::new(2, 0)).unwrap();
        assert_eq!(schedule.ul_grants.len(), 1);
        let grant = &schedule.ul_grants[0];
        assert_eq!(grant.pusch_slot, SlotPoint::new(2, 4));
        let dci = grant.dci.as_ref().unwrap();
        assert_eq!(dci.format, DciFormat::Format0_0);
        // Fallback formats share the aligned size
        assert_eq!(dci.payload.size, 39);
        assert_eq!(dci.fields.get(DciField::Identifier), 0);

        let UlGrantKind::Data { harq_id, .. } = grant.kind else {
            panic!("expected a data grant");
        };
        assert_eq!(scheduler.on_crc(rnti, harq_id, true).unwrap(), FeedbackOutcome::Released);
        assert_eq!(scheduler.ue(rnti).unwrap().ul.pending_bytes, 0);
    }

    #[test]
    fn test_non_fallback_formats() {
        let mut scheduler = scheduler();
        let rnti = Rnti(0x4601);
        let mut config = ue_config();
        config.search_space.formats = DciFormats::NON_FALLBACK;
        scheduler.add_ue(rnti, config).unwrap();
        scheduler.on_dl_buffer_status(rnti, 100).unwrap();
        scheduler.on_bsr(rnti, 100).unwrap();

        let schedule = scheduler.run_slot(SlotPoint::new(1, 1)).unwrap();
        assert_eq!(data_grants(&schedule)[0].dci.format, DciFormat::Format1_1);
        assert_eq!(schedule.ul_grants[0].dci.as_ref().unwrap().format, DciFormat::Format0_1);
    }

    #[test]
    fn test_random_access_response() {
        let mut scheduler = scheduler();
        let indication = RachIndication { slot: SlotPoint::new(4, 1), preamble: 12, ra_rnti: 0x10b, timing_advance: 3 };
        let tc_rnti = scheduler.on_rach(indication).unwrap();
        assert_eq!(tc_rnti, Rnti(0x4601));

        let schedule = scheduler.run_slot(SlotPoint::new(4, 3)).unwrap();
        let rar = schedule
            .dl_grants
            .iter()
            .find(|grant| matches!(grant.kind, DlGrantKind::Rar { .. }))
            .expect("RAR scheduled");
        assert_eq!(rar.rnti, Rnti(0x10b));
        assert_eq!(rar.dci.rnti_type, RntiType::Ra);
        assert_eq!(rar.kind, DlGrantKind::Rar { tc_rnti, preamble: 12 });

        let msg3 = &schedule.ul_grants[0];
        assert_eq!(msg3.kind, UlGrantKind::Msg3);
        assert_eq!(msg3.rnti, tc_rnti);
        assert_eq!(msg3.pusch_slot, SlotPoint::new(4, 9));
        assert!(msg3.dci.is_none());
        assert_eq!(scheduler.pending_rars(), 0);

        // The next TC-RNTI skips the admitted UE
        scheduler.add_ue(Rnti(0x4602), ue_config()).unwrap();
        assert_eq!(scheduler.on_rach(indication).unwrap(), Rnti(0x4603));
    }

    #[test]
    fn test_tc_rnti_wraps_above_ra_rntis() {
        let mut scheduler = scheduler();
        let indication = RachIndication { slot: SlotPoint::new(0, 1), preamble: 3, ra_rnti: 0x21, timing_advance: 0 };
        scheduler.next_tc_rnti = MAX_C_RNTI;

        assert_eq!(scheduler.on_rach(indication).unwrap(), Rnti(MAX_C_RNTI));
        assert_eq!(scheduler.on_rach(indication).unwrap(), Rnti(FIRST_TC_RNTI));
        assert!(FIRST_TC_RNTI > 0x4600);
    }

    #[test]
    fn test_rnti_search_is_bounded() {
        assert_eq!(next_free_rnti(7, 5, 8, |value| value != 6), Some(6));
        assert_eq!(next_free_rnti(5, 5, 8, |_| false), Some(5));
        assert_eq!(next_free_rnti(7, 5, 8, |_| true), None);
    }

    #[test]
    fn test_rar_window_expiry() {
        let mut scheduler = scheduler();
        let tc_rnti = scheduler
            .on_rach(RachIndication { slot: SlotPoint::new(4, 0), preamble: 1, ra_rnti: 0x11, timing_advance: 0 })
            .unwrap();
        scheduler.take_events();
        let schedule = scheduler.run_slot(SlotPoint::new(5, 0)).unwrap();
        assert!(schedule.dl_grants.iter().all(|grant| !matches!(grant.kind, DlGrantKind::Rar { .. })));
        assert_eq!(scheduler.pending_rars(), 0);
        assert!(scheduler.take_events().contains(&SchedEvent::RarWindowMissed { preamble: 1, tc_rnti }));
    }

    #[test]
    fn test_paging() {
        let mut scheduler = scheduler();
        scheduler.page(PagingRequest { payload_bytes: 20, short_message: Some(0x80) });
        let schedule = scheduler.run_slot(SlotPoint::new(7, 5)).unwrap();
        let paging = schedule.dl_grants.iter().find(|grant| grant.kind == DlGrantKind::Paging).unwrap();
        assert_eq!(paging.rnti, Rnti::P);
        assert_eq!(paging.dci.fields.get(DciField::ShortMessageIndicator), 0b11);
        assert_eq!(paging.dci.fields.get(DciField::ShortMessages), 0x80);
    }

    #[test]
    fn test_ue_admission_and_release() {
        let mut scheduler = scheduler();
        let rnti = Rnti(0x4601);
        scheduler.add_ue(rnti, ue_config()).unwrap();
        assert!(matches!(scheduler.add_ue(rnti, ue_config()), Err(MacError::DuplicateUe(_))));

        for value in 0x4602..0x4605 {
            scheduler.add_ue(Rnti(value), ue_config()).unwrap();
        }
        assert!(matches!(scheduler.add_ue(Rnti(0x4700), ue_config()), Err(MacError::CellFull { max: 4 })));

        scheduler.remove_ue(rnti).unwrap();
        assert_eq!(scheduler.num_ues(), 3);
        assert!(matches!(scheduler.on_harq_feedback(rnti, 0, Some(true)), Err(MacError::UnknownUe(_))));
        assert!(scheduler.remove_ue(rnti).is_err());
    }

    #[test]
    fn test_events_are_held_for_the_owner() {
        let mut scheduler = scheduler();
        let rnti = Rnti(0x4601);
        scheduler.add_ue(rnti, ue_config()).unwrap();
        scheduler.remove_ue(rnti).unwrap();

        let events = scheduler.take_events();
        assert!(matches!(events[0], SchedEvent::UeAdmitted { rnti: r, dl_harq: 8, ul_harq: 8, .. } if r == rnti));
        assert_eq!(events[1], SchedEvent::UeReleased { rnti });
        assert!(scheduler.take_events().is_empty());
    }

    #[test]
    fn test_feedback_timeout_is_recorded() {
        let mut scheduler = scheduler();
        let rnti = Rnti(0x4601);
        scheduler.add_ue(rnti, ue_config()).unwrap();
        scheduler.on_dl_buffer_status(rnti, 100).unwrap();

        let first = scheduler.run_slot(SlotPoint::new(5, 0)).unwrap();
        let harq_id = harq_of(data_grants(&first)[0]);
        for slot in 1..=13 {
            scheduler.run_slot(SlotPoint::new(5, slot)).unwrap();
        }
        let timeout = SchedEvent::FeedbackTimeout {
            rnti,
            direction: Direction::Downlink,
            harq_id,
            outcome: FeedbackOutcome::Retransmit { round: 1 },
        };
        assert!(scheduler.take_events().contains(&timeout));
    }

    #[test]
    fn test_feedback_for_unknown_process_keeps_pdcch_filter() {
        let mut scheduler = scheduler();
        let rnti = Rnti(0x4601);
        scheduler.add_ue(rnti, ue_config()).unwrap();

        assert!(matches!(
            scheduler.on_harq_feedback(rnti, 200, None),
            Err(MacError::HarqProcessOutOfRange { id: 200, .. })
        ));
        assert_eq!(scheduler.ue(rnti).unwrap().pdcch_adjust(), 0.0);
    }

    #[test]
    fn test_skipped_grant_releases_pdcch() {
        let mut scheduler = scheduler();
        let rnti = Rnti(0x4601);
        scheduler.add_ue(rnti, ue_config()).unwrap();
        scheduler.on_dl_buffer_status(rnti, 500).unwrap();

        let now = SlotPoint::new(1, 5);
        let spf = scheduler.slots_per_frame();
        let cell = scheduler.config().cell.clone();
        let config = ue_config();
        let feedback_slot = now.advance(config.k1 as u32, spf);
        let num_cces = scheduler.ue(rnti).unwrap().layout().num_cces;

        // Every HARQ-ACK resource the UE could be pointed at is already taken
        let mut pucch_used = Vec::new();
        for first_cce in 0..num_cces {
            for pri in 0..NUM_PRI_VALUES {
                let resource = pucch::derive(
                    &config.pucch_resources,
                    cell.pucch_resource_common,
                    first_cce,
                    num_cces,
                    pri,
                    cell.initial_ul_bwp.num_rbs,
                )
                .unwrap()
                .unwrap();
                pucch_used.push((feedback_slot, resource));
            }
        }

        let MacScheduler { ues, vrb_map, ul_maps, .. } = &mut scheduler;
        let mut resources = SlotResources {
            now,
            slots_per_frame: spf,
            pucch_resource_common: cell.pucch_resource_common,
            common_ul_rbs: cell.initial_ul_bwp.num_rbs,
            feedback_timeout: 8,
            vrb_map,
            ul_maps,
            pucch_used: &mut pucch_used,
        };
        let ue = ues.get_mut(&rnti).unwrap();
        let outcome = with_harq(ue.grant_parts(Direction::Downlink), &mut resources, 0, build_dl).unwrap();
        assert!(matches!(outcome, GrantOutcome::Skipped(SkipReason::NoPucchResource)));

        // Neither the CCEs nor the HARQ process stay reserved
        assert!(scheduler.vrb_map().is_range_free(0, 0, cell.carrier_rbs, SymbolMask::FULL_SLOT));
        let ue = scheduler.ue(rnti).unwrap();
        assert_eq!(ue.dl.harq.len(HarqQueue::Available), 8);
        assert_eq!(ue.dl.pending_bytes, 500);

        // With the PUCCH resources free again the same UE is scheduled
        let schedule = scheduler.run_slot(now).unwrap();
        assert_eq!(data_grants(&schedule).len(), 1);
    }
}
