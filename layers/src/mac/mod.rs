//! Medium Access Control (MAC) Layer Implementation
//!
//! Implements the 5G NR MAC slot scheduler according to 3GPP TS 38.321,
//! with physical layer procedures from TS 38.211, 38.212, 38.213 and 38.214

pub mod beam;
pub mod config;
pub mod dci;
pub mod harq;
pub mod link_adaptation;
pub mod occupancy;
pub mod pdcch;
pub mod pucch;
pub mod scheduler;
pub mod tbs;
pub mod ue_context;

use crate::{LayerError, ProtocolLayer};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

pub use config::{BwpConfig, CellSchedConfig, UeSchedConfig};
pub use dci::{DciFormat, RntiType};
pub use harq::{FeedbackOutcome, HarqId, HarqQueue};
pub use scheduler::{
    DlGrant, DlGrantKind, MacScheduler, PagingRequest, RachIndication, SchedEvent, SkipReason, SlotSchedule,
    SsbScheduleInfo, UlGrant, UlGrantKind,
};
use common::types::{Rnti, SlotPoint};

/// MAC scheduler errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MacError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid CORESET: {0}")]
    InvalidCoreset(String),

    #[error("HARQ process {id} is {actual:?}, expected {expected:?}")]
    UnexpectedHarqState { id: HarqId, expected: HarqQueue, actual: HarqQueue },

    #[error("HARQ process {id} outside a pool of {capacity}")]
    HarqProcessOutOfRange { id: HarqId, capacity: usize },

    #[error("HARQ pool cannot shrink from {current} to {requested} processes")]
    InvalidHarqResize { current: usize, requested: usize },

    #[error("DCI {format} payload of {size} bits exceeds the maximum")]
    DciPayloadTooLarge { format: DciFormat, size: u32 },

    #[error("DCI {format} needs {natural} bits but is aligned to {aligned}")]
    DciSizeMismatch { format: DciFormat, natural: u32, aligned: u8 },

    #[error("DCI {format} is not defined for {rnti:?}")]
    UnsupportedDci { format: DciFormat, rnti: RntiType },

    #[error("Unknown UE {0:?}")]
    UnknownUe(Rnti),

    #[error("UE {0:?} already admitted")]
    DuplicateUe(Rnti),

    #[error("Cell full: {max} UEs admitted")]
    CellFull { max: u16 },

    #[error("No free TC-RNTI")]
    NoFreeRnti,
}

/// MAC layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacConfig {
    /// Cell scheduling configuration
    pub cell: CellSchedConfig,
    /// RAR window in slots after the PRACH occasion
    #[serde(default = "default_ra_response_window")]
    pub ra_response_window: u16,
    /// Slots from RAR to Msg3
    #[serde(default = "default_msg3_delay")]
    pub msg3_delay: u8,
    /// Slots after the expected feedback before a HARQ process times out
    #[serde(default = "default_harq_feedback_timeout")]
    pub harq_feedback_timeout: u16,
}

fn default_ra_response_window() -> u16 {
    10
}

fn default_msg3_delay() -> u8 {
    6
}

fn default_harq_feedback_timeout() -> u16 {
    8
}

/// MAC-PHY interface for scheduling information
#[async_trait]
pub trait MacPhyInterface: Send + Sync {
    /// Decide the schedule of a slot
    async fn slot_indication(&self, slot: SlotPoint) -> Result<SlotSchedule, LayerError>;

    /// Downlink HARQ-ACK from PUCCH; `None` is DTX
    async fn harq_indication(&self, rnti: Rnti, harq_id: HarqId, ack: Option<bool>) -> Result<FeedbackOutcome, LayerError>;

    /// PUSCH CRC result
    async fn crc_indication(&self, rnti: Rnti, harq_id: HarqId, ok: bool) -> Result<FeedbackOutcome, LayerError>;

    /// Detected PRACH preamble; returns the TC-RNTI assigned to it
    async fn rach_indication(&self, indication: RachIndication) -> Result<Rnti, LayerError>;
}

/// MAC layer implementation
pub struct MacLayer {
    config: MacConfig,
    scheduler: Arc<Mutex<MacScheduler>>,
    initialized: bool,
}

impl MacLayer {
    /// Create a new MAC layer instance
    pub fn new(config: MacConfig) -> Result<Self, LayerError> {
        let scheduler = MacScheduler::new(config.clone())?;

        Ok(Self {
            config,
            scheduler: Arc::new(Mutex::new(scheduler)),
            initialized: false,
        })
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    pub fn slots_per_frame(&self) -> u16 {
        self.config.cell.scs.slots_per_frame()
    }

    fn ensure_initialized(&self) -> Result<(), LayerError> {
        if self.initialized {
            Ok(())
        } else {
            Err(LayerError::NotInitialized)
        }
    }

    /// Run `f` on the scheduler and log what it recorded once the lock is released
    async fn locked<T>(
        &self,
        f: impl FnOnce(&mut MacScheduler) -> Result<T, MacError> + Send,
    ) -> Result<T, LayerError> {
        let (result, events) = {
            let mut scheduler = self.scheduler.lock().await;
            let result = f(&mut *scheduler);
            (result, scheduler.take_events())
        };
        events.iter().for_each(log_event);
        Ok(result?)
    }

    /// Admit a UE
    pub async fn add_ue(&self, rnti: Rnti, config: UeSchedConfig) -> Result<(), LayerError> {
        self.ensure_initialized()?;
        self.locked(|scheduler| scheduler.add_ue(rnti, config)).await
    }

    /// Release a UE
    pub async fn remove_ue(&self, rnti: Rnti) -> Result<(), LayerError> {
        self.locked(|scheduler| scheduler.remove_ue(rnti)).await
    }

    pub async fn reconfigure_ue(&self, rnti: Rnti, config: UeSchedConfig) -> Result<(), LayerError> {
        self.locked(|scheduler| scheduler.reconfigure_ue(rnti, config)).await
    }

    pub async fn switch_bwp(&self, rnti: Rnti, dl_bwp: BwpConfig, ul_bwp: BwpConfig) -> Result<(), LayerError> {
        self.locked(|scheduler| scheduler.switch_bwp(rnti, dl_bwp, ul_bwp)).await
    }

    /// Downlink buffer occupancy reported by RLC
    pub async fn dl_buffer_status(&self, rnti: Rnti, bytes: u32) -> Result<(), LayerError> {
        self.locked(|scheduler| scheduler.on_dl_buffer_status(rnti, bytes)).await
    }

    /// Buffer status report received from a UE
    pub async fn bsr(&self, rnti: Rnti, bytes: u32) -> Result<(), LayerError> {
        self.locked(|scheduler| scheduler.on_bsr(rnti, bytes)).await
    }

    pub async fn page(&self, request: PagingRequest) -> Result<(), LayerError> {
        self.ensure_initialized()?;
        self.scheduler.lock().await.page(request);
        Ok(())
    }

    /// Number of admitted UEs
    pub async fn num_ues(&self) -> usize {
        self.scheduler.lock().await.num_ues()
    }

    /// RNTIs of admitted UEs in ascending order
    pub async fn ue_rntis(&self) -> Vec<Rnti> {
        self.scheduler.lock().await.rntis().collect()
    }
}

#[async_trait]
impl ProtocolLayer for MacLayer {
    async fn initialize(&mut self) -> Result<(), LayerError> {
        info!("Initializing MAC layer");
        debug!(
            "MAC config: cell_id={}, pci={}, scs={:?}, carrier_rbs={}",
            self.config.cell.cell_id.0,
            self.config.cell.pci.0,
            self.config.cell.scs,
            self.config.cell.carrier_rbs
        );

        self.initialized = true;
        info!("MAC layer initialized successfully");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), LayerError> {
        info!("Shutting down MAC layer");
        self.initialized = false;
        Ok(())
    }
}

#[async_trait]
impl MacPhyInterface for MacLayer {
    async fn slot_indication(&self, slot: SlotPoint) -> Result<SlotSchedule, LayerError> {
        self.ensure_initialized()?;

        let schedule = self.locked(|scheduler| scheduler.run_slot(slot)).await?;

        for skipped in &schedule.skipped {
            debug!("UE {:#06x} {:?} not scheduled: {:?}", skipped.rnti.value(), skipped.direction, skipped.reason);
        }
        for grant in schedule.dl_grants.iter().filter(|g| matches!(g.kind, DlGrantKind::Data { .. })) {
            trace!(
                "UE {:#06x} DL {:?}: RBs {}+{} MCS {} TBS {}",
                grant.rnti.value(), grant.kind, grant.start_rb, grant.num_rbs, grant.mcs, grant.tbs_bytes
            );
        }
        for grant in &schedule.ul_grants {
            trace!(
                "UE {:#06x} UL {:?}: RBs {}+{} MCS {} TBS {} in {:?}",
                grant.rnti.value(), grant.kind, grant.start_rb, grant.num_rbs, grant.mcs, grant.tbs_bytes, grant.pusch_slot
            );
        }
        if !schedule.is_empty() {
            debug!(
                "Slot {}.{}: ssb={} dl={} ul={} skipped={}",
                slot.frame,
                slot.slot,
                schedule.ssb_info.is_some(),
                schedule.dl_grants.len(),
                schedule.ul_grants.len(),
                schedule.skipped.len()
            );
        }
        Ok(schedule)
    }

    async fn harq_indication(&self, rnti: Rnti, harq_id: HarqId, ack: Option<bool>) -> Result<FeedbackOutcome, LayerError> {
        self.ensure_initialized()?;
        let outcome = self.locked(|scheduler| scheduler.on_harq_feedback(rnti, harq_id, ack)).await?;
        if outcome == FeedbackOutcome::Discarded {
            warn!("UE {:#06x} DL HARQ {} discarded after the last retransmission", rnti.value(), harq_id);
        }
        Ok(outcome)
    }

    async fn crc_indication(&self, rnti: Rnti, harq_id: HarqId, ok: bool) -> Result<FeedbackOutcome, LayerError> {
        self.ensure_initialized()?;
        let outcome = self.locked(|scheduler| scheduler.on_crc(rnti, harq_id, ok)).await?;
        if outcome == FeedbackOutcome::Discarded {
            warn!("UE {:#06x} UL HARQ {} discarded after the last retransmission", rnti.value(), harq_id);
        }
        Ok(outcome)
    }

    async fn rach_indication(&self, indication: RachIndication) -> Result<Rnti, LayerError> {
        self.ensure_initialized()?;
        self.locked(|scheduler| scheduler.on_rach(indication)).await
    }
}

fn log_event(event: &SchedEvent) {
    match *event {
        SchedEvent::UeAdmitted { rnti, dl_harq, ul_harq, num_cces } => info!(
            "UE {:#06x} admitted: {} DL / {} UL HARQ processes, {} CCEs",
            rnti.value(), dl_harq, ul_harq, num_cces
        ),
        SchedEvent::UeReleased { rnti } => info!("UE {:#06x} released", rnti.value()),
        SchedEvent::UeReconfigured { rnti, num_cces } => {
            debug!("UE {:#06x} reconfigured, layout {} CCEs", rnti.value(), num_cces)
        }
        SchedEvent::BwpSwitched { rnti, dl_bwp, ul_bwp } => {
            info!("UE {:#06x} switched to DL BWP {} / UL BWP {}", rnti.value(), dl_bwp, ul_bwp)
        }
        SchedEvent::RachDetected { indication, tc_rnti } => debug!(
            "RACH preamble {} in {:?}: RA-RNTI {:#06x}, TC-RNTI {:#06x}",
            indication.preamble, indication.slot, indication.ra_rnti, tc_rnti.value()
        ),
        SchedEvent::RarWindowMissed { preamble, tc_rnti } => {
            warn!("RAR for preamble {} (TC-RNTI {:#06x}) missed its window", preamble, tc_rnti.value())
        }
        SchedEvent::Sib1Missed { slot } => warn!("SIB1 could not be scheduled in {:?}", slot),
        SchedEvent::FeedbackTimeout { rnti, direction, harq_id, outcome } => debug!(
            "UE {:#06x} {:?} HARQ {} feedback timeout: {:?}",
            rnti.value(), direction, harq_id, outcome
        ),
        SchedEvent::McsChanged { rnti, direction, from, to, bler } => debug!(
            "UE {:#06x} {:?} link adaptation: bler {:.3}, MCS {} -> {}",
            rnti.value(), direction, bler, from, to
        ),
    }
}
