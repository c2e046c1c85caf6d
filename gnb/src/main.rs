//! Albor Space 5G GNodeB Scheduler Driver
//!
//! Runs the MAC slot scheduler of one cell against a simulated PHY: a slot
//! ticker drives slot indications while a separate task delivers HARQ-ACK
//! and CRC feedback, so both paths contend for the scheduler lock as they
//! would behind a real PHY.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use num_traits::FromPrimitive;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::types::{Rnti, SlotPoint, SubcarrierSpacing};
use common::utils::bytes_to_hex;
use config::{GnbConfig, SimulationConfig};
use layers::mac::{
    DlGrantKind, MacLayer, MacPhyInterface, RachIndication, SlotSchedule, UeSchedConfig, UlGrantKind,
};
use layers::ProtocolLayer;

/// Albor Space 5G GNodeB scheduler
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML, or TOML with a .toml extension)
    #[arg(short, long, default_value = "config/gnb_sched.yml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Subcarrier spacing in kHz (15, 30, 60, 120), overrides the file
    #[arg(long)]
    scs_khz: Option<u32>,

    /// Number of slots to run, 0 runs until interrupted
    #[arg(long, default_value = "0")]
    slots: u64,

    /// Run slots back to back instead of at the numerology's slot rate
    #[arg(long)]
    fast: bool,

    /// Seed of the feedback model
    #[arg(long)]
    seed: Option<u64>,
}

/// Feedback the simulated PHY reports for a grant
#[derive(Debug, Clone, Copy)]
enum Feedback {
    Harq { rnti: Rnti, harq_id: u8 },
    Crc { rnti: Rnti, harq_id: u8 },
    Msg3 { rnti: Rnti },
}

/// Running totals reported periodically
#[derive(Debug, Default)]
struct SlotStats {
    slots: u64,
    dl_grants: u64,
    dl_retx: u64,
    dl_bytes: u64,
    ul_grants: u64,
    ul_bytes: u64,
    skipped: u64,
}

impl SlotStats {
    fn record(&mut self, schedule: &SlotSchedule) {
        self.slots += 1;
        self.skipped += schedule.skipped.len() as u64;
        for grant in &schedule.dl_grants {
            if let DlGrantKind::Data { round, .. } = grant.kind {
                self.dl_grants += 1;
                if round > 0 {
                    self.dl_retx += 1;
                } else {
                    self.dl_bytes += grant.tbs_bytes as u64;
                }
            }
        }
        for grant in &schedule.ul_grants {
            if let UlGrantKind::Data { round: 0, .. } = grant.kind {
                self.ul_bytes += grant.tbs_bytes as u64;
            }
            self.ul_grants += 1;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut gnb_config = GnbConfig::from_file(&args.config)
        .with_context(|| format!("loading configuration {}", args.config.display()))?;

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| gnb_config.log.level.clone());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Albor Space 5G GNodeB scheduler");
    info!("Configuration file: {}", args.config.display());

    if let Some(khz) = args.scs_khz {
        let scs = SubcarrierSpacing::from_u32(khz).ok_or_else(|| anyhow::anyhow!("Invalid subcarrier spacing: {} kHz", khz))?;
        let cell = &mut gnb_config.mac.cell;
        cell.scs = scs;
        cell.initial_dl_bwp.scs = scs;
        cell.initial_ul_bwp.scs = scs;
    }

    let cell = &gnb_config.mac.cell;
    info!("Cell configuration:");
    info!("  PCI: {}", cell.pci.0);
    info!("  Cell ID: {}", cell.cell_id.0);
    info!("  Carrier: {} RBs", cell.carrier_rbs);
    info!("  Subcarrier spacing: {:?}", cell.scs);
    info!("  CORESET#0 index: {}", cell.coreset0_index);

    // Initialize MAC layer
    let mut mac_layer = MacLayer::new(gnb_config.mac.clone())?;
    mac_layer.initialize().await?;
    info!("MAC layer initialized");
    let mac_layer = Arc::new(mac_layer);

    for ue in &gnb_config.ues {
        mac_layer.add_ue(ue.rnti(), ue.config.clone()).await?;
    }
    info!("{} UEs admitted", gnb_config.ues.len());

    let rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let (feedback_tx, feedback_rx) = mpsc::channel::<Feedback>(1024);

    // Feedback arrives asynchronously to the slot ticker
    let feedback_handle = {
        let mac = mac_layer.clone();
        let sim = gnb_config.simulation.clone();
        let template = gnb_config.ues.first().map(|ue| ue.config.clone());
        tokio::spawn(feedback_task(mac, sim, template, rng, feedback_rx))
    };

    let slot_loop = run_slots(mac_layer.clone(), gnb_config.simulation.clone(), &args, feedback_tx);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = slot_loop => {
            match result {
                Ok(stats) => info!(
                    "Slot loop finished: {} slots, {} DL grants ({} retx), {} UL grants",
                    stats.slots, stats.dl_grants, stats.dl_retx, stats.ul_grants
                ),
                Err(e) => error!("Slot loop stopped: {:#}", e),
            }
        }
    }

    // Shutdown
    info!("Shutting down GNodeB");
    let _ = tokio::time::timeout(Duration::from_secs(5), feedback_handle).await;

    match Arc::try_unwrap(mac_layer) {
        Ok(mut mac) => mac.shutdown().await?,
        Err(_) => warn!("MAC layer still referenced at shutdown"),
    }

    info!("GNodeB shutdown complete");
    Ok(())
}

/// Drive slot indications and queue the feedback each grant will produce
async fn run_slots(
    mac: Arc<MacLayer>,
    sim: SimulationConfig,
    args: &Args,
    feedback_tx: mpsc::Sender<Feedback>,
) -> Result<SlotStats> {
    let spf = mac.slots_per_frame();
    let slot_us = mac.config().cell.scs.slot_duration_us();
    let mut interval = tokio::time::interval(Duration::from_micros(slot_us as u64));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut stats = SlotStats::default();
    // Feedback keyed by the slot count it is reported in
    let mut pending: BTreeMap<u64, Vec<Feedback>> = BTreeMap::new();
    let mut next_preamble = 0u8;
    let mut slot_count = 0u64;

    while args.slots == 0 || slot_count < args.slots {
        if args.fast {
            tokio::task::yield_now().await;
        } else {
            interval.tick().await;
        }
        let now = SlotPoint::from_count(slot_count as u32, spf);

        if sim.refill_period_slots > 0 && slot_count % sim.refill_period_slots as u64 == 0 {
            for rnti in mac.ue_rntis().await {
                mac.dl_buffer_status(rnti, sim.dl_bytes).await?;
                mac.bsr(rnti, sim.ul_bytes).await?;
            }
        }

        if sim.rach_period_slots > 0 && slot_count % sim.rach_period_slots as u64 == 0 {
            let indication = RachIndication {
                slot: now,
                preamble: next_preamble,
                ra_rnti: 1 + now.slot,
                timing_advance: 0,
            };
            next_preamble = (next_preamble + 1) % 64;
            let tc_rnti = mac.rach_indication(indication).await?;
            debug!("PRACH preamble {} detected, TC-RNTI {:#06x}", indication.preamble, tc_rnti.value());
        }

        let schedule = mac.slot_indication(now).await?;
        stats.record(&schedule);

        for dci in schedule.dl_grants.iter().map(|g| &g.dci).chain(schedule.ul_grants.iter().filter_map(|g| g.dci.as_ref())) {
            trace!(
                "DCI {} for {:#06x} at CCE {} AL{}: {}",
                dci.format,
                dci.rnti.value(),
                dci.pdcch.first_cce,
                dci.pdcch.aggregation_level,
                bytes_to_hex(&dci.payload.to_bytes())
            );
        }

        for grant in &schedule.dl_grants {
            if let (DlGrantKind::Data { harq_id, .. }, Some(slot)) = (grant.kind, grant.feedback_slot) {
                let due = slot_count + slot.slots_since(now, spf) as u64;
                pending.entry(due).or_default().push(Feedback::Harq { rnti: grant.rnti, harq_id });
            }
        }
        for grant in &schedule.ul_grants {
            let due = slot_count + grant.pusch_slot.slots_since(now, spf) as u64;
            let feedback = match grant.kind {
                UlGrantKind::Data { harq_id, .. } => Feedback::Crc { rnti: grant.rnti, harq_id },
                UlGrantKind::Msg3 => Feedback::Msg3 { rnti: grant.rnti },
            };
            pending.entry(due).or_default().push(feedback);
        }

        // Everything reported up to this slot goes to the feedback task
        while let Some(entry) = pending.first_entry() {
            if *entry.key() > slot_count {
                break;
            }
            for feedback in entry.remove() {
                if feedback_tx.send(feedback).await.is_err() {
                    warn!("Feedback task gone");
                    return Ok(stats);
                }
            }
        }

        if stats.slots % (10 * spf as u64) == 0 {
            info!(
                "Scheduler statistics: slots={} DL grants={} (retx {}) DL bytes={} UL grants={} UL bytes={} skipped={}",
                stats.slots, stats.dl_grants, stats.dl_retx, stats.dl_bytes, stats.ul_grants, stats.ul_bytes, stats.skipped
            );
        }
        slot_count += 1;
    }
    Ok(stats)
}

/// Apply the synthetic channel to queued feedback
async fn feedback_task(
    mac: Arc<MacLayer>,
    sim: SimulationConfig,
    template: Option<UeSchedConfig>,
    mut rng: StdRng,
    mut rx: mpsc::Receiver<Feedback>,
) {
    while let Some(feedback) = rx.recv().await {
        let result = match feedback {
            Feedback::Harq { rnti, harq_id } => {
                let ack = if rng.gen_bool(sim.dtx_probability) {
                    None
                } else {
                    Some(rng.gen_bool(sim.ack_probability))
                };
                mac.harq_indication(rnti, harq_id, ack).await.map(|_| ())
            }
            Feedback::Crc { rnti, harq_id } => {
                let ok = rng.gen_bool(sim.ack_probability);
                mac.crc_indication(rnti, harq_id, ok).await.map(|_| ())
            }
            Feedback::Msg3 { rnti } => match &template {
                Some(config) if rng.gen_bool(sim.ack_probability) => {
                    info!("Msg3 from TC-RNTI {:#06x} decoded, admitting UE", rnti.value());
                    mac.add_ue(rnti, config.clone()).await
                }
                _ => {
                    debug!("Msg3 from TC-RNTI {:#06x} lost", rnti.value());
                    Ok(())
                }
            },
        };
        if let Err(e) = result {
            warn!("Feedback {:?} rejected: {}", feedback, e);
        }
    }
    debug!("Feedback task finished");
}
