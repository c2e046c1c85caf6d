//! Link Adaptation
//!
//! Closed-loop MCS selection per UE and direction, driven by a filtered
//! block error rate estimated from HARQ round statistics.

use common::types::frame_diff;
use serde::{Deserialize, Serialize};

/// Weight of the previous filtered error rate
const FILTER_ALPHA: f32 = 0.9;

/// Transmissions per window above which an MCS increase is allowed
const MIN_TX_FOR_INCREASE: u64 = 3;

/// Transmissions per window below which the MCS is lowered regardless of errors
const MIN_TX_FOR_ACTIVITY: u64 = 3;

/// Link adaptation thresholds and bounds for one direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkAdaptationConfig {
    /// Evaluation window in frames
    #[serde(default = "default_window_frames")]
    pub window_frames: u16,
    /// Filtered error rate below which the MCS is raised
    #[serde(default = "default_bler_lower")]
    pub bler_lower: f32,
    /// Filtered error rate above which the MCS is lowered
    #[serde(default = "default_bler_upper")]
    pub bler_upper: f32,
    /// Lowest MCS the controller may select
    #[serde(default)]
    pub min_mcs: u8,
    /// Highest MCS the controller may select
    #[serde(default = "default_max_mcs")]
    pub max_mcs: u8,
    /// MCS used before the first evaluation
    #[serde(default = "default_initial_mcs")]
    pub initial_mcs: u8,
}

fn default_window_frames() -> u16 {
    10
}

fn default_bler_lower() -> f32 {
    0.05
}

fn default_bler_upper() -> f32 {
    0.15
}

fn default_max_mcs() -> u8 {
    28
}

fn default_initial_mcs() -> u8 {
    9
}

impl Default for LinkAdaptationConfig {
    fn default() -> Self {
        Self {
            window_frames: default_window_frames(),
            bler_lower: default_bler_lower(),
            bler_upper: default_bler_upper(),
            min_mcs: 0,
            max_mcs: default_max_mcs(),
            initial_mcs: default_initial_mcs(),
        }
    }
}

/// Cumulative transmission counters per HARQ round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundStats {
    /// `rounds[0]` counts initial transmissions, `rounds[k]` the k-th retransmissions
    pub rounds: [u64; 4],
}

impl RoundStats {
    /// Count one transmission in `round` (rounds past the last bucket share it)
    pub fn record(&mut self, round: u8) {
        let idx = (round as usize).min(self.rounds.len() - 1);
        self.rounds[idx] += 1;
    }
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    frame: u16,
    stats: RoundStats,
}

/// MCS controller of one UE in one direction
#[derive(Debug, Clone)]
pub struct LinkAdaptation {
    config: LinkAdaptationConfig,
    mcs: u8,
    bler: f32,
    baseline: Option<Baseline>,
}

impl LinkAdaptation {
    pub fn new(config: LinkAdaptationConfig) -> Self {
        let mcs = config.initial_mcs.clamp(config.min_mcs, config.max_mcs);
        let bler = (config.bler_lower + config.bler_upper) / 2.0;
        Self { config, mcs, bler, baseline: None }
    }

    /// Current MCS
    pub fn mcs(&self) -> u8 {
        self.mcs
    }

    /// Current filtered error rate
    pub fn bler(&self) -> f32 {
        self.bler
    }

    /// Whether a baseline has been recorded
    pub fn is_active(&self) -> bool {
        self.baseline.is_some()
    }

    /// Re-evaluate the MCS at frame `now` from cumulative `stats`.
    ///
    /// At most one update per window; between windows the current MCS is
    /// returned unchanged. The first call only records the baseline.
    pub fn evaluate(&mut self, now: u16, stats: &RoundStats) -> u8 {
        let Some(baseline) = self.baseline else {
            self.baseline = Some(Baseline { frame: now, stats: *stats });
            return self.mcs;
        };

        if frame_diff(now, baseline.frame) < self.config.window_frames {
            return self.mcs;
        }

        let num_tx = stats.rounds[0].saturating_sub(baseline.stats.rounds[0]);
        let num_retx = stats.rounds[1].saturating_sub(baseline.stats.rounds[1]);
        let window_bler = if num_tx > 0 {
            (num_retx as f32 / num_tx as f32).min(1.0)
        } else {
            self.bler
        };
        self.bler = FILTER_ALPHA * self.bler + (1.0 - FILTER_ALPHA) * window_bler;

        if self.bler < self.config.bler_lower && num_tx > MIN_TX_FOR_INCREASE {
            self.mcs = (self.mcs + 1).min(self.config.max_mcs);
        } else if self.bler > self.config.bler_upper || num_tx < MIN_TX_FOR_ACTIVITY {
            self.mcs = self.mcs.saturating_sub(1).max(self.config.min_mcs);
        }

        self.baseline = Some(Baseline { frame: now, stats: *stats });
        self.mcs
    }
}
