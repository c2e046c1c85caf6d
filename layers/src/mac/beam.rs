//! Beam Allocation
//!
//! Rotating table of beam tracks. Each track can serve one beam per
//! allocation period; UEs on the same beam share the track, and the track
//! index is the occupancy map beam index used for the slot.

use serde::{Deserialize, Serialize};

/// Beam management configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeamConfig {
    /// Enable analog beam management
    #[serde(default)]
    pub enabled: bool,
    /// Slots a beam allocation lasts
    #[serde(default = "default_beam_duration")]
    pub beam_duration: u16,
    /// Number of allocation periods in the rotating table
    #[serde(default = "default_allocation_size")]
    pub allocation_size: usize,
    /// Beams that can be served simultaneously
    #[serde(default = "default_num_tracks")]
    pub num_tracks: usize,
}

fn default_beam_duration() -> u16 {
    1
}

fn default_allocation_size() -> usize {
    20
}

fn default_num_tracks() -> usize {
    1
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            beam_duration: default_beam_duration(),
            allocation_size: default_allocation_size(),
            num_tracks: default_num_tracks(),
        }
    }
}

/// Track granted to a beam for one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeamSlot {
    /// Track index, also the occupancy map beam index
    pub track: usize,
    /// The track was empty before this allocation
    pub newly_allocated: bool,
}

/// Rotating beam track table
#[derive(Debug, Clone)]
pub struct BeamAllocator {
    config: BeamConfig,
    table: Vec<Option<u16>>,
}

impl BeamAllocator {
    pub fn new(config: BeamConfig) -> Self {
        let entries = if config.enabled {
            config.num_tracks.max(1) * config.allocation_size.max(1)
        } else {
            0
        };
        Self { config, table: vec![None; entries] }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Number of tracks, which sizes the occupancy map
    pub fn num_tracks(&self) -> usize {
        if self.config.enabled {
            self.config.num_tracks.max(1)
        } else {
            1
        }
    }

    fn period_index(&self, frame: u16, slot: u16, slots_per_frame: u16) -> usize {
        let count = frame as usize * slots_per_frame as usize + slot as usize;
        (count / self.config.beam_duration.max(1) as usize) % self.config.allocation_size.max(1)
    }

    fn entry(&self, track: usize, index: usize) -> usize {
        track * self.config.allocation_size.max(1) + index
    }

    /// Allocate a track for `beam` at (frame, slot).
    ///
    /// A track already holding `beam` in this period is shared; otherwise the
    /// first empty track is taken. `None` when every track holds another beam.
    pub fn allocate(&mut self, frame: u16, slot: u16, beam: u16, slots_per_frame: u16) -> Option<BeamSlot> {
        if !self.config.enabled {
            return Some(BeamSlot { track: 0, newly_allocated: false });
        }

        let index = self.period_index(frame, slot, slots_per_frame);
        let tracks = 0..self.num_tracks();
        if let Some(track) = tracks.clone().find(|&t| self.table[self.entry(t, index)] == Some(beam)) {
            return Some(BeamSlot { track, newly_allocated: false });
        }

        let track = tracks.clone().find(|&t| self.table[self.entry(t, index)].is_none())?;
        let entry = self.entry(track, index);
        self.table[entry] = Some(beam);
        Some(BeamSlot { track, newly_allocated: true })
    }

    /// Undo an allocation whose slot ended up unused. Shared tracks stay.
    pub fn release(&mut self, frame: u16, slot: u16, allocation: BeamSlot, slots_per_frame: u16) {
        if !self.config.enabled || !allocation.newly_allocated {
            return;
        }
        let index = self.period_index(frame, slot, slots_per_frame);
        let entry = self.entry(allocation.track, index);
        if let Some(cell) = self.table.get_mut(entry) {
            *cell = None;
        }
    }

    /// Clear the period starting at (frame, slot) before it is reused
    pub fn reset_period(&mut self, frame: u16, slot: u16, slots_per_frame: u16) {
        let count = frame as usize * slots_per_frame as usize + slot as usize;
        if !self.config.enabled || count % self.config.beam_duration.max(1) as usize != 0 {
            return;
        }
        let index = self.period_index(frame, slot, slots_per_frame);
        for track in 0..self.num_tracks() {
            let entry = self.entry(track, index);
            self.table[entry] = None;
        }
    }
}
