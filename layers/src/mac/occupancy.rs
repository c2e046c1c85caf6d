//! Per-beam resource occupancy map
//!
//! One entry per (beam, RB) holding a bitmask of the OFDM symbols already
//! allocated in the current slot. Shared by control-channel placement and by
//! the data-channel allocation of every UE scheduled in the slot.

use common::types::SYMBOLS_PER_SLOT;

/// Bitmask of OFDM symbols within a slot, bit `n` = symbol `n`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SymbolMask(pub u16);

impl SymbolMask {
    /// Every symbol of a normal-CP slot
    pub const FULL_SLOT: Self = Self((1 << SYMBOLS_PER_SLOT) - 1);

    /// Symbols `[start, start + len)`, clipped to the slot
    pub fn range(start: u8, len: u8) -> Self {
        let end = (start as u32 + len as u32).min(SYMBOLS_PER_SLOT as u32);
        let start = (start as u32).min(end);
        let bits = ((1u32 << end) - 1) & !((1u32 << start) - 1);
        Self(bits as u16)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn intersects(&self, other: SymbolMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Number of symbols in the mask
    pub fn len(&self) -> u8 {
        self.0.count_ones() as u8
    }
}

/// Resource occupancy of one slot, per beam
#[derive(Debug, Clone)]
pub struct VrbMap {
    num_beams: usize,
    num_rbs: u16,
    symbols: Vec<u16>,
}

impl VrbMap {
    /// Create an empty map for `num_beams` beams over `num_rbs` RBs
    pub fn new(num_beams: usize, num_rbs: u16) -> Self {
        let num_beams = num_beams.max(1);
        Self {
            num_beams,
            num_rbs,
            symbols: vec![0; num_beams * num_rbs as usize],
        }
    }

    pub fn num_beams(&self) -> usize {
        self.num_beams
    }

    pub fn num_rbs(&self) -> u16 {
        self.num_rbs
    }

    /// Release everything, at the start of a slot
    pub fn clear(&mut self) {
        self.symbols.fill(0);
    }

    fn index(&self, beam: usize, rb: u16) -> Option<usize> {
        (beam < self.num_beams && rb < self.num_rbs).then(|| beam * self.num_rbs as usize + rb as usize)
    }

    /// Symbols already used at `rb` on `beam`; out-of-range positions read as fully used
    pub fn occupied(&self, beam: usize, rb: u16) -> SymbolMask {
        match self.index(beam, rb) {
            Some(idx) => SymbolMask(self.symbols[idx]),
            None => SymbolMask(u16::MAX),
        }
    }

    /// True when none of `mask` is used at `rb` on `beam`
    pub fn is_free(&self, beam: usize, rb: u16, mask: SymbolMask) -> bool {
        !self.occupied(beam, rb).intersects(mask)
    }

    /// True when `[start, start + len)` is free on `beam` for `mask`
    pub fn is_range_free(&self, beam: usize, start: u16, len: u16, mask: SymbolMask) -> bool {
        (start..start.saturating_add(len)).all(|rb| self.is_free(beam, rb, mask))
    }

    /// Mark `mask` at `rb` on `beam`. Out-of-range positions are ignored.
    pub fn mark(&mut self, beam: usize, rb: u16, mask: SymbolMask) {
        if let Some(idx) = self.index(beam, rb) {
            self.symbols[idx] |= mask.0;
        }
    }

    /// Clear `mask` at `rb` on `beam`, undoing a mark made on free positions
    pub fn release(&mut self, beam: usize, rb: u16, mask: SymbolMask) {
        if let Some(idx) = self.index(beam, rb) {
            self.symbols[idx] &= !mask.0;
        }
    }

    /// Mark `mask` over `[start, start + len)` on `beam`
    pub fn mark_range(&mut self, beam: usize, start: u16, len: u16, mask: SymbolMask) {
        for rb in start..start.saturating_add(len) {
            self.mark(beam, rb, mask);
        }
    }

    /// Longest run of RBs in `[start, end)` free for `mask` on `beam`, as (first RB, length)
    pub fn largest_free_run(&self, beam: usize, start: u16, end: u16, mask: SymbolMask) -> Option<(u16, u16)> {
        let mut best: Option<(u16, u16)> = None;
        let mut run_start = None;

        for rb in start..=end {
            let free = rb < end && self.is_free(beam, rb, mask);
            match (free, run_start) {
                (true, None) => run_start = Some(rb),
                (false, Some(first)) => {
                    let len = rb - first;
                    if best.map_or(true, |(_, best_len)| len > best_len) {
                        best = Some((first, len));
                    }
                    run_start = None;
                }
                _ => {}
            }
        }
        best
    }
}
