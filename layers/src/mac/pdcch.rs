//! PDCCH Resource Placement
//!
//! CORESET layout (TS 38.211 Section 7.3.2.2), search space candidate
//! derivation (TS 38.213 Section 10.1) and collision-free candidate selection
//! against the slot occupancy map.

use super::config::{BwpConfig, CceRegMapping, CoresetConfig, SearchSpaceConfig, SearchSpaceKind, NUM_AGGREGATION_LEVELS};
use super::occupancy::{SymbolMask, VrbMap};
use super::MacError;
use common::types::Rnti;

/// Aggregation levels in increasing order
pub const AGGREGATION_LEVELS: [u8; NUM_AGGREGATION_LEVELS] = [1, 2, 4, 8, 16];

/// REGs per CCE
const REGS_PER_CCE: u32 = 6;

/// Number of RB groups addressed by frequencyDomainResources
const FDR_GROUPS: u32 = 45;

/// Modulus D of the search space hashing function
const HASH_MODULUS: u32 = 65537;

/// CORESET#0 configuration based on 3GPP TS 38.213
#[derive(Debug, Clone)]
pub struct Coreset0Config {
    /// Number of resource blocks
    pub num_rbs: u32,
    /// Number of symbols
    pub num_symbols: u32,
    /// RB offset from the SSB
    pub rb_offset: u32,
}

impl Coreset0Config {
    /// Get CORESET#0 configuration from table index
    /// Based on 3GPP TS 38.213 Table 13-1 for {15, 15} kHz SCS
    pub fn from_index(index: u8) -> Result<Self, MacError> {
        let config = match index {
            0 => Self { num_rbs: 24, num_symbols: 2, rb_offset: 0 },
            1 => Self { num_rbs: 24, num_symbols: 2, rb_offset: 2 },
            2 => Self { num_rbs: 24, num_symbols: 2, rb_offset: 4 },
            3 => Self { num_rbs: 24, num_symbols: 3, rb_offset: 0 },
            4 => Self { num_rbs: 24, num_symbols: 3, rb_offset: 2 },
            5 => Self { num_rbs: 24, num_symbols: 3, rb_offset: 4 },
            6 => Self { num_rbs: 48, num_symbols: 1, rb_offset: 12 },
            7 => Self { num_rbs: 48, num_symbols: 1, rb_offset: 16 },
            8 => Self { num_rbs: 48, num_symbols: 2, rb_offset: 12 },
            9 => Self { num_rbs: 48, num_symbols: 2, rb_offset: 16 },
            10 => Self { num_rbs: 48, num_symbols: 3, rb_offset: 12 },
            11 => Self { num_rbs: 48, num_symbols: 3, rb_offset: 16 },
            12 => Self { num_rbs: 96, num_symbols: 1, rb_offset: 38 },
            13 => Self { num_rbs: 96, num_symbols: 2, rb_offset: 38 },
            14 => Self { num_rbs: 96, num_symbols: 3, rb_offset: 38 },
            _ => return Err(MacError::InvalidConfiguration(
                format!("Invalid CORESET#0 index: {}", index)
            )),
        };
        Ok(config)
    }
}

/// Physical layout of a CORESET within its BWP
#[derive(Debug, Clone, PartialEq)]
pub struct CoresetLayout {
    /// CORESET id
    pub coreset_id: u8,
    /// First symbol, from the search space
    pub start_symbol: u8,
    /// Duration in symbols
    pub duration: u8,
    /// Common RBs of the CORESET in increasing order
    pub rbs: Vec<u16>,
    /// REG bundle size L
    pub reg_bundle_size: u8,
    /// Interleaver size R, `None` for non-interleaved mapping
    pub interleaver_size: Option<u8>,
    /// Shift index n_shift
    pub shift_index: u16,
    /// Number of CCEs
    pub num_cces: u16,
}

impl CoresetLayout {
    /// Compute the layout of `coreset` monitored through `search_space` in `bwp`
    pub fn new(coreset: &CoresetConfig, search_space: &SearchSpaceConfig, bwp: &BwpConfig) -> Result<Self, MacError> {
        if coreset.id == 0 {
            return Err(MacError::InvalidCoreset("CORESET#0 is derived from the MIB index".into()));
        }
        if search_space.coreset_id != coreset.id {
            return Err(MacError::InvalidCoreset(format!(
                "search space {} refers to CORESET {}, not {}",
                search_space.id, search_space.coreset_id, coreset.id
            )));
        }

        // RB groups are aligned to multiples of 6 in the common RB grid
        let grid_start = (bwp.start_rb as u32 + 5) / 6 * 6;
        let bwp_end = bwp.start_rb as u32 + bwp.num_rbs as u32;
        let mut rbs = Vec::new();
        for group in 0..FDR_GROUPS {
            if coreset.frequency_domain_resources & (1u64 << (FDR_GROUPS - 1 - group)) == 0 {
                continue;
            }
            let first = grid_start + 6 * group;
            if first + 6 > bwp_end {
                return Err(MacError::InvalidCoreset(format!(
                    "CORESET {} RB group {} ends at RB {} beyond BWP end {}",
                    coreset.id, group, first + 6, bwp_end
                )));
            }
            rbs.extend((first..first + 6).map(|rb| rb as u16));
        }
        if coreset.frequency_domain_resources >> FDR_GROUPS != 0 {
            return Err(MacError::InvalidCoreset(format!(
                "CORESET {} frequency resources exceed 45 bits",
                coreset.id
            )));
        }

        Self::from_rbs(coreset.id, search_space.first_symbol, coreset.duration, rbs, coreset.cce_reg_mapping)
    }

    /// Layout of CORESET#0 starting at common RB `start_rb`
    pub fn coreset0(config: &Coreset0Config, start_rb: u16, first_symbol: u8, pci: u16) -> Result<Self, MacError> {
        let rbs = (0..config.num_rbs as u16).map(|rb| start_rb + rb).collect();
        let mapping = CceRegMapping::Interleaved {
            reg_bundle_size: 6,
            interleaver_size: 2,
            shift_index: pci,
        };
        Self::from_rbs(0, first_symbol, config.num_symbols as u8, rbs, mapping)
    }

    fn from_rbs(
        coreset_id: u8,
        start_symbol: u8,
        duration: u8,
        rbs: Vec<u16>,
        mapping: CceRegMapping,
    ) -> Result<Self, MacError> {
        if !(1..=3).contains(&duration) {
            return Err(MacError::InvalidCoreset(format!("CORESET {} duration {} outside 1..=3", coreset_id, duration)));
        }
        if start_symbol + duration > common::types::SYMBOLS_PER_SLOT {
            return Err(MacError::InvalidCoreset(format!(
                "CORESET {} symbols {}..{} exceed the slot",
                coreset_id, start_symbol, start_symbol + duration
            )));
        }

        let num_regs = rbs.len() as u32 * duration as u32;
        let num_cces = num_regs / REGS_PER_CCE;
        if num_cces == 0 {
            return Err(MacError::InvalidCoreset(format!("CORESET {} holds no CCE", coreset_id)));
        }

        let (reg_bundle_size, interleaver_size, shift_index) = match mapping {
            CceRegMapping::NonInterleaved => (6, None, 0),
            CceRegMapping::Interleaved { reg_bundle_size, interleaver_size, shift_index } => {
                let bundle_ok = match duration {
                    1 => matches!(reg_bundle_size, 2 | 6),
                    d => reg_bundle_size == d || reg_bundle_size == 6,
                };
                if !bundle_ok || !matches!(interleaver_size, 2 | 3 | 6) {
                    return Err(MacError::InvalidCoreset(format!(
                        "CORESET {}: bundle size {} / interleaver size {} invalid for duration {}",
                        coreset_id, reg_bundle_size, interleaver_size, duration
                    )));
                }
                if num_regs % (reg_bundle_size as u32 * interleaver_size as u32) != 0 {
                    return Err(MacError::InvalidCoreset(format!(
                        "CORESET {}: {} REGs not divisible by L*R = {}",
                        coreset_id, num_regs, reg_bundle_size as u32 * interleaver_size as u32
                    )));
                }
                (reg_bundle_size, Some(interleaver_size), shift_index)
            }
        };

        Ok(Self {
            coreset_id,
            start_symbol,
            duration,
            rbs,
            reg_bundle_size,
            interleaver_size,
            shift_index,
            num_cces: num_cces as u16,
        })
    }

    /// Symbols occupied by the CORESET
    pub fn symbols(&self) -> SymbolMask {
        SymbolMask::range(self.start_symbol, self.duration)
    }

    /// Lowest and one-past-highest common RB of the CORESET
    pub fn rb_range(&self) -> (u16, u16) {
        match (self.rbs.first(), self.rbs.last()) {
            (Some(&first), Some(&last)) => (first, last + 1),
            _ => (0, 0),
        }
    }

    fn num_regs(&self) -> u32 {
        self.rbs.len() as u32 * self.duration as u32
    }

    // REG bundle interleaver f(x)
    fn interleave(&self, bundle: u32) -> u32 {
        match self.interleaver_size {
            None => bundle,
            Some(r) => {
                let r = r as u32;
                let num_bundles = self.num_regs() / self.reg_bundle_size as u32;
                let c = num_bundles / r;
                let (row, col) = (bundle % r, bundle / r);
                (row * c + col + self.shift_index as u32) % num_bundles
            }
        }
    }

    /// Common RBs carrying `cce`. Every REG bundle spans whole RBs over the
    /// CORESET duration, so RB granularity is exact.
    pub fn cce_rbs(&self, cce: u16) -> impl Iterator<Item = u16> + '_ {
        let bundle_size = self.reg_bundle_size as u32;
        let bundles_per_cce = REGS_PER_CCE / bundle_size;
        let rbs_per_bundle = bundle_size / self.duration as u32;
        (0..bundles_per_cce).flat_map(move |k| {
            let bundle = self.interleave(cce as u32 * bundles_per_cce + k);
            let first = bundle * rbs_per_bundle;
            (first..first + rbs_per_bundle).map(move |idx| self.rbs[idx as usize])
        })
    }
}

/// Search space hashing value Y_{p,n} for `slot` (0 for common search spaces)
pub fn pdcch_hash(kind: SearchSpaceKind, coreset_id: u8, rnti: Rnti, slot: u16) -> u32 {
    if kind == SearchSpaceKind::Common {
        return 0;
    }
    let a = match coreset_id % 3 {
        0 => 39827u64,
        1 => 39829,
        _ => 39839,
    };
    let mut y = rnti.value() as u64;
    for _ in 0..=slot {
        y = (a * y) % HASH_MODULUS as u64;
    }
    y as u32
}

/// First CCE of candidate `m` of `num_candidates` at aggregation level `al`
pub fn candidate_first_cce(num_cces: u16, al: u8, m: u8, num_candidates: u8, hash: u32) -> Option<u16> {
    let (n, l, big_m) = (num_cces as u32, al as u32, num_candidates as u32);
    if l == 0 || big_m == 0 || n < l {
        return None;
    }
    let positions = n / l;
    let offset = (m as u32 * n) / (l * big_m);
    Some((l * ((hash + offset) % positions)) as u16)
}

fn candidate_is_free(layout: &CoresetLayout, first_cce: u16, al: u8, beam: usize, occupancy: &VrbMap) -> bool {
    let symbols = layout.symbols();
    (first_cce..first_cce + al as u16)
        .flat_map(|cce| layout.cce_rbs(cce))
        .all(|rb| occupancy.is_free(beam, rb, symbols))
}

/// Find the first candidate at `al` whose RBs are free on `beam`
pub fn find_candidate(
    layout: &CoresetLayout,
    al: u8,
    num_candidates: u8,
    beam: usize,
    occupancy: &VrbMap,
    hash: u32,
) -> Option<u16> {
    (0..num_candidates)
        .filter_map(|m| candidate_first_cce(layout.num_cces, al, m, num_candidates, hash))
        .find(|&first_cce| candidate_is_free(layout, first_cce, al, beam, occupancy))
}

/// Mark every RB and symbol of an accepted candidate as used on `beam`
pub fn mark(layout: &CoresetLayout, first_cce: u16, al: u8, beam: usize, occupancy: &mut VrbMap) {
    let symbols = layout.symbols();
    for cce in first_cce..first_cce + al as u16 {
        for rb in layout.cce_rbs(cce) {
            occupancy.mark(beam, rb, symbols);
        }
    }
}

/// Aggregation level indexes in search order for a channel adjustment in [0, 1].
///
/// Starts at the level nearest to `adjust * 4`, then goes up, then down
/// through the levels that were skipped.
pub fn aggregation_level_order(adjust: f32) -> [usize; NUM_AGGREGATION_LEVELS] {
    let top = NUM_AGGREGATION_LEVELS - 1;
    let start = (adjust.clamp(0.0, 1.0) * top as f32).round() as usize;
    let mut order = [0; NUM_AGGREGATION_LEVELS];
    let mut pos = 0;
    for idx in (start..=top).chain((0..start).rev()) {
        order[pos] = idx;
        pos += 1;
    }
    order
}

/// A placed PDCCH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdcchAllocation {
    /// Aggregation level
    pub aggregation_level: u8,
    /// First CCE of the candidate
    pub first_cce: u16,
}

/// Search all aggregation levels of `search_space` for a candidate free on `beam`.
///
/// Nothing is marked; the caller commits the result once its grant is settled.
pub fn select(
    layout: &CoresetLayout,
    search_space: &SearchSpaceConfig,
    adjust: f32,
    beam: usize,
    occupancy: &VrbMap,
    hash: u32,
) -> Option<PdcchAllocation> {
    aggregation_level_order(adjust).into_iter().find_map(|idx| {
        let num_candidates = search_space.num_candidates[idx];
        if num_candidates == 0 {
            return None;
        }
        let al = AGGREGATION_LEVELS[idx];
        find_candidate(layout, al, num_candidates, beam, occupancy, hash)
            .map(|first_cce| PdcchAllocation { aggregation_level: al, first_cce })
    })
}

/// Mark a selected candidate as used
pub fn commit(layout: &CoresetLayout, allocation: PdcchAllocation, beam: usize, occupancy: &mut VrbMap) {
    mark(layout, allocation.first_cce, allocation.aggregation_level, beam, occupancy);
}

/// Undo [`commit`] for a candidate whose grant was dropped.
///
/// The candidate was free when selected, so clearing its positions restores
/// the map to its state before the commit.
pub fn release(layout: &CoresetLayout, allocation: PdcchAllocation, beam: usize, occupancy: &mut VrbMap) {
    let symbols = layout.symbols();
    let first = allocation.first_cce;
    for cce in first..first + allocation.aggregation_level as u16 {
        for rb in layout.cce_rbs(cce) {
            occupancy.release(beam, rb, symbols);
        }
    }
}

/// Select a free candidate and commit it.
///
/// `None` means the DCI cannot be sent this slot; the caller skips the UE.
pub fn place(
    layout: &CoresetLayout,
    search_space: &SearchSpaceConfig,
    adjust: f32,
    beam: usize,
    occupancy: &mut VrbMap,
    hash: u32,
) -> Option<PdcchAllocation> {
    let allocation = select(layout, search_space, adjust, beam, occupancy, hash)?;
    commit(layout, allocation, beam, occupancy);
    Some(allocation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::config::DciFormats;
    use common::types::{CyclicPrefix, SubcarrierSpacing};
    use proptest::prelude::*;

    fn bwp(start_rb: u16, num_rbs: u16) -> BwpConfig {
        BwpConfig { id: 1, start_rb, num_rbs, scs: SubcarrierSpacing::Scs30, cyclic_prefix: CyclicPrefix::Normal }
    }

    fn search_space(num_candidates: [u8; 5]) -> SearchSpaceConfig {
        SearchSpaceConfig {
            id: 2,
            coreset_id: 1,
            kind: SearchSpaceKind::UeSpecific,
            first_symbol: 0,
            num_candidates,
            formats: DciFormats::FALLBACK,
        }
    }

    /// 8 groups x 6 RBs x 2 symbols = 96 REGs = 16 CCEs
    fn coreset_16_cces(mapping: CceRegMapping) -> CoresetConfig {
        CoresetConfig {
            id: 1,
            frequency_domain_resources: 0xFF << (45 - 8),
            duration: 2,
            cce_reg_mapping: mapping,
        }
    }

    fn layout_16_cces() -> CoresetLayout {
        CoresetLayout::new(&coreset_16_cces(CceRegMapping::NonInterleaved), &search_space([0, 0, 2, 0, 0]), &bwp(0, 52))
            .unwrap()
    }

    #[test]
    fn test_coreset0_config() {
        // Test valid index
        let config = Coreset0Config::from_index(1).unwrap();
        assert_eq!(config.num_rbs, 24);
        assert_eq!(config.num_symbols, 2);
        assert_eq!(config.rb_offset, 2);

        // Test invalid index
        assert!(Coreset0Config::from_index(20).is_err());
    }

    #[test]
    fn test_layout_geometry() {
        let layout = layout_16_cces();
        assert_eq!(layout.num_cces, 16);
        assert_eq!(layout.rbs.len(), 48);
        assert_eq!(layout.rb_range(), (0, 48));
        assert_eq!(layout.symbols(), SymbolMask(0b11));

        // Non-interleaved: CCE 0 covers REGs 0..6 = RBs 0..3 over 2 symbols
        let rbs: Vec<_> = layout.cce_rbs(0).collect();
        assert_eq!(rbs, vec![0, 1, 2]);
    }

    #[test]
    fn test_layout_grid_alignment() {
        // BWP starting at RB 4: RB groups start at common RB 6
        let layout = CoresetLayout::new(
            &coreset_16_cces(CceRegMapping::NonInterleaved),
            &search_space([0, 0, 1, 0, 0]),
            &bwp(4, 60),
        )
        .unwrap();
        assert_eq!(layout.rb_range(), (6, 54));
    }

    #[test]
    fn test_layout_rejects_groups_outside_bwp() {
        let result = CoresetLayout::new(
            &coreset_16_cces(CceRegMapping::NonInterleaved),
            &search_space([0, 0, 1, 0, 0]),
            &bwp(0, 24),
        );
        assert!(matches!(result, Err(MacError::InvalidCoreset(_))));
    }

    #[test]
    fn test_interleaved_mapping_is_permutation() {
        let mapping = CceRegMapping::Interleaved { reg_bundle_size: 2, interleaver_size: 2, shift_index: 5 };
        let layout = CoresetLayout::new(&coreset_16_cces(mapping), &search_space([0, 0, 1, 0, 0]), &bwp(0, 52)).unwrap();

        let mut hits = vec![0u8; 48];
        for cce in 0..layout.num_cces {
            for rb in layout.cce_rbs(cce) {
                hits[rb as usize] += 1;
            }
        }
        // Each RB holds exactly one bundle of 2 REGs
        assert!(hits.iter().all(|&count| count == 1));
    }

    #[test]
    fn test_interleaved_rejects_bad_bundle() {
        let mapping = CceRegMapping::Interleaved { reg_bundle_size: 3, interleaver_size: 2, shift_index: 0 };
        let result = CoresetLayout::new(&coreset_16_cces(mapping), &search_space([0, 0, 1, 0, 0]), &bwp(0, 52));
        assert!(result.is_err());
    }

    #[test]
    fn test_coreset0_layout() {
        let config = Coreset0Config::from_index(1).unwrap();
        let layout = CoresetLayout::coreset0(&config, 0, 0, 1).unwrap();
        assert_eq!(layout.num_cces, 8);
        assert_eq!(layout.interleaver_size, Some(2));
    }

    #[test]
    fn test_hash_common_is_zero() {
        assert_eq!(pdcch_hash(SearchSpaceKind::Common, 0, Rnti(0x4601), 7), 0);
    }

    #[test]
    fn test_hash_recursion() {
        // Y_{p,0} = A_p * Y_{p,-1} mod D with A_1 = 39829
        let y0 = pdcch_hash(SearchSpaceKind::UeSpecific, 1, Rnti(0x4601), 0);
        assert_eq!(y0 as u64, (39829u64 * 0x4601) % 65537);
        let y1 = pdcch_hash(SearchSpaceKind::UeSpecific, 1, Rnti(0x4601), 1);
        assert_eq!(y1 as u64, (39829u64 * y0 as u64) % 65537);
    }

    #[test]
    fn test_candidate_formula() {
        // N_CCE = 16, L = 4, M = 2: offsets 0 and 2 positions
        assert_eq!(candidate_first_cce(16, 4, 0, 2, 0), Some(0));
        assert_eq!(candidate_first_cce(16, 4, 1, 2, 0), Some(8));
        assert_eq!(candidate_first_cce(16, 4, 1, 2, 3), Some(4));
        assert_eq!(candidate_first_cce(16, 16, 0, 1, 9), Some(0));
        assert_eq!(candidate_first_cce(8, 16, 0, 1, 0), None);
    }

    #[test]
    fn test_collision_avoidance_between_users() {
        let layout = layout_16_cces();
        let mut occupancy = VrbMap::new(1, 52);

        let a = find_candidate(&layout, 4, 2, 0, &occupancy, 0).unwrap();
        mark(&layout, a, 4, 0, &mut occupancy);

        let b = find_candidate(&layout, 4, 2, 0, &occupancy, 0).unwrap();
        assert!(b + 4 <= a || a + 4 <= b, "A at {}, B at {}", a, b);

        // With a single candidate the only position is taken
        assert_eq!(find_candidate(&layout, 4, 1, 0, &occupancy, 0), None);
    }

    #[test]
    fn test_other_beam_is_independent() {
        let layout = layout_16_cces();
        let mut occupancy = VrbMap::new(2, 52);
        mark(&layout, 0, 16, 0, &mut occupancy);

        assert_eq!(find_candidate(&layout, 4, 1, 0, &occupancy, 0), None);
        assert_eq!(find_candidate(&layout, 4, 1, 1, &occupancy, 0), Some(0));
    }

    #[test]
    fn test_aggregation_level_order() {
        assert_eq!(aggregation_level_order(0.0), [0, 1, 2, 3, 4]);
        assert_eq!(aggregation_level_order(1.0), [4, 3, 2, 1, 0]);
        assert_eq!(aggregation_level_order(0.5), [2, 3, 4, 1, 0]);
        assert_eq!(aggregation_level_order(0.8), [3, 4, 2, 1, 0]);
        assert_eq!(aggregation_level_order(7.0), [4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_place_falls_back_to_other_levels() {
        let layout = layout_16_cces();
        let ss = search_space([0, 2, 2, 1, 0]);
        let mut occupancy = VrbMap::new(1, 52);

        // Block the only AL8 candidate region (CCEs 0..8)
        mark(&layout, 0, 8, 0, &mut occupancy);

        // Poor channel starts at AL16 (no candidates), then AL8 is blocked, then AL4
        let placed = place(&layout, &ss, 1.0, 0, &mut occupancy, 0).unwrap();
        assert_eq!(placed.aggregation_level, 4);
        assert!(placed.first_cce >= 8);
    }

    #[test]
    fn test_place_exhaustion_is_none() {
        let layout = layout_16_cces();
        let ss = search_space([1, 1, 1, 1, 1]);
        let mut occupancy = VrbMap::new(1, 52);
        occupancy.mark_range(0, 0, 52, SymbolMask::range(0, 1));
        assert_eq!(place(&layout, &ss, 0.0, 0, &mut occupancy, 0), None);
    }

    #[test]
    fn test_release_restores_prior_occupancy() {
        let layout = layout_16_cces();
        let ss = search_space([0, 0, 2, 1, 0]);
        let mut occupancy = VrbMap::new(1, 52);
        let first = place(&layout, &ss, 0.5, 0, &mut occupancy, 0).unwrap();
        let before: Vec<SymbolMask> = (0..52).map(|rb| occupancy.occupied(0, rb)).collect();

        let second = select(&layout, &ss, 0.5, 0, &occupancy, 0).unwrap();
        assert_ne!(second.first_cce, first.first_cce);
        commit(&layout, second, 0, &mut occupancy);
        release(&layout, second, 0, &mut occupancy);

        let after: Vec<SymbolMask> = (0..52).map(|rb| occupancy.occupied(0, rb)).collect();
        assert_eq!(before, after);
        // The first candidate is still held
        assert!(!candidate_is_free(&layout, first.first_cce, first.aggregation_level, 0, &occupancy));
    }

    proptest! {
        #[test]
        fn marked_positions_never_reused(hashes in prop::collection::vec(0u32..65537, 1..12), adjusts in prop::collection::vec(0.0f32..=1.0, 12)) {
            let layout = layout_16_cces();
            let ss = search_space([2, 2, 2, 1, 1]);
            let mut occupancy = VrbMap::new(1, 52);
            let mut used = vec![false; 52];

            for (hash, adjust) in hashes.iter().zip(adjusts.iter()) {
                if let Some(placed) = place(&layout, &ss, *adjust, 0, &mut occupancy, *hash) {
                    for cce in placed.first_cce..placed.first_cce + placed.aggregation_level as u16 {
                        for rb in layout.cce_rbs(cce) {
                            prop_assert!(!used[rb as usize], "RB {} reused", rb);
                            used[rb as usize] = true;
                        }
                    }
                }
            }
        }
    }
}
