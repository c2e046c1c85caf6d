//! Transport Block Size and Resource Block Sizing
//!
//! TBS determination according to 3GPP TS 38.214 Section 5.1.3.2 and the
//! search for the smallest RB allocation carrying a given number of bytes.

use serde::{Deserialize, Serialize};

/// Maximum number of REs per PRB counted for TBS purposes
const MAX_RE_PER_PRB: u32 = 156;

/// TBS table for N_info <= 3824 (TS 38.214 Table 5.1.3.2-1)
const TBS_TABLE: [u32; 93] = [
    24, 32, 40, 48, 56, 64, 72, 80, 88, 96, 104, 112, 120, 128, 136, 144, 152, 160, 168, 176,
    184, 192, 208, 224, 240, 256, 272, 288, 304, 320, 336, 352, 368, 384, 408, 432, 456, 480,
    504, 528, 552, 576, 608, 640, 672, 704, 736, 768, 808, 848, 888, 928, 984, 1032, 1064, 1128,
    1160, 1192, 1224, 1256, 1288, 1320, 1352, 1416, 1480, 1544, 1608, 1672, 1736, 1800, 1864,
    1928, 2024, 2088, 2152, 2216, 2280, 2408, 2472, 2536, 2600, 2664, 2728, 2792, 2856, 2976,
    3104, 3240, 3368, 3496, 3624, 3752, 3824,
];

/// (Qm, target code rate x 1024 x 10) for MCS index table 1 (TS 38.214 Table 5.1.3.1-1)
const MCS_TABLE_QAM64: [(u8, u32); 29] = [
    (2, 1200), (2, 1570), (2, 1930), (2, 2510), (2, 3080), (2, 3790), (2, 4490), (2, 5260),
    (2, 6020), (2, 6790), (4, 3400), (4, 3780), (4, 4340), (4, 4900), (4, 5530), (4, 6160),
    (4, 6580), (6, 4380), (6, 4660), (6, 5170), (6, 5670), (6, 6160), (6, 6660), (6, 7190),
    (6, 7720), (6, 8220), (6, 8730), (6, 9100), (6, 9480),
];

/// (Qm, target code rate x 1024 x 10) for MCS index table 2 (TS 38.214 Table 5.1.3.1-2)
const MCS_TABLE_QAM256: [(u8, u32); 28] = [
    (2, 1200), (2, 1930), (2, 3080), (2, 4490), (2, 6020), (4, 3780), (4, 4340), (4, 4900),
    (4, 5530), (4, 6160), (4, 6580), (6, 4660), (6, 5170), (6, 5670), (6, 6160), (6, 6660),
    (6, 7190), (6, 7720), (6, 8220), (6, 8730), (8, 6825), (8, 7110), (8, 7540), (8, 7970),
    (8, 8410), (8, 8850), (8, 9165), (8, 9480),
];

/// MCS index table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McsTable {
    Qam64,
    Qam256,
}

impl McsTable {
    /// Highest MCS index with a defined code rate
    pub fn max_mcs(&self) -> u8 {
        match self {
            McsTable::Qam64 => 28,
            McsTable::Qam256 => 27,
        }
    }

    /// Modulation order and code rate (x 1024 x 10), `None` for reserved indexes
    pub fn lookup(&self, mcs: u8) -> Option<(u8, u32)> {
        match self {
            McsTable::Qam64 => MCS_TABLE_QAM64.get(mcs as usize).copied(),
            McsTable::Qam256 => MCS_TABLE_QAM256.get(mcs as usize).copied(),
        }
    }
}

/// Parameters of the TBS function other than the RB count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TbsParams {
    /// MCS index
    pub mcs: u8,
    /// MCS table in use
    pub table: McsTable,
    /// Allocated OFDM symbols
    pub num_symbols: u8,
    /// DMRS REs per PRB over the allocation
    pub dmrs_re_per_prb: u16,
    /// xOverhead (0, 6, 12 or 18)
    pub overhead: u16,
    /// Number of MIMO layers
    pub num_layers: u8,
    /// Uplink transform precoding (DFT-s-OFDM); RB counts must be 2^a 3^b 5^c
    pub transform_precoding: bool,
}

impl TbsParams {
    /// Single layer, 12 data symbols, one DMRS symbol of type 1
    pub fn with_mcs(mcs: u8, table: McsTable) -> Self {
        Self {
            mcs,
            table,
            num_symbols: 12,
            dmrs_re_per_prb: 12,
            overhead: 0,
            num_layers: 1,
            transform_precoding: false,
        }
    }
}

/// Transport block size in bits for `num_rbs` PRBs
pub fn tbs_bits(params: &TbsParams, num_rbs: u16) -> u32 {
    let Some((qm, rate_x10240)) = params.table.lookup(params.mcs) else {
        return 0;
    };

    let re_per_prb = (12 * params.num_symbols as u32)
        .saturating_sub(params.dmrs_re_per_prb as u32)
        .saturating_sub(params.overhead as u32);
    let n_re = re_per_prb.min(MAX_RE_PER_PRB) * num_rbs as u32;
    let n_info = n_re as f64 * (rate_x10240 as f64 / 10240.0) * qm as f64 * params.num_layers as f64;

    if n_info <= 0.0 {
        return 0;
    }

    if n_info <= 3824.0 {
        let n = ((n_info.log2().floor() as i32) - 6).max(3);
        let step = (1u32 << n) as f64;
        let n_info_q = (step * (n_info / step).floor()).max(24.0) as u32;
        TBS_TABLE
            .iter()
            .copied()
            .find(|&tbs| tbs >= n_info_q)
            .unwrap_or(3824)
    } else {
        let n = (n_info - 24.0).log2().floor() as i32 - 5;
        let step = 2f64.powi(n);
        let n_info_q = (step * ((n_info - 24.0) / step).round()).max(3840.0);
        let code_rate = rate_x10240 as f64 / 10240.0;

        let blocks = if code_rate <= 0.25 {
            ((n_info_q + 24.0) / 3816.0).ceil()
        } else if n_info_q > 8424.0 {
            ((n_info_q + 24.0) / 8424.0).ceil()
        } else {
            1.0
        };
        (8.0 * blocks * ((n_info_q + 24.0) / (8.0 * blocks)).ceil() - 24.0) as u32
    }
}

/// Transport block size in whole bytes for `num_rbs` PRBs
pub fn tbs_bytes(params: &TbsParams, num_rbs: u16) -> u32 {
    tbs_bits(params, num_rbs) / 8
}

/// True when `n` only has 2, 3 and 5 as prime factors
pub fn is_235(n: u16) -> bool {
    if n == 0 {
        return false;
    }
    let mut n = n;
    for p in [2, 3, 5] {
        while n % p == 0 {
            n /= p;
        }
    }
    n == 1
}

/// Outcome of [`fit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RbFit {
    /// Chosen number of RBs
    pub num_rbs: u16,
    /// TBS in bytes at `num_rbs`
    pub tbs_bytes: u32,
    /// Whether `tbs_bytes` reaches the requested size
    pub fits: bool,
}

/// Find the smallest RB count in `[min_rb, max_rb]` whose TBS holds `target_bytes`.
///
/// With transform precoding only 2-3-5 smooth counts are considered. When even
/// `max_rb` is too small the maximum is returned with `fits == false`.
pub fn fit(target_bytes: u32, min_rb: u16, max_rb: u16, params: &TbsParams) -> RbFit {
    let conforming = |n: u16| !params.transform_precoding || is_235(n);
    let step_up = |n: u16, limit: u16| (n..=limit).find(|&n| conforming(n));
    let step_down = |n: u16, limit: u16| (limit.max(1)..=n).rev().find(|&n| conforming(n));

    let min_rb = min_rb.max(1);
    let (Some(hi_rb), Some(lo_rb)) = (step_down(max_rb, min_rb), step_up(min_rb, max_rb)) else {
        return RbFit { num_rbs: max_rb, tbs_bytes: 0, fits: false };
    };

    let hi_bytes = tbs_bytes(params, hi_rb);
    if hi_bytes < target_bytes {
        return RbFit { num_rbs: hi_rb, tbs_bytes: hi_bytes, fits: false };
    }

    let lo_bytes = tbs_bytes(params, lo_rb);
    if lo_bytes >= target_bytes {
        return RbFit { num_rbs: lo_rb, tbs_bytes: lo_bytes, fits: true };
    }

    // Invariant: tbs(lo) < target <= tbs(hi)
    let (mut lo, mut hi, mut hi_tbs) = (lo_rb, hi_rb, hi_bytes);
    let mut iterations = 0u32;
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        let candidate = match step_up(mid, hi - 1) {
            Some(n) => n,
            None => match step_down(mid, lo + 1) {
                Some(n) => n,
                None => break,
            },
        };

        let bytes = tbs_bytes(params, candidate);
        if bytes >= target_bytes {
            hi = candidate;
            hi_tbs = bytes;
        } else {
            lo = candidate;
        }

        iterations += 1;
        debug_assert!(iterations <= (max_rb - min_rb) as u32);
    }

    RbFit { num_rbs: hi, tbs_bytes: hi_tbs, fits: hi_tbs >= target_bytes && hi <= max_rb }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_small_tbs_from_table() {
        // MCS 0, 1 PRB: N_RE = 132, N_info = 132 * 0.1171875 * 2 = 30.9 -> 24
        let params = TbsParams::with_mcs(0, McsTable::Qam64);
        assert_eq!(tbs_bits(&params, 1), 24);
        // MCS 9, 10 PRBs: N_info = 1320 * 0.6630859375 * 2 = 1750.5 -> 1744 -> 1800
        let params = TbsParams::with_mcs(9, McsTable::Qam64);
        assert_eq!(tbs_bits(&params, 10), 1800);
    }

    #[test]
    fn test_large_tbs_formula() {
        // MCS 27, 52 PRBs, 12 symbols, 12 DMRS REs: N_RE = 6864
        // N_info = 6864 * 0.888671875 * 6 = 36599.1 -> N'_info = 36864, C = 5 -> 36896
        let params = TbsParams::with_mcs(27, McsTable::Qam64);
        assert_eq!(tbs_bits(&params, 52), 36896);
    }

    #[test]
    fn test_reserved_mcs_yields_zero() {
        let params = TbsParams::with_mcs(29, McsTable::Qam64);
        assert_eq!(tbs_bits(&params, 10), 0);
    }

    #[test]
    fn test_tbs_monotone_in_rbs() {
        for table in [McsTable::Qam64, McsTable::Qam256] {
            for mcs in 0..=table.max_mcs() {
                let params = TbsParams::with_mcs(mcs, table);
                let mut previous = 0;
                for rbs in 1..=273 {
                    let tbs = tbs_bits(&params, rbs);
                    assert!(tbs >= previous, "mcs {} rbs {}", mcs, rbs);
                    previous = tbs;
                }
            }
        }
    }

    #[test]
    fn test_is_235() {
        assert!(is_235(1));
        assert!(is_235(30));
        assert!(is_235(75));
        assert!(!is_235(7));
        assert!(!is_235(0));
        assert!(!is_235(14));
    }

    #[test]
    fn test_fit_at_minimum() {
        let params = TbsParams::with_mcs(10, McsTable::Qam64);
        let result = fit(1, 1, 50, &params);
        assert_eq!(result.num_rbs, 1);
        assert!(result.fits);
    }

    #[test]
    fn test_fit_infeasible() {
        let params = TbsParams::with_mcs(0, McsTable::Qam64);
        let max = tbs_bytes(&params, 10);
        let result = fit(max + 1, 1, 10, &params);
        assert!(!result.fits);
        assert_eq!(result.num_rbs, 10);
        assert_eq!(result.tbs_bytes, max);
    }

    #[test]
    fn test_fit_is_minimal() {
        let params = TbsParams::with_mcs(9, McsTable::Qam64);
        let target = tbs_bytes(&params, 20) - 1;
        let result = fit(target, 1, 100, &params);
        assert!(result.fits);
        assert!(tbs_bytes(&params, result.num_rbs - 1) < target);
    }

    #[test]
    fn test_fit_transform_precoding_skips_non_235() {
        let mut params = TbsParams::with_mcs(5, McsTable::Qam64);
        params.transform_precoding = true;
        // Needs more than 13 RBs worth; 14 is not 2-3-5 smooth so 15 is expected
        let target = tbs_bytes(&params, 13) + 1;
        let result = fit(target, 1, 48, &params);
        assert!(result.fits);
        assert!(is_235(result.num_rbs));
        assert!(result.num_rbs >= 14);
        assert!(tbs_bytes(&params, result.num_rbs) >= target);
    }

    #[test]
    fn test_fit_at_top_of_rb_range() {
        let mut params = TbsParams::with_mcs(5, McsTable::Qam64);
        params.transform_precoding = true;
        // No 2-3-5 smooth count in 65530..=65535
        let result = fit(1, 65530, u16::MAX, &params);
        assert!(!result.fits);
        assert_eq!(result.num_rbs, u16::MAX);

        params.transform_precoding = false;
        let result = fit(1, u16::MAX - 1, u16::MAX, &params);
        assert!(result.fits);
        assert_eq!(result.num_rbs, u16::MAX - 1);
    }

    proptest! {
        #[test]
        fn fit_law(mcs in 0u8..=28, min_rb in 1u16..20, span in 0u16..250, target in 0u32..5000) {
            let params = TbsParams::with_mcs(mcs, McsTable::Qam64);
            let max_rb = min_rb + span;
            let result = fit(target, min_rb, max_rb, &params);
            if target <= tbs_bytes(&params, max_rb) {
                prop_assert!(result.fits);
                prop_assert!(result.num_rbs <= max_rb);
                prop_assert!(result.num_rbs >= min_rb);
                prop_assert!(result.tbs_bytes >= target);
                if result.num_rbs > min_rb {
                    prop_assert!(tbs_bytes(&params, result.num_rbs - 1) < target);
                }
            } else {
                prop_assert!(!result.fits);
            }
        }

        #[test]
        fn fit_law_transform_precoding(mcs in 0u8..=28, target in 0u32..3000) {
            let mut params = TbsParams::with_mcs(mcs, McsTable::Qam64);
            params.transform_precoding = true;
            let result = fit(target, 1, 100, &params);
            prop_assert!(is_235(result.num_rbs));
            prop_assert_eq!(result.fits, target <= tbs_bytes(&params, 100));
        }
    }
}
