//! PUCCH Resource Determination
//!
//! HARQ-ACK resource selection according to 3GPP TS 38.213 Section 9.2.
//! Before dedicated PUCCH configuration the resource is derived implicitly
//! from the first CCE of the scheduling PDCCH and the PUCCH resource
//! indicator (Table 9.2.1-1).

use super::MacError;

/// PUCCH resource indicator values
pub const NUM_PRI_VALUES: u8 = 8;

/// One row of TS 38.213 Table 9.2.1-1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CommonResourceSet {
    format: u8,
    first_symbol: u8,
    num_symbols: u8,
    /// PRB offset, `None` for floor(N_BWP / 4)
    prb_offset: Option<u16>,
    initial_cyclic_shifts: &'static [u8],
}

const CS_2: &[u8] = &[0, 6];
const CS_3: &[u8] = &[0, 4, 8];
const CS_4: &[u8] = &[0, 3, 6, 9];

const PUCCH_RESOURCE_COMMON: [CommonResourceSet; 16] = [
    CommonResourceSet { format: 0, first_symbol: 12, num_symbols: 2, prb_offset: Some(0), initial_cyclic_shifts: &[0, 3] },
    CommonResourceSet { format: 0, first_symbol: 12, num_symbols: 2, prb_offset: Some(0), initial_cyclic_shifts: CS_3 },
    CommonResourceSet { format: 0, first_symbol: 12, num_symbols: 2, prb_offset: Some(3), initial_cyclic_shifts: CS_3 },
    CommonResourceSet { format: 1, first_symbol: 10, num_symbols: 4, prb_offset: Some(0), initial_cyclic_shifts: CS_2 },
    CommonResourceSet { format: 1, first_symbol: 10, num_symbols: 4, prb_offset: Some(0), initial_cyclic_shifts: CS_4 },
    CommonResourceSet { format: 1, first_symbol: 10, num_symbols: 4, prb_offset: Some(2), initial_cyclic_shifts: CS_4 },
    CommonResourceSet { format: 1, first_symbol: 10, num_symbols: 4, prb_offset: Some(4), initial_cyclic_shifts: CS_4 },
    CommonResourceSet { format: 1, first_symbol: 4, num_symbols: 10, prb_offset: Some(0), initial_cyclic_shifts: CS_2 },
    CommonResourceSet { format: 1, first_symbol: 4, num_symbols: 10, prb_offset: Some(0), initial_cyclic_shifts: CS_4 },
    CommonResourceSet { format: 1, first_symbol: 4, num_symbols: 10, prb_offset: Some(2), initial_cyclic_shifts: CS_4 },
    CommonResourceSet { format: 1, first_symbol: 4, num_symbols: 10, prb_offset: Some(4), initial_cyclic_shifts: CS_4 },
    CommonResourceSet { format: 1, first_symbol: 0, num_symbols: 14, prb_offset: Some(0), initial_cyclic_shifts: CS_2 },
    CommonResourceSet { format: 1, first_symbol: 0, num_symbols: 14, prb_offset: Some(0), initial_cyclic_shifts: CS_4 },
    CommonResourceSet { format: 1, first_symbol: 0, num_symbols: 14, prb_offset: Some(2), initial_cyclic_shifts: CS_4 },
    CommonResourceSet { format: 1, first_symbol: 0, num_symbols: 14, prb_offset: Some(4), initial_cyclic_shifts: CS_4 },
    CommonResourceSet { format: 1, first_symbol: 0, num_symbols: 14, prb_offset: None, initial_cyclic_shifts: CS_4 },
];

/// PUCCH resource derived from pucch-ResourceCommon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonPucchResource {
    /// PUCCH format (0 or 1)
    pub format: u8,
    pub first_symbol: u8,
    pub num_symbols: u8,
    /// PRB of the first hop, relative to the BWP start
    pub first_hop_prb: u16,
    /// PRB of the second hop, relative to the BWP start
    pub second_hop_prb: u16,
    /// Initial cyclic shift
    pub initial_cyclic_shift: u8,
}

/// HARQ-ACK PUCCH resource of a downlink grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PucchResource {
    /// Implicit resource from the common table
    Common(CommonPucchResource),
    /// Dedicated resource id from the UE configuration
    Dedicated { resource_id: u8 },
}

/// Implicit resource index r_PUCCH = floor(2 n_CCE,0 / N_CCE) + 2 delta_PRI
pub fn common_resource_index(first_cce: u16, num_cces: u16, pri: u8) -> u8 {
    let num_cces = num_cces.max(1) as u32;
    ((2 * first_cce as u32 / num_cces) + 2 * pri as u32) as u8
}

/// Resource from pucch-ResourceCommon `table_index` for a PDCCH at `first_cce`
pub fn derive_common(
    table_index: u8,
    first_cce: u16,
    num_cces: u16,
    pri: u8,
    bwp_rbs: u16,
) -> Result<CommonPucchResource, MacError> {
    let set = PUCCH_RESOURCE_COMMON
        .get(table_index as usize)
        .ok_or_else(|| MacError::InvalidConfiguration(format!("pucch-ResourceCommon {} outside 0..16", table_index)))?;
    if pri >= NUM_PRI_VALUES {
        return Err(MacError::InvalidConfiguration(format!("PUCCH resource indicator {} outside 0..8", pri)));
    }

    let r = common_resource_index(first_cce, num_cces, pri) as u16;
    let num_cs = set.initial_cyclic_shifts.len() as u16;
    let offset = set.prb_offset.unwrap_or(bwp_rbs / 4);
    let last = bwp_rbs.saturating_sub(1);

    let (first_hop_prb, second_hop_prb, cs_index) = if r < 8 {
        let prb = offset + r / num_cs;
        (prb, last.saturating_sub(prb), r % num_cs)
    } else {
        let prb = offset + (r - 8) / num_cs;
        (last.saturating_sub(prb), prb, (r - 8) % num_cs)
    };

    Ok(CommonPucchResource {
        format: set.format,
        first_symbol: set.first_symbol,
        num_symbols: set.num_symbols,
        first_hop_prb,
        second_hop_prb,
        initial_cyclic_shift: set.initial_cyclic_shifts[cs_index as usize],
    })
}

/// Dedicated resource selected by `pri` from the first resource set.
///
/// With more than eight resources the CCE index picks within the PRI subset
/// (TS 38.213 Section 9.2.3).
pub fn select_dedicated(resources: &[u8], first_cce: u16, num_cces: u16, pri: u8) -> Option<u8> {
    let count = resources.len() as u32;
    if count == 0 || pri >= NUM_PRI_VALUES {
        return None;
    }
    let (n_cce, n, pri) = (first_cce as u32, num_cces.max(1) as u32, pri as u32);
    let index = if count <= 8 {
        pri
    } else if pri < count % 8 {
        let step = count.div_ceil(8);
        n_cce * step / n + pri * step
    } else {
        let step = count / 8;
        n_cce * step / n + pri * step + count % 8
    };
    resources.get(index as usize).copied()
}

/// HARQ-ACK resource for a downlink grant
pub fn derive(
    dedicated: &[u8],
    table_index: u8,
    first_cce: u16,
    num_cces: u16,
    pri: u8,
    bwp_rbs: u16,
) -> Result<Option<PucchResource>, MacError> {
    if dedicated.is_empty() {
        derive_common(table_index, first_cce, num_cces, pri, bwp_rbs).map(|res| Some(PucchResource::Common(res)))
    } else {
        Ok(select_dedicated(dedicated, first_cce, num_cces, pri).map(|resource_id| PucchResource::Dedicated { resource_id }))
    }
}
