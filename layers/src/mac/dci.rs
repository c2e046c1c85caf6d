//! Downlink Control Information
//!
//! Bit-exact DCI payloads for formats 0_0, 0_1, 1_0 and 1_1 according to
//! 3GPP TS 38.212 Section 7.3.1. Fields are packed MSB first in the fixed
//! order of each format / RNTI type pair, then zero padded to the aligned
//! payload size.

use super::MacError;
use bytes::Bytes;
use common::utils::{ceil_log2, low_mask, pack_bits};
use std::fmt;

/// Largest payload the encoder can carry
pub const MAX_DCI_BITS: u8 = 64;

/// DCI format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DciFormat {
    /// Uplink fallback
    Format0_0,
    /// Uplink non-fallback
    Format0_1,
    /// Downlink fallback
    Format1_0,
    /// Downlink non-fallback
    Format1_1,
}

impl DciFormat {
    pub fn is_downlink(&self) -> bool {
        matches!(self, DciFormat::Format1_0 | DciFormat::Format1_1)
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, DciFormat::Format0_0 | DciFormat::Format1_0)
    }
}

impl fmt::Display for DciFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DciFormat::Format0_0 => "0_0",
            DciFormat::Format0_1 => "0_1",
            DciFormat::Format1_0 => "1_0",
            DciFormat::Format1_1 => "1_1",
        };
        f.write_str(name)
    }
}

/// RNTI type the CRC is scrambled with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RntiType {
    Si,
    Ra,
    P,
    Tc,
    C,
}

/// DCI fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DciField {
    Identifier,
    ShortMessageIndicator,
    ShortMessages,
    BwpIndicator,
    FreqDomainAssignment,
    TimeDomainAssignment,
    VrbToPrbMapping,
    FrequencyHopping,
    Mcs,
    Ndi,
    RedundancyVersion,
    HarqProcess,
    Dai,
    Tpc,
    PucchResourceIndicator,
    HarqFeedbackTiming,
    TbScaling,
    SystemInformationIndicator,
    RaPreambleIndex,
    UlSulIndicator,
    SsbIndex,
    PrachMaskIndex,
    AntennaPorts,
    SrsRequest,
    DmrsSequenceInit,
    UlSchIndicator,
    Reserved,
}

impl DciField {
    pub const COUNT: usize = DciField::Reserved as usize + 1;
}

/// Field values of one DCI, indexed by [`DciField`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DciFields([u32; DciField::COUNT]);

impl DciFields {
    /// Empty field set with the format identifier preset
    pub fn for_format(format: DciFormat) -> Self {
        let mut fields = Self::default();
        fields.set(DciField::Identifier, format.is_downlink() as u32);
        fields
    }

    pub fn get(&self, field: DciField) -> u32 {
        self.0[field as usize]
    }

    pub fn set(&mut self, field: DciField, value: u32) -> &mut Self {
        self.0[field as usize] = value;
        self
    }

    pub fn with(mut self, field: DciField, value: u32) -> Self {
        self.set(field, value);
        self
    }
}

/// Layout variant of a DCI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DciVariant {
    /// Resource grant
    Grant,
    /// Format 1_0 with C-RNTI and all-ones frequency assignment: PDCCH order
    /// initiating random access
    PdcchOrder,
}

/// Configuration-dependent field widths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DciSizeConfig {
    /// RBs the downlink frequency assignment addresses
    pub dl_rbs: u16,
    /// RBs the uplink frequency assignment addresses
    pub ul_rbs: u16,
    /// Dedicated downlink BWPs, not counting the initial BWP
    pub num_dl_bwps: u8,
    /// Dedicated uplink BWPs, not counting the initial BWP
    pub num_ul_bwps: u8,
    /// PUSCH transform precoding
    pub transform_precoding: bool,
    /// HARQ process number width of formats 0_1 and 1_1 (4, or 5 above 16 processes)
    pub harq_bits: u8,
}

/// Width of a type 1 frequency domain resource assignment over `num_rbs`
pub fn fdra_bits(num_rbs: u16) -> u8 {
    let n = num_rbs as u32;
    ceil_log2(n * (n + 1) / 2)
}

/// Width of the BWP indicator for `num_bwps` dedicated BWPs.
///
/// Up to three dedicated BWPs the initial BWP is addressable too, so the
/// indicator counts `num_bwps + 1` values (TS 38.212 Section 7.3.1.1.2).
pub fn bwp_indicator_bits(num_bwps: u8) -> u8 {
    let n = if num_bwps <= 3 { num_bwps as u32 + 1 } else { num_bwps as u32 };
    ceil_log2(n)
}

/// Type 1 resource indication value for `len` RBs starting at `start`
/// (TS 38.214 Section 5.1.2.2.2)
pub fn riv(num_rbs: u16, start: u16, len: u16) -> u32 {
    let (n, s, l) = (num_rbs as u32, start as u32, len.max(1) as u32);
    if l - 1 <= n / 2 {
        n * (l - 1) + s
    } else {
        n * (n - l + 1) + (n - 1 - s)
    }
}

const MAX_LAYOUT_FIELDS: usize = 20;

/// Ordered (field, width) list of one format / RNTI type / variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    entries: [(DciField, u8); MAX_LAYOUT_FIELDS],
    len: usize,
}

impl FieldLayout {
    fn from_slice(entries: &[(DciField, u8)]) -> Self {
        let mut layout = Self { entries: [(DciField::Reserved, 0); MAX_LAYOUT_FIELDS], len: 0 };
        for &(field, width) in entries.iter().filter(|(_, width)| *width > 0) {
            layout.entries[layout.len] = (field, width);
            layout.len += 1;
        }
        layout
    }

    pub fn iter(&self) -> impl Iterator<Item = (DciField, u8)> + '_ {
        self.entries[..self.len].iter().copied()
    }

    /// Sum of the field widths
    pub fn size(&self) -> u32 {
        self.iter().map(|(_, width)| width as u32).sum()
    }

    pub fn width_of(&self, field: DciField) -> Option<u8> {
        self.iter().find(|(f, _)| *f == field).map(|(_, width)| width)
    }
}

/// Field layout for `format` scrambled by `rnti` in `variant`
pub fn layout(format: DciFormat, rnti: RntiType, variant: DciVariant, cfg: &DciSizeConfig) -> Result<FieldLayout, MacError> {
    use DciField::*;

    let dl_fdra = fdra_bits(cfg.dl_rbs);
    let ul_fdra = fdra_bits(cfg.ul_rbs);
    let layout = match (format, rnti, variant) {
        (DciFormat::Format1_0, RntiType::C, DciVariant::PdcchOrder) => FieldLayout::from_slice(&[
            (Identifier, 1),
            (FreqDomainAssignment, dl_fdra),
            (RaPreambleIndex, 6),
            (UlSulIndicator, 1),
            (SsbIndex, 6),
            (PrachMaskIndex, 4),
            (Reserved, 10),
        ]),
        (DciFormat::Format1_0, RntiType::C | RntiType::Tc, DciVariant::Grant) => FieldLayout::from_slice(&[
            (Identifier, 1),
            (FreqDomainAssignment, dl_fdra),
            (TimeDomainAssignment, 4),
            (VrbToPrbMapping, 1),
            (Mcs, 5),
            (Ndi, 1),
            (RedundancyVersion, 2),
            (HarqProcess, 4),
            (Dai, 2),
            (Tpc, 2),
            (PucchResourceIndicator, 3),
            (HarqFeedbackTiming, 3),
        ]),
        (DciFormat::Format1_0, RntiType::P, DciVariant::Grant) => FieldLayout::from_slice(&[
            (ShortMessageIndicator, 2),
            (ShortMessages, 8),
            (FreqDomainAssignment, dl_fdra),
            (TimeDomainAssignment, 4),
            (VrbToPrbMapping, 1),
            (Mcs, 5),
            (TbScaling, 2),
            (Reserved, 6),
        ]),
        (DciFormat::Format1_0, RntiType::Si, DciVariant::Grant) => FieldLayout::from_slice(&[
            (FreqDomainAssignment, dl_fdra),
            (TimeDomainAssignment, 4),
            (VrbToPrbMapping, 1),
            (Mcs, 5),
            (RedundancyVersion, 2),
            (SystemInformationIndicator, 1),
            (Reserved, 15),
        ]),
        (DciFormat::Format1_0, RntiType::Ra, DciVariant::Grant) => FieldLayout::from_slice(&[
            (FreqDomainAssignment, dl_fdra),
            (TimeDomainAssignment, 4),
            (VrbToPrbMapping, 1),
            (Mcs, 5),
            (TbScaling, 2),
            (Reserved, 16),
        ]),
        (DciFormat::Format0_0, RntiType::C | RntiType::Tc, DciVariant::Grant) => FieldLayout::from_slice(&[
            (Identifier, 1),
            (FreqDomainAssignment, ul_fdra),
            (TimeDomainAssignment, 4),
            (FrequencyHopping, 1),
            (Mcs, 5),
            (Ndi, 1),
            (RedundancyVersion, 2),
            (HarqProcess, 4),
            (Tpc, 2),
        ]),
        (DciFormat::Format1_1, RntiType::C, DciVariant::Grant) => FieldLayout::from_slice(&[
            (Identifier, 1),
            (BwpIndicator, bwp_indicator_bits(cfg.num_dl_bwps)),
            (FreqDomainAssignment, dl_fdra),
            (TimeDomainAssignment, 4),
            (VrbToPrbMapping, 1),
            (Mcs, 5),
            (Ndi, 1),
            (RedundancyVersion, 2),
            (HarqProcess, cfg.harq_bits),
            (Dai, 2),
            (Tpc, 2),
            (PucchResourceIndicator, 3),
            (HarqFeedbackTiming, 3),
            (AntennaPorts, 4),
            (SrsRequest, 2),
            (DmrsSequenceInit, 1),
        ]),
        (DciFormat::Format0_1, RntiType::C, DciVariant::Grant) => FieldLayout::from_slice(&[
            (Identifier, 1),
            (BwpIndicator, bwp_indicator_bits(cfg.num_ul_bwps)),
            (FreqDomainAssignment, ul_fdra),
            (TimeDomainAssignment, 4),
            (FrequencyHopping, 1),
            (Mcs, 5),
            (Ndi, 1),
            (RedundancyVersion, 2),
            (HarqProcess, cfg.harq_bits),
            (Dai, 1),
            (Tpc, 2),
            (AntennaPorts, if cfg.transform_precoding { 2 } else { 3 }),
            (SrsRequest, 2),
            (DmrsSequenceInit, if cfg.transform_precoding { 0 } else { 1 }),
            (UlSchIndicator, 1),
        ]),
        _ => return Err(MacError::UnsupportedDci { format, rnti }),
    };
    Ok(layout)
}

/// Variant selected by the field values.
///
/// TS 38.212 Section 7.3.1.2.1 defines the all-ones frequency domain
/// assignment switch of format 1_0 only under C-RNTI, where it turns the DCI
/// into a PDCCH order starting random access. Under SI-, RA-, P- and TC-RNTI
/// the field is always a resource allocation, so those keep the grant layout.
pub fn variant_of(format: DciFormat, rnti: RntiType, fdra: u32, cfg: &DciSizeConfig) -> DciVariant {
    let width = fdra_bits(cfg.dl_rbs);
    match (format, rnti) {
        (DciFormat::Format1_0, RntiType::C) if width > 0 && fdra as u64 & low_mask(width) == low_mask(width) => {
            DciVariant::PdcchOrder
        }
        _ => DciVariant::Grant,
    }
}

/// Payload size before padding
pub fn natural_size(format: DciFormat, rnti: RntiType, cfg: &DciSizeConfig) -> Result<u32, MacError> {
    Ok(layout(format, rnti, DciVariant::Grant, cfg)?.size())
}

/// Payload size after size alignment.
///
/// Formats 0_0 and 1_0 are padded to the larger of the two. A non-fallback
/// format whose size equals the fallback size gets one extra zero bit.
pub fn aligned_size(format: DciFormat, cfg: &DciSizeConfig) -> Result<u8, MacError> {
    let fallback = natural_size(DciFormat::Format1_0, RntiType::C, cfg)?
        .max(natural_size(DciFormat::Format0_0, RntiType::C, cfg)?);
    let size = if format.is_fallback() {
        fallback
    } else {
        let natural = natural_size(format, RntiType::C, cfg)?;
        if natural == fallback { natural + 1 } else { natural }
    };
    if size > MAX_DCI_BITS as u32 {
        return Err(MacError::DciPayloadTooLarge { format, size });
    }
    Ok(size as u8)
}

/// Encoded DCI payload, `size` bits right-aligned in `bits`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DciPayload {
    pub bits: u64,
    pub size: u8,
}

impl DciPayload {
    /// Bit `index` counted from the first transmitted bit
    pub fn bit(&self, index: u8) -> bool {
        index < self.size && (self.bits >> (self.size - 1 - index)) & 1 == 1
    }

    /// Payload bytes, first transmitted bit in the MSB of byte 0
    pub fn to_bytes(&self) -> Bytes {
        let bits: Vec<bool> = (0..self.size).map(|i| self.bit(i)).collect();
        pack_bits(&bits)
    }
}

/// Encode `fields` as `format` for `rnti`, zero padded to `aligned` bits
pub fn encode(
    format: DciFormat,
    rnti: RntiType,
    fields: &DciFields,
    cfg: &DciSizeConfig,
    aligned: u8,
) -> Result<DciPayload, MacError> {
    let variant = variant_of(format, rnti, fields.get(DciField::FreqDomainAssignment), cfg);
    let layout = layout(format, rnti, variant, cfg)?;
    let natural = layout.size();

    if natural > MAX_DCI_BITS as u32 || aligned > MAX_DCI_BITS {
        return Err(MacError::DciPayloadTooLarge { format, size: natural.max(aligned as u32) });
    }
    if natural > aligned as u32 {
        return Err(MacError::DciSizeMismatch { format, natural, aligned });
    }

    let mut bits = 0u64;
    for (field, width) in layout.iter() {
        bits = (bits << width) | (fields.get(field) as u64 & low_mask(width));
    }
    bits <<= aligned as u32 - natural;

    Ok(DciPayload { bits, size: aligned })
}

/// Decode a payload produced by [`encode`]
pub fn decode(
    format: DciFormat,
    rnti: RntiType,
    payload: &DciPayload,
    cfg: &DciSizeConfig,
) -> Result<(DciVariant, DciFields), MacError> {
    let read = |layout: &FieldLayout| -> Result<DciFields, MacError> {
        let natural = layout.size();
        if natural > payload.size as u32 {
            return Err(MacError::DciSizeMismatch { format, natural, aligned: payload.size });
        }
        let mut fields = DciFields::default();
        let mut pos = payload.size as u32;
        for (field, width) in layout.iter() {
            pos -= width as u32;
            fields.set(field, ((payload.bits >> pos) & low_mask(width)) as u32);
        }
        Ok(fields)
    };

    let fields = read(&layout(format, rnti, DciVariant::Grant, cfg)?)?;
    match variant_of(format, rnti, fields.get(DciField::FreqDomainAssignment), cfg) {
        DciVariant::Grant => Ok((DciVariant::Grant, fields)),
        DciVariant::PdcchOrder => {
            let order = read(&layout(format, rnti, DciVariant::PdcchOrder, cfg)?)?;
            Ok((DciVariant::PdcchOrder, order))
        }
    }
}
