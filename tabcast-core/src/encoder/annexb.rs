//! Annex-B H.265 bitstream utilities.
//!
//! Every access unit put on the wire must be Annex-B (4-byte
//! `00 00 00 01` start codes) and self-contained: VPS/SPS/PPS followed
//! by an IDR slice, so any conforming decoder can bootstrap from any
//! frame. Codec backends do not all guarantee that — some omit the
//! parameter sets after the first frame, some emit length-prefixed NAL
//! units instead of start codes. [`ParameterSetCache`] repairs both.

/// The 4-byte Annex-B start code.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// HEVC NAL unit types for the parameter sets.
pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;

/// True when the buffer begins with a 4- or 3-byte start code.
pub fn starts_with_start_code(data: &[u8]) -> bool {
    data.starts_with(&START_CODE) || data.starts_with(&[0x00, 0x00, 0x01])
}

/// HEVC NAL unit type from the first header byte after the start code.
#[inline]
pub fn nal_unit_type(header_byte: u8) -> u8 {
    (header_byte >> 1) & 0x3F
}

/// True for the IDR slice types (IDR_W_RADL = 19, IDR_N_LP = 20).
pub fn is_idr(nal_type: u8) -> bool {
    nal_type == 19 || nal_type == 20
}

// ── NAL iteration ────────────────────────────────────────────────

/// One NAL unit located in an Annex-B stream. `bytes` includes the
/// leading start code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit<'a> {
    pub nal_type: u8,
    pub bytes: &'a [u8],
}

/// Iterate NAL units in an Annex-B buffer (4- or 3-byte start codes).
pub fn nal_units(data: &[u8]) -> NalIter<'_> {
    NalIter { data, pos: 0 }
}

pub struct NalIter<'a> {
    data: &'a [u8],
    pos: usize,
}

/// Length of the start code at `data[pos..]`, or `None`.
fn start_code_len(data: &[u8], pos: usize) -> Option<usize> {
    let rest = &data[pos..];
    if rest.starts_with(&START_CODE) {
        Some(4)
    } else if rest.starts_with(&[0x00, 0x00, 0x01]) {
        Some(3)
    } else {
        None
    }
}

impl<'a> Iterator for NalIter<'a> {
    type Item = NalUnit<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        // Seek to the next start code.
        while self.pos < self.data.len() && start_code_len(self.data, self.pos).is_none() {
            self.pos += 1;
        }
        let start = self.pos;
        let code_len = start_code_len(self.data, start)?;
        let header = start + code_len;
        if header >= self.data.len() {
            return None;
        }

        // Find the start of the following NAL unit.
        let mut end = header + 1;
        while end < self.data.len() && start_code_len(self.data, end).is_none() {
            end += 1;
        }

        self.pos = end;
        Some(NalUnit {
            nal_type: nal_unit_type(self.data[header]),
            bytes: &self.data[start..end],
        })
    }
}

// ── Parameter-set extraction ─────────────────────────────────────

/// Concatenated VPS/SPS/PPS NAL units (with start codes) from an
/// access unit, or an empty vec when none are present.
pub fn extract_parameter_sets(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nal_units(data) {
        if (NAL_VPS..=NAL_PPS).contains(&nal.nal_type) {
            out.extend_from_slice(nal.bytes);
        }
    }
    out
}

/// True when the access unit carries a VPS (and therefore, from every
/// encoder in use, the full VPS/SPS/PPS set).
pub fn has_parameter_sets(data: &[u8]) -> bool {
    nal_units(data).any(|nal| nal.nal_type == NAL_VPS)
}

// ── Length-prefix (AVCC/HVCC) conversion ─────────────────────────

/// Convert a 4-byte big-endian length-prefixed NAL stream to Annex-B.
///
/// Returns `None` when the buffer does not parse as length-prefixed
/// (inconsistent lengths), in which case it should be treated as
/// already being Annex-B.
pub fn length_prefixed_to_annexb(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() + 8);
    let mut pos = 0usize;
    while pos + 4 <= data.len() {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        pos += 4;
        if len == 0 || pos + len > data.len() {
            return None;
        }
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&data[pos..pos + len]);
        pos += len;
    }
    if pos == data.len() && !out.is_empty() {
        Some(out)
    } else {
        None
    }
}

// ── ParameterSetCache ────────────────────────────────────────────

/// Repairs encoder output into self-contained Annex-B access units.
///
/// Caches VPS/SPS/PPS from the first access unit that carries them and
/// prepends the cache to later units that lack them. Converts
/// length-prefixed output to Annex-B first when necessary.
#[derive(Debug, Default)]
pub struct ParameterSetCache {
    cached: Vec<u8>,
}

impl ParameterSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalise one access unit for the wire.
    pub fn process(&mut self, data: &[u8]) -> Vec<u8> {
        let annexb;
        let data: &[u8] = if starts_with_start_code(data) {
            data
        } else if let Some(converted) = length_prefixed_to_annexb(data) {
            annexb = converted;
            &annexb
        } else {
            data
        };

        if has_parameter_sets(data) {
            self.cached = extract_parameter_sets(data);
            data.to_vec()
        } else if !self.cached.is_empty() {
            let mut out = Vec::with_capacity(self.cached.len() + data.len());
            out.extend_from_slice(&self.cached);
            out.extend_from_slice(data);
            out
        } else {
            data.to_vec()
        }
    }

    /// Bytes of cached parameter sets (0 until the first keyframe).
    pub fn cached_len(&self) -> usize {
        self.cached.len()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a NAL unit with the given type and payload length.
    fn nal(nal_type: u8, body_len: usize) -> Vec<u8> {
        let mut v = START_CODE.to_vec();
        v.push(nal_type << 1); // forbidden_zero_bit 0, layer/tid bits 0
        v.push(0x01);
        v.extend(std::iter::repeat(0xAA).take(body_len));
        v
    }

    fn idr_access_unit_with_params() -> Vec<u8> {
        let mut au = Vec::new();
        au.extend(nal(NAL_VPS, 4));
        au.extend(nal(NAL_SPS, 8));
        au.extend(nal(NAL_PPS, 2));
        au.extend(nal(19, 32)); // IDR_W_RADL
        au
    }

    #[test]
    fn detects_start_codes() {
        assert!(starts_with_start_code(&[0, 0, 0, 1, 0x40]));
        assert!(starts_with_start_code(&[0, 0, 1, 0x40]));
        assert!(!starts_with_start_code(&[0, 0, 2, 0x40]));
        assert!(!starts_with_start_code(&[1, 2, 3]));
    }

    #[test]
    fn iterates_nal_units_in_order() {
        let au = idr_access_unit_with_params();
        let types: Vec<u8> = nal_units(&au).map(|n| n.nal_type).collect();
        assert_eq!(types, vec![NAL_VPS, NAL_SPS, NAL_PPS, 19]);
    }

    #[test]
    fn every_nal_slice_keeps_its_start_code() {
        let au = idr_access_unit_with_params();
        for unit in nal_units(&au) {
            assert!(unit.bytes.starts_with(&START_CODE));
        }
    }

    #[test]
    fn extracts_only_parameter_sets() {
        let au = idr_access_unit_with_params();
        let params = extract_parameter_sets(&au);
        let types: Vec<u8> = nal_units(&params).map(|n| n.nal_type).collect();
        assert_eq!(types, vec![NAL_VPS, NAL_SPS, NAL_PPS]);
    }

    #[test]
    fn idr_detection() {
        assert!(is_idr(19));
        assert!(is_idr(20));
        assert!(!is_idr(1));
        assert!(!is_idr(NAL_VPS));
    }

    #[test]
    fn cache_prepends_params_to_bare_idr() {
        let mut cache = ParameterSetCache::new();

        // First AU carries the parameter sets; passes through unchanged.
        let first = idr_access_unit_with_params();
        let out = cache.process(&first);
        assert_eq!(out, first);
        assert!(cache.cached_len() > 0);

        // Later AU without them gets the cache prepended.
        let bare = nal(19, 16);
        let repaired = cache.process(&bare);
        assert!(has_parameter_sets(&repaired));
        let types: Vec<u8> = nal_units(&repaired).map(|n| n.nal_type).collect();
        assert_eq!(types, vec![NAL_VPS, NAL_SPS, NAL_PPS, 19]);
        assert_eq!(&repaired[0..4], &START_CODE);
    }

    #[test]
    fn cache_passes_through_before_first_params() {
        let mut cache = ParameterSetCache::new();
        let bare = nal(19, 16);
        assert_eq!(cache.process(&bare), bare);
    }

    #[test]
    fn converts_length_prefixed_output() {
        // Two length-prefixed NALs: an SPS and an IDR slice.
        let mut avcc = Vec::new();
        let sps = [NAL_SPS << 1, 0x01, 0xAA, 0xBB];
        avcc.extend_from_slice(&(sps.len() as u32).to_be_bytes());
        avcc.extend_from_slice(&sps);
        let idr = [19 << 1, 0x01, 0xCC];
        avcc.extend_from_slice(&(idr.len() as u32).to_be_bytes());
        avcc.extend_from_slice(&idr);

        let annexb = length_prefixed_to_annexb(&avcc).unwrap();
        assert!(annexb.starts_with(&START_CODE));
        let types: Vec<u8> = nal_units(&annexb).map(|n| n.nal_type).collect();
        assert_eq!(types, vec![NAL_SPS, 19]);
    }

    #[test]
    fn rejects_inconsistent_length_prefixes() {
        let bogus = [0x00, 0x00, 0x10, 0x00, 0x01, 0x02];
        assert!(length_prefixed_to_annexb(&bogus).is_none());
    }

    #[test]
    fn cache_normalises_length_prefixed_input() {
        let mut cache = ParameterSetCache::new();

        let mut avcc = Vec::new();
        for (ty, len) in [(NAL_VPS, 3usize), (NAL_SPS, 4), (NAL_PPS, 2), (19, 8)] {
            let mut body = vec![ty << 1, 0x01];
            body.extend(std::iter::repeat(0xEE).take(len));
            avcc.extend_from_slice(&(body.len() as u32).to_be_bytes());
            avcc.extend_from_slice(&body);
        }

        let out = cache.process(&avcc);
        assert!(out.starts_with(&START_CODE));
        assert!(has_parameter_sets(&out));
    }
}
