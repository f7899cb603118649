//! Low-latency Annex-B H.265 encoding.
//!
//! Output contract (clients depend on every clause):
//! - Annex-B with 4-byte `00 00 00 01` start codes before every NAL unit
//! - HEVC Main profile
//! - all-intra: every access unit is an IDR (GOP length 1), no B-frames
//! - VPS/SPS/PPS prepended to every access unit
//! - VBR with peak ≈ 1.5× target and a 1-second VBV window
//! - zero frame delay: a submitted frame produces its packet before the
//!   next submit returns
//!
//! The factory tries backends in declared order and returns the first
//! one whose initialisation succeeds.

pub mod annexb;
pub mod convert;
mod ffmpeg;

pub use ffmpeg::FfmpegEncoder;

use tracing::{debug, info};

use crate::error::{Result, TabcastError};

// ── Bitrate & boost constants ────────────────────────────────────

pub const MIN_BITRATE_MBPS: u32 = 20;
pub const MAX_BITRATE_MBPS: u32 = 5000;

/// Fixed overrides applied when gaming boost is on, regardless of the
/// stored settings.
pub const GAMING_BOOST_BITRATE_MBPS: u32 = 1000;
pub const GAMING_BOOST_QUALITY: f32 = 0.3;

/// Clamp a requested bitrate into the supported range.
pub fn clamp_bitrate(bitrate_mbps: u32) -> u32 {
    bitrate_mbps.clamp(MIN_BITRATE_MBPS, MAX_BITRATE_MBPS)
}

// ── Encoder trait ────────────────────────────────────────────────

/// Callback delivering one encoded access unit:
/// `(annex_b_bytes, timestamp_ns, is_keyframe)`.
pub type OutputCallback = Box<dyn FnMut(&[u8], u64, bool) + Send>;

/// One H.265 encoder backend. The operation set is deliberately small;
/// the factory picks the concrete implementation.
pub trait VideoEncoder: Send {
    /// Submit one raw BGRA frame. With the all-intra contract the
    /// matching output callback fires before this returns (modulo an
    /// explicit depth-2 pipeline drained by [`flush`](Self::flush)).
    ///
    /// A failure encodes nothing for this frame but is not fatal.
    fn encode(
        &mut self,
        data: &[u8],
        width: u32,
        height: u32,
        stride: usize,
        timestamp_ns: u64,
    ) -> Result<()>;

    /// Apply new settings on the next frame. `gaming_boost` overrides
    /// bitrate and quality with the fixed high-performance values.
    fn update_settings(&mut self, bitrate_mbps: u32, quality: f32, gaming_boost: bool);

    /// Drain any pipelined frame so `stop` loses nothing.
    fn flush(&mut self);

    /// Human-readable backend identifier, e.g. `"ffmpeg (libx265)"`.
    fn name(&self) -> &str;

    /// Register (or clear) the output callback.
    fn set_output_callback(&mut self, callback: Option<OutputCallback>);
}

// ── Factory ──────────────────────────────────────────────────────

/// libavcodec encoder names, in selection order: NVIDIA hardware, Intel
/// QuickSync, then software x265 as the universal fallback.
const BACKENDS: &[&str] = &["hevc_nvenc", "hevc_qsv", "libx265"];

/// Build an encoder for the given geometry; first working backend wins.
pub fn create(
    width: u32,
    height: u32,
    fps: u32,
    bitrate_mbps: u32,
) -> Result<Box<dyn VideoEncoder>> {
    let bitrate_mbps = clamp_bitrate(bitrate_mbps);

    for name in BACKENDS.iter().copied() {
        match FfmpegEncoder::try_new(name, width, height, fps, bitrate_mbps) {
            Ok(encoder) => {
                info!(backend = %encoder.name(), width, height, fps, bitrate_mbps, "encoder ready");
                return Ok(Box::new(encoder));
            }
            Err(e) => debug!(backend = name, "encoder backend unavailable: {e}"),
        }
    }

    Err(TabcastError::BackendMissing)
}

/// Backend names present in the local libavcodec build, in selection
/// order. Used by `--list-encoders`.
pub fn available_backends() -> Vec<&'static str> {
    ffmpeg::probe_backends(BACKENDS)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_clamps_to_supported_range() {
        assert_eq!(clamp_bitrate(0), MIN_BITRATE_MBPS);
        assert_eq!(clamp_bitrate(19), MIN_BITRATE_MBPS);
        assert_eq!(clamp_bitrate(100), 100);
        assert_eq!(clamp_bitrate(9999), MAX_BITRATE_MBPS);
    }

    #[test]
    fn gaming_boost_constants_are_in_range() {
        assert_eq!(
            clamp_bitrate(GAMING_BOOST_BITRATE_MBPS),
            GAMING_BOOST_BITRATE_MBPS
        );
        assert!(GAMING_BOOST_QUALITY > 0.0 && GAMING_BOOST_QUALITY <= 1.0);
    }
}
