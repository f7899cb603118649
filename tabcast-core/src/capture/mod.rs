//! Frame acquisition: types shared by the capture worker, the pipeline
//! coupler and the encoder.
//!
//! Two carriers exist for pixel data. [`FrameRef`] borrows a buffer that
//! is only valid for the duration of the frame callback (the zero-copy
//! hot path — the capturer may reclaim the buffer as soon as the
//! callback returns). [`OwnedFrame`] is the source-owned copy kept for
//! idle re-send, safe to deliver at any later time.

mod source;

pub use source::ScreenSource;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

// ── Pixel formats ────────────────────────────────────────────────

/// Pixel layout of captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha. What every capture
    /// backend in use delivers.
    Bgra8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 => 4,
        }
    }
}

// ── Frame carriers ───────────────────────────────────────────────

/// A borrowed view of one captured frame.
///
/// Valid only while the frame callback runs; the capture backend may
/// overwrite the underlying buffer afterwards.
#[derive(Debug, Clone, Copy)]
pub struct FrameRef<'a> {
    /// `height` rows of `stride` bytes each.
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes; may exceed `width * 4` due to alignment.
    pub stride: usize,
    pub format: PixelFormat,
    /// Monotonic capture timestamp in nanoseconds.
    pub timestamp_ns: u64,
}

/// A frame the source owns outright, used for idle re-delivery.
#[derive(Debug, Clone)]
pub struct OwnedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub format: PixelFormat,
}

impl OwnedFrame {
    /// Borrow this frame with a caller-supplied (fresh) timestamp.
    pub fn as_ref(&self, timestamp_ns: u64) -> FrameRef<'_> {
        FrameRef {
            data: &self.data,
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format,
            timestamp_ns,
        }
    }
}

/// Callback invoked by the capture worker for every delivered frame.
pub type FrameCallback = Box<dyn FnMut(FrameRef<'_>) + Send>;

pub(crate) type SharedFrameCallback = Arc<Mutex<Option<FrameCallback>>>;

// ── Back-pressure ────────────────────────────────────────────────

/// Upper bound on frames in flight between capture and encoder.
pub const ENCODER_QUEUE_DEPTH: u32 = 2;

/// Lock-free in-flight encode counter owned by the frame source.
///
/// The capture worker skips frame delivery while the counter is
/// saturated; the coupler holds an [`EncodeGuard`] for the duration of
/// each `encode` call. Invariant: the count stays in
/// `[0, ENCODER_QUEUE_DEPTH]`.
#[derive(Debug, Clone, Default)]
pub struct Backpressure {
    pending: Arc<AtomicU32>,
}

impl Backpressure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of encodes currently in flight.
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// True when the encoder queue is full and capture should skip.
    pub fn is_saturated(&self) -> bool {
        self.pending() >= ENCODER_QUEUE_DEPTH
    }

    /// Account one in-flight encode; the count drops when the guard
    /// does. Callers check [`is_saturated`](Self::is_saturated) first.
    pub fn begin(&self) -> EncodeGuard {
        self.pending.fetch_add(1, Ordering::AcqRel);
        EncodeGuard {
            pending: Arc::clone(&self.pending),
        }
    }
}

/// RAII guard for one in-flight encode.
#[derive(Debug)]
pub struct EncodeGuard {
    pending: Arc<AtomicU32>,
}

impl Drop for EncodeGuard {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Timestamps ───────────────────────────────────────────────────

/// Monotonic nanoseconds since process start. Strictly non-decreasing
/// within a run, which is all the pipeline relies on.
pub fn monotonic_ns() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_counts_in_flight_work() {
        let bp = Backpressure::new();
        assert_eq!(bp.pending(), 0);
        assert!(!bp.is_saturated());

        let g1 = bp.begin();
        assert_eq!(bp.pending(), 1);
        assert!(!bp.is_saturated());

        let g2 = bp.begin();
        assert_eq!(bp.pending(), 2);
        assert!(bp.is_saturated());

        drop(g1);
        assert_eq!(bp.pending(), 1);
        drop(g2);
        assert_eq!(bp.pending(), 0);
    }

    #[test]
    fn guard_releases_on_panic() {
        let bp = Backpressure::new();
        let bp2 = bp.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = bp2.begin();
            panic!("encode blew up");
        });
        assert!(result.is_err());
        assert_eq!(bp.pending(), 0);
    }

    #[test]
    fn owned_frame_borrows_with_fresh_timestamp() {
        let frame = OwnedFrame {
            data: vec![0u8; 16],
            width: 2,
            height: 2,
            stride: 8,
            format: PixelFormat::Bgra8,
        };
        let view = frame.as_ref(42);
        assert_eq!(view.timestamp_ns, 42);
        assert_eq!(view.data.len(), 16);
        assert_eq!(view.stride, 8);
    }

    #[test]
    fn monotonic_ns_never_decreases() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
