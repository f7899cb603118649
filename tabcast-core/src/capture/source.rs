//! Paced screen capture worker.
//!
//! Wraps the platform capturer (XShm/X11 on Linux, DXGI on Windows,
//! CoreGraphics on macOS — all behind `scrap`) in a dedicated thread
//! that delivers frames to a single registered callback at a target
//! rate, subject to back-pressure from the encoder.
//!
//! The capturer itself is not `Send`, so the worker thread constructs
//! and owns it; [`ScreenSource::initialize`] only probes the display
//! list for geometry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use scrap::{Capturer, Display};
use tracing::{debug, info, warn};

use super::{
    monotonic_ns, Backpressure, FrameCallback, FrameRef, OwnedFrame, PixelFormat,
    SharedFrameCallback,
};
use crate::error::{Result, TabcastError};

/// Delay before retrying after the capture handle is lost
/// (display-mode change, compositor switch, session lock).
const RECOVER_DELAY: Duration = Duration::from_millis(100);

// ── SourceState ──────────────────────────────────────────────────

/// Lifecycle of a [`ScreenSource`]. Only `Running` produces frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceState {
    Created,
    Initialized,
    Running,
    Stopped,
}

// ── ScreenSource ─────────────────────────────────────────────────

/// Captures one display and feeds the frame callback.
///
/// States: Created → Initialized → Running → Stopped. `stop` is safe
/// from any state and joins the worker; `start_capture` may be called
/// again afterwards.
pub struct ScreenSource {
    state: SourceState,
    display_index: usize,
    width: u32,
    height: u32,
    running: Arc<AtomicBool>,
    backpressure: Backpressure,
    callback: SharedFrameCallback,
    worker: Option<JoinHandle<()>>,
}

impl ScreenSource {
    pub fn new() -> Self {
        Self {
            state: SourceState::Created,
            display_index: 0,
            width: 0,
            height: 0,
            running: Arc::new(AtomicBool::new(false)),
            backpressure: Backpressure::new(),
            callback: Arc::new(Mutex::new(None)),
            worker: None,
        }
    }

    /// Bind to the display at `display_index` and record its geometry.
    pub fn initialize(&mut self, display_index: usize) -> Result<()> {
        let mut displays = Display::all()
            .map_err(|e| TabcastError::AccessDenied(format!("cannot enumerate displays: {e}")))?;

        if display_index >= displays.len() {
            return Err(TabcastError::NoDisplay(display_index));
        }

        // The Display is consumed when a Capturer is built and is not
        // Send, so only its geometry leaves this call; the worker
        // re-opens it by index.
        let display = displays.remove(display_index);
        self.width = display.width() as u32;
        self.height = display.height() as u32;
        self.display_index = display_index;
        self.state = SourceState::Initialized;

        info!(
            display_index,
            width = self.width,
            height = self.height,
            "screen source initialized"
        );
        Ok(())
    }

    /// Start the capture worker at `target_fps`. No-op while running.
    pub fn start_capture(&mut self, target_fps: u32) {
        if self.state == SourceState::Running {
            return;
        }
        if self.state == SourceState::Created {
            warn!("start_capture before initialize; no frames will be produced");
            return;
        }

        let target_fps = if target_fps == 0 {
            warn!("target_fps 0 clamped to 1");
            1
        } else {
            target_fps
        };

        self.running.store(true, Ordering::SeqCst);

        let ctx = WorkerContext {
            display_index: self.display_index,
            width: self.width,
            height: self.height,
            target_fps,
            running: Arc::clone(&self.running),
            backpressure: self.backpressure.clone(),
            callback: Arc::clone(&self.callback),
        };
        self.worker = Some(
            thread::Builder::new()
                .name("tabcast-capture".into())
                .spawn(move || capture_loop(ctx))
                .expect("spawn capture worker"),
        );
        self.state = SourceState::Running;

        info!(target_fps, "capture started");
    }

    /// Stop the worker and join it. Idempotent, safe from any state.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            info!("capture stopped");
        }
        if self.state != SourceState::Created {
            self.state = SourceState::Stopped;
        }
    }

    /// Register (or clear) the frame callback. Safe at any time,
    /// including while the worker is running.
    pub fn set_frame_callback(&self, callback: Option<FrameCallback>) {
        *self.callback.lock().expect("frame callback lock") = callback;
    }

    /// Capture width in pixels. Valid after `initialize`.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Capture height in pixels. Valid after `initialize`.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Handle to the in-flight encode counter.
    pub fn backpressure(&self) -> Backpressure {
        self.backpressure.clone()
    }

    /// True when the encoder queue is full.
    pub fn is_backpressured(&self) -> bool {
        self.backpressure.is_saturated()
    }
}

impl Default for ScreenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScreenSource {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Worker ───────────────────────────────────────────────────────

struct WorkerContext {
    display_index: usize,
    width: u32,
    height: u32,
    target_fps: u32,
    running: Arc<AtomicBool>,
    backpressure: Backpressure,
    callback: SharedFrameCallback,
}

impl WorkerContext {
    fn deliver(&self, frame: FrameRef<'_>) {
        let mut guard = self.callback.lock().expect("frame callback lock");
        if let Some(cb) = guard.as_mut() {
            cb(frame);
        }
    }
}

fn capture_loop(ctx: WorkerContext) {
    raise_thread_priority();

    let period = Duration::from_nanos(1_000_000_000 / u64::from(ctx.target_fps));
    let idle_after = 2 * period;

    let mut next_tick = Instant::now() + period;
    let mut capturer: Option<Capturer> = None;
    let mut last_frame: Option<OwnedFrame> = None;
    let mut last_new_frame = Instant::now();

    while ctx.running.load(Ordering::Relaxed) {
        if capturer.is_none() {
            match open_capturer(ctx.display_index) {
                Ok(c) => {
                    debug!("capture handle (re)created");
                    capturer = Some(c);
                }
                Err(e) => {
                    debug!("capture handle unavailable: {e}");
                    thread::sleep(RECOVER_DELAY);
                    continue;
                }
            }
        }

        // Back-pressure: skip the capture/delivery step entirely but
        // keep advancing the pacing schedule below.
        if !ctx.backpressure.is_saturated() {
            let outcome = capture_once(
                capturer.as_mut().expect("capturer present"),
                &ctx,
                &mut last_frame,
            );
            match outcome {
                CaptureOutcome::Delivered => last_new_frame = Instant::now(),
                CaptureOutcome::NoNewFrame => {
                    // Re-deliver the last frame with a fresh timestamp
                    // once the screen has been static for two frame
                    // intervals, so the encoder and client never stall.
                    if last_new_frame.elapsed() > idle_after {
                        if let Some(frame) = &last_frame {
                            ctx.deliver(frame.as_ref(monotonic_ns()));
                        }
                    }
                }
                CaptureOutcome::Lost => {
                    capturer = None;
                    thread::sleep(RECOVER_DELAY);
                }
            }
        }

        pace(&mut next_tick, period);
    }
}

enum CaptureOutcome {
    Delivered,
    NoNewFrame,
    Lost,
}

fn capture_once(
    capturer: &mut Capturer,
    ctx: &WorkerContext,
    last_frame: &mut Option<OwnedFrame>,
) -> CaptureOutcome {
    match capturer.frame() {
        Ok(buffer) => {
            let stride = buffer.len() / ctx.height as usize;
            let timestamp_ns = monotonic_ns();

            store_last_frame(last_frame, &buffer, ctx, stride);

            ctx.deliver(FrameRef {
                data: &buffer,
                width: ctx.width,
                height: ctx.height,
                stride,
                format: PixelFormat::Bgra8,
                timestamp_ns,
            });
            CaptureOutcome::Delivered
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => CaptureOutcome::NoNewFrame,
        Err(e) => {
            warn!("capture handle lost ({e}); recreating");
            CaptureOutcome::Lost
        }
    }
}

/// Advance the schedule by the nominal period so transient jitter does
/// not drift it; resynchronise only after falling a full frame behind.
fn pace(next_tick: &mut Instant, period: Duration) {
    *next_tick += period;
    let now = Instant::now();
    if *next_tick > now {
        thread::sleep(*next_tick - now);
    } else if now.duration_since(*next_tick) > period {
        *next_tick = now;
    }
}

fn open_capturer(display_index: usize) -> std::io::Result<Capturer> {
    let mut displays = Display::all()?;
    if display_index >= displays.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("display {display_index} gone"),
        ));
    }
    Capturer::new(displays.remove(display_index))
}

fn store_last_frame(
    slot: &mut Option<OwnedFrame>,
    buffer: &[u8],
    ctx: &WorkerContext,
    stride: usize,
) {
    match slot {
        Some(frame) => {
            frame.data.clear();
            frame.data.extend_from_slice(buffer);
            frame.stride = stride;
        }
        None => {
            *slot = Some(OwnedFrame {
                data: buffer.to_vec(),
                width: ctx.width,
                height: ctx.height,
                stride,
                format: PixelFormat::Bgra8,
            });
        }
    }
}

/// Best-effort latency tweak; failure is expected without privileges.
fn raise_thread_priority() {
    #[cfg(target_os = "linux")]
    // SAFETY: plain syscall on the calling thread, no pointers involved.
    unsafe {
        libc::setpriority(libc::PRIO_PROCESS, 0, -10);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_before_start_is_safe_and_idempotent() {
        let mut source = ScreenSource::new();
        source.stop();
        source.stop();
        assert_eq!(source.state, SourceState::Created);
    }

    #[test]
    fn start_without_initialize_is_inert() {
        let mut source = ScreenSource::new();
        source.start_capture(60);
        assert_eq!(source.state, SourceState::Created);
        assert!(source.worker.is_none());
    }

    #[test]
    fn callback_reassignment_is_safe() {
        let source = ScreenSource::new();
        source.set_frame_callback(Some(Box::new(|_| {})));
        source.set_frame_callback(None);
        source.set_frame_callback(Some(Box::new(|_| {})));
    }

    #[test]
    fn pace_advances_by_nominal_period() {
        let period = Duration::from_millis(1);
        let start = Instant::now();
        let mut next_tick = start + period;
        pace(&mut next_tick, period);
        // Advanced by exactly one period from the previous target, not
        // re-anchored to "now".
        assert_eq!(next_tick, start + 2 * period);
    }

    #[test]
    fn pace_resyncs_after_long_stall() {
        let period = Duration::from_millis(1);
        let mut next_tick = Instant::now() - Duration::from_secs(1);
        pace(&mut next_tick, period);
        assert!(Instant::now().duration_since(next_tick) < Duration::from_millis(100));
    }
}
