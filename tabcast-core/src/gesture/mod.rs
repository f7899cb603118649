//! Touch gesture engine.
//!
//! Translates the client's normalized pointer events into host input
//! that feels like a direct touch on a local screen: tap → click,
//! double-tap, long-press → right-click or drag, one-finger scroll
//! with momentum, two-finger scroll, and pinch → Ctrl+wheel zoom.
//!
//! ## Locking discipline
//!
//! All gesture state lives behind one mutex. Injection calls can block
//! on OS IPC, so every handler snapshots state under the lock, decides
//! what to do, releases the lock, and only then injects. The long-press
//! and momentum workers follow the same rule: they take the mutex to
//! read or decay state and never call the input backend while holding
//! it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::input::{InputBackend, ModifierKey, MouseButton};
use crate::protocol::{PointerAction, PointerEvent};

// ── Tuning constants ─────────────────────────────────────────────

pub const TAP_MAX_DISTANCE: f32 = 15.0;
pub const TAP_MAX_TIME: Duration = Duration::from_millis(250);
pub const DOUBLE_TAP_MAX_TIME: Duration = Duration::from_millis(400);
pub const DOUBLE_TAP_MAX_DISTANCE: f32 = 20.0;
pub const LONG_PRESS_TIME: Duration = Duration::from_millis(500);
pub const SCROLL_SENSITIVITY: f32 = 1.2;
pub const PINCH_MIN_DISTANCE: f32 = 20.0;
pub const MOMENTUM_DECAY: f32 = 0.92;
pub const MOMENTUM_MIN_VELOCITY: f32 = 0.5;
pub const MOMENTUM_INTERVAL: Duration = Duration::from_millis(16);

/// Poll granularity of the long-press worker; bounds join latency.
const LONG_PRESS_POLL: Duration = Duration::from_millis(10);

/// Flick launch: the release must follow the last move this closely.
const MOMENTUM_LAUNCH_WINDOW: Duration = Duration::from_millis(50);
/// ...and the last scroll delta must exceed this many pixels.
const MOMENTUM_LAUNCH_THRESHOLD: f32 = 2.0;
/// Initial momentum velocity is the last delta times this factor.
const MOMENTUM_LAUNCH_FACTOR: f32 = 6.0;

/// Pixels of finger travel per wheel notch.
const SCROLL_NOTCH_PIXELS: i32 = 10;

// ── State ────────────────────────────────────────────────────────

/// Current phase of the gesture state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureState {
    Idle,
    /// Finger down, nothing decided yet.
    Pending,
    Scrolling,
    /// Long-press fired; release right-clicks, movement drags.
    LongPressReady,
    Dragging,
    TwoFingerScroll,
    Pinching,
}

/// Host-pixel rectangle the normalized coordinates map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayBounds {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Default for DisplayBounds {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 1920,
            height: 1200,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LastTap {
    x: i32,
    y: i32,
    at: Instant,
}

/// Everything behind the gesture mutex.
struct Tracker {
    state: GestureState,
    bounds: DisplayBounds,
    touch_start: (i32, i32),
    touch_start_time: Instant,
    touch_last: (i32, i32),
    last_move_time: Instant,
    last_scroll_delta: (f32, f32),
    last_tap: Option<LastTap>,
    initial_pinch_distance: f32,
    last_pinch_distance: f32,
    two_finger_last_mid: (i32, i32),
    momentum_pos: (i32, i32),
    momentum_velocity: (f32, f32),
}

impl Tracker {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            state: GestureState::Idle,
            bounds: DisplayBounds::default(),
            touch_start: (0, 0),
            touch_start_time: now,
            touch_last: (0, 0),
            last_move_time: now,
            last_scroll_delta: (0.0, 0.0),
            last_tap: None,
            initial_pinch_distance: 0.0,
            last_pinch_distance: 0.0,
            two_finger_last_mid: (0, 0),
            momentum_pos: (0, 0),
            momentum_velocity: (0.0, 0.0),
        }
    }
}

fn distance(a: (i32, i32), b: (i32, i32)) -> f32 {
    let dx = (b.0 - a.0) as f32;
    let dy = (b.1 - a.1) as f32;
    (dx * dx + dy * dy).sqrt()
}

// ── Workers ──────────────────────────────────────────────────────

/// A short-lived worker thread with an explicit running flag. At most
/// one long-press and one momentum worker exist at any moment: the
/// spawn sites cancel-and-join the previous one first.
struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn cancel(self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

// ── GestureEngine ────────────────────────────────────────────────

/// The gesture engine. Cheap to clone handles are not needed — the
/// server's receive task drives [`handle_touch`](Self::handle_touch)
/// and the supervisor owns the engine.
pub struct GestureEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    tracker: Mutex<Tracker>,
    backend: Mutex<Box<dyn InputBackend>>,
    long_press: Mutex<Option<Worker>>,
    momentum: Mutex<Option<Worker>>,
}

impl GestureEngine {
    pub fn new(backend: Box<dyn InputBackend>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                tracker: Mutex::new(Tracker::new()),
                backend: Mutex::new(backend),
                long_press: Mutex::new(None),
                momentum: Mutex::new(None),
            }),
        }
    }

    /// Set the host-pixel rectangle normalized coordinates map onto.
    pub fn set_display_bounds(&self, x: i32, y: i32, width: i32, height: i32) {
        let mut tracker = self.inner.lock_tracker();
        tracker.bounds = DisplayBounds {
            x,
            y,
            width,
            height,
        };
    }

    /// Feed one pointer event from the client.
    pub fn handle_touch(&self, event: &PointerEvent) {
        let (x1, y1) = self.to_screen(event.x1, event.y1);

        if event.pointer_count >= 2 {
            let (x2, y2) = self.to_screen(event.x2, event.y2);
            self.two_finger(x1, y1, x2, y2, event.action);
        } else {
            match event.action {
                PointerAction::Down => self.one_finger_down(x1, y1),
                PointerAction::Move => self.one_finger_move(x1, y1),
                PointerAction::Up => self.one_finger_up(x1, y1),
            }
        }
    }

    /// Current phase of the state machine.
    pub fn current_state(&self) -> GestureState {
        self.inner.lock_tracker().state
    }

    /// Cancel both workers and park the machine in Idle.
    pub fn stop(&self) {
        self.inner.cancel_long_press();
        self.inner.stop_momentum();
        self.inner.lock_tracker().state = GestureState::Idle;
    }

    fn to_screen(&self, nx: f32, ny: f32) -> (i32, i32) {
        let bounds = self.inner.lock_tracker().bounds;
        (
            bounds.x + (nx * bounds.width as f32) as i32,
            bounds.y + (ny * bounds.height as f32) as i32,
        )
    }

    // ── One-finger state machine ─────────────────────────────────

    fn one_finger_down(&self, x: i32, y: i32) {
        // Workers join threads that also take the tracker mutex, so
        // they must be stopped before it is held here.
        self.inner.stop_momentum();
        self.inner.cancel_long_press();

        {
            let mut t = self.inner.lock_tracker();
            let now = Instant::now();
            t.touch_start = (x, y);
            t.touch_last = (x, y);
            t.touch_start_time = now;
            t.last_move_time = now;
            t.state = GestureState::Pending;
        }

        self.inner.inject_move(x, y);
        self.start_long_press();
    }

    fn one_finger_move(&self, x: i32, y: i32) {
        enum Todo {
            None,
            StartScroll(f32, f32),
            Scroll(f32, f32),
            StartDrag(i32, i32),
            Drag,
        }

        let todo;
        {
            let mut t = self.inner.lock_tracker();
            let now = Instant::now();
            let dx = (x - t.touch_last.0) as f32;
            let dy = (y - t.touch_last.1) as f32;
            let total = distance(t.touch_start, (x, y));

            todo = match t.state {
                GestureState::Pending if total > TAP_MAX_DISTANCE => {
                    t.state = GestureState::Scrolling;
                    let sx = dx * SCROLL_SENSITIVITY;
                    let sy = dy * SCROLL_SENSITIVITY;
                    t.last_scroll_delta = (sx, sy);
                    Todo::StartScroll(sx, sy)
                }
                GestureState::LongPressReady if total > TAP_MAX_DISTANCE => {
                    t.state = GestureState::Dragging;
                    Todo::StartDrag(t.touch_start.0, t.touch_start.1)
                }
                GestureState::Scrolling => {
                    let sx = dx * SCROLL_SENSITIVITY;
                    let sy = dy * SCROLL_SENSITIVITY;
                    let dt = now.duration_since(t.last_move_time);
                    // Only fresh movement feeds the flick velocity.
                    if dt > Duration::ZERO && dt < Duration::from_millis(100) {
                        t.last_scroll_delta = (sx, sy);
                    }
                    Todo::Scroll(sx, sy)
                }
                GestureState::Dragging => Todo::Drag,
                _ => Todo::None,
            };

            t.touch_last = (x, y);
            t.last_move_time = now;
        }

        match todo {
            Todo::StartScroll(sx, sy) => {
                self.inner.cancel_long_press();
                self.inner.inject_scroll(x, y, sx as i32, sy as i32);
            }
            Todo::Scroll(sx, sy) => self.inner.inject_scroll(x, y, sx as i32, sy as i32),
            Todo::StartDrag(sx, sy) => {
                // The cursor is still at the touch-start position.
                debug!(x = sx, y = sy, "drag start");
                self.inner.inject_button(MouseButton::Left, true);
                self.inner.inject_move(x, y);
            }
            Todo::Drag => self.inner.inject_move(x, y),
            Todo::None => {}
        }
    }

    fn one_finger_up(&self, x: i32, y: i32) {
        self.inner.cancel_long_press();

        enum Todo {
            None,
            SingleTap,
            DoubleTap,
            RightClick,
            Momentum(f32, f32),
            DragEnd,
        }

        let todo;
        {
            let mut t = self.inner.lock_tracker();
            let now = Instant::now();
            let elapsed = now.duration_since(t.touch_start_time);
            let dist = distance(t.touch_start, (x, y));

            todo = match t.state {
                GestureState::Pending
                    if dist < TAP_MAX_DISTANCE && elapsed < TAP_MAX_TIME =>
                {
                    let is_double = t.last_tap.is_some_and(|last| {
                        now.duration_since(last.at) < DOUBLE_TAP_MAX_TIME
                            && distance((last.x, last.y), (x, y)) < DOUBLE_TAP_MAX_DISTANCE
                    });
                    if is_double {
                        // Cleared so a third tap starts over instead of
                        // chaining triple-clicks.
                        t.last_tap = None;
                        Todo::DoubleTap
                    } else {
                        t.last_tap = Some(LastTap { x, y, at: now });
                        Todo::SingleTap
                    }
                }
                GestureState::LongPressReady => Todo::RightClick,
                GestureState::Scrolling => {
                    let since_move = now.duration_since(t.last_move_time);
                    let (ldx, ldy) = t.last_scroll_delta;
                    if since_move < MOMENTUM_LAUNCH_WINDOW
                        && (ldx.abs() > MOMENTUM_LAUNCH_THRESHOLD
                            || ldy.abs() > MOMENTUM_LAUNCH_THRESHOLD)
                    {
                        t.momentum_pos = (x, y);
                        Todo::Momentum(ldx * MOMENTUM_LAUNCH_FACTOR, ldy * MOMENTUM_LAUNCH_FACTOR)
                    } else {
                        Todo::None
                    }
                }
                GestureState::Dragging => Todo::DragEnd,
                _ => Todo::None,
            };

            t.state = GestureState::Idle;
        }

        match todo {
            Todo::SingleTap => {
                self.inner.inject_button(MouseButton::Left, true);
                self.inner.inject_button(MouseButton::Left, false);
            }
            Todo::DoubleTap => {
                for _ in 0..2 {
                    self.inner.inject_button(MouseButton::Left, true);
                    self.inner.inject_button(MouseButton::Left, false);
                }
            }
            Todo::RightClick => {
                self.inner.inject_button(MouseButton::Right, true);
                self.inner.inject_button(MouseButton::Right, false);
            }
            Todo::Momentum(vx, vy) => self.start_momentum(vx, vy),
            Todo::DragEnd => self.inner.inject_button(MouseButton::Left, false),
            Todo::None => {}
        }
    }

    // ── Two-finger state machine ─────────────────────────────────

    fn two_finger(&self, x1: i32, y1: i32, x2: i32, y2: i32, action: PointerAction) {
        let d = distance((x1, y1), (x2, y2));
        let mid = ((x1 + x2) / 2, (y1 + y2) / 2);

        match action {
            PointerAction::Down => {
                self.inner.cancel_long_press();
                self.inner.stop_momentum();
                let mut t = self.inner.lock_tracker();
                t.state = GestureState::Idle;
                t.initial_pinch_distance = d;
                t.last_pinch_distance = d;
                t.two_finger_last_mid = mid;
            }
            PointerAction::Move => {
                enum Todo {
                    None,
                    Scroll(f32, f32),
                    Zoom(i32),
                }

                let todo;
                {
                    let mut t = self.inner.lock_tracker();
                    let dist_change = (d - t.initial_pinch_distance).abs();
                    let mid_delta = distance(t.two_finger_last_mid, mid);

                    // Classify once; the gesture keeps its mode until
                    // the fingers lift.
                    if t.state != GestureState::TwoFingerScroll
                        && t.state != GestureState::Pinching
                    {
                        if dist_change > PINCH_MIN_DISTANCE {
                            t.state = GestureState::Pinching;
                        } else if mid_delta > TAP_MAX_DISTANCE {
                            t.state = GestureState::TwoFingerScroll;
                        }
                    }

                    todo = match t.state {
                        GestureState::TwoFingerScroll => Todo::Scroll(
                            (mid.0 - t.two_finger_last_mid.0) as f32 * SCROLL_SENSITIVITY,
                            (mid.1 - t.two_finger_last_mid.1) as f32 * SCROLL_SENSITIVITY,
                        ),
                        GestureState::Pinching => {
                            let zoom = ((d - t.last_pinch_distance) * 0.5) as i32;
                            t.last_pinch_distance = d;
                            if zoom != 0 {
                                Todo::Zoom(zoom)
                            } else {
                                Todo::None
                            }
                        }
                        _ => Todo::None,
                    };

                    t.two_finger_last_mid = mid;
                }

                match todo {
                    Todo::Scroll(dx, dy) => {
                        self.inner.inject_scroll(mid.0, mid.1, dx as i32, dy as i32)
                    }
                    Todo::Zoom(z) => self.inner.inject_zoom(mid.0, mid.1, z),
                    Todo::None => {}
                }
            }
            PointerAction::Up => {
                let mut t = self.inner.lock_tracker();
                t.state = GestureState::Idle;
                // Clear one-finger scratch so no stale delta leaks into
                // the next gesture.
                t.touch_start = (0, 0);
                t.touch_last = (0, 0);
            }
        }
    }

    // ── Worker management ────────────────────────────────────────

    fn start_long_press(&self) {
        let mut slot = self.inner.lock_long_press();
        if let Some(worker) = slot.take() {
            worker.cancel();
        }

        let running = Arc::new(AtomicBool::new(true));
        let inner = Arc::clone(&self.inner);
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("tabcast-longpress".into())
            .spawn(move || {
                let start = Instant::now();
                while flag.load(Ordering::SeqCst) {
                    if start.elapsed() >= LONG_PRESS_TIME {
                        let mut t = inner.lock_tracker();
                        if t.state == GestureState::Pending {
                            t.state = GestureState::LongPressReady;
                        }
                        return;
                    }
                    thread::sleep(LONG_PRESS_POLL);
                }
            })
            .expect("spawn long-press worker");

        *slot = Some(Worker { running, handle });
    }

    fn start_momentum(&self, vx: f32, vy: f32) {
        self.inner.stop_momentum();
        {
            let mut t = self.inner.lock_tracker();
            t.momentum_velocity = (vx, vy);
        }

        let mut slot = self.inner.lock_momentum();
        let running = Arc::new(AtomicBool::new(true));
        let inner = Arc::clone(&self.inner);
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("tabcast-momentum".into())
            .spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    let (pos, velocity);
                    {
                        let mut t = inner.lock_tracker();
                        let (vx, vy) = t.momentum_velocity;
                        if vx.abs() < MOMENTUM_MIN_VELOCITY && vy.abs() < MOMENTUM_MIN_VELOCITY {
                            t.momentum_velocity = (0.0, 0.0);
                            return;
                        }
                        pos = t.momentum_pos;
                        velocity = (vx, vy);
                    }

                    inner.inject_scroll(
                        pos.0,
                        pos.1,
                        velocity.0.round() as i32,
                        velocity.1.round() as i32,
                    );

                    {
                        let mut t = inner.lock_tracker();
                        t.momentum_velocity.0 *= MOMENTUM_DECAY;
                        t.momentum_velocity.1 *= MOMENTUM_DECAY;
                    }

                    thread::sleep(MOMENTUM_INTERVAL);
                }
            })
            .expect("spawn momentum worker");

        *slot = Some(Worker { running, handle });
    }
}

impl Drop for GestureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── EngineInner helpers ──────────────────────────────────────────

impl EngineInner {
    fn lock_tracker(&self) -> std::sync::MutexGuard<'_, Tracker> {
        self.tracker.lock().expect("gesture state lock")
    }

    fn lock_long_press(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        self.long_press.lock().expect("long-press slot lock")
    }

    fn lock_momentum(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        self.momentum.lock().expect("momentum slot lock")
    }

    fn cancel_long_press(&self) {
        if let Some(worker) = self.lock_long_press().take() {
            worker.cancel();
        }
    }

    fn stop_momentum(&self) {
        if let Some(worker) = self.lock_momentum().take() {
            worker.cancel();
        }
        self.lock_tracker().momentum_velocity = (0.0, 0.0);
    }

    // Injection helpers; failures are logged and swallowed, a missed
    // event is better than a dead session.

    fn inject_move(&self, x: i32, y: i32) {
        let mut backend = self.backend.lock().expect("input backend lock");
        if let Err(e) = backend.mouse_move(x, y) {
            warn!("{e}");
        }
    }

    fn inject_button(&self, button: MouseButton, down: bool) {
        let mut backend = self.backend.lock().expect("input backend lock");
        if let Err(e) = backend.button(button, down) {
            warn!("{e}");
        }
    }

    /// Move the cursor so the scroll targets the right window, then
    /// convert pixel deltas to wheel notches.
    fn inject_scroll(&self, x: i32, y: i32, dx: i32, dy: i32) {
        let mut backend = self.backend.lock().expect("input backend lock");
        if let Err(e) = backend.mouse_move(x, y) {
            warn!("{e}");
        }
        let nx = dx / SCROLL_NOTCH_PIXELS;
        let ny = dy / SCROLL_NOTCH_PIXELS;
        if nx != 0 || ny != 0 {
            if let Err(e) = backend.wheel(nx, ny) {
                warn!("{e}");
            }
        }
    }

    /// Pinch zoom: Ctrl + wheel, the convention every major desktop
    /// understands.
    fn inject_zoom(&self, x: i32, y: i32, delta: i32) {
        let mut backend = self.backend.lock().expect("input backend lock");
        if let Err(e) = backend.mouse_move(x, y) {
            warn!("{e}");
        }
        let notches = delta.abs().max(1) * delta.signum();
        if let Err(e) = backend.modifier(ModifierKey::Ctrl, true) {
            warn!("{e}");
        }
        if let Err(e) = backend.wheel(0, notches) {
            warn!("{e}");
        }
        if let Err(e) = backend.modifier(ModifierKey::Ctrl, false) {
            warn!("{e}");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Injected {
        Move(i32, i32),
        Button(MouseButton, bool),
        Wheel(i32, i32),
        Modifier(bool),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<Injected>>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<Injected> {
            self.log.lock().unwrap().clone()
        }

        fn len(&self) -> usize {
            self.log.lock().unwrap().len()
        }
    }

    impl InputBackend for Recorder {
        fn mouse_move(&mut self, x: i32, y: i32) -> Result<()> {
            self.log.lock().unwrap().push(Injected::Move(x, y));
            Ok(())
        }
        fn button(&mut self, button: MouseButton, down: bool) -> Result<()> {
            self.log.lock().unwrap().push(Injected::Button(button, down));
            Ok(())
        }
        fn wheel(&mut self, dx: i32, dy: i32) -> Result<()> {
            self.log.lock().unwrap().push(Injected::Wheel(dx, dy));
            Ok(())
        }
        fn modifier(&mut self, _key: ModifierKey, down: bool) -> Result<()> {
            self.log.lock().unwrap().push(Injected::Modifier(down));
            Ok(())
        }
    }

    fn engine() -> (GestureEngine, Recorder) {
        let recorder = Recorder::default();
        let engine = GestureEngine::new(Box::new(recorder.clone()));
        engine.set_display_bounds(0, 0, 1920, 1200);
        (engine, recorder)
    }

    fn touch1(engine: &GestureEngine, x: f32, y: f32, action: PointerAction) {
        engine.handle_touch(&PointerEvent {
            pointer_count: 1,
            x1: x,
            y1: y,
            x2: 0.0,
            y2: 0.0,
            action,
        });
    }

    fn touch2(engine: &GestureEngine, p1: (f32, f32), p2: (f32, f32), action: PointerAction) {
        engine.handle_touch(&PointerEvent {
            pointer_count: 2,
            x1: p1.0,
            y1: p1.1,
            x2: p2.0,
            y2: p2.1,
            action,
        });
    }

    #[test]
    fn single_tap_moves_then_clicks() {
        let (engine, rec) = engine();

        touch1(&engine, 0.5, 0.5, PointerAction::Down);
        thread::sleep(Duration::from_millis(50));
        touch1(&engine, 0.5, 0.5, PointerAction::Up);

        assert_eq!(
            rec.events(),
            vec![
                Injected::Move(960, 600),
                Injected::Button(MouseButton::Left, true),
                Injected::Button(MouseButton::Left, false),
            ]
        );
        assert_eq!(engine.current_state(), GestureState::Idle);
    }

    #[test]
    fn slow_release_is_not_a_tap() {
        let (engine, rec) = engine();

        touch1(&engine, 0.5, 0.5, PointerAction::Down);
        thread::sleep(LONG_PRESS_TIME + Duration::from_millis(100));
        // Long-press has fired by now; release right-clicks instead.
        touch1(&engine, 0.5, 0.5, PointerAction::Up);

        let events = rec.events();
        assert_eq!(events[0], Injected::Move(960, 600));
        assert!(events.contains(&Injected::Button(MouseButton::Right, true)));
        assert!(!events.contains(&Injected::Button(MouseButton::Left, true)));
        assert_eq!(engine.current_state(), GestureState::Idle);
    }

    #[test]
    fn double_tap_then_third_tap_does_not_chain() {
        let (engine, rec) = engine();

        let tap = |e: &GestureEngine| {
            touch1(e, 0.5, 0.5, PointerAction::Down);
            thread::sleep(Duration::from_millis(30));
            touch1(e, 0.5, 0.5, PointerAction::Up);
        };

        tap(&engine);
        let after_first = rec.len();
        // One move + single-tap click pair.
        assert_eq!(after_first, 3);

        thread::sleep(Duration::from_millis(150));
        tap(&engine);
        let second: Vec<_> = rec.events()[after_first..].to_vec();
        // Move + double-tap: two click pairs.
        assert_eq!(
            second,
            vec![
                Injected::Move(960, 600),
                Injected::Button(MouseButton::Left, true),
                Injected::Button(MouseButton::Left, false),
                Injected::Button(MouseButton::Left, true),
                Injected::Button(MouseButton::Left, false),
            ]
        );

        // The stored tap was cleared, so a third tap is single again.
        let after_second = rec.len();
        thread::sleep(Duration::from_millis(150));
        tap(&engine);
        let third: Vec<_> = rec.events()[after_second..].to_vec();
        assert_eq!(
            third,
            vec![
                Injected::Move(960, 600),
                Injected::Button(MouseButton::Left, true),
                Injected::Button(MouseButton::Left, false),
            ]
        );
    }

    #[test]
    fn long_press_then_move_drags() {
        let (engine, rec) = engine();

        touch1(&engine, 0.25, 0.25, PointerAction::Down);
        thread::sleep(LONG_PRESS_TIME + Duration::from_millis(100));
        assert_eq!(engine.current_state(), GestureState::LongPressReady);

        touch1(&engine, 0.30, 0.25, PointerAction::Move); // 96 px
        assert_eq!(engine.current_state(), GestureState::Dragging);
        touch1(&engine, 0.35, 0.25, PointerAction::Move);
        touch1(&engine, 0.35, 0.25, PointerAction::Up);

        let events = rec.events();
        assert_eq!(events[0], Injected::Move(480, 300));
        assert_eq!(events[1], Injected::Button(MouseButton::Left, true));
        assert_eq!(events[2], Injected::Move(576, 300));
        assert_eq!(*events.last().unwrap(), Injected::Button(MouseButton::Left, false));
        assert_eq!(engine.current_state(), GestureState::Idle);
    }

    #[test]
    fn fast_move_scrolls_and_cancels_long_press() {
        let (engine, rec) = engine();

        touch1(&engine, 0.10, 0.10, PointerAction::Down);
        touch1(&engine, 0.10, 0.20, PointerAction::Move); // 120 px down
        assert_eq!(engine.current_state(), GestureState::Scrolling);

        // Long-press must not fire once scrolling started.
        thread::sleep(LONG_PRESS_TIME + Duration::from_millis(100));
        assert_eq!(engine.current_state(), GestureState::Scrolling);

        // 120 px × 1.2 sensitivity = 144 px → 14 notches.
        assert!(rec.events().contains(&Injected::Wheel(0, 14)));
    }

    #[test]
    fn flick_release_starts_momentum_and_down_cancels_it() {
        let (engine, rec) = engine();

        touch1(&engine, 0.5, 0.40, PointerAction::Down);
        touch1(&engine, 0.5, 0.45, PointerAction::Move); // fast 60 px
        touch1(&engine, 0.5, 0.45, PointerAction::Up);
        assert_eq!(engine.current_state(), GestureState::Idle);

        let at_release = rec.len();
        thread::sleep(5 * MOMENTUM_INTERVAL);
        let coasting = rec.len();
        assert!(coasting > at_release, "momentum should keep scrolling");

        // A new touch-down stops the coast.
        touch1(&engine, 0.5, 0.5, PointerAction::Down);
        let at_down = rec.len();
        thread::sleep(5 * MOMENTUM_INTERVAL);
        assert_eq!(rec.len(), at_down);
    }

    #[test]
    fn slow_release_does_not_start_momentum() {
        let (engine, rec) = engine();

        touch1(&engine, 0.5, 0.40, PointerAction::Down);
        touch1(&engine, 0.5, 0.45, PointerAction::Move);
        thread::sleep(MOMENTUM_LAUNCH_WINDOW + Duration::from_millis(30));
        touch1(&engine, 0.5, 0.45, PointerAction::Up);

        let at_release = rec.len();
        thread::sleep(5 * MOMENTUM_INTERVAL);
        assert_eq!(rec.len(), at_release);
    }

    #[test]
    fn two_finger_scroll_emits_wheel() {
        let (engine, rec) = engine();

        touch2(&engine, (0.40, 0.40), (0.50, 0.40), PointerAction::Down);
        // Midpoint moves down 48 px while the distance stays fixed.
        touch2(&engine, (0.40, 0.44), (0.50, 0.44), PointerAction::Move);
        assert_eq!(engine.current_state(), GestureState::TwoFingerScroll);

        assert!(rec
            .events()
            .iter()
            .any(|e| matches!(e, Injected::Wheel(_, dy) if *dy != 0)));

        touch2(&engine, (0.40, 0.44), (0.50, 0.44), PointerAction::Up);
        assert_eq!(engine.current_state(), GestureState::Idle);
    }

    #[test]
    fn pinch_zooms_with_ctrl_held() {
        let (engine, rec) = engine();

        touch2(&engine, (0.45, 0.50), (0.55, 0.50), PointerAction::Down); // 192 px apart
        touch2(&engine, (0.40, 0.50), (0.60, 0.50), PointerAction::Move); // 384 px apart
        assert_eq!(engine.current_state(), GestureState::Pinching);

        let events = rec.events();
        let ctrl_down = events.iter().position(|e| *e == Injected::Modifier(true));
        let ctrl_up = events.iter().position(|e| *e == Injected::Modifier(false));
        let wheel = events
            .iter()
            .position(|e| matches!(e, Injected::Wheel(_, dy) if *dy > 0));
        assert!(ctrl_down.is_some() && wheel.is_some() && ctrl_up.is_some());
        assert!(ctrl_down < wheel && wheel < ctrl_up);
    }

    #[test]
    fn two_finger_up_clears_one_finger_scratch() {
        let (engine, rec) = engine();

        touch2(&engine, (0.40, 0.40), (0.50, 0.40), PointerAction::Down);
        touch2(&engine, (0.40, 0.44), (0.50, 0.44), PointerAction::Move);
        touch2(&engine, (0.40, 0.44), (0.50, 0.44), PointerAction::Up);

        let before = rec.len();
        touch1(&engine, 0.5, 0.5, PointerAction::Down);
        thread::sleep(Duration::from_millis(30));
        touch1(&engine, 0.5, 0.5, PointerAction::Up);

        // A clean tap, not a scroll leaked from stale deltas.
        let tail: Vec<_> = rec.events()[before..].to_vec();
        assert_eq!(
            tail,
            vec![
                Injected::Move(960, 600),
                Injected::Button(MouseButton::Left, true),
                Injected::Button(MouseButton::Left, false),
            ]
        );
    }

    #[test]
    fn up_from_any_state_returns_to_idle() {
        let (engine, _rec) = engine();

        // Pending → Up
        touch1(&engine, 0.5, 0.5, PointerAction::Down);
        touch1(&engine, 0.5, 0.5, PointerAction::Up);
        assert_eq!(engine.current_state(), GestureState::Idle);

        // Scrolling → Up
        touch1(&engine, 0.1, 0.1, PointerAction::Down);
        touch1(&engine, 0.1, 0.3, PointerAction::Move);
        touch1(&engine, 0.1, 0.3, PointerAction::Up);
        assert_eq!(engine.current_state(), GestureState::Idle);

        // Two-finger → Up
        touch2(&engine, (0.4, 0.4), (0.5, 0.4), PointerAction::Down);
        touch2(&engine, (0.4, 0.4), (0.5, 0.4), PointerAction::Up);
        assert_eq!(engine.current_state(), GestureState::Idle);
    }

    #[test]
    fn stop_cancels_workers() {
        let (engine, rec) = engine();

        touch1(&engine, 0.5, 0.40, PointerAction::Down);
        touch1(&engine, 0.5, 0.45, PointerAction::Move);
        touch1(&engine, 0.5, 0.45, PointerAction::Up); // momentum running
        engine.stop();

        let after_stop = rec.len();
        thread::sleep(5 * MOMENTUM_INTERVAL);
        assert_eq!(rec.len(), after_stop);
        assert_eq!(engine.current_state(), GestureState::Idle);
    }
}
