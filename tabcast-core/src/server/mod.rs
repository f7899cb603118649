//! Single-client TCP streaming server.
//!
//! Owns the listening socket, accepts at most one client at a time,
//! frames every message per the wire protocol, delivers received
//! messages to callbacks, and accounts throughput stats over a rolling
//! one-second window.
//!
//! ## Task structure
//!
//! One accept task lives for the server. Each accepted client gets a
//! receive task (exact-size reads, one opcode at a time) and a writer
//! task draining a bounded channel. The channel is the send
//! serialisation point: a single owner of the write half, strict FIFO,
//! one complete `write_all` per message — DISPLAY_CONFIG is enqueued
//! before the writer starts draining, so it is always the first bytes
//! on the wire.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TabcastError};
use crate::protocol::{
    self, DisplayConfig, PointerEvent, DISPLAY_CONFIG_LEN, MAX_FRAME_SIZE, MSG_PING,
    MSG_TOUCH_EVENT, PING_PAYLOAD_LEN, TOUCH_PAYLOAD_MAX,
};

/// Outbound messages queued for the writer; the bound keeps in-flight
/// work small so a slow socket back-pressures the encode thread.
const OUTBOUND_QUEUE_DEPTH: usize = 4;

// ── Callback types ───────────────────────────────────────────────

pub type TouchCallback = Box<dyn Fn(PointerEvent) + Send + Sync>;
pub type ConnectionCallback = Box<dyn Fn(bool) + Send + Sync>;
/// `(fps, mbps)` over the last stats window.
pub type StatsCallback = Box<dyn Fn(f64, f64) + Send + Sync>;

// ── StreamingServer ──────────────────────────────────────────────

/// The streaming server. One instance serves one `start`/`stop` cycle;
/// the supervisor builds a fresh one per session.
pub struct StreamingServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    port: u16,
    running: AtomicBool,
    shutdown: CancellationToken,
    /// Bound port, for ephemeral-port listeners. 0 until `start`.
    local_port: AtomicU16,
    display: Mutex<DisplayConfig>,
    client: Mutex<Option<ClientHandle>>,
    connected: AtomicBool,
    stats: Mutex<StatsWindow>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    touch_callback: Mutex<Option<TouchCallback>>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    stats_callback: Mutex<Option<StatsCallback>>,
}

struct ClientHandle {
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

enum Outbound {
    Frame(Vec<u8>),
    Config([u8; DISPLAY_CONFIG_LEN]),
    Pong([u8; PING_PAYLOAD_LEN + 1]),
}

impl StreamingServer {
    pub fn new(port: u16) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                port,
                running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                local_port: AtomicU16::new(0),
                display: Mutex::new(DisplayConfig {
                    width: 0,
                    height: 0,
                    rotation: 0,
                }),
                client: Mutex::new(None),
                connected: AtomicBool::new(false),
                stats: Mutex::new(StatsWindow::new()),
                accept_task: Mutex::new(None),
                touch_callback: Mutex::new(None),
                connection_callback: Mutex::new(None),
                stats_callback: Mutex::new(None),
            }),
        }
    }

    /// Bind the listener and spawn the accept task. Returns
    /// immediately when already running.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Port 0 asks the OS for an ephemeral port (tests); anything
        // else must be outside the privileged range.
        if self.inner.port != 0 && self.inner.port < 1024 {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(TabcastError::ConfigInvalid(format!(
                "port {} is privileged",
                self.inner.port
            )));
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.inner.port));
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(match e.kind() {
                    std::io::ErrorKind::AddrInUse => TabcastError::SocketInUse(self.inner.port),
                    _ => TabcastError::Socket(e.to_string()),
                });
            }
        };

        let local_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
        self.inner.local_port.store(local_port, Ordering::SeqCst);
        info!(port = local_port, "listening");

        let task = tokio::spawn(ServerInner::accept_loop(Arc::clone(&self.inner), listener));
        *self.inner.accept_task.lock().expect("accept task slot") = Some(task);
        Ok(())
    }

    /// Shut down the listener and any client session. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        let task = self.inner.accept_task.lock().expect("accept task slot").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("server stopped");
    }

    /// Geometry and rotation for the next DISPLAY_CONFIG.
    pub fn set_display_size(&self, width: i32, height: i32, rotation: i32) {
        let mut display = self.inner.display.lock().expect("display lock");
        display.width = width;
        display.height = height;
        display.rotation = rotation;
    }

    /// Change rotation and re-send DISPLAY_CONFIG to a connected
    /// client.
    pub fn update_rotation(&self, rotation: i32) {
        {
            let mut display = self.inner.display.lock().expect("display lock");
            display.rotation = rotation;
        }
        self.inner.resend_display_config();
    }

    /// Handle used by the encoder output path to put frames on the
    /// wire.
    pub fn frame_sink(&self) -> FrameSink {
        FrameSink {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn set_touch_callback(&self, callback: TouchCallback) {
        *self.inner.touch_callback.lock().expect("touch callback") = Some(callback);
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self
            .inner
            .connection_callback
            .lock()
            .expect("connection callback") = Some(callback);
    }

    pub fn set_stats_callback(&self, callback: StatsCallback) {
        *self.inner.stats_callback.lock().expect("stats callback") = Some(callback);
    }

    /// Clear every registered callback; part of pipeline disconnect.
    pub fn clear_callbacks(&self) {
        *self.inner.touch_callback.lock().expect("touch callback") = None;
        *self
            .inner
            .connection_callback
            .lock()
            .expect("connection callback") = None;
        *self.inner.stats_callback.lock().expect("stats callback") = None;
    }

    pub fn is_client_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// The actually-bound port (differs from the requested one only
    /// for ephemeral-port listeners).
    pub fn local_port(&self) -> u16 {
        self.inner.local_port.load(Ordering::SeqCst)
    }
}

// ── FrameSink ────────────────────────────────────────────────────

/// Thread-safe frame entry point for the encoder output callback.
#[derive(Clone)]
pub struct FrameSink {
    inner: Arc<ServerInner>,
}

impl FrameSink {
    /// Queue one encoded access unit for the client.
    ///
    /// Called from the capture/encode thread; blocks while the writer
    /// channel is full, which is the write-side back-pressure the
    /// pipeline relies on. Must not be called from async context.
    pub fn send_frame(&self, data: &[u8]) {
        if data.is_empty() || !self.inner.connected.load(Ordering::SeqCst) {
            return;
        }
        if data.len() > MAX_FRAME_SIZE {
            warn!(
                size = data.len(),
                max = MAX_FRAME_SIZE,
                "frame too large; dropped"
            );
            return;
        }

        let sender = {
            let client = self.inner.client.lock().expect("client slot");
            client.as_ref().map(|c| c.outbound.clone())
        };
        if let Some(tx) = sender {
            // An error just means the session died under us.
            let _ = tx.blocking_send(Outbound::Frame(data.to_vec()));
        }
    }
}

// ── ServerInner ──────────────────────────────────────────────────

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = listener.accept() => result,
            };

            match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "client connected");
                    self.attach_client(stream).await;
                }
                Err(e) => {
                    warn!("accept error: {e}");
                }
            }
        }

        self.detach_client().await;
    }

    /// Install a new client session, tearing down any previous one
    /// first (its receive task is joined before the slot is reused).
    async fn attach_client(self: &Arc<Self>, stream: TcpStream) {
        self.detach_client().await;

        let _ = stream.set_nodelay(true);

        self.stats.lock().expect("stats lock").reset();

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

        // Queued before the writer task exists, so it is the first
        // message on the wire for this connection.
        let config = self.display.lock().expect("display lock").encode();
        let _ = tx.send(Outbound::Config(config)).await;

        self.connected.store(true, Ordering::SeqCst);
        self.fire_connection(true);

        let cancel = CancellationToken::new();
        let writer_task = tokio::spawn(Self::writer_loop(
            Arc::clone(self),
            rx,
            writer,
            cancel.clone(),
        ));
        let receive_task = tokio::spawn(Self::receive_loop(
            Arc::clone(self),
            reader,
            tx.clone(),
            cancel.clone(),
        ));

        *self.client.lock().expect("client slot") = Some(ClientHandle {
            outbound: tx,
            cancel,
            tasks: vec![writer_task, receive_task],
        });
    }

    async fn detach_client(&self) {
        let handle = self.client.lock().expect("client slot").take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            for task in handle.tasks {
                let _ = task.await;
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn writer_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Outbound>,
        mut writer: OwnedWriteHalf,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(m) => m,
                    None => break,
                },
            };

            let result = match &message {
                Outbound::Frame(payload) => {
                    let header = protocol::frame_header(payload.len());
                    match writer.write_all(&header).await {
                        Ok(()) => writer.write_all(payload).await,
                        Err(e) => Err(e),
                    }
                }
                Outbound::Config(bytes) => writer.write_all(bytes).await,
                Outbound::Pong(bytes) => writer.write_all(bytes).await,
            };

            match result {
                Ok(()) => {
                    if let Outbound::Frame(payload) = &message {
                        self.record_frame_sent(payload.len());
                    }
                }
                Err(e) => {
                    debug!("send failed: {e}");
                    self.connected.store(false, Ordering::SeqCst);
                    cancel.cancel();
                    break;
                }
            }
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        outbound: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) {
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = self.read_messages(&mut reader, &outbound) => result,
        };

        if let Err(e) = result {
            debug!("client session ended: {e}");
        }

        self.connected.store(false, Ordering::SeqCst);
        cancel.cancel();
        self.fire_connection(false);
        info!("client disconnected");
    }

    /// Read messages until EOF or a protocol violation. A short read
    /// anywhere ends the session; there is no way to resynchronise a
    /// stream without length prefixes.
    async fn read_messages(
        &self,
        reader: &mut OwnedReadHalf,
        outbound: &mpsc::Sender<Outbound>,
    ) -> Result<()> {
        loop {
            let mut opcode = [0u8; 1];
            reader.read_exact(&mut opcode).await?;

            match opcode[0] {
                MSG_TOUCH_EVENT => {
                    let mut count = [0u8; 1];
                    reader.read_exact(&mut count).await?;
                    let count = count[0];
                    if !(1..=2).contains(&count) {
                        return Err(TabcastError::ProtocolViolation("invalid pointer count"));
                    }

                    let len = PointerEvent::payload_len(count);
                    let mut payload = [0u8; TOUCH_PAYLOAD_MAX];
                    reader.read_exact(&mut payload[..len]).await?;

                    let event = PointerEvent::decode(count, &payload[..len])?;
                    self.fire_touch(event);
                }
                MSG_PING => {
                    let mut timestamp = [0u8; PING_PAYLOAD_LEN];
                    reader.read_exact(&mut timestamp).await?;
                    if outbound
                        .send(Outbound::Pong(protocol::pong(&timestamp)))
                        .await
                        .is_err()
                    {
                        return Err(TabcastError::SessionLost);
                    }
                }
                other => {
                    warn!(opcode = other, "unknown message type");
                    return Err(TabcastError::ProtocolViolation("unknown opcode"));
                }
            }
        }
    }

    fn resend_display_config(&self) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let config = self.display.lock().expect("display lock").encode();
        let sender = {
            let client = self.client.lock().expect("client slot");
            client.as_ref().map(|c| c.outbound.clone())
        };
        if let Some(tx) = sender {
            if tx.try_send(Outbound::Config(config)).is_err() {
                warn!("display config not queued; writer busy");
            }
        }
    }

    fn record_frame_sent(&self, bytes: usize) {
        let report = {
            let mut stats = self.stats.lock().expect("stats lock");
            stats.record(bytes as u64)
        };
        if let Some((fps, mbps)) = report {
            let cb = self.stats_callback.lock().expect("stats callback");
            if let Some(cb) = cb.as_ref() {
                cb(fps, mbps);
            }
        }
    }

    fn fire_touch(&self, event: PointerEvent) {
        let cb = self.touch_callback.lock().expect("touch callback");
        if let Some(cb) = cb.as_ref() {
            cb(event);
        }
    }

    fn fire_connection(&self, connected: bool) {
        let cb = self
            .connection_callback
            .lock()
            .expect("connection callback");
        if let Some(cb) = cb.as_ref() {
            cb(connected);
        }
    }
}

// ── Stats ────────────────────────────────────────────────────────

/// Rolling one-second throughput window.
struct StatsWindow {
    bytes: u64,
    frames: u64,
    window_start: Instant,
}

impl StatsWindow {
    fn new() -> Self {
        Self {
            bytes: 0,
            frames: 0,
            window_start: Instant::now(),
        }
    }

    fn reset(&mut self) {
        self.bytes = 0;
        self.frames = 0;
        self.window_start = Instant::now();
    }

    /// Account one sent frame; returns `(fps, mbps)` when the window
    /// has elapsed, resetting it.
    fn record(&mut self, bytes: u64) -> Option<(f64, f64)> {
        self.bytes += bytes;
        self.frames += 1;

        let elapsed = self.window_start.elapsed().as_secs_f64();
        if elapsed < 1.0 {
            return None;
        }

        let mbps = (self.bytes * 8) as f64 / elapsed / 1e6;
        let fps = self.frames as f64 / elapsed;
        self.reset();
        Some((fps, mbps))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_window_reports_after_one_second() {
        let mut window = StatsWindow::new();
        assert!(window.record(1000).is_none());
        assert!(window.record(1000).is_none());

        // Rewind the window start instead of sleeping.
        window.window_start = Instant::now() - std::time::Duration::from_secs(2);
        let (fps, mbps) = window.record(1000).unwrap();

        // 3 frames / ~2 s and 3000 bytes × 8 / ~2 s / 1e6.
        assert!((fps - 1.5).abs() < 0.1);
        assert!((mbps - 0.012).abs() < 0.001);

        // Window reset after reporting.
        assert_eq!(window.bytes, 0);
        assert_eq!(window.frames, 0);
    }

    #[test]
    fn server_rejects_privileged_ports() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let server = StreamingServer::new(80);
            assert!(matches!(
                server.start().await,
                Err(TabcastError::ConfigInvalid(_))
            ));
        });
    }
}
