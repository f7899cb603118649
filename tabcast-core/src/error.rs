//! Domain-specific error types for the tabcast pipeline.
//!
//! All fallible operations return `Result<T, TabcastError>`.
//! No panics on invalid input — every error is typed, and the taxonomy
//! maps directly onto the recovery policies the supervisor applies.

use thiserror::Error;

/// The canonical error type for the tabcast host.
#[derive(Debug, Error)]
pub enum TabcastError {
    // ── Capture errors ───────────────────────────────────────────
    /// No display exists at the requested index.
    #[error("no display with index {0}")]
    NoDisplay(usize),

    /// The OS denied access to capture or input facilities.
    #[error("access denied: {0}")]
    AccessDenied(String),

    // ── Encoder errors ───────────────────────────────────────────
    /// No H.265 encoder backend could be initialised.
    #[error("no H.265 encoder backend available")]
    BackendMissing,

    /// The active encoder backend failed.
    #[error("encoder error ({backend}): {message}")]
    Encoder {
        backend: &'static str,
        message: String,
    },

    // ── Network errors ───────────────────────────────────────────
    /// The listening port is already bound by another process.
    #[error("port {0} is already in use")]
    SocketInUse(u16),

    /// A socket-level failure that is not a simple bind conflict.
    #[error("socket error: {0}")]
    Socket(String),

    /// The client connection failed; the session is torn down.
    #[error("client session lost")]
    SessionLost,

    /// A recoverable I/O hiccup; retried at the next tick.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// The peer violated the wire protocol (unknown opcode, short
    /// read). The session cannot be resynchronised and is ended.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// An encoded frame exceeded the wire limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Configuration errors ─────────────────────────────────────
    /// Rejected settings; the previous values stay in effect.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    // ── Input errors ─────────────────────────────────────────────
    /// Injecting an event into the host input system failed.
    #[error("input injection failed: {0}")]
    Input(String),

    /// The I/O layer reported an error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TabcastError>;

impl From<String> for TabcastError {
    fn from(s: String) -> Self {
        TabcastError::TransientIo(s)
    }
}
