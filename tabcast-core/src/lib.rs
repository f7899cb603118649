//! tabcast-core — the streaming pipeline that turns a desktop into a
//! wireless secondary display for an Android tablet.
//!
//! Capture → encode → network in one direction, touch → gestures →
//! input injection in the other:
//!
//! - [`capture`]: paced frame source with lock-free back-pressure
//! - [`encoder`]: all-intra Annex-B H.265 with a bit-exact contract
//! - [`pipeline`]: the coupler wiring source → encoder → server
//! - [`server`]: single-client TCP server and wire framing
//! - [`gesture`]: the touch gesture state machine
//! - [`input`]: host input injection backends
//! - [`display`] / [`bridge`]: virtual-monitor and USB adapters

pub mod bridge;
pub mod capture;
pub mod display;
pub mod encoder;
pub mod error;
pub mod gesture;
pub mod input;
pub mod pipeline;
pub mod protocol;
pub mod server;

pub use capture::ScreenSource;
pub use encoder::VideoEncoder;
pub use error::{Result, TabcastError};
pub use gesture::GestureEngine;
pub use server::StreamingServer;
