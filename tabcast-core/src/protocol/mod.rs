//! Wire protocol for the single-client TCP stream.
//!
//! Every message is one opcode byte followed by a fixed-size payload.
//! There is no per-message length field except inside VIDEO_FRAME, so an
//! unknown opcode is fatal for the session — the stream cannot be
//! resynchronised.
//!
//! ## Server → client
//!
//! ```text
//! 0x00 VIDEO_FRAME     size:u32 BE, then `size` bytes of Annex-B H.265
//! 0x01 DISPLAY_CONFIG  width:i32 BE, height:i32 BE, rotation:i32 BE
//! 0x05 PONG            8 bytes — byte-for-byte echo of the PING payload
//! ```
//!
//! ## Client → server
//!
//! ```text
//! 0x02 TOUCH_EVENT     count:u8 (1|2); count × (x:f32 LE, y:f32 LE);
//!                      action:i32 LE
//! 0x04 PING            8 arbitrary bytes (client-chosen timestamp)
//! ```
//!
//! Sizes and display config are big-endian; the touch floats/ints and
//! the ping timestamp are little-endian. This mixed layout is a legacy
//! contract with the Android client — do not change it.

use crate::error::{Result, TabcastError};

// ── Opcodes ──────────────────────────────────────────────────────

pub const MSG_VIDEO_FRAME: u8 = 0x00;
pub const MSG_DISPLAY_CONFIG: u8 = 0x01;
pub const MSG_TOUCH_EVENT: u8 = 0x02;
pub const MSG_PING: u8 = 0x04;
pub const MSG_PONG: u8 = 0x05;

// ── Limits ───────────────────────────────────────────────────────

/// Largest VIDEO_FRAME payload the server will put on the wire.
pub const MAX_FRAME_SIZE: usize = 5 * 1024 * 1024;

/// Default listening port. Valid ports are 1024–65535.
pub const DEFAULT_PORT: u16 = 8888;

/// PING/PONG payload length.
pub const PING_PAYLOAD_LEN: usize = 8;

/// VIDEO_FRAME header length: opcode + u32 size.
pub const FRAME_HEADER_LEN: usize = 5;

/// DISPLAY_CONFIG message length: opcode + 3 × i32.
pub const DISPLAY_CONFIG_LEN: usize = 13;

/// Largest TOUCH_EVENT payload: 2 pointers × 8 bytes + 4-byte action.
pub const TOUCH_PAYLOAD_MAX: usize = 20;

// ── Byte-order helpers ───────────────────────────────────────────

/// Write a 32-bit integer in big-endian.
#[inline]
pub fn write_be32(dst: &mut [u8], value: i32) {
    dst[..4].copy_from_slice(&value.to_be_bytes());
}

/// Read a 32-bit integer from big-endian bytes.
#[inline]
pub fn read_be32(src: &[u8]) -> i32 {
    i32::from_be_bytes([src[0], src[1], src[2], src[3]])
}

/// Read a float from little-endian bytes.
#[inline]
pub fn read_le_f32(src: &[u8]) -> f32 {
    f32::from_le_bytes([src[0], src[1], src[2], src[3]])
}

/// Read a 32-bit integer from little-endian bytes.
#[inline]
pub fn read_le_i32(src: &[u8]) -> i32 {
    i32::from_le_bytes([src[0], src[1], src[2], src[3]])
}

// ── DisplayConfig ────────────────────────────────────────────────

/// Geometry advertised to the client on connect and on rotation
/// changes. The host streams raw (unrotated) frames; the client applies
/// `rotation` when presenting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayConfig {
    /// Stream width in pixels.
    pub width: i32,
    /// Stream height in pixels.
    pub height: i32,
    /// Rotation in degrees: 0, 90, 180 or 270.
    pub rotation: i32,
}

impl DisplayConfig {
    /// Serialize as a complete DISPLAY_CONFIG message.
    pub fn encode(&self) -> [u8; DISPLAY_CONFIG_LEN] {
        let mut buf = [0u8; DISPLAY_CONFIG_LEN];
        buf[0] = MSG_DISPLAY_CONFIG;
        write_be32(&mut buf[1..5], self.width);
        write_be32(&mut buf[5..9], self.height);
        write_be32(&mut buf[9..13], self.rotation);
        buf
    }
}

// ── Touch events ─────────────────────────────────────────────────

/// Pointer phase reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerAction {
    Down,
    Move,
    Up,
}

impl PointerAction {
    /// Map the wire value (0/1/2) onto an action.
    pub fn from_wire(value: i32) -> Result<Self> {
        match value {
            0 => Ok(PointerAction::Down),
            1 => Ok(PointerAction::Move),
            2 => Ok(PointerAction::Up),
            _ => Err(TabcastError::ProtocolViolation("unknown touch action")),
        }
    }
}

/// A decoded TOUCH_EVENT. Coordinates are normalized to `[0, 1]` in
/// the client's view of the stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerEvent {
    /// 1 or 2 active pointers.
    pub pointer_count: u8,
    pub x1: f32,
    pub y1: f32,
    /// Second pointer, meaningful only when `pointer_count == 2`.
    pub x2: f32,
    pub y2: f32,
    pub action: PointerAction,
}

impl PointerEvent {
    /// Payload length on the wire for a given pointer count:
    /// `count × (x + y) + action`.
    pub fn payload_len(pointer_count: u8) -> usize {
        pointer_count as usize * 8 + 4
    }

    /// Decode the payload that follows the opcode and count bytes.
    pub fn decode(pointer_count: u8, payload: &[u8]) -> Result<Self> {
        if !(1..=2).contains(&pointer_count) {
            return Err(TabcastError::ProtocolViolation("invalid pointer count"));
        }
        let expected = Self::payload_len(pointer_count);
        if payload.len() < expected {
            return Err(TabcastError::ProtocolViolation("short touch payload"));
        }

        let x1 = read_le_f32(&payload[0..4]);
        let y1 = read_le_f32(&payload[4..8]);
        let (x2, y2) = if pointer_count == 2 {
            (read_le_f32(&payload[8..12]), read_le_f32(&payload[12..16]))
        } else {
            (0.0, 0.0)
        };

        let coord_len = pointer_count as usize * 8;
        let action = PointerAction::from_wire(read_le_i32(&payload[coord_len..coord_len + 4]))?;

        Ok(Self {
            pointer_count,
            x1,
            y1,
            x2,
            y2,
            action,
        })
    }
}

// ── Outgoing message builders ────────────────────────────────────

/// Build the 5-byte VIDEO_FRAME header for a payload of `size` bytes.
pub fn frame_header(size: usize) -> [u8; FRAME_HEADER_LEN] {
    let mut buf = [0u8; FRAME_HEADER_LEN];
    buf[0] = MSG_VIDEO_FRAME;
    write_be32(&mut buf[1..5], size as i32);
    buf
}

/// Build a PONG echoing the given PING payload byte-for-byte.
pub fn pong(ping_payload: &[u8; PING_PAYLOAD_LEN]) -> [u8; PING_PAYLOAD_LEN + 1] {
    let mut buf = [0u8; PING_PAYLOAD_LEN + 1];
    buf[0] = MSG_PONG;
    buf[1..].copy_from_slice(ping_payload);
    buf
}

// ── Tests ────────────────────────────────────────────────────────
