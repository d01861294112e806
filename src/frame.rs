// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Plaintext frame codec.
//!
//! Every unit crossing the encrypted stream is a length-prefixed typed
//! frame:
//!
//! ```text
//! +------------+--------+------------------+
//! | len: u32BE | type:1 | payload: len B   |
//! +------------+--------+------------------+
//! ```
//!
//! Frames may span several raw transport units and several raw reads; the
//! connection engine reassembles them. The codec operates strictly on
//! plaintext and performs no encryption.

use bytes::{BufMut, BytesMut};

/// Frame header size: 4-byte big-endian length plus 1-byte type.
pub const HEADER_LEN: usize = 5;

/// Frame types carried on the wire. Unknown type bytes are skipped by the
/// reader for forward compatibility.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Application payload bytes.
    #[default]
    Data = 0x00,
    /// Keep-alive; zero-length payload.
    Ping = 0x01,
    /// Graceful half-close of the sender's write side.
    Fin = 0x02,
    /// The sender has migrated to a fresh raw resource.
    Rotate = 0x03,
}

impl FrameType {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::Data,
            0x01 => Self::Ping,
            0x02 => Self::Fin,
            0x03 => Self::Rotate,
            _ => return None,
        })
    }
}

/// Appends exactly `HEADER_LEN + payload.len()` bytes to `buf`.
pub fn build(buf: &mut BytesMut, ty: FrameType, payload: &[u8]) {
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(ty as u8);
    buf.put_slice(payload);
}

/// Peeks the frame header at the head of `buf`. Returns `(payload_len,
/// raw_type)` once at least `HEADER_LEN` bytes are buffered; the payload
/// itself may still be incomplete.
pub fn peek(buf: &[u8]) -> Option<(usize, u8)> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    Some((len, buf[4]))
}
