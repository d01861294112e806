// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Anonymous Noise session.
//!
//! Wraps the `NN` pattern (Curve25519, AES-256-GCM, SHA-256): two
//! ephemeral-only messages, after which both directional cipher states are
//! derived and the session is promoted to transport mode. Post-handshake
//! payloads travel as sealed chunks `[len:u32 BE][ciphertext+tag]`; the
//! AEAD nonce is implicit in the cipher state, so chunks must be unsealed
//! strictly in FIFO order.

use bytes::{BufMut, BytesMut};
use snow::{Builder, HandshakeState, TransportState, params::NoiseParams};

use crate::error::{Error, Result};

/// Noise pattern negotiated between the peers. NN is anonymous: neither
/// side proves a static identity.
pub const PATTERN: &str = "Noise_NN_25519_AESGCM_SHA256";

/// AES-256-GCM authentication tag length.
pub const TAG_LEN: usize = 16;
/// Big-endian ciphertext length prefix on every sealed chunk.
pub const LEN_PREFIX: usize = 4;
/// Per-chunk overhead the framing layer budgets for.
pub const OVERHEAD: usize = LEN_PREFIX + TAG_LEN;
/// Noise caps a single transport message at 65535 bytes of ciphertext.
pub const MAX_PLAINTEXT: usize = 65_535 - TAG_LEN;

enum State {
    Handshaking(Box<HandshakeState>),
    Established(Box<TransportState>),
    /// Transitional placeholder while promoting by value; observing it
    /// afterwards means an earlier transition failed.
    Invalid,
}

pub struct Session {
    state: State,
    initiator: bool,
}

impl Session {
    pub fn initiator() -> Result<Self> {
        Self::new(true)
    }

    pub fn responder() -> Result<Self> {
        Self::new(false)
    }

    fn new(initiator: bool) -> Result<Self> {
        let params: NoiseParams = PATTERN.parse()?;
        let builder = Builder::new(params);
        let hs = if initiator {
            builder.build_initiator()?
        } else {
            builder.build_responder()?
        };
        Ok(Self {
            state: State::Handshaking(Box::new(hs)),
            initiator,
        })
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// True once both handshake messages have been exchanged and the
    /// directional cipher states exist.
    pub fn is_established(&self) -> bool {
        matches!(self.state, State::Established(_))
    }

    /// Produces the next handshake message embedding `payload`.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let State::Handshaking(hs) = &mut self.state else {
            return Err(Error::HandshakeIncomplete);
        };
        let mut out = vec![0u8; payload.len() + 128];
        let n = hs.write_message(payload, &mut out)?;
        out.truncate(n);
        self.promote()?;
        Ok(out)
    }

    /// Consumes a peer handshake message and returns its embedded payload.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let State::Handshaking(hs) = &mut self.state else {
            return Err(Error::HandshakeIncomplete);
        };
        let mut out = vec![0u8; message.len()];
        let n = hs.read_message(message, &mut out)?;
        out.truncate(n);
        self.promote()?;
        Ok(out)
    }

    fn promote(&mut self) -> Result<()> {
        let finished =
            matches!(&self.state, State::Handshaking(hs) if hs.is_handshake_finished());
        if !finished {
            return Ok(());
        }
        match std::mem::replace(&mut self.state, State::Invalid) {
            State::Handshaking(hs) => {
                self.state = State::Established(Box::new(hs.into_transport_mode()?));
                Ok(())
            },
            other => {
                self.state = other;
                Err(Error::HandshakeIncomplete)
            },
        }
    }

    /// Encrypts `plaintext` with the send cipher and appends
    /// `[len:u32 BE][ciphertext+tag]` to `dst`.
    pub fn seal(&mut self, dst: &mut BytesMut, plaintext: &[u8]) -> Result<()> {
        let State::Established(ts) = &mut self.state else {
            return Err(Error::HandshakeIncomplete);
        };
        let mut ct = vec![0u8; plaintext.len() + TAG_LEN];
        let n = ts.write_message(plaintext, &mut ct)?;
        dst.reserve(LEN_PREFIX + n);
        dst.put_u32(n as u32);
        dst.put_slice(&ct[..n]);
        Ok(())
    }

    /// Attempts to unseal the chunk at the head of `raw`.
    ///
    /// `Ok(None)` signals a short buffer: accumulate more raw bytes and
    /// retry. On success returns the plaintext and the number of raw bytes
    /// consumed. A verification failure is fatal for the connection.
    pub fn unseal(&mut self, raw: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        let State::Established(ts) = &mut self.state else {
            return Err(Error::HandshakeIncomplete);
        };
        if raw.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        if raw.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let mut pt = vec![0u8; len];
        let n = ts
            .read_message(&raw[LEN_PREFIX..LEN_PREFIX + len], &mut pt)
            .map_err(|_| Error::DecryptionFailed)?;
        pt.truncate(n);
        Ok(Some((pt, LEN_PREFIX + len)))
    }
}
