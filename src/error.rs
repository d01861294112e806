// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error taxonomy of the core. `NoData` is the only recoverable kind; the
/// engine polls through it and never surfaces it to the application.
#[derive(Debug, Error)]
pub enum Error {
    /// Nothing new at the driver's current read cursor.
    #[error("no data at current cursor")]
    NoData,

    /// No driver registered for the URL scheme.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A signed URL failed to parse or decode.
    #[error("invalid sas token: {0}")]
    InvalidSas(String),

    /// The connection string lacks the named SAS query value.
    #[error("missing sas token: {0}")]
    MissingSas(&'static str),

    /// Rendezvous POST/GET failed irrecoverably.
    #[error("handshake exchange failed: {0}")]
    HandshakeExchange(String),

    #[error("noise handshake failed: {0}")]
    Handshake(#[from] snow::Error),

    /// Both handshake messages were exchanged but the session did not
    /// reach the established state.
    #[error("noise handshake did not complete")]
    HandshakeIncomplete,

    /// A sealed chunk failed AEAD verification; fatal for the connection.
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("connection closed")]
    Closed,

    /// Write on a connection whose write side has been shut down.
    #[error("write on closed pipe")]
    ClosedPipe,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,

    /// Raw transport or rendezvous failure other than `NoData`.
    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}

impl Error {
    pub fn is_no_data(&self) -> bool {
        matches!(self, Error::NoData)
    }
}
