// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Driver contract.
//!
//! A driver binds the core to one storage backend. It has two halves: the
//! data plane ([`RawTransport`], optionally [`Rotator`]) and the
//! rendezvous/control plane ([`Driver`]). The core never interprets
//! handshake record ids or token payloads; both are opaque driver
//! currency.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    cfg::config::Config,
    endpoint::Endpoint,
    error::{Error, Result},
};

pub mod mem;
pub mod metrics;

/// Signed-URL pair granting the dialer access to one session's resource
/// pair without holding the account secret. Serialized as JSON inside the
/// second handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokens {
    pub req: String,
    pub res: String,
}

/// One record of the shared handshake inbox. `id` is driver-assigned and
/// used only to delete the record after consumption.
#[derive(Debug, Clone)]
pub struct HandshakeRecord {
    pub id: String,
    pub payload: Bytes,
}

/// Data-plane half: append-style writes and cursor reads against one
/// session's resource pair.
///
/// Invariants the core relies on: writes from one side are observed in
/// order; each write is atomic; `Error::NoData` signals an exhausted
/// cursor and any other error is fatal; the core never hands `write_raw`
/// more than `max_raw_size` minus the seal overhead.
#[async_trait]
pub trait RawTransport: Send + Sync {
    /// Appends `buf` atomically to the sender's outbound resource.
    async fn write_raw(&self, cancel: &CancellationToken, buf: Bytes) -> Result<()>;

    /// Next chunk at the read cursor; `Error::NoData` when nothing new.
    async fn read_raw(&self, cancel: &CancellationToken) -> Result<Bytes>;

    async fn close(&self) -> Result<()>;

    fn local_addr(&self) -> String;
    fn remote_addr(&self) -> String;

    /// Upper bound on a single raw unit.
    fn max_raw_size(&self) -> usize;

    /// Rotation capability, present when the backend imposes a
    /// per-resource append limit.
    fn rotator(&self) -> Option<&dyn Rotator> {
        None
    }
}

/// Resource-rotation capability of a [`RawTransport`].
#[async_trait]
pub trait Rotator: Send + Sync {
    fn should_rotate(&self) -> bool;

    /// Migrates the write side to a fresh resource.
    async fn rotate_tx(&self, cancel: &CancellationToken) -> Result<()>;

    /// Follows the peer onto its next resource.
    fn rotate_rx(&self) -> Result<()>;
}

/// Control-plane half: rendezvous endpoints plus per-session provisioning.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn post_handshake(&self, conn_id: &str, payload: Bytes) -> Result<()>;
    async fn get_handshakes(&self) -> Result<Vec<HandshakeRecord>>;
    async fn delete_handshake(&self, id: &str) -> Result<()>;

    async fn post_token(&self, conn_id: &str, payload: Bytes) -> Result<()>;
    /// `Error::NoData` while the listener has not responded yet.
    async fn get_token(&self, conn_id: &str) -> Result<Bytes>;
    async fn delete_token(&self, conn_id: &str) -> Result<()>;

    /// Provisions the per-session resource pair and issues its signed
    /// URLs.
    async fn create_session(&self, conn_id: &str) -> Result<SessionTokens>;

    /// Issues the listener's bootstrap pair: write access to the handshake
    /// inbox and read access to the token outbox.
    async fn create_bootstrap_tokens(&self) -> Result<(String, String)>;

    /// Opens the data-plane transport for one side of a session.
    async fn new_transport(
        &self,
        conn_id: &str,
        tokens: &SessionTokens,
        is_initiator: bool,
    ) -> Result<Box<dyn RawTransport>>;

    async fn cleanup_bootstrap(&self) -> Result<()>;
    async fn cleanup_session(&self, conn_id: &str) -> Result<()>;
}

/// Constructs a driver for a parsed endpoint.
pub type DriverFactory = fn(&Endpoint, &Config) -> Result<Arc<dyn Driver>>;

static REGISTRY: Lazy<DashMap<String, DriverFactory>> = Lazy::new(DashMap::new);

/// Registers a factory for a URL scheme, replacing any previous one.
pub fn register_driver(scheme: &str, factory: DriverFactory) {
    REGISTRY.insert(scheme.to_string(), factory);
}

/// Resolves the driver for an endpoint's scheme.
pub fn driver_for(ep: &Endpoint, cfg: &Config) -> Result<Arc<dyn Driver>> {
    let factory = REGISTRY
        .get(ep.scheme.as_str())
        .map(|entry| *entry.value())
        .ok_or_else(|| Error::UnsupportedScheme(ep.scheme.clone()))?;
    factory(ep, cfg)
}
