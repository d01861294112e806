// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-memory reference driver.
//!
//! Models one storage account per host name: append-only block logs for
//! the session resource pairs, a handshake inbox, and a token table. It
//! issues fake signed URLs so the whole rendezvous and URL plumbing is
//! exercised without a cloud account, and supports rotation through a
//! configurable per-resource block threshold. The driver doubles as the
//! executable documentation of the contract in [`crate::driver`].

use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rand::RngExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    cfg::config::Config,
    driver::{
        Driver, HandshakeRecord, RawTransport, Rotator, SessionTokens, register_driver,
    },
    error::{Error, Result},
};

/// Process-global namespace so `mem://<host>` resolves to one shared
/// service per host, mirroring a storage account.
static SERVICES: Lazy<DashMap<String, Arc<MemService>>> = Lazy::new(DashMap::new);

/// Registers the `mem` scheme with the driver registry.
pub fn register() {
    register_driver("mem", |ep, cfg| {
        let driver: Arc<dyn Driver> = Arc::new(MemDriver::new(MemService::named(&ep.host), cfg));
        Ok(driver)
    });
}

/// One append-only resource, rotated into generations when the backend
/// append limit is reached.
struct ResourceLog {
    generations: Mutex<Vec<Vec<Bytes>>>,
}

impl Default for ResourceLog {
    fn default() -> Self {
        Self {
            generations: Mutex::new(vec![Vec::new()]),
        }
    }
}

impl ResourceLog {
    fn gens(&self) -> MutexGuard<'_, Vec<Vec<Bytes>>> {
        self.generations.lock().expect("resource log lock poisoned")
    }
}

#[derive(Default)]
struct SessionStore {
    req: ResourceLog,
    res: ResourceLog,
}

/// The shared storage account backing any number of listeners and dialers
/// within the process.
pub struct MemService {
    host: String,
    handshakes: Mutex<Vec<HandshakeRecord>>,
    next_handshake_id: AtomicU64,
    tokens: DashMap<String, Bytes>,
    sessions: DashMap<String, Arc<SessionStore>>,
    max_raw_size: usize,
    rotate_threshold: Option<usize>,
}

impl MemService {
    pub fn builder() -> MemServiceBuilder {
        MemServiceBuilder::default()
    }

    /// The globally shared service for `host`, created with default
    /// options on first use.
    pub fn named(host: &str) -> Arc<Self> {
        SERVICES
            .entry(host.to_string())
            .or_insert_with(|| MemService::builder().host(host).build())
            .clone()
    }

    fn records(&self) -> MutexGuard<'_, Vec<HandshakeRecord>> {
        self.handshakes.lock().expect("handshake inbox lock poisoned")
    }

    fn sign(&self, name: &str, expiry: Duration) -> String {
        let mut sig = [0u8; 8];
        rand::rng().fill(&mut sig);
        let se = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .saturating_add(expiry)
            .as_secs();
        format!("mem://{}/{}?sig={}&se={}", self.host, name, hex::encode(sig), se)
    }
}

#[derive(Debug, Clone)]
pub struct MemServiceBuilder {
    host: String,
    max_raw_size: usize,
    rotate_threshold: Option<usize>,
}

impl Default for MemServiceBuilder {
    fn default() -> Self {
        Self {
            host: "local".to_string(),
            max_raw_size: 65_536,
            rotate_threshold: None,
        }
    }
}

impl MemServiceBuilder {
    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Upper bound on a single raw unit, in bytes.
    pub fn max_raw_size(mut self, n: usize) -> Self {
        self.max_raw_size = n;
        self
    }

    /// Blocks per resource generation before the writer must rotate.
    pub fn rotate_threshold(mut self, blocks: usize) -> Self {
        self.rotate_threshold = Some(blocks);
        self
    }

    pub fn build(self) -> Arc<MemService> {
        Arc::new(MemService {
            host: self.host,
            handshakes: Mutex::new(Vec::new()),
            next_handshake_id: AtomicU64::new(0),
            tokens: DashMap::new(),
            sessions: DashMap::new(),
            max_raw_size: self.max_raw_size,
            rotate_threshold: self.rotate_threshold,
        })
    }
}

/// Driver over one [`MemService`], parameterised by the rendezvous names
/// of a [`Config`].
pub struct MemDriver {
    svc: Arc<MemService>,
    req_prefix: String,
    res_prefix: String,
    handshake_endpoint: String,
    token_endpoint: String,
    sas_expiry: Duration,
}

impl MemDriver {
    pub fn new(svc: Arc<MemService>, cfg: &Config) -> Self {
        Self {
            svc,
            req_prefix: cfg.req_prefix.clone(),
            res_prefix: cfg.res_prefix.clone(),
            handshake_endpoint: cfg.handshake_endpoint.clone(),
            token_endpoint: cfg.token_endpoint.clone(),
            sas_expiry: cfg.sas_expiry,
        }
    }

    fn resource_name(&self, prefix: &str, conn_id: &str) -> String {
        format!("{prefix}-{conn_id}")
    }

    fn check_sas(&self, sas: &str, expected: &str) -> Result<()> {
        let url = Url::parse(sas).map_err(|e| Error::InvalidSas(format!("{e}")))?;
        let name = url.path().trim_start_matches('/');
        if name != expected {
            return Err(Error::InvalidSas(format!(
                "token grants {name:?}, expected {expected:?}"
            )));
        }
        if !url.query_pairs().any(|(k, _)| k == "sig") {
            return Err(Error::InvalidSas("missing sig".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for MemDriver {
    async fn post_handshake(&self, _conn_id: &str, payload: Bytes) -> Result<()> {
        let id = self.svc.next_handshake_id.fetch_add(1, Ordering::Relaxed);
        self.svc.records().push(HandshakeRecord {
            id: id.to_string(),
            payload,
        });
        Ok(())
    }

    async fn get_handshakes(&self) -> Result<Vec<HandshakeRecord>> {
        Ok(self.svc.records().clone())
    }

    async fn delete_handshake(&self, id: &str) -> Result<()> {
        self.svc.records().retain(|r| r.id != id);
        Ok(())
    }

    async fn post_token(&self, conn_id: &str, payload: Bytes) -> Result<()> {
        self.svc.tokens.insert(conn_id.to_string(), payload);
        Ok(())
    }

    async fn get_token(&self, conn_id: &str) -> Result<Bytes> {
        self.svc
            .tokens
            .get(conn_id)
            .map(|e| e.value().clone())
            .ok_or(Error::NoData)
    }

    async fn delete_token(&self, conn_id: &str) -> Result<()> {
        self.svc.tokens.remove(conn_id);
        Ok(())
    }

    async fn create_session(&self, conn_id: &str) -> Result<SessionTokens> {
        self.svc
            .sessions
            .insert(conn_id.to_string(), Arc::new(SessionStore::default()));
        Ok(SessionTokens {
            req: self
                .svc
                .sign(&self.resource_name(&self.req_prefix, conn_id), self.sas_expiry),
            res: self
                .svc
                .sign(&self.resource_name(&self.res_prefix, conn_id), self.sas_expiry),
        })
    }

    async fn create_bootstrap_tokens(&self) -> Result<(String, String)> {
        Ok((
            self.svc.sign(&self.handshake_endpoint, self.sas_expiry),
            self.svc.sign(&self.token_endpoint, self.sas_expiry),
        ))
    }

    async fn new_transport(
        &self,
        conn_id: &str,
        tokens: &SessionTokens,
        is_initiator: bool,
    ) -> Result<Box<dyn RawTransport>> {
        self.check_sas(&tokens.req, &self.resource_name(&self.req_prefix, conn_id))?;
        self.check_sas(&tokens.res, &self.resource_name(&self.res_prefix, conn_id))?;

        let store = self
            .svc
            .sessions
            .get(conn_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::HandshakeExchange(format!("unknown session {conn_id}")))?;

        let side = if is_initiator { "dialer" } else { "listener" };
        let peer = if is_initiator { "listener" } else { "dialer" };
        Ok(Box::new(MemTransport {
            store,
            is_initiator,
            local: format!("mem://{}/{}#{}", self.svc.host, conn_id, side),
            remote: format!("mem://{}/{}#{}", self.svc.host, conn_id, peer),
            read_gen: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            max_raw_size: self.svc.max_raw_size,
            rotate_threshold: self.svc.rotate_threshold,
        }))
    }

    async fn cleanup_bootstrap(&self) -> Result<()> {
        self.svc.records().clear();
        self.svc.tokens.clear();
        Ok(())
    }

    async fn cleanup_session(&self, conn_id: &str) -> Result<()> {
        self.svc.sessions.remove(conn_id);
        Ok(())
    }
}

/// One side of a session's data plane. The initiator writes the `req` log
/// and reads the `res` log; the responder is mirrored.
pub struct MemTransport {
    store: Arc<SessionStore>,
    is_initiator: bool,
    local: String,
    remote: String,
    read_gen: AtomicUsize,
    read_idx: AtomicUsize,
    closed: AtomicBool,
    max_raw_size: usize,
    rotate_threshold: Option<usize>,
}

impl MemTransport {
    fn write_log(&self) -> &ResourceLog {
        if self.is_initiator { &self.store.req } else { &self.store.res }
    }

    fn read_log(&self) -> &ResourceLog {
        if self.is_initiator { &self.store.res } else { &self.store.req }
    }

    fn ensure_open(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Driver(anyhow!("transport closed")));
        }
        Ok(())
    }
}

#[async_trait]
impl RawTransport for MemTransport {
    async fn write_raw(&self, cancel: &CancellationToken, buf: Bytes) -> Result<()> {
        self.ensure_open(cancel)?;
        let mut gens = self.write_log().gens();
        match gens.last_mut() {
            Some(blocks) => blocks.push(buf),
            None => gens.push(vec![buf]),
        }
        Ok(())
    }

    async fn read_raw(&self, cancel: &CancellationToken) -> Result<Bytes> {
        self.ensure_open(cancel)?;
        let gens = self.read_log().gens();
        let generation = self.read_gen.load(Ordering::Acquire);
        let idx = self.read_idx.load(Ordering::Acquire);
        match gens.get(generation).and_then(|blocks| blocks.get(idx)) {
            Some(block) => {
                self.read_idx.store(idx + 1, Ordering::Release);
                Ok(block.clone())
            },
            None => Err(Error::NoData),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }

    fn max_raw_size(&self) -> usize {
        self.max_raw_size
    }

    fn rotator(&self) -> Option<&dyn Rotator> {
        self.rotate_threshold.map(|_| self as &dyn Rotator)
    }
}

#[async_trait]
impl Rotator for MemTransport {
    fn should_rotate(&self) -> bool {
        let Some(threshold) = self.rotate_threshold else {
            return false;
        };
        self.write_log()
            .gens()
            .last()
            .is_some_and(|blocks| blocks.len() >= threshold)
    }

    async fn rotate_tx(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open(cancel)?;
        self.write_log().gens().push(Vec::new());
        Ok(())
    }

    fn rotate_rx(&self) -> Result<()> {
        self.read_gen.fetch_add(1, Ordering::AcqRel);
        self.read_idx.store(0, Ordering::Release);
        Ok(())
    }
}
