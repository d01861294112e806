// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Metrics decoration.
//!
//! [`MeteredDriver`] and [`MeteredTransport`] forward every method to the
//! wrapped value and increment a counter on success. They never change
//! error semantics; `NoData` passes through uncounted.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    driver::{Driver, HandshakeRecord, RawTransport, Rotator, SessionTokens},
    error::{Error, Result},
};

/// Success-only increment hooks. All counters are monotone.
#[derive(Debug, Default)]
pub struct Counters {
    pub raw_writes: AtomicU64,
    pub raw_reads: AtomicU64,
    pub bytes_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub rotations_tx: AtomicU64,
    pub rotations_rx: AtomicU64,
    pub handshakes_posted: AtomicU64,
    pub handshake_scans: AtomicU64,
    pub tokens_posted: AtomicU64,
    pub tokens_fetched: AtomicU64,
    pub sessions_created: AtomicU64,
    pub transports_opened: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct MeteredDriver {
    inner: Arc<dyn Driver>,
    counters: Arc<Counters>,
}

impl MeteredDriver {
    pub fn new(inner: Arc<dyn Driver>) -> Self {
        Self {
            inner,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }
}

#[async_trait]
impl Driver for MeteredDriver {
    async fn post_handshake(&self, conn_id: &str, payload: Bytes) -> Result<()> {
        self.inner.post_handshake(conn_id, payload).await?;
        Counters::bump(&self.counters.handshakes_posted);
        Ok(())
    }

    async fn get_handshakes(&self) -> Result<Vec<HandshakeRecord>> {
        let records = self.inner.get_handshakes().await?;
        Counters::bump(&self.counters.handshake_scans);
        Ok(records)
    }

    async fn delete_handshake(&self, id: &str) -> Result<()> {
        self.inner.delete_handshake(id).await
    }

    async fn post_token(&self, conn_id: &str, payload: Bytes) -> Result<()> {
        self.inner.post_token(conn_id, payload).await?;
        Counters::bump(&self.counters.tokens_posted);
        Ok(())
    }

    async fn get_token(&self, conn_id: &str) -> Result<Bytes> {
        let payload = self.inner.get_token(conn_id).await?;
        Counters::bump(&self.counters.tokens_fetched);
        Ok(payload)
    }

    async fn delete_token(&self, conn_id: &str) -> Result<()> {
        self.inner.delete_token(conn_id).await
    }

    async fn create_session(&self, conn_id: &str) -> Result<SessionTokens> {
        let tokens = self.inner.create_session(conn_id).await?;
        Counters::bump(&self.counters.sessions_created);
        Ok(tokens)
    }

    async fn create_bootstrap_tokens(&self) -> Result<(String, String)> {
        self.inner.create_bootstrap_tokens().await
    }

    async fn new_transport(
        &self,
        conn_id: &str,
        tokens: &SessionTokens,
        is_initiator: bool,
    ) -> Result<Box<dyn RawTransport>> {
        let inner = self.inner.new_transport(conn_id, tokens, is_initiator).await?;
        Counters::bump(&self.counters.transports_opened);
        Ok(Box::new(MeteredTransport {
            inner,
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn cleanup_bootstrap(&self) -> Result<()> {
        self.inner.cleanup_bootstrap().await
    }

    async fn cleanup_session(&self, conn_id: &str) -> Result<()> {
        self.inner.cleanup_session(conn_id).await
    }
}

pub struct MeteredTransport {
    inner: Box<dyn RawTransport>,
    counters: Arc<Counters>,
}

impl MeteredTransport {
    fn inner_rotator(&self) -> Result<&dyn Rotator> {
        self.inner
            .rotator()
            .ok_or_else(|| Error::Driver(anyhow!("inner transport has no rotator")))
    }
}

#[async_trait]
impl RawTransport for MeteredTransport {
    async fn write_raw(&self, cancel: &CancellationToken, buf: Bytes) -> Result<()> {
        let n = buf.len() as u64;
        self.inner.write_raw(cancel, buf).await?;
        Counters::bump(&self.counters.raw_writes);
        self.counters.bytes_out.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }

    async fn read_raw(&self, cancel: &CancellationToken) -> Result<Bytes> {
        let chunk = self.inner.read_raw(cancel).await?;
        Counters::bump(&self.counters.raw_reads);
        self.counters
            .bytes_in
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Ok(chunk)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn local_addr(&self) -> String {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> String {
        self.inner.remote_addr()
    }

    fn max_raw_size(&self) -> usize {
        self.inner.max_raw_size()
    }

    fn rotator(&self) -> Option<&dyn Rotator> {
        self.inner.rotator().map(|_| self as &dyn Rotator)
    }
}

#[async_trait]
impl Rotator for MeteredTransport {
    fn should_rotate(&self) -> bool {
        self.inner.rotator().is_some_and(|r| r.should_rotate())
    }

    async fn rotate_tx(&self, cancel: &CancellationToken) -> Result<()> {
        self.inner_rotator()?.rotate_tx(cancel).await?;
        Counters::bump(&self.counters.rotations_tx);
        Ok(())
    }

    fn rotate_rx(&self) -> Result<()> {
        self.inner_rotator()?.rotate_rx()?;
        Counters::bump(&self.counters.rotations_rx);
        Ok(())
    }
}
