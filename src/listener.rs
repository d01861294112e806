// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Listener-side rendezvous: handshake inbox scanning, session
//! provisioning, the live-connection map, and the janitor.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    sync::Mutex,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    client::{
        common::{CLEANUP_TIMEOUT, best_effort_cleanup},
        connection::Connection,
    },
    driver::{Driver, HandshakeRecord},
    endpoint::{Endpoint, build_connection_string},
    error::{Error, Result},
    noise,
};

pub struct Listener {
    endpoint: Endpoint,
    driver: Arc<dyn Driver>,
    cfg: Config,
    conns: DashMap<String, Arc<Connection>>,
    cancel: CancellationToken,
    /// The accept loop is cooperative: one scan at a time.
    accept_gate: Mutex<()>,
    /// Bootstrap SAS pair: write access to the handshake inbox, read
    /// access to the token outbox.
    bootstrap: (String, String),
}

impl Listener {
    /// Provisions the bootstrap resources and starts the janitor.
    pub async fn bind(
        endpoint: Endpoint,
        driver: Arc<dyn Driver>,
        cfg: Config,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let bootstrap = driver.create_bootstrap_tokens().await?;

        let listener = Arc::new(Self {
            endpoint,
            driver,
            cfg,
            conns: DashMap::new(),
            cancel,
            accept_gate: Mutex::new(()),
            bootstrap,
        });
        listener.spawn_janitor();
        info!(host = %listener.endpoint.host, "listener ready");
        Ok(listener)
    }

    pub fn address(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The URL a dialer hands to `dial_url`.
    pub fn connection_string(&self) -> String {
        build_connection_string(&self.endpoint, &self.bootstrap.0, &self.bootstrap.1)
    }

    pub fn active_connections(&self) -> usize {
        self.conns.len()
    }

    /// Scans the handshake inbox until a dialer gets through. A single
    /// record's failure never stops the loop.
    pub async fn accept(&self) -> Result<Arc<Connection>> {
        let _gate = self.accept_gate.lock().await;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Closed);
            }

            let records = match self.driver.get_handshakes().await {
                Ok(r) => r,
                Err(e) => {
                    warn!("handshake scan failed: {e}");
                    self.accept_pause().await?;
                    continue;
                },
            };

            for record in records {
                match self.try_accept(&record).await {
                    Ok(Some(conn)) => return Ok(conn),
                    Ok(None) => {},
                    Err(e) => debug!(record = %record.id, "handshake record skipped: {e}"),
                }
            }

            self.accept_pause().await?;
        }
    }

    async fn accept_pause(&self) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Closed),
            _ = sleep(self.cfg.accept_poll) => Ok(()),
        }
    }

    async fn try_accept(&self, record: &HandshakeRecord) -> Result<Option<Arc<Connection>>> {
        let mut session = noise::Session::responder()?;
        let plain = session.read_message(&record.payload)?;
        let conn_id = String::from_utf8(plain)
            .map_err(|_| Error::HandshakeExchange("non-utf8 conn id".to_string()))?;
        if conn_id.is_empty() || self.conns.contains_key(&conn_id) {
            return Ok(None);
        }

        let tokens = self.driver.create_session(&conn_id).await?;
        let serialized = serde_json::to_vec(&tokens)
            .map_err(|e| Error::HandshakeExchange(format!("token encode: {e}")))?;
        let msg2 = session.write_message(&serialized)?;
        self.driver
            .post_token(&conn_id, Bytes::from(msg2))
            .await
            .map_err(|e| Error::HandshakeExchange(format!("post token: {e}")))?;

        if !session.is_established() {
            // Left for a later scan; the record is only deleted on the
            // success path and the janitor reclaims the session.
            return Ok(None);
        }

        let transport = self.driver.new_transport(&conn_id, &tokens, false).await?;
        self.driver.delete_handshake(&record.id).await?;

        let conn = Connection::new(
            conn_id.clone(),
            transport,
            session,
            &self.cfg,
            self.cancel.child_token(),
            Some(Arc::clone(&self.driver)),
        )?;
        self.conns.insert(conn_id.clone(), Arc::clone(&conn));
        info!(conn_id = %conn_id, "accepted connection");
        Ok(Some(conn))
    }

    // ─── janitor ────────────────────────────────────────────────────────

    fn spawn_janitor(self: &Arc<Self>) {
        let listener = Arc::clone(self);
        tokio::spawn(async move {
            let period = (listener.cfg.idle_timeout / 2).max(Duration::from_millis(10));
            loop {
                tokio::select! {
                    _ = listener.cancel.cancelled() => break,
                    _ = sleep(period) => {},
                }

                let candidates: Vec<(String, Arc<Connection>)> = listener
                    .conns
                    .iter()
                    .filter(|e| {
                        let c = e.value();
                        c.is_defunct() || c.peer_idle() > listener.cfg.idle_timeout
                    })
                    .map(|e| (e.key().clone(), Arc::clone(e.value())))
                    .collect();

                for (conn_id, conn) in candidates {
                    debug!(conn_id = %conn_id, "janitor evicting");
                    listener.evict(&conn_id, &conn).await;
                }
            }
        });
    }

    /// Closes a connection and reclaims its storage; all errors are
    /// swallowed under a local timeout.
    async fn evict(&self, conn_id: &str, conn: &Arc<Connection>) {
        let _ = conn.close().await;
        let cleanup = async {
            self.driver.delete_token(conn_id).await?;
            self.driver.cleanup_session(conn_id).await
        };
        best_effort_cleanup("session cleanup", conn_id, cleanup).await;
        self.conns.remove(conn_id);
    }

    /// Cancels the listener scope, closes every live connection with a
    /// final sweep, and tears down the bootstrap resources.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();

        let live: Vec<(String, Arc<Connection>)> = self
            .conns
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (conn_id, conn) in live {
            self.evict(&conn_id, &conn).await;
        }

        match timeout(CLEANUP_TIMEOUT, self.driver.cleanup_bootstrap()).await {
            Ok(r) => r,
            Err(_) => Err(Error::Driver(anyhow::anyhow!("bootstrap cleanup timeout"))),
        }
    }
}
