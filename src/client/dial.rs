// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Initiator-side rendezvous.

use std::{sync::Arc, time::Instant};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cfg::config::Config,
    client::connection::Connection,
    driver::{Driver, SessionTokens, driver_for},
    endpoint::parse_connection_string,
    error::{Error, Result},
    noise, utils,
};

/// Dials through an already constructed driver.
///
/// Posts the first handshake message carrying a fresh `conn_id`, polls the
/// token outbox under `connect_timeout`, decodes the session tokens from
/// the second handshake message, and opens the data-plane transport.
pub async fn dial(
    driver: Arc<dyn Driver>,
    cfg: &Config,
    cancel: CancellationToken,
) -> Result<Arc<Connection>> {
    cfg.validate()?;

    let conn_id = utils::generate_conn_id();
    let mut session = noise::Session::initiator()?;

    let msg1 = session.write_message(conn_id.as_bytes())?;
    driver
        .post_handshake(&conn_id, msg1.into())
        .await
        .map_err(|e| Error::HandshakeExchange(format!("post handshake: {e}")))?;
    debug!(conn_id = %conn_id, "handshake posted, awaiting session tokens");

    let deadline = Instant::now() + cfg.connect_timeout;
    let payload = loop {
        if Instant::now() >= deadline {
            return Err(Error::DeadlineExceeded);
        }
        let got = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = driver.get_token(&conn_id) => r,
        };
        match got {
            Ok(p) => break p,
            Err(e) if e.is_no_data() => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = sleep(cfg.data_poll) => {},
                }
            },
            Err(e) => return Err(e),
        }
    };

    let plain = session.read_message(&payload)?;
    let tokens: SessionTokens = serde_json::from_slice(&plain)
        .map_err(|e| Error::InvalidSas(format!("token payload: {e}")))?;
    if !session.is_established() {
        return Err(Error::HandshakeIncomplete);
    }

    let transport = driver.new_transport(&conn_id, &tokens, true).await?;
    info!(conn_id = %conn_id, "dial complete");
    Connection::new(conn_id, transport, session, cfg, cancel.child_token(), None)
}

/// Dials a listener-emitted connection string, resolving the driver
/// through the scheme registry. The embedded SAS pair stays available to
/// the driver through the endpoint's original URL.
pub async fn dial_url(
    connection_string: &str,
    cfg: &Config,
    cancel: CancellationToken,
) -> Result<Arc<Connection>> {
    let (endpoint, _handshake_sas, _token_sas) = parse_connection_string(connection_string)?;
    let driver = driver_for(&endpoint, cfg)?;
    dial(driver, cfg, cancel).await
}
