// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use cloudpipe::{
    cfg::config::Config,
    client::{connection::Connection, dial::dial},
    driver::{
        Driver,
        mem::{MemDriver, MemService},
    },
    endpoint::Endpoint,
    listener::Listener,
};
use tokio_util::sync::CancellationToken;

/// Poll intervals tightened so scenarios complete in milliseconds.
pub fn test_config() -> Config {
    Config {
        fast_poll: Duration::from_millis(1),
        data_poll: Duration::from_millis(20),
        accept_poll: Duration::from_millis(10),
        ping_interval: Duration::ZERO,
        connect_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(60),
        ..Config::default()
    }
}

pub struct TestNet {
    pub listener: Arc<Listener>,
    pub dialer: Arc<Connection>,
    pub accepted: Arc<Connection>,
    pub driver: Arc<dyn Driver>,
}

/// Stands up a listener on `driver`, dials it, and returns both ends.
pub async fn connect_pair_with(driver: Arc<dyn Driver>, cfg: Config) -> Result<TestNet> {
    let endpoint = Endpoint::parse("mem://test")?;
    let listener = Listener::bind(
        endpoint,
        Arc::clone(&driver),
        cfg.clone(),
        CancellationToken::new(),
    )
    .await?;

    let accept = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.accept().await })
    };
    let dialer = dial(Arc::clone(&driver), &cfg, CancellationToken::new()).await?;
    let accepted = accept.await??;

    Ok(TestNet {
        listener,
        dialer,
        accepted,
        driver,
    })
}

pub async fn connect_pair(svc: Arc<MemService>, cfg: Config) -> Result<TestNet> {
    let driver: Arc<dyn Driver> = Arc::new(MemDriver::new(svc, &cfg));
    connect_pair_with(driver, cfg).await
}

/// Reads exactly `n` bytes or fails when the stream ends early.
pub async fn read_exact(conn: &Connection, n: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(n);
    let mut buf = vec![0u8; 64 * 1024];
    while out.len() < n {
        let want = buf.len().min(n - out.len());
        let got = conn.read(&mut buf[..want]).await?;
        anyhow::ensure!(got > 0, "stream ended after {} of {} bytes", out.len(), n);
        out.extend_from_slice(&buf[..got]);
    }
    Ok(out)
}

/// Reads until end of stream.
pub async fn read_to_end(conn: &Connection) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let got = conn.read(&mut buf).await?;
        if got == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..got]);
    }
}
