// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use cloudpipe::{
    cfg::{config::Config, logger::init_logger_from_env},
    client::dial::dial_url,
    driver::{self, Driver, mem::{MemDriver, MemService}},
    endpoint::Endpoint,
    listener::Listener,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_logger_from_env()?;
    driver::mem::register();

    let cfg = Config::default();
    let svc = MemService::named("demo");
    let drv: Arc<dyn Driver> = Arc::new(MemDriver::new(svc, &cfg));

    let endpoint = Endpoint::parse("mem://demo").context("failed to parse endpoint")?;
    let listener = Listener::bind(endpoint, drv, cfg.clone(), CancellationToken::new()).await?;
    let url = listener.connection_string();
    info!("connection string: {url}");

    // Echo everything back until the dialer half-closes.
    let echo = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move {
            let conn = listener.accept().await?;
            let mut buf = [0u8; 4096];
            loop {
                let n = conn.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                conn.write(&buf[..n]).await?;
            }
            conn.close().await?;
            anyhow::Ok(())
        })
    };

    // The dialer side only knows the connection string.
    let conn = dial_url(&url, &cfg, CancellationToken::new()).await?;
    info!("dialed {} (mtu {})", conn.remote_addr(), conn.mtu());

    conn.write(b"ping over the storage plane").await?;
    conn.close_write().await?;

    let mut got = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        got.extend_from_slice(&buf[..n]);
    }
    info!("echoed {} bytes: {:?}", got.len(), String::from_utf8_lossy(&got));

    conn.close().await?;
    echo.await.context("echo task panicked")??;
    listener.close().await?;

    Ok(())
}
