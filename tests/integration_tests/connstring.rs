// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use cloudpipe::{
    client::dial::dial_url,
    driver::{self, driver_for},
    endpoint::Endpoint,
    error::Error,
    listener::Listener,
};
use tokio_util::sync::CancellationToken;

use crate::integration_tests::common::{read_exact, test_config};

/// The full zero-shared-state path: registry lookup, listener bootstrap,
/// connection string emit, dial through the parsed URL.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dial_through_connection_string() -> Result<()> {
    driver::mem::register();
    let cfg = test_config();

    let endpoint = Endpoint::parse("mem://connstring-host")?;
    let drv = driver_for(&endpoint, &cfg)?;
    let listener = Listener::bind(
        endpoint,
        Arc::clone(&drv),
        cfg.clone(),
        CancellationToken::new(),
    )
    .await?;

    let url = listener.connection_string();
    assert!(url.starts_with("mem://connstring-host"));
    assert!(url.contains("handshake="));
    assert!(url.contains("token="));

    let accept = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.accept().await })
    };
    let dialer = dial_url(&url, &cfg, CancellationToken::new()).await?;
    let accepted = accept.await??;

    dialer.write(b"via url").await?;
    assert_eq!(read_exact(&accepted, 7).await?, b"via url");

    dialer.close().await?;
    listener.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_scheme_is_rejected() {
    let cfg = test_config();
    match dial_url(
        "nosuch://host?handshake=aGk=&token=aGk=",
        &cfg,
        CancellationToken::new(),
    )
    .await
    {
        Err(Error::UnsupportedScheme(scheme)) => assert_eq!(scheme, "nosuch"),
        other => panic!("expected UnsupportedScheme, got {other:?}"),
    }
}
