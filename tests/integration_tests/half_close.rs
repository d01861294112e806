// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use cloudpipe::{driver::mem::MemService, error::Error};

use crate::integration_tests::common::{connect_pair, read_to_end, test_config};

/// FIN propagation: the peer reads everything written before the
/// half-close, then a clean end of stream.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fin_after_payload() -> Result<()> {
    let svc = MemService::builder().host("fin").build();
    let net = connect_pair(svc, test_config()).await?;

    net.dialer.write(b"hello").await?;
    net.dialer.close_write().await?;

    let got = read_to_end(&net.accepted).await?;
    assert_eq!(got, b"hello");

    // End of stream is sticky.
    let mut buf = [0u8; 8];
    assert_eq!(net.accepted.read(&mut buf).await?, 0);

    net.dialer.close().await?;
    net.listener.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_after_half_close_fails() -> Result<()> {
    let svc = MemService::builder().host("fin-write").build();
    let net = connect_pair(svc, test_config()).await?;

    net.dialer.close_write().await?;
    // close_write is idempotent.
    net.dialer.close_write().await?;

    match net.dialer.write(b"late").await {
        Err(Error::ClosedPipe) => {},
        other => panic!("expected ClosedPipe, got {other:?}"),
    }

    // Reads keep working until the peer's FIN arrives.
    net.accepted.write(b"still open").await?;
    net.accepted.close_write().await?;
    let got = read_to_end(&net.dialer).await?;
    assert_eq!(got, b"still open");

    net.dialer.close().await?;
    net.listener.close().await?;
    Ok(())
}
