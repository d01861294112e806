// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use cloudpipe::driver::mem::MemService;

use crate::integration_tests::common::{connect_pair, read_exact, test_config};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_roundtrip() -> Result<()> {
    let svc = MemService::builder().host("echo").build();
    let net = connect_pair(svc, test_config()).await?;

    // Listener side echoes whatever it reads.
    let echo = {
        let conn = net.accepted;
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let n = conn.read(&mut buf).await?;
            conn.write(&buf[..n]).await?;
            anyhow::Ok(())
        })
    };

    net.dialer.write(b"ping").await?;
    let got = read_exact(&net.dialer, 4).await?;
    assert_eq!(got, b"ping");

    echo.await??;
    net.dialer.close().await?;
    net.listener.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bidirectional_transfer() -> Result<()> {
    let svc = MemService::builder().host("echo-bidi").build();
    let net = connect_pair(svc, test_config()).await?;

    net.dialer.write(b"from dialer").await?;
    net.accepted.write(b"from listener").await?;

    assert_eq!(read_exact(&net.accepted, 11).await?, b"from dialer");
    assert_eq!(read_exact(&net.dialer, 13).await?, b"from listener");

    net.dialer.close().await?;
    net.listener.close().await?;
    Ok(())
}
