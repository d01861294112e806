// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::{Duration, Instant};

use anyhow::Result;
use cloudpipe::{driver::mem::MemService, error::Error};

use crate::integration_tests::common::{connect_pair, read_exact, test_config};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_deadline_fires() -> Result<()> {
    let svc = MemService::builder().host("deadline").build();
    let net = connect_pair(svc, test_config()).await?;

    net.dialer
        .set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));

    let start = Instant::now();
    let mut buf = [0u8; 16];
    match net.dialer.read(&mut buf).await {
        Err(Error::DeadlineExceeded) => {},
        other => panic!("expected DeadlineExceeded, got {other:?}"),
    }
    assert!(
        start.elapsed() < Duration::from_millis(150),
        "deadline took {:?} to fire",
        start.elapsed()
    );

    net.dialer.close().await?;
    net.listener.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clearing_a_deadline_restores_reads() -> Result<()> {
    let svc = MemService::builder().host("deadline-clear").build();
    let net = connect_pair(svc, test_config()).await?;

    net.dialer
        .set_deadline(Some(Instant::now() + Duration::from_millis(30)));
    let mut buf = [0u8; 16];
    assert!(matches!(
        net.dialer.read(&mut buf).await,
        Err(Error::DeadlineExceeded)
    ));
    assert!(matches!(
        net.dialer.write(b"x").await,
        Err(Error::DeadlineExceeded)
    ));

    net.dialer.set_deadline(None);
    net.accepted.write(b"fresh").await?;
    net.dialer.write(b"pong").await?;
    assert_eq!(read_exact(&net.dialer, 5).await?, b"fresh");

    net.dialer.close().await?;
    net.listener.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_deadline_checked_before_buffering() -> Result<()> {
    let svc = MemService::builder().host("deadline-write").build();
    let net = connect_pair(svc, test_config()).await?;

    net.dialer.set_write_deadline(Some(Instant::now()));
    assert!(matches!(
        net.dialer.write(b"never sent").await,
        Err(Error::DeadlineExceeded)
    ));

    // The read side is unaffected by the write deadline.
    net.accepted.write(b"ok").await?;
    assert_eq!(read_exact(&net.dialer, 2).await?, b"ok");

    net.dialer.close().await?;
    net.listener.close().await?;
    Ok(())
}
