// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, atomic::Ordering};

use anyhow::Result;
use bytes::Bytes;
use cloudpipe::{
    cfg::config::Config,
    driver::{
        Driver,
        mem::{MemDriver, MemService},
        metrics::MeteredDriver,
    },
    error::Error,
};
use tokio_util::sync::CancellationToken;

fn metered(rotate_threshold: Option<usize>) -> MeteredDriver {
    let cfg = Config::default();
    let mut builder = MemService::builder().host("metrics-test");
    if let Some(t) = rotate_threshold {
        builder = builder.rotate_threshold(t);
    }
    let svc = builder.build();
    MeteredDriver::new(Arc::new(MemDriver::new(svc, &cfg)))
}

#[tokio::test]
async fn test_rendezvous_counters() -> Result<()> {
    let driver = metered(None);
    let counters = driver.counters();

    driver.post_handshake("c1", Bytes::from_static(b"m1")).await?;
    let records = driver.get_handshakes().await?;
    assert_eq!(records.len(), 1);

    driver.post_token("c1", Bytes::from_static(b"m2")).await?;
    let _ = driver.get_token("c1").await?;

    assert_eq!(counters.handshakes_posted.load(Ordering::Relaxed), 1);
    assert_eq!(counters.handshake_scans.load(Ordering::Relaxed), 1);
    assert_eq!(counters.tokens_posted.load(Ordering::Relaxed), 1);
    assert_eq!(counters.tokens_fetched.load(Ordering::Relaxed), 1);
    Ok(())
}

#[tokio::test]
async fn test_no_data_is_not_counted() -> Result<()> {
    let driver = metered(None);
    let counters = driver.counters();

    match driver.get_token("absent").await {
        Err(Error::NoData) => {},
        other => panic!("expected NoData, got {other:?}"),
    }
    assert_eq!(counters.tokens_fetched.load(Ordering::Relaxed), 0);
    Ok(())
}

#[tokio::test]
async fn test_transport_counters() -> Result<()> {
    let driver = metered(None);
    let counters = driver.counters();
    let cancel = CancellationToken::new();

    let tokens = driver.create_session("c1").await?;
    let tx = driver.new_transport("c1", &tokens, true).await?;
    let rx = driver.new_transport("c1", &tokens, false).await?;

    tx.write_raw(&cancel, Bytes::from_static(b"0123456789")).await?;
    let chunk = rx.read_raw(&cancel).await?;
    assert_eq!(&chunk[..], b"0123456789");

    // An exhausted cursor is NoData and stays uncounted.
    assert!(matches!(rx.read_raw(&cancel).await, Err(Error::NoData)));

    assert_eq!(counters.sessions_created.load(Ordering::Relaxed), 1);
    assert_eq!(counters.transports_opened.load(Ordering::Relaxed), 2);
    assert_eq!(counters.raw_writes.load(Ordering::Relaxed), 1);
    assert_eq!(counters.raw_reads.load(Ordering::Relaxed), 1);
    assert_eq!(counters.bytes_out.load(Ordering::Relaxed), 10);
    assert_eq!(counters.bytes_in.load(Ordering::Relaxed), 10);
    Ok(())
}

#[tokio::test]
async fn test_rotation_counters_forwarded() -> Result<()> {
    let driver = metered(Some(2));
    let counters = driver.counters();
    let cancel = CancellationToken::new();

    let tokens = driver.create_session("c2").await?;
    let tx = driver.new_transport("c2", &tokens, true).await?;
    let rx = driver.new_transport("c2", &tokens, false).await?;

    let rot_tx = tx.rotator().expect("metered transport keeps the capability");
    assert!(!rot_tx.should_rotate());

    tx.write_raw(&cancel, Bytes::from_static(b"a")).await?;
    tx.write_raw(&cancel, Bytes::from_static(b"b")).await?;
    assert!(rot_tx.should_rotate());
    rot_tx.rotate_tx(&cancel).await?;
    tx.write_raw(&cancel, Bytes::from_static(b"c")).await?;

    // Reader drains the first generation, follows, and drains the next.
    assert_eq!(&rx.read_raw(&cancel).await?[..], b"a");
    assert_eq!(&rx.read_raw(&cancel).await?[..], b"b");
    assert!(matches!(rx.read_raw(&cancel).await, Err(Error::NoData)));
    rx.rotator().expect("capability").rotate_rx()?;
    assert_eq!(&rx.read_raw(&cancel).await?[..], b"c");

    assert_eq!(counters.rotations_tx.load(Ordering::Relaxed), 1);
    assert_eq!(counters.rotations_rx.load(Ordering::Relaxed), 1);
    Ok(())
}
