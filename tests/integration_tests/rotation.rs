// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, atomic::Ordering};

use anyhow::Result;
use cloudpipe::driver::{
    mem::{MemDriver, MemService},
    metrics::MeteredDriver,
};

use crate::integration_tests::common::{connect_pair_with, read_exact, test_config};

/// Twelve one-block writes through a four-block append limit: all blocks
/// arrive in order and the reader follows at least two rotations.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_survive_rotations() -> Result<()> {
    let cfg = test_config();
    let svc = MemService::builder()
        .host("rotation")
        .rotate_threshold(4)
        .build();
    let metered = MeteredDriver::new(Arc::new(MemDriver::new(svc, &cfg)));
    let counters = metered.counters();

    let net = connect_pair_with(Arc::new(metered), cfg).await?;

    let mut expected = Vec::new();
    for i in 0..12u8 {
        let block = [i; 100];
        expected.extend_from_slice(&block);
        net.dialer.write(&block).await?;
    }

    let got = read_exact(&net.accepted, expected.len()).await?;
    assert_eq!(got, expected);

    assert!(
        counters.rotations_tx.load(Ordering::Relaxed) >= 2,
        "writer should have rotated at least twice"
    );
    assert!(
        counters.rotations_rx.load(Ordering::Relaxed) >= 2,
        "reader should have followed at least twice"
    );

    net.dialer.close().await?;
    net.listener.close().await?;
    Ok(())
}
