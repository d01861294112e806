// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::Result;

/// Local budget for fire-and-forget resource cleanup (token deletion,
/// janitor sweeps, bootstrap teardown).
pub(crate) const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs a cleanup future under the local budget, swallowing failures.
/// Storage reclamation must never take a connection or the janitor down
/// with it.
pub(crate) async fn best_effort_cleanup<F>(label: &'static str, conn_id: &str, fut: F)
where
    F: Future<Output = Result<()>>,
{
    match timeout(CLEANUP_TIMEOUT, fut).await {
        Ok(Ok(())) => trace!(conn_id, "{label} done"),
        Ok(Err(e)) => debug!(conn_id, "{label} failed: {e}"),
        Err(_) => debug!(conn_id, "{label} timed out"),
    }
}
