// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Instant;

use once_cell::sync::Lazy;
use rand::RngExt;

/// Process-local monotonic epoch for all atomic timestamp fields.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds elapsed since the process epoch. Never zero: zero is the
/// "unset" sentinel in atomic timestamp and deadline cells.
pub fn now_nanos() -> u64 {
    (EPOCH.elapsed().as_nanos() as u64).max(1)
}

/// Converts an absolute instant into epoch nanoseconds. Instants before the
/// epoch saturate to the epoch itself.
pub fn instant_nanos(t: Instant) -> u64 {
    (t.saturating_duration_since(*EPOCH).as_nanos() as u64).max(1)
}

/// Generates a fresh 128-bit connection id and returns its 36-character
/// hyphenated hex form (8-4-4-4-12).
pub fn generate_conn_id() -> String {
    let mut raw = [0u8; 16];
    rand::rng().fill(&mut raw);

    let hex = hex::encode(raw);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
