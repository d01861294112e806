// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Adaptive back-off sleeper between raw-transport polls.

use std::time::Duration;

use tokio::time::sleep;

/// Exponential back-off between a fast and a steady interval. `fast <=
/// current <= steady` holds at all times.
#[derive(Debug)]
pub struct Poller {
    current: Duration,
    fast: Duration,
    steady: Duration,
    skip_once: bool,
}

impl Poller {
    pub fn new(fast: Duration, steady: Duration) -> Self {
        let steady = steady.max(fast);
        Self {
            current: fast,
            fast,
            steady,
            skip_once: false,
        }
    }

    /// Next back-off interval, doubling the stored one up to `steady`, or
    /// `None` when the sleep after a `reset` is elided.
    pub fn next_interval(&mut self) -> Option<Duration> {
        if self.skip_once {
            self.skip_once = false;
            return None;
        }
        let d = self.current;
        self.current = (self.current * 2).min(self.steady);
        Some(d)
    }

    /// Blocks for the current interval. The first call after `reset`
    /// returns immediately so a successful read never delays the next
    /// poll attempt.
    pub async fn sleep(&mut self) {
        if let Some(d) = self.next_interval() {
            sleep(d).await;
        }
    }

    /// Drops back to the fast interval after observed activity.
    pub fn reset(&mut self) {
        self.current = self.fast;
        self.skip_once = true;
    }
}
