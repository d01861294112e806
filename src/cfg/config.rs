// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Runtime options. Immutable after construction; every duration accepts a
/// millisecond value in the YAML form.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "FastPoll", with = "serde_millis")]
    /// Starting interval of the adaptive poller.
    pub fast_poll: Duration,

    #[serde(rename = "DataPoll", with = "serde_millis")]
    /// Steady-state (maximum) polling interval.
    pub data_poll: Duration,

    #[serde(rename = "AcceptPoll", with = "serde_millis")]
    /// Listener's handshake-inbox scan interval.
    pub accept_poll: Duration,

    #[serde(rename = "PingInterval", with = "serde_millis")]
    /// Keep-alive cadence; zero disables the keep-alive task.
    pub ping_interval: Duration,

    #[serde(rename = "ConnectTimeout", with = "serde_millis")]
    /// Maximum dial duration.
    pub connect_timeout: Duration,

    #[serde(rename = "IdleTimeout", with = "serde_millis")]
    /// Janitor eviction threshold; the janitor runs at half this period.
    pub idle_timeout: Duration,

    #[serde(rename = "SasExpiry", with = "serde_millis")]
    /// Validity of issued signed URLs.
    pub sas_expiry: Duration,

    #[serde(rename = "HandshakeEndpoint")]
    /// Name of the shared handshake inbox.
    pub handshake_endpoint: String,

    #[serde(rename = "TokenEndpoint")]
    /// Name of the shared token outbox; must differ from the inbox.
    pub token_endpoint: String,

    #[serde(rename = "ReqPrefix")]
    /// Prefix of per-session request resources.
    pub req_prefix: String,

    #[serde(rename = "ResPrefix")]
    /// Prefix of per-session response resources; must differ.
    pub res_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fast_poll: Duration::from_millis(10),
            data_poll: Duration::from_millis(500),
            accept_poll: Duration::from_secs(1),
            ping_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(5 * 60),
            sas_expiry: Duration::from_secs(24 * 60 * 60),
            handshake_endpoint: "handshake".to_string(),
            token_endpoint: "token".to_string(),
            req_prefix: "req".to_string(),
            res_prefix: "res".to_string(),
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the invariants the rendezvous layer relies on.
    pub fn validate(&self) -> Result<(), Error> {
        if self.handshake_endpoint.is_empty() || self.token_endpoint.is_empty() {
            return Err(Error::InvalidConfig(
                "rendezvous endpoint names must not be empty".to_string(),
            ));
        }
        if self.handshake_endpoint == self.token_endpoint {
            return Err(Error::InvalidConfig(format!(
                "handshake and token endpoints must differ (both {:?})",
                self.handshake_endpoint
            )));
        }
        if self.req_prefix == self.res_prefix {
            return Err(Error::InvalidConfig(format!(
                "req and res prefixes must differ (both {:?})",
                self.req_prefix
            )));
        }
        if self.fast_poll > self.data_poll {
            return Err(Error::InvalidConfig(
                "fast_poll must not exceed data_poll".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
