// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use cloudpipe::{cfg::config::Config, error::Error};

#[test]
fn test_defaults() {
    let cfg = Config::default();
    assert_eq!(cfg.fast_poll, Duration::from_millis(10));
    assert_eq!(cfg.data_poll, Duration::from_millis(500));
    assert_eq!(cfg.accept_poll, Duration::from_secs(1));
    assert_eq!(cfg.ping_interval, Duration::from_secs(30));
    assert_eq!(cfg.connect_timeout, Duration::from_secs(30));
    assert_eq!(cfg.idle_timeout, Duration::from_secs(300));
    assert_eq!(cfg.sas_expiry, Duration::from_secs(86_400));
    assert_eq!(cfg.handshake_endpoint, "handshake");
    assert_eq!(cfg.token_endpoint, "token");
    assert_eq!(cfg.req_prefix, "req");
    assert_eq!(cfg.res_prefix, "res");
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_equal_endpoints_rejected() {
    let cfg = Config {
        token_endpoint: "handshake".to_string(),
        ..Config::default()
    };
    match cfg.validate() {
        Err(Error::InvalidConfig(_)) => {},
        other => panic!("expected InvalidConfig, got {other:?}"),
    }
}

#[test]
fn test_equal_prefixes_rejected() {
    let cfg = Config {
        res_prefix: "req".to_string(),
        ..Config::default()
    };
    match cfg.validate() {
        Err(Error::InvalidConfig(_)) => {},
        other => panic!("expected InvalidConfig, got {other:?}"),
    }
}

#[test]
fn test_fast_poll_above_data_poll_rejected() {
    let cfg = Config {
        fast_poll: Duration::from_secs(2),
        data_poll: Duration::from_millis(100),
        ..Config::default()
    };
    assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
}

#[test]
fn test_load_from_file() -> Result<()> {
    let cfg = Config::load_from_file("tests/config.yaml")?;
    assert_eq!(cfg.fast_poll, Duration::from_millis(5));
    assert_eq!(cfg.data_poll, Duration::from_millis(100));
    assert_eq!(cfg.ping_interval, Duration::ZERO);
    assert_eq!(cfg.idle_timeout, Duration::from_secs(1));
    assert_eq!(cfg.sas_expiry, Duration::from_secs(3600));
    Ok(())
}
