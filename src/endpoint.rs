// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection targets and connection strings.
//!
//! An [`Endpoint`] is parsed once per listen/dial and is immutable
//! afterwards. Credentials come from the URL userinfo, the first path
//! segment, or the environment, in that order. The listener-emitted
//! connection string carries the two bootstrap signed URLs as padded
//! base64-url query values.

use std::env;

use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use url::Url;

use crate::error::{Error, Result};

/// Public-cloud host suffix; hosts elsewhere are emulator or sovereign
/// deployments.
pub const CLOUD_SUFFIX: &str = ".core.windows.net";

/// Environment variables consulted when the URL carries no credentials.
pub const ENV_ACCOUNT: &str = "AZURE_STORAGE_ACCOUNT";
pub const ENV_ACCOUNT_KEY: &str = "AZURE_STORAGE_ACCOUNT_KEY";

/// Parsed connection target.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// URL scheme selecting the driver.
    pub scheme: String,
    pub host: String,
    /// Storage account identifier.
    pub account: String,
    /// Account secret, when available; SAS-only flows leave this empty.
    pub secret: Option<String>,
    /// True when the host carries the public-cloud suffix.
    pub is_cloud: bool,
    /// The original URL, queries included, for driver-specific extraction.
    pub url: Url,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let url =
            Url::parse(raw).map_err(|e| Error::InvalidConfig(format!("endpoint url: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidConfig("endpoint url has no host".to_string()))?
            .to_string();

        let mut account = url.username().to_string();
        let mut secret = url
            .password()
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string());

        if account.is_empty() {
            account = url
                .path_segments()
                .and_then(|mut segs| segs.find(|s| !s.is_empty()))
                .unwrap_or_default()
                .to_string();
        }
        if account.is_empty() {
            account = env::var(ENV_ACCOUNT).unwrap_or_default();
        }
        if secret.is_none() {
            secret = env::var(ENV_ACCOUNT_KEY).ok().filter(|s| !s.is_empty());
        }

        let is_cloud = host.ends_with(CLOUD_SUFFIX);

        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            account,
            secret,
            is_cloud,
            url,
        })
    }
}

/// Emits `<scheme>://<host>[/<account>]?handshake=<b64url>&token=<b64url>`.
pub fn build_connection_string(ep: &Endpoint, handshake_sas: &str, token_sas: &str) -> String {
    let mut s = format!("{}://{}", ep.scheme, ep.host);
    if !ep.account.is_empty() {
        s.push('/');
        s.push_str(&ep.account);
    }
    format!(
        "{s}?handshake={}&token={}",
        URL_SAFE.encode(handshake_sas),
        URL_SAFE.encode(token_sas)
    )
}

/// Parses a connection string back into its endpoint and SAS pair.
pub fn parse_connection_string(raw: &str) -> Result<(Endpoint, String, String)> {
    let ep = Endpoint::parse(raw)?;

    let mut handshake = None;
    let mut token = None;
    for (k, v) in ep.url.query_pairs() {
        match k.as_ref() {
            "handshake" => handshake = Some(decode_sas(&v)?),
            "token" => token = Some(decode_sas(&v)?),
            _ => {},
        }
    }

    let handshake = handshake.ok_or(Error::MissingSas("handshake"))?;
    let token = token.ok_or(Error::MissingSas("token"))?;
    Ok((ep, handshake, token))
}

fn decode_sas(v: &str) -> Result<String> {
    let raw = URL_SAFE
        .decode(v.as_bytes())
        .map_err(|e| Error::InvalidSas(format!("base64: {e}")))?;
    String::from_utf8(raw).map_err(|e| Error::InvalidSas(format!("utf8: {e}")))
}
