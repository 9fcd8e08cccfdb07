//! Relay URL normalization.
//!
//! Every piece of per-relay state is keyed by [`RelayUrl`]. Two inputs that
//! normalize to the same string are the same relay.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Normalized WebSocket URL of a relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayUrl(String);

impl RelayUrl {
    /// Parse and normalize a relay URL.
    pub fn parse(url: &str) -> Result<Self> {
        normalize_relay_url(url).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// HTTP(S) URL serving the NIP-11 information document of this relay.
    pub fn to_http_url(&self) -> String {
        if let Some(rest) = self.0.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = self.0.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else {
            self.0.clone()
        }
    }
}

/// Normalize a relay URL.
///
/// Scheme and host are lower-cased, default ports and trailing slashes are
/// removed, query and fragment are preserved. Only `ws` and `wss` are accepted.
pub fn normalize_relay_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url.trim())?;

    let scheme = parsed.scheme();
    if scheme != "ws" && scheme != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            scheme
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| ClientError::InvalidUrl(format!("missing host in {}", url)))?;

    let mut normalized = format!("{}://{}", scheme, host);
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{}", port));
    }
    normalized.push_str(parsed.path().trim_end_matches('/'));
    if let Some(query) = parsed.query() {
        normalized.push('?');
        normalized.push_str(query);
    }
    if let Some(fragment) = parsed.fragment() {
        normalized.push('#');
        normalized.push_str(fragment);
    }

    Ok(normalized)
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RelayUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RelayUrl {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RelayUrl {
    type Error = ClientError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for RelayUrl {
    type Error = ClientError;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<RelayUrl> for String {
    fn from(url: RelayUrl) -> Self {
        url.0
    }
}

/// Parse a list of relay URLs, dropping duplicates while keeping order.
pub(crate) fn parse_relay_urls<I, S>(urls: I) -> Result<Vec<RelayUrl>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<RelayUrl> = Vec::new();
    for url in urls {
        let url = RelayUrl::parse(url.as_ref())?;
        if !out.contains(&url) {
            out.push(url);
        }
    }
    Ok(out)
}
