//! NIP-11: Relay Information Document
//!
//! The pool sizes REQ batches from the `limitation` section a relay
//! advertises. Documents are fetched over HTTP with
//! `Accept: application/nostr+json` and cached per relay in a
//! [`Nip11Registry`]; concurrent lookups of the same relay share one fetch.
//! Values registered with [`Nip11Registry::set`] win over fetching, and
//! [`Nip11Registry::set_default`] supplies the fallback for anything unknown.

use crate::error::{ClientError, Result};
use crate::url::RelayUrl;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

/// NIP-11 Relay Information Document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayInfo {
    /// Relay name (should be <30 chars)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Detailed description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Administrative contact pubkey (hex)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,

    /// Administrative contact (URI: mailto:, https:, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,

    /// List of supported NIP numbers
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub supported_nips: Vec<u16>,

    /// Relay software URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,

    /// Software version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Server limitations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limitation: Option<Limitation>,
}

/// Server limitations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limitation {
    /// Maximum message length in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_length: Option<usize>,

    /// Maximum active subscriptions per connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subscriptions: Option<usize>,

    /// Maximum filters per REQ
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_filters: Option<usize>,

    /// Maximum subscription ID length
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subid_length: Option<usize>,

    /// Maximum limit value in filters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_limit: Option<usize>,

    /// Authentication required (NIP-42)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,

    /// Payment required
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_required: Option<bool>,
}

impl RelayInfo {
    pub fn max_filters(&self) -> Option<usize> {
        self.limitation.as_ref()?.max_filters
    }

    pub fn max_subscriptions(&self) -> Option<usize> {
        self.limitation.as_ref()?.max_subscriptions
    }
}

/// Source of relay information documents.
#[async_trait]
pub trait Nip11Fetcher: Send + Sync {
    async fn fetch(&self, url: &RelayUrl) -> Result<RelayInfo>;
}

/// Fetches documents over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpNip11Fetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpNip11Fetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for HttpNip11Fetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Nip11Fetcher for HttpNip11Fetcher {
    async fn fetch(&self, url: &RelayUrl) -> Result<RelayInfo> {
        let response = self
            .client
            .get(url.to_http_url())
            .header(reqwest::header::ACCEPT, "application/nostr+json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ClientError::RelayInfo(e.to_string()))?
            .error_for_status()
            .map_err(|e| ClientError::RelayInfo(e.to_string()))?;

        response
            .json::<RelayInfo>()
            .await
            .map_err(|e| ClientError::RelayInfo(e.to_string()))
    }
}

type InfoCell = Arc<OnceCell<Option<RelayInfo>>>;

/// Per-pool cache of relay information documents.
pub struct Nip11Registry {
    fetcher: Arc<dyn Nip11Fetcher>,
    cache: Mutex<HashMap<RelayUrl, InfoCell>>,
    default: Mutex<RelayInfo>,
}

impl Nip11Registry {
    pub fn new(fetcher: Arc<dyn Nip11Fetcher>) -> Self {
        Self {
            fetcher,
            cache: Mutex::new(HashMap::new()),
            default: Mutex::new(RelayInfo::default()),
        }
    }

    /// Cached or `set()` information, without fetching.
    pub fn get(&self, url: &RelayUrl) -> Option<RelayInfo> {
        self.cache.lock().get(url)?.get().cloned().flatten()
    }

    /// Register information for a relay; it is never fetched afterwards.
    pub fn set(&self, url: RelayUrl, info: RelayInfo) {
        let cell = Arc::new(OnceCell::new_with(Some(Some(info))));
        self.cache.lock().insert(url, cell);
    }

    pub fn get_default(&self) -> RelayInfo {
        self.default.lock().clone()
    }

    /// Fallback used for relays whose own document lacks a value.
    pub fn set_default(&self, info: RelayInfo) {
        *self.default.lock() = info;
    }

    pub fn forget(&self, url: &RelayUrl) {
        self.cache.lock().remove(url);
    }

    /// Forget every relay. The default stays.
    pub fn forget_all(&self) {
        self.cache.lock().clear();
    }

    /// Cached information, or fetch it once.
    ///
    /// Concurrent callers for the same relay wait on the same fetch. A failed
    /// fetch yields `None` to every waiter and is not remembered.
    pub async fn get_or_fetch(&self, url: &RelayUrl) -> Option<RelayInfo> {
        let cell = {
            let mut cache = self.cache.lock();
            Arc::clone(cache.entry(url.clone()).or_default())
        };

        let info = cell
            .get_or_init(|| async {
                match self.fetcher.fetch(url).await {
                    Ok(info) => {
                        debug!("Fetched NIP-11 information for {}", url);
                        Some(info)
                    }
                    Err(e) => {
                        debug!("NIP-11 fetch for {} failed: {}", url, e);
                        None
                    }
                }
            })
            .await
            .clone();

        if info.is_none() {
            let mut cache = self.cache.lock();
            if cache.get(url).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
                cache.remove(url);
            }
        }

        info
    }

    /// Look a value up in the relay's document, fetching it unless `skip_fetch`,
    /// and fall back to the default document.
    pub async fn get_value<T, F>(&self, url: &RelayUrl, getter: F, skip_fetch: bool) -> Option<T>
    where
        F: Fn(&RelayInfo) -> Option<T>,
    {
        if let Some(value) = self.get(url).as_ref().and_then(&getter) {
            return Some(value);
        }
        if !skip_fetch
            && let Some(value) = self.get_or_fetch(url).await.as_ref().and_then(&getter)
        {
            return Some(value);
        }
        getter(&*self.default.lock())
    }
}

impl std::fmt::Debug for Nip11Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nip11Registry")
            .field("cached", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}
