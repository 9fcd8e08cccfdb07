//! Logical subscriptions.
//!
//! [`SubscriptionEntry`] is the pool's record of one `use_req` call: where it
//! is sent and what it last asked for. [`Subscription`] is the caller's handle;
//! it yields the matching events and ends the subscription when dropped.

use crate::packet::EventPacket;
use crate::pool::PoolInner;
use crate::req::{LazyFilter, ReqMode};
use crate::url::RelayUrl;
use std::collections::HashSet;
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Registry entry of a logical subscription.
#[derive(Debug)]
pub(crate) struct SubscriptionEntry {
    pub id: String,
    pub mode: ReqMode,
    /// Explicit relays; `None` follows the pool's default set.
    pub relays: Option<Vec<RelayUrl>>,
    /// Last emission, kept unevaluated so every later send resolves its own
    /// time bounds. `None` before the first one and while paused.
    pub filters: Option<Vec<LazyFilter>>,
    /// Bumped on every emission so stale fan-outs can be discarded.
    pub generation: u64,
    pub events: mpsc::UnboundedSender<EventPacket>,
    /// Backward only: next free batch index
    pub next_index: usize,
    /// Backward only: wire subscriptions still waiting for EOSE
    pub pending_eose: HashSet<(RelayUrl, String)>,
    /// Backward only: the request signalled `over()`
    pub over: bool,
}

impl SubscriptionEntry {
    pub fn new(
        id: String,
        mode: ReqMode,
        relays: Option<Vec<RelayUrl>>,
        events: mpsc::UnboundedSender<EventPacket>,
    ) -> Self {
        Self {
            id,
            mode,
            relays,
            filters: None,
            generation: 0,
            events,
            next_index: 0,
            pending_eose: HashSet::new(),
            over: false,
        }
    }

    /// Relays this subscription currently targets.
    pub fn targets(&self, defaults: &[RelayUrl]) -> Vec<RelayUrl> {
        match &self.relays {
            Some(relays) => relays.clone(),
            None => defaults.to_vec(),
        }
    }

    pub fn targets_relay(&self, relay: &RelayUrl, defaults: &[RelayUrl]) -> bool {
        match &self.relays {
            Some(relays) => relays.contains(relay),
            None => defaults.contains(relay),
        }
    }

    /// Follows the default relay set.
    pub fn is_implicit(&self) -> bool {
        self.relays.is_none()
    }

    /// A backward subscription that has nothing left to wait for.
    pub fn is_complete(&self) -> bool {
        self.mode == ReqMode::Backward && self.over && self.pending_eose.is_empty()
    }
}

/// Handle to a logical subscription.
///
/// Dropping the handle unsubscribes. A backward subscription's stream ends
/// after `over()` once every relay has answered with EOSE.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    events: mpsc::UnboundedReceiver<EventPacket>,
    pool: Weak<PoolInner>,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        events: mpsc::UnboundedReceiver<EventPacket>,
        pool: Weak<PoolInner>,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            events,
            pool,
            pump: Some(pump),
        }
    }

    /// Logical subscription id; wire ids are derived from it as `<id>:<index>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<EventPacket> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EventPacket> {
        self.events.try_recv().ok()
    }

    /// CLOSE every open wire subscription and stop delivering events. Idempotent.
    pub fn unsubscribe(&mut self) {
        let Some(pump) = self.pump.take() else {
            return;
        };
        pump.abort();
        if let Some(pool) = self.pool.upgrade() {
            pool.unsubscribe(&self.id);
        }
        self.events.close();
        while self.events.try_recv().is_ok() {}
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
