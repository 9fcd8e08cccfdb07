//! Maps logical subscriptions onto wire subscriptions.
//!
//! A logical subscription with `n` filters becomes `ceil(n / max_filters)`
//! wire subscriptions on each target relay, named `<id>:<index>`. The
//! multiplexer plans the REQ and CLOSE frames for that mapping and routes
//! inbound subscription-scoped frames back to the logical id.

use crate::message::{ClientMessage, Filter, RelayMessage};
use crate::url::RelayUrl;
use std::collections::HashMap;
use tracing::warn;

/// Relay-facing id of batch `index` of logical subscription `id`.
pub fn wire_id(id: &str, index: usize) -> String {
    format!("{}:{}", id, index)
}

/// Filters per wire subscription for a relay advertising `max_filters`.
pub fn batch_size(max_filters: Option<usize>) -> usize {
    max_filters.filter(|n| *n > 0).unwrap_or(usize::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WireEntry {
    subscription_id: String,
    index: usize,
}

/// Where an inbound frame belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Scoped to a wire id owned by this logical subscription.
    Subscription {
        subscription_id: String,
        wire_subscription_id: String,
    },
    /// OK, NOTICE and other frames that belong to the relay as a whole.
    Relay,
    /// A subscription-scoped frame for a wire id nobody owns (late frames after CLOSE).
    Unmatched,
}

/// Derived view `relay -> wire id -> logical id`.
#[derive(Debug, Default)]
pub struct Multiplexer {
    routes: HashMap<RelayUrl, HashMap<String, WireEntry>>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames that (re)issue `subscription_id` on `relay` with `filters`.
    ///
    /// Filters are split into batches of at most `max_filters` (unbounded when
    /// `None`). A REQ for an id that is already open replaces it on the relay;
    /// ids left over from a previous, larger emission are closed.
    pub fn plan_req(
        &mut self,
        subscription_id: &str,
        relay: &RelayUrl,
        filters: &[Filter],
        max_filters: Option<usize>,
        max_subscriptions: Option<usize>,
    ) -> Vec<ClientMessage> {
        let mut out = self.open_batches(subscription_id, relay, filters, max_filters, 0);
        let batches = out.len();

        if let Some(wires) = self.routes.get_mut(relay) {
            let mut surplus: Vec<(usize, String)> = wires
                .iter()
                .filter(|(_, entry)| entry.subscription_id == subscription_id && entry.index >= batches)
                .map(|(id, entry)| (entry.index, id.clone()))
                .collect();
            surplus.sort();
            for (_, id) in surplus {
                wires.remove(&id);
                out.push(ClientMessage::close(id));
            }
        }

        self.finish_relay(relay, max_subscriptions);
        out
    }

    /// Frames for a one-shot emission whose batches are numbered from `first_index`.
    ///
    /// Earlier emissions of the same subscription stay open until they are
    /// closed individually.
    pub fn plan_backward_req(
        &mut self,
        subscription_id: &str,
        relay: &RelayUrl,
        filters: &[Filter],
        max_filters: Option<usize>,
        max_subscriptions: Option<usize>,
        first_index: usize,
    ) -> Vec<ClientMessage> {
        let out = self.open_batches(subscription_id, relay, filters, max_filters, first_index);
        self.finish_relay(relay, max_subscriptions);
        out
    }

    fn open_batches(
        &mut self,
        subscription_id: &str,
        relay: &RelayUrl,
        filters: &[Filter],
        max_filters: Option<usize>,
        first_index: usize,
    ) -> Vec<ClientMessage> {
        if filters.is_empty() {
            return Vec::new();
        }

        let chunk_size = batch_size(max_filters);
        let wires = self.routes.entry(relay.clone()).or_default();

        filters
            .chunks(chunk_size)
            .enumerate()
            .map(|(offset, chunk)| {
                let index = first_index + offset;
                let id = wire_id(subscription_id, index);
                wires.insert(
                    id.clone(),
                    WireEntry {
                        subscription_id: subscription_id.to_string(),
                        index,
                    },
                );
                ClientMessage::req(id, chunk.to_vec())
            })
            .collect()
    }

    fn finish_relay(&mut self, relay: &RelayUrl, max_subscriptions: Option<usize>) {
        let open = self.open_count(relay);
        if open == 0 {
            self.routes.remove(relay);
            return;
        }
        if let Some(max) = max_subscriptions
            && open > max
        {
            warn!(
                "{} wire subscriptions open on {}, relay advertises max_subscriptions={}",
                open, relay, max
            );
        }
    }

    /// One CLOSE per still-open wire id of `subscription_id`, on every relay.
    pub fn plan_close(&mut self, subscription_id: &str) -> Vec<(RelayUrl, ClientMessage)> {
        let relays = self.relays_of(subscription_id);
        relays
            .into_iter()
            .flat_map(|relay| {
                self.close_on_relay(subscription_id, &relay)
                    .into_iter()
                    .map(move |msg| (relay.clone(), msg))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// CLOSE every wire id of `subscription_id` on a relay that left its target set.
    pub fn close_on_relay(&mut self, subscription_id: &str, relay: &RelayUrl) -> Vec<ClientMessage> {
        self.open_wire_ids(subscription_id, relay)
            .into_iter()
            .filter_map(|id| self.release(relay, &id).map(|_| ClientMessage::close(id)))
            .collect()
    }

    /// Close a single wire subscription, if it is still open.
    pub fn close_wire(&mut self, relay: &RelayUrl, wire_subscription_id: &str) -> Option<ClientMessage> {
        self.release(relay, wire_subscription_id)
            .map(|_| ClientMessage::close(wire_subscription_id))
    }

    /// Drop a mapping without emitting anything. Returns the owning logical id.
    pub fn release(&mut self, relay: &RelayUrl, wire_subscription_id: &str) -> Option<String> {
        let wires = self.routes.get_mut(relay)?;
        let entry = wires.remove(wire_subscription_id)?;
        if wires.is_empty() {
            self.routes.remove(relay);
        }
        Some(entry.subscription_id)
    }

    /// Demultiplex an inbound frame. A relay-issued CLOSED releases its wire id.
    pub fn route(&mut self, relay: &RelayUrl, message: &RelayMessage) -> Route {
        let Some(wire) = message.subscription_id() else {
            return Route::Relay;
        };

        let owner = if matches!(message, RelayMessage::Closed { .. }) {
            self.release(relay, wire)
        } else {
            self.routes
                .get(relay)
                .and_then(|wires| wires.get(wire))
                .map(|entry| entry.subscription_id.clone())
        };

        match owner {
            Some(subscription_id) => Route::Subscription {
                subscription_id,
                wire_subscription_id: wire.to_string(),
            },
            None => Route::Unmatched,
        }
    }

    /// Open wire ids of a logical subscription on one relay, in batch order.
    pub fn open_wire_ids(&self, subscription_id: &str, relay: &RelayUrl) -> Vec<String> {
        let Some(wires) = self.routes.get(relay) else {
            return Vec::new();
        };
        let mut ids: Vec<(usize, String)> = wires
            .iter()
            .filter(|(_, entry)| entry.subscription_id == subscription_id)
            .map(|(id, entry)| (entry.index, id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Relays on which a logical subscription has open wire ids.
    pub fn relays_of(&self, subscription_id: &str) -> Vec<RelayUrl> {
        let mut relays: Vec<RelayUrl> = self
            .routes
            .iter()
            .filter(|(_, wires)| wires.values().any(|e| e.subscription_id == subscription_id))
            .map(|(relay, _)| relay.clone())
            .collect();
        relays.sort();
        relays
    }

    pub fn is_open(&self, relay: &RelayUrl, wire_subscription_id: &str) -> bool {
        self.routes
            .get(relay)
            .is_some_and(|wires| wires.contains_key(wire_subscription_id))
    }

    pub fn open_count(&self, relay: &RelayUrl) -> usize {
        self.routes.get(relay).map_or(0, HashMap::len)
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }
}
