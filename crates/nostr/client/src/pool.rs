//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool owns one [`RelayConnection`] per relay it has ever been asked to
//! use, the registry of logical subscriptions and the [`Multiplexer`] view
//! derived from it. After every change to the default relay set, to the
//! subscriptions or to outstanding publishes it asks the configured
//! [`ConnectionStrategy`] which relays must be held open and sends connect or
//! dormant commands accordingly.
//!
//! Inbound frames of all relays go through one dispatcher task, so packets of
//! a relay are delivered in wire order.

use crate::error::{ClientError, Result};
use crate::event::{Event, EventVerifier, SchnorrVerifier};
use crate::message::{ClientMessage, RelayMessage};
use crate::multiplexer::{Multiplexer, Route, batch_size};
use crate::nip11::{HttpNip11Fetcher, Nip11Fetcher, Nip11Registry, RelayInfo};
use crate::packet::{
    ConnectionState, ConnectionStatePacket, ErrorPacket, EventPacket, MessagePacket, OkPacket,
    RelayRole, RelayStatus,
};
use crate::relay::{InboundFrame, RelayChannels, RelayConfig, RelayConnection, wait_for_state};
use crate::req::{LazyFilter, Req, ReqMode, ReqPacket, ReqSource, ReqUpdate, evaluate_filters};
use crate::strategy::{ConnectionStrategy, Decision};
use crate::subscription::{Subscription, SubscriptionEntry};
use crate::url::{RelayUrl, parse_relay_urls};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PoolConfig {
    /// When relay sockets are held open
    pub connection_strategy: ConnectionStrategy,
    /// Never fetch NIP-11 documents; only `set()` values and the default apply
    pub skip_fetch_nip11: bool,
    /// Deliver events without checking id and signature
    pub skip_verify: bool,
    /// How long a published event keeps its relays open waiting for OK
    #[serde(with = "crate::duration_ms")]
    pub ok_timeout: Duration,
    /// Per-relay connection settings
    pub relay: RelayConfig,
    /// Capacity of each broadcast stream
    pub channel_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_strategy: ConnectionStrategy::default(),
            skip_fetch_nip11: false,
            skip_verify: false,
            ok_timeout: Duration::from_secs(30),
            relay: RelayConfig::default(),
            channel_capacity: 1000,
        }
    }
}

/// Options for [`RelayPool::use_req`].
#[derive(Debug, Clone, Default)]
pub struct UseOptions {
    /// Send to these relays instead of the default set.
    pub relays: Option<Vec<String>>,
}

/// Options for [`RelayPool::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Publish to these relays instead of the default set.
    pub relays: Option<Vec<String>>,
}

/// Acknowledgements for one published event.
///
/// Yields one [`OkPacket`] per relay that answered; ends when every target
/// relay answered or the OK timeout passed.
#[derive(Debug)]
pub struct OkReceiver {
    rx: mpsc::UnboundedReceiver<OkPacket>,
}

impl OkReceiver {
    pub async fn recv(&mut self) -> Option<OkPacket> {
        self.rx.recv().await
    }
}

#[derive(Debug)]
struct RelayEntry {
    conn: RelayConnection,
    /// Last command sent was `connect`
    held: bool,
}

#[derive(Debug)]
struct PendingOk {
    event_id: String,
    relays: HashSet<RelayUrl>,
    tx: mpsc::UnboundedSender<OkPacket>,
}

#[derive(Debug, Default)]
struct PoolState {
    disposed: bool,
    default_relays: Vec<RelayUrl>,
    relays: HashMap<RelayUrl, RelayEntry>,
    subscriptions: HashMap<String, SubscriptionEntry>,
    mux: Multiplexer,
    pending_oks: HashMap<u64, PendingOk>,
    next_ok_token: u64,
}

impl PoolState {
    fn role(&self, url: &RelayUrl) -> RelayRole {
        if self.default_relays.contains(url) {
            RelayRole::Default
        } else {
            RelayRole::Temporary
        }
    }

    fn demand(&self, url: &RelayUrl) -> usize {
        let subscriptions = self
            .subscriptions
            .values()
            .filter(|s| s.targets_relay(url, &self.default_relays))
            .count();
        let publishes = self
            .pending_oks
            .values()
            .filter(|p| p.relays.contains(url))
            .count();
        subscriptions + publishes
    }

    fn send(&self, url: &RelayUrl, message: ClientMessage) {
        match self.relays.get(url) {
            Some(entry) => entry.conn.send(message),
            None => warn!("No connection for {}, dropping frame", url),
        }
    }
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    nip11: Nip11Registry,
    verifier: Arc<dyn EventVerifier>,
    channels: RelayChannels,
    events: broadcast::Sender<EventPacket>,
    messages: broadcast::Sender<MessagePacket>,
    oks: broadcast::Sender<OkPacket>,
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolInner")
            .field("config", &self.config)
            .field("nip11", &self.nip11)
            .finish_non_exhaustive()
    }
}

/// A pool of Nostr relay connections.
#[derive(Debug, Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    /// Create a pool that fetches NIP-11 over HTTP and verifies Schnorr signatures.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(HttpNip11Fetcher::default()),
            Arc::new(SchnorrVerifier),
        )
    }

    /// Create a pool with custom NIP-11 fetching and event verification.
    pub fn with_collaborators(
        config: PoolConfig,
        fetcher: Arc<dyn Nip11Fetcher>,
        verifier: Arc<dyn EventVerifier>,
    ) -> Self {
        let capacity = config.channel_capacity.max(1);
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (states, _) = broadcast::channel(capacity);
        let (errors, _) = broadcast::channel(capacity);
        let (events, _) = broadcast::channel(capacity);
        let (messages, _) = broadcast::channel(capacity);
        let (oks, _) = broadcast::channel(capacity);

        info!(
            "Creating relay pool with {} connection strategy",
            config.connection_strategy
        );

        let inner = Arc::new(PoolInner {
            config,
            state: Mutex::new(PoolState::default()),
            nip11: Nip11Registry::new(fetcher),
            verifier,
            channels: RelayChannels {
                inbound,
                states,
                errors,
            },
            events,
            messages,
            oks,
        });

        tokio::spawn(dispatch(Arc::downgrade(&inner), inbound_rx));

        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// NIP-11 information used to size REQ batches.
    pub fn nip11(&self) -> &Nip11Registry {
        &self.inner.nip11
    }

    /// Replace the default relay set.
    ///
    /// Subscriptions without explicit relays are REQ'd on added relays and
    /// CLOSEd on removed ones.
    pub fn set_default_relays<I, S>(&self, urls: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let urls = parse_relay_urls(urls)?;
        self.inner.set_default_relays(urls)
    }

    pub fn add_default_relay(&self, url: &str) -> Result<()> {
        let url = RelayUrl::parse(url)?;
        let mut relays = self.inner.state.lock().default_relays.clone();
        if !relays.contains(&url) {
            relays.push(url);
        }
        self.inner.set_default_relays(relays)
    }

    pub fn remove_default_relay(&self, url: &str) -> Result<()> {
        let url = RelayUrl::parse(url)?;
        let mut relays = self.inner.state.lock().default_relays.clone();
        relays.retain(|r| r != &url);
        self.inner.set_default_relays(relays)
    }

    pub fn default_relays(&self) -> Vec<RelayUrl> {
        self.inner.state.lock().default_relays.clone()
    }

    /// Relays known to the pool that are not in the default set.
    pub fn temporary_relays(&self) -> Vec<RelayUrl> {
        let state = self.inner.state.lock();
        let mut relays: Vec<RelayUrl> = state
            .relays
            .keys()
            .filter(|url| !state.default_relays.contains(*url))
            .cloned()
            .collect();
        relays.sort();
        relays
    }

    /// Every relay the pool holds a connection for.
    pub fn relay_urls(&self) -> Vec<RelayUrl> {
        let mut relays: Vec<RelayUrl> = self.inner.state.lock().relays.keys().cloned().collect();
        relays.sort();
        relays
    }

    /// Start a logical subscription driven by `req`.
    pub fn use_req<R: Req>(&self, req: &R, options: UseOptions) -> Result<Subscription> {
        let relays = options.relays.map(parse_relay_urls).transpose()?;
        let id = req.id().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.disposed {
                return Err(ClientError::Disposed);
            }
            if state.subscriptions.contains_key(&id) {
                return Err(ClientError::Subscription(format!(
                    "subscription {} is already in use",
                    id
                )));
            }

            debug!("Subscription {} registered ({:?})", id, req.mode());
            let entry = SubscriptionEntry::new(id.clone(), req.mode(), relays, tx);
            for url in entry.targets(&state.default_relays) {
                self.inner.ensure_relay(&mut state.relays, &url);
            }
            state.subscriptions.insert(id.clone(), entry);
            self.inner.reconcile(state);
        }

        let pump = tokio::spawn(pump(
            Arc::downgrade(&self.inner),
            id.clone(),
            req.source(),
        ));
        Ok(Subscription::new(id, rx, Arc::downgrade(&self.inner), pump))
    }

    /// Publish an event. Its target relays count as demand until they answer
    /// with OK or the OK timeout passes.
    pub fn send(&self, event: Event, options: SendOptions) -> Result<OkReceiver> {
        let explicit = options.relays.map(parse_relay_urls).transpose()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let token = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.disposed {
                return Err(ClientError::Disposed);
            }

            let targets = explicit.unwrap_or_else(|| state.default_relays.clone());
            if targets.is_empty() {
                return Ok(OkReceiver { rx });
            }

            for url in &targets {
                self.inner
                    .ensure_relay(&mut state.relays, url)
                    .conn
                    .send(ClientMessage::Event(event.clone()));
            }
            debug!("Publishing {} to {} relays", event.id, targets.len());

            let token = state.next_ok_token;
            state.next_ok_token += 1;
            state.pending_oks.insert(
                token,
                PendingOk {
                    event_id: event.id,
                    relays: targets.into_iter().collect(),
                    tx,
                },
            );
            self.inner.reconcile(state);
            token
        };

        let weak = Arc::downgrade(&self.inner);
        let ok_timeout = self.inner.config.ok_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(ok_timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_ok(token);
            }
        });

        Ok(OkReceiver { rx })
    }

    /// Connection state and role of a relay. `None` for unknown relays and after dispose.
    pub fn get_relay_status(&self, url: &str) -> Option<RelayStatus> {
        let url = RelayUrl::parse(url).ok()?;
        let state = self.inner.state.lock();
        if state.disposed {
            return None;
        }
        let entry = state.relays.get(&url)?;
        Some(RelayStatus {
            connection: entry.conn.state(),
            role: state.role(&url),
        })
    }

    /// Wait until a relay reaches `state`. Returns `false` on timeout or for unknown relays.
    pub async fn wait_for_state(&self, url: &str, state: ConnectionState, limit: Duration) -> bool {
        let Ok(url) = RelayUrl::parse(url) else {
            return false;
        };
        let watch = match self.inner.state.lock().relays.get(&url) {
            Some(entry) => entry.conn.watch(),
            None => return false,
        };
        wait_for_state(watch, state, limit).await
    }

    /// Reopen a relay, including from `error` and `rejected`.
    pub fn reconnect(&self, url: &str) -> Result<()> {
        let url = RelayUrl::parse(url)?;
        let mut state = self.inner.state.lock();
        if state.disposed {
            return Err(ClientError::Disposed);
        }
        let entry = state
            .relays
            .get_mut(&url)
            .ok_or_else(|| ClientError::UnknownRelay(url.to_string()))?;
        info!("Reconnecting to relay: {}", url);
        entry.held = true;
        entry.conn.reconnect();
        Ok(())
    }

    /// Events of every subscription.
    pub fn events(&self) -> broadcast::Receiver<EventPacket> {
        self.inner.events.subscribe()
    }

    /// Every parsed relay frame.
    pub fn messages(&self) -> broadcast::Receiver<MessagePacket> {
        self.inner.messages.subscribe()
    }

    pub fn errors(&self) -> broadcast::Receiver<ErrorPacket> {
        self.inner.channels.errors.subscribe()
    }

    pub fn connection_states(&self) -> broadcast::Receiver<ConnectionStatePacket> {
        self.inner.channels.states.subscribe()
    }

    pub fn oks(&self) -> broadcast::Receiver<OkPacket> {
        self.inner.oks.subscribe()
    }

    /// Terminate every connection and forget all subscriptions. Irreversible.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }
}

impl PoolInner {
    fn ensure_relay<'a>(
        &self,
        relays: &'a mut HashMap<RelayUrl, RelayEntry>,
        url: &RelayUrl,
    ) -> &'a mut RelayEntry {
        relays.entry(url.clone()).or_insert_with(|| {
            debug!("Adding relay to pool: {}", url);
            RelayEntry {
                conn: RelayConnection::spawn(
                    url.clone(),
                    self.config.relay.clone(),
                    self.channels.clone(),
                ),
                held: false,
            }
        })
    }

    /// Apply the strategy to every relay.
    fn reconcile(&self, state: &mut PoolState) {
        let strategy = self.config.connection_strategy;
        let decisions: Vec<(RelayUrl, Decision)> = state
            .relays
            .iter()
            .map(|(url, entry)| {
                let live = entry.held || entry.conn.state().is_live();
                let decision = strategy.decide(state.role(url), state.demand(url), live);
                (url.clone(), decision)
            })
            .collect();

        for (url, decision) in decisions {
            let Some(entry) = state.relays.get_mut(&url) else {
                continue;
            };
            let current = entry.conn.state();
            match decision {
                Decision::HoldOpen => {
                    if current == ConnectionState::Terminated {
                        continue;
                    }
                    // The observed state lags queued commands: a `dormant` sent
                    // since the last observation is only undone by `connect`.
                    if (!entry.held || !current.is_live()) && !current.needs_manual_recovery() {
                        entry.conn.connect();
                    }
                    entry.held = true;
                }
                Decision::AllowDormant => {
                    if entry.held || current.is_live() {
                        debug!("Relay {} has no demand, letting it go dormant", url);
                        entry.conn.dormant();
                        entry.held = false;
                    }
                }
            }
        }
    }

    fn set_default_relays(self: &Arc<Self>, urls: Vec<RelayUrl>) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.disposed {
            return Err(ClientError::Disposed);
        }

        let added: Vec<RelayUrl> = urls
            .iter()
            .filter(|u| !state.default_relays.contains(*u))
            .cloned()
            .collect();
        let removed: Vec<RelayUrl> = state
            .default_relays
            .iter()
            .filter(|u| !urls.contains(*u))
            .cloned()
            .collect();

        info!(
            "Default relays: {} ({} added, {} removed)",
            urls.len(),
            added.len(),
            removed.len()
        );
        state.default_relays = urls;
        for url in &added {
            self.ensure_relay(&mut state.relays, url);
        }

        let mut completed = Vec::new();
        for entry in state.subscriptions.values_mut().filter(|s| s.is_implicit()) {
            for url in &removed {
                for close in state.mux.close_on_relay(&entry.id, url) {
                    if let Some(relay) = state.relays.get(url) {
                        relay.conn.send(close);
                    }
                }
                entry.pending_eose.retain(|(relay, _)| relay != url);
            }

            match entry.mode {
                ReqMode::Forward => {
                    if let Some(filters) = entry.filters.clone()
                        && !added.is_empty()
                    {
                        let inner = Arc::clone(self);
                        let id = entry.id.clone();
                        let generation = entry.generation;
                        let relays = added.clone();
                        tokio::spawn(async move {
                            inner.send_reqs(&id, relays, filters, generation).await;
                        });
                    }
                }
                ReqMode::Backward => {
                    if entry.is_complete() {
                        completed.push(entry.id.clone());
                    }
                }
            }
        }
        for id in completed {
            self.complete(state, &id);
        }

        self.reconcile(state);
        Ok(())
    }

    async fn limits(&self, relay: &RelayUrl) -> (Option<usize>, Option<usize>) {
        let skip_fetch = self.config.skip_fetch_nip11;
        let max_filters = self
            .nip11
            .get_value(relay, RelayInfo::max_filters, skip_fetch)
            .await;
        let max_subscriptions = self
            .nip11
            .get_value(relay, RelayInfo::max_subscriptions, true)
            .await;
        (max_filters, max_subscriptions)
    }

    /// Handle one emission of a subscription's request. Returns `false` once
    /// the subscription is gone.
    async fn apply_packet(self: &Arc<Self>, id: &str, filters: ReqPacket) -> bool {
        let (targets, generation) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.disposed {
                return false;
            }
            let Some(entry) = state.subscriptions.get_mut(id) else {
                return false;
            };

            entry.generation += 1;
            let targets = entry.targets(&state.default_relays);

            match (&filters, entry.mode) {
                (Some(filters), _) => {
                    if entry.mode == ReqMode::Forward {
                        entry.filters = Some(filters.clone());
                    }
                    (targets, entry.generation)
                }
                (None, ReqMode::Forward) => {
                    debug!("Subscription {} paused", id);
                    entry.filters = None;
                    for (relay, close) in state.mux.plan_close(id) {
                        state.send(&relay, close);
                    }
                    return true;
                }
                (None, ReqMode::Backward) => return true,
            }
        };

        match filters {
            Some(filters) => self.send_reqs(id, targets, filters, generation).await,
            None => true,
        }
    }

    /// Issue REQs for `lazy` on `relays`, sized by each relay's NIP-11 limits.
    /// Time bounds are evaluated once for the whole fan-out.
    async fn send_reqs(
        self: &Arc<Self>,
        id: &str,
        relays: Vec<RelayUrl>,
        lazy: Vec<LazyFilter>,
        generation: u64,
    ) -> bool {
        let limits = join_all(relays.into_iter().map(|relay| async move {
            let limits = self.limits(&relay).await;
            (relay, limits)
        }))
        .await;
        let filters = evaluate_filters(&lazy);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.disposed {
            return false;
        }
        let Some(entry) = state.subscriptions.get_mut(id) else {
            return false;
        };

        match entry.mode {
            ReqMode::Forward => {
                if entry.generation != generation {
                    // A newer emission covers every target.
                    return true;
                }
                for (relay, (max_filters, max_subscriptions)) in limits {
                    if !entry.targets_relay(&relay, &state.default_relays) {
                        continue;
                    }
                    let frames =
                        state
                            .mux
                            .plan_req(id, &relay, &filters, max_filters, max_subscriptions);
                    let conn = &self.ensure_relay(&mut state.relays, &relay).conn;
                    send_frames(conn, frames, &lazy, max_filters);
                }
            }
            ReqMode::Backward => {
                let first_index = entry.next_index;
                let mut span = 0;
                for (relay, (max_filters, max_subscriptions)) in limits {
                    if !entry.targets_relay(&relay, &state.default_relays) {
                        continue;
                    }
                    let frames = state.mux.plan_backward_req(
                        id,
                        &relay,
                        &filters,
                        max_filters,
                        max_subscriptions,
                        first_index,
                    );
                    span = span.max(frames.len());
                    for frame in &frames {
                        if let Some(wire) = frame.subscription_id() {
                            entry.pending_eose.insert((relay.clone(), wire.to_string()));
                        }
                    }
                    let conn = &self.ensure_relay(&mut state.relays, &relay).conn;
                    send_frames(conn, frames, &lazy, max_filters);
                }
                entry.next_index += span;
            }
        }

        self.reconcile(state);
        true
    }

    /// The backward request signalled `over()`.
    fn backward_over(&self, id: &str) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.subscriptions.get_mut(id) else {
            return false;
        };
        entry.over = true;
        if entry.is_complete() {
            self.complete(state, id);
            self.reconcile(state);
        }
        false
    }

    /// End a backward subscription whose queries have all finished.
    fn complete(&self, state: &mut PoolState, id: &str) {
        debug!("Subscription {} complete", id);
        for (relay, close) in state.mux.plan_close(id) {
            state.send(&relay, close);
        }
        // Dropping the sender ends the caller's stream.
        state.subscriptions.remove(id);
    }

    pub(crate) fn unsubscribe(&self, id: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.subscriptions.remove(id).is_none() {
            return;
        }
        debug!("Subscription {} removed", id);
        for (relay, close) in state.mux.plan_close(id) {
            state.send(&relay, close);
        }
        self.reconcile(state);
    }

    fn expire_ok(&self, token: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(pending) = state.pending_oks.remove(&token) {
            debug!(
                "OK timeout for {}, {} relays did not answer",
                pending.event_id,
                pending.relays.len()
            );
            self.reconcile(state);
        }
    }

    fn handle_frame(&self, frame: InboundFrame) {
        let InboundFrame { from, text } = frame;
        let message = match RelayMessage::from_json(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed frame from {}: {}", from, e);
                let _ = self.channels.errors.send(ErrorPacket {
                    from,
                    reason: format!("malformed message: {}", e),
                });
                return;
            }
        };

        let _ = self.messages.send(MessagePacket {
            from: from.clone(),
            message: message.clone(),
        });

        // Verification runs before taking the lock.
        if let RelayMessage::Event { event, .. } = &message
            && !self.config.skip_verify
            && !self.verifier.verify(event)
        {
            debug!("Dropping event {} from {}: verification failed", event.id, from);
            return;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.disposed {
            return;
        }

        let route = state.mux.route(&from, &message);
        match (message, route) {
            (
                RelayMessage::Event { event, .. },
                Route::Subscription {
                    subscription_id,
                    wire_subscription_id,
                },
            ) => {
                let Some(entry) = state.subscriptions.get(&subscription_id) else {
                    return;
                };
                let packet = EventPacket {
                    from,
                    subscription_id,
                    wire_subscription_id,
                    event,
                };
                let _ = entry.events.send(packet.clone());
                let _ = self.events.send(packet);
            }
            (
                RelayMessage::Eose { .. },
                Route::Subscription {
                    subscription_id,
                    wire_subscription_id,
                },
            ) => {
                debug!("EOSE for {} from {}", wire_subscription_id, from);
                self.finish_backward(state, &subscription_id, &from, &wire_subscription_id, true);
            }
            (
                RelayMessage::Closed { message, .. },
                Route::Subscription {
                    subscription_id,
                    wire_subscription_id,
                },
            ) => {
                info!(
                    "Relay {} closed subscription {}: {}",
                    from, wire_subscription_id, message
                );
                self.finish_backward(state, &subscription_id, &from, &wire_subscription_id, false);
            }
            (
                RelayMessage::Ok {
                    event_id,
                    success,
                    message,
                },
                _,
            ) => {
                let packet = OkPacket {
                    from,
                    id: event_id,
                    ok: success,
                    message,
                };
                let _ = self.oks.send(packet.clone());
                self.settle_ok(state, packet);
            }
            (RelayMessage::Notice { message }, _) => {
                info!("Notice from {}: {}", from, message);
            }
            (_, Route::Unmatched) => {
                debug!("Frame for unknown subscription from {}", from);
            }
            _ => {}
        }
    }

    /// A backward wire subscription reached EOSE (or was closed by the relay).
    fn finish_backward(
        &self,
        state: &mut PoolState,
        id: &str,
        relay: &RelayUrl,
        wire: &str,
        send_close: bool,
    ) {
        let Some(entry) = state.subscriptions.get_mut(id) else {
            return;
        };
        if entry.mode != ReqMode::Backward {
            return;
        }

        entry.pending_eose.remove(&(relay.clone(), wire.to_string()));
        let complete = entry.is_complete();
        if send_close && let Some(close) = state.mux.close_wire(relay, wire) {
            state.send(relay, close);
        }
        if complete {
            self.complete(state, id);
            self.reconcile(state);
        }
    }

    fn settle_ok(&self, state: &mut PoolState, packet: OkPacket) {
        let mut settled = Vec::new();
        for (token, pending) in state.pending_oks.iter_mut() {
            if pending.event_id == packet.id && pending.relays.remove(&packet.from) {
                let _ = pending.tx.send(packet.clone());
                if pending.relays.is_empty() {
                    settled.push(*token);
                }
            }
        }
        if settled.is_empty() {
            return;
        }
        for token in settled {
            state.pending_oks.remove(&token);
        }
        self.reconcile(state);
    }

    fn dispose(&self) {
        let relays = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.disposed {
                return;
            }
            info!("Disposing relay pool ({} relays)", state.relays.len());
            state.disposed = true;
            state.subscriptions.clear();
            state.pending_oks.clear();
            state.mux.clear();
            state.default_relays.clear();
            std::mem::take(&mut state.relays)
        };

        for entry in relays.values() {
            entry.conn.dispose();
        }
        self.nip11.forget_all();
    }
}

/// Hand planned frames to a connection. Each REQ carries the slice of `lazy`
/// it was evaluated from, in batch order.
fn send_frames(
    conn: &RelayConnection,
    frames: Vec<ClientMessage>,
    lazy: &[LazyFilter],
    max_filters: Option<usize>,
) {
    let mut batches = lazy.chunks(batch_size(max_filters));
    for frame in frames {
        if matches!(frame, ClientMessage::Req { .. })
            && let Some(batch) = batches.next()
        {
            conn.send_req(frame, batch.to_vec());
        } else {
            conn.send(frame);
        }
    }
}

/// Feed a subscription's request into the pool until either side ends.
async fn pump(inner: Weak<PoolInner>, id: String, mut source: ReqSource) {
    while let Some(update) = source.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let alive = match update {
            ReqUpdate::Packet(packet) => inner.apply_packet(&id, packet).await,
            ReqUpdate::Over => inner.backward_over(&id),
        };
        if !alive {
            break;
        }
    }
}

/// Route inbound frames of every relay, in arrival order.
async fn dispatch(inner: Weak<PoolInner>, mut inbound: mpsc::UnboundedReceiver<InboundFrame>) {
    while let Some(frame) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_frame(frame);
    }
    debug!("Relay pool dispatcher stopped");
}
