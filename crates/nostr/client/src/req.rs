//! Subscription request sources.
//!
//! A request is the caller's side of a logical subscription. [`ForwardReq`]
//! keeps one live query whose filters can be replaced at any time, while
//! [`BackwardReq`] issues one-shot queries that finish at end of stored events.
//! Both are handed to `RelayPool::use_req`, which turns their emissions into
//! wire REQ/CLOSE traffic.
//!
//! `since` and `until` may be deferred with [`TimeBound::Lazy`]; they are
//! resolved once per emission so every relay in a fan-out sees the same
//! timestamps.

use crate::message::Filter;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch};
use tracing::warn;

const BACKWARD_CAPACITY: usize = 256;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A `since`/`until` value that may be computed at send time.
#[derive(Clone)]
pub enum TimeBound {
    Fixed(u64),
    Lazy(Arc<dyn Fn() -> u64 + Send + Sync>),
}

impl TimeBound {
    pub fn lazy<F>(f: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        TimeBound::Lazy(Arc::new(f))
    }

    /// Resolves to the unix time at which it is evaluated.
    pub fn now() -> Self {
        Self::lazy(unix_now)
    }

    pub fn resolve(&self) -> u64 {
        match self {
            TimeBound::Fixed(value) => *value,
            TimeBound::Lazy(f) => f(),
        }
    }
}

impl fmt::Debug for TimeBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeBound::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            TimeBound::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

impl From<u64> for TimeBound {
    fn from(value: u64) -> Self {
        TimeBound::Fixed(value)
    }
}

/// A filter whose time bounds may be deferred.
#[derive(Debug, Clone, Default)]
pub struct LazyFilter {
    filter: Filter,
    since: Option<TimeBound>,
    until: Option<TimeBound>,
}

impl LazyFilter {
    pub fn new(filter: Filter) -> Self {
        Self::from(filter)
    }

    pub fn since(mut self, since: impl Into<TimeBound>) -> Self {
        self.since = Some(since.into());
        self
    }

    pub fn until(mut self, until: impl Into<TimeBound>) -> Self {
        self.until = Some(until.into());
        self
    }

    /// Resolve deferred fields into a concrete wire filter.
    pub fn evaluate(&self) -> Filter {
        let mut filter = self.filter.clone();
        if let Some(since) = &self.since {
            filter.since = Some(since.resolve());
        }
        if let Some(until) = &self.until {
            filter.until = Some(until.resolve());
        }
        filter
    }
}

impl From<Filter> for LazyFilter {
    fn from(mut filter: Filter) -> Self {
        let since = filter.since.take().map(TimeBound::Fixed);
        let until = filter.until.take().map(TimeBound::Fixed);
        Self {
            filter,
            since,
            until,
        }
    }
}

/// Resolve a batch of lazy filters once.
pub fn evaluate_filters(filters: &[LazyFilter]) -> Vec<Filter> {
    filters.iter().map(LazyFilter::evaluate).collect()
}

/// One emission of a request: `None` pauses the subscription.
pub type ReqPacket = Option<Vec<LazyFilter>>;

/// Whether a request is a live query or a one-shot fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqMode {
    Forward,
    Backward,
}

fn random_id(prefix: &str) -> String {
    let n: u32 = rand::rng().random();
    format!("{}-{:08x}", prefix, n)
}

#[derive(Debug, Clone)]
pub(crate) enum ForwardSignal {
    Idle,
    Packet(ReqPacket),
}

/// A live query. Each emission replaces the previous filters on every target relay.
#[derive(Debug)]
pub struct ForwardReq {
    id: String,
    tx: watch::Sender<ForwardSignal>,
}

impl ForwardReq {
    pub fn new() -> Self {
        Self::with_id(random_id("forward"))
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(ForwardSignal::Idle);
        Self { id: id.into(), tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replace the filters. The latest emission is kept for subscribers that attach later.
    pub fn emit<I, F>(&self, filters: I)
    where
        I: IntoIterator<Item = F>,
        F: Into<LazyFilter>,
    {
        let filters = filters.into_iter().map(Into::into).collect();
        self.tx.send_replace(ForwardSignal::Packet(Some(filters)));
    }

    /// Stop the query on every relay without ending the subscription.
    pub fn pause(&self) {
        self.tx.send_replace(ForwardSignal::Packet(None));
    }
}

impl Default for ForwardReq {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum BackwardSignal {
    Packet(ReqPacket),
    Over,
}

/// One-shot queries. Each emission is answered up to EOSE; after [`BackwardReq::over`]
/// and the last EOSE the subscription completes.
///
/// Emissions are only seen by subscriptions that already use the request.
#[derive(Debug)]
pub struct BackwardReq {
    id: String,
    tx: broadcast::Sender<BackwardSignal>,
}

impl BackwardReq {
    pub fn new() -> Self {
        Self::with_id(random_id("backward"))
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let (tx, _rx) = broadcast::channel(BACKWARD_CAPACITY);
        Self { id: id.into(), tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn emit<I, F>(&self, filters: I)
    where
        I: IntoIterator<Item = F>,
        F: Into<LazyFilter>,
    {
        let filters = filters.into_iter().map(Into::into).collect();
        let _ = self.tx.send(BackwardSignal::Packet(Some(filters)));
    }

    /// No more emissions will follow.
    pub fn over(&self) {
        let _ = self.tx.send(BackwardSignal::Over);
    }
}

impl Default for BackwardReq {
    fn default() -> Self {
        Self::new()
    }
}

/// What a subscription pump receives from its request.
#[derive(Debug, Clone)]
pub(crate) enum ReqUpdate {
    Packet(ReqPacket),
    Over,
}

/// Receiving side of a request, owned by the subscription pump task.
#[derive(Debug)]
pub(crate) enum ReqSource {
    Forward(watch::Receiver<ForwardSignal>),
    Backward(broadcast::Receiver<BackwardSignal>),
}

impl ReqSource {
    /// Next update, or `None` once the request can produce nothing more.
    pub(crate) async fn next(&mut self) -> Option<ReqUpdate> {
        match self {
            ReqSource::Forward(rx) => loop {
                rx.changed().await.ok()?;
                if let ForwardSignal::Packet(packet) = &*rx.borrow_and_update() {
                    return Some(ReqUpdate::Packet(packet.clone()));
                }
            },
            ReqSource::Backward(rx) => loop {
                match rx.recv().await {
                    Ok(BackwardSignal::Packet(packet)) => return Some(ReqUpdate::Packet(packet)),
                    Ok(BackwardSignal::Over) => return Some(ReqUpdate::Over),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Backward request lagged, {} emissions dropped", n);
                    }
                    // Dropping the request ends it like `over()`.
                    Err(broadcast::error::RecvError::Closed) => return Some(ReqUpdate::Over),
                }
            },
        }
    }
}

mod sealed {
    pub trait Sealed {
        fn source(&self) -> super::ReqSource;
    }
}

/// Anything `RelayPool::use_req` accepts.
pub trait Req: sealed::Sealed {
    fn id(&self) -> &str;
    fn mode(&self) -> ReqMode;
}

impl sealed::Sealed for ForwardReq {
    fn source(&self) -> ReqSource {
        let mut rx = self.tx.subscribe();
        rx.mark_changed();
        ReqSource::Forward(rx)
    }
}

impl Req for ForwardReq {
    fn id(&self) -> &str {
        &self.id
    }

    fn mode(&self) -> ReqMode {
        ReqMode::Forward
    }
}

impl sealed::Sealed for BackwardReq {
    fn source(&self) -> ReqSource {
        ReqSource::Backward(self.tx.subscribe())
    }
}

impl Req for BackwardReq {
    fn id(&self) -> &str {
        &self.id
    }

    fn mode(&self) -> ReqMode {
        ReqMode::Backward
    }
}
