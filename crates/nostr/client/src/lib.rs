//! Nostr relay pool.
//!
//! This crate provides:
//! - One WebSocket connection state machine per relay, with exponential
//!   backoff, dormancy and manual recovery
//! - Connection strategies that decide which relays are held open
//! - Logical subscriptions multiplexed onto per-relay REQ/CLOSE wire
//!   subscriptions, split by the relay's NIP-11 limits
//! - Publishing with per-relay OK acknowledgements
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_relay_pool::{BackwardReq, Filter, PoolConfig, RelayPool, UseOptions};
//!
//! #[tokio::main]
//! async fn main() -> nostr_relay_pool::Result<()> {
//!     let pool = RelayPool::new(PoolConfig::default());
//!     pool.set_default_relays(["wss://relay.damus.io", "wss://nos.lol"])?;
//!
//!     // Fetch the ten most recent text notes, then stop.
//!     let req = BackwardReq::new();
//!     let mut sub = pool.use_req(&req, UseOptions::default())?;
//!     req.emit([Filter::new().kinds(vec![1]).limit(10)]);
//!     req.over();
//!
//!     while let Some(packet) = sub.recv().await {
//!         println!("{} from {}", packet.event.id, packet.from);
//!     }
//!
//!     pool.dispose();
//!     Ok(())
//! }
//! ```

mod duration_ms;
pub mod error;
pub mod event;
pub mod message;
pub mod multiplexer;
pub mod nip11;
pub mod packet;
mod pool;
pub mod recovery;
pub mod relay;
pub mod req;
pub mod strategy;
mod subscription;
pub mod url;

// Re-export main types
pub use error::{ClientError, Result};
pub use event::{Event, EventError, EventVerifier, SchnorrVerifier, event_hash, verify_event};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage};
pub use nip11::{HttpNip11Fetcher, Limitation, Nip11Fetcher, Nip11Registry, RelayInfo};
pub use packet::{
    ConnectionState, ConnectionStatePacket, ErrorPacket, EventPacket, MessagePacket, OkPacket,
    RelayRole, RelayStatus,
};
pub use pool::{OkReceiver, PoolConfig, RelayPool, SendOptions, UseOptions};
pub use recovery::{BackoffConfig, ExponentialBackoff, Jitter};
pub use relay::{RelayConfig, RelayConnection};
pub use req::{BackwardReq, ForwardReq, LazyFilter, Req, ReqMode, ReqPacket, TimeBound};
pub use strategy::{ConnectionStrategy, Decision};
pub use subscription::Subscription;
pub use url::{RelayUrl, normalize_relay_url};
