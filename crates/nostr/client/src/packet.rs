//! Typed packets emitted by the pool and the state types they carry.

use crate::event::Event;
use crate::message::RelayMessage;
use crate::url::RelayUrl;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle state of a single relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Created, never connected
    Initialized,
    /// Opening the first socket (or reopening after closed/dormant)
    Connecting,
    /// Socket open
    Connected,
    /// Peer closed the socket cleanly
    Closed,
    /// Closed by the pool because nothing needs the relay
    Dormant,
    /// Backoff timer running after an involuntary disconnect
    WaitingForReconnection,
    /// Reopening the socket after backoff
    Reconnecting,
    /// Retry budget exhausted
    Error,
    /// Relay refused service (close code 4000)
    Rejected,
    /// Disposed; absorbing
    Terminated,
}

impl ConnectionState {
    /// The connection holds a socket or is in the middle of acquiring one.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::WaitingForReconnection
                | ConnectionState::Reconnecting
        )
    }

    /// Only an explicit reconnect leaves these states.
    pub fn needs_manual_recovery(self) -> bool {
        matches!(self, ConnectionState::Error | ConnectionState::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
            ConnectionState::Dormant => "dormant",
            ConnectionState::WaitingForReconnection => "waiting-for-reconnection",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
            ConnectionState::Rejected => "rejected",
            ConnectionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a relay belongs to the default set or is reached only through overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayRole {
    Default,
    Temporary,
}

/// Snapshot returned by `RelayPool::get_relay_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatus {
    pub connection: ConnectionState,
    pub role: RelayRole,
}

/// Event delivered for a logical subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPacket {
    pub from: RelayUrl,
    /// Logical subscription id
    pub subscription_id: String,
    /// Relay-facing id the event arrived on (`<id>:<index>`)
    pub wire_subscription_id: String,
    pub event: Event,
}

/// Any parsed relay frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePacket {
    pub from: RelayUrl,
    pub message: RelayMessage,
}

/// Transport or protocol problem on one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub from: RelayUrl,
    pub reason: String,
}

/// A relay changed connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatePacket {
    pub from: RelayUrl,
    pub state: ConnectionState,
}

/// Publish acknowledgement from one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub from: RelayUrl,
    /// Event id
    pub id: String,
    pub ok: bool,
    pub message: String,
}
