//! Connection strategies.
//!
//! A strategy decides, per relay, whether the pool keeps the socket open or
//! lets it go dormant. It is a pure function of the relay's role, its current
//! demand (live subscriptions targeting it plus outstanding publish
//! acknowledgements) and whether the connection is currently live.

use crate::packet::RelayRole;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the pool should do with a relay's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    HoldOpen,
    AllowDormant,
}

/// Connection strategy, fixed when the pool is constructed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStrategy {
    /// Every relay is connected only while something needs it.
    Lazy,
    /// Like `Lazy`, but a default relay that is already connected stays
    /// connected for as long as it remains in the default set.
    #[default]
    LazyKeep,
    /// Default relays are always connected; other relays are demand-driven.
    Aggressive,
}

impl ConnectionStrategy {
    pub fn decide(self, role: RelayRole, demand: usize, live: bool) -> Decision {
        if demand > 0 {
            return Decision::HoldOpen;
        }

        let keep = match (self, role) {
            (ConnectionStrategy::Aggressive, RelayRole::Default) => true,
            (ConnectionStrategy::LazyKeep, RelayRole::Default) => live,
            _ => false,
        };

        if keep {
            Decision::HoldOpen
        } else {
            Decision::AllowDormant
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStrategy::Lazy => "lazy",
            ConnectionStrategy::LazyKeep => "lazy-keep",
            ConnectionStrategy::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for ConnectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
