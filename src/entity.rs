//! Shared entity identity and ownership conventions
//!
//! Every shared entity (network, wallet manager, wallet, transfer, listener) is handed
//! out as an `Arc<T>`:
//!
//! - create: `Arc::new` / `Arc::new_cyclic` (count = 1)
//! - retain: `Arc::clone`
//! - release: dropping an `Arc`; the last drop runs `Drop` exactly once
//!
//! Owners hold strong references downwards (manager -> wallets -> transfers) and
//! `Weak` references upwards, so the graph is acyclic. An entity that must announce
//! itself keeps a `Weak` to itself and upgrades it when building an event; an event in
//! flight therefore always holds its own strong reference to the subject.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Process-unique identity of an entity
///
/// Transfers are compared by `EntityId`, never by hash: one chain hash may back
/// several transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Allocate a fresh identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell entities apart in logs
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Subject kind of a lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Network,
    Manager,
    Wallet,
    Transfer,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Network => write!(f, "network"),
            EntityKind::Manager => write!(f, "manager"),
            EntityKind::Wallet => write!(f, "wallet"),
            EntityKind::Transfer => write!(f, "transfer"),
        }
    }
}
