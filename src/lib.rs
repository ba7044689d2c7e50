//! Multi-chain wallet engine core
//!
//! Refcounted network, wallet-manager, wallet and transfer entities, a per-family
//! handler table for Bitcoin, Bitcoin Cash, Bitcoin SV and Tezos, and listeners that
//! deliver every entity event in order on a worker thread of their own.

pub mod cli;
pub mod config;
pub mod entity;
pub mod error;
pub mod handler;
pub mod listener;
pub mod manager;
pub mod network;
pub mod wallet;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use handler::{ChainHandler, HandlerRegistry};
pub use listener::{Listener, ListenerCallbacks};
pub use manager::WalletManager;
pub use network::{Network, NetworkType};
pub use wallet::{Transfer, Wallet};
