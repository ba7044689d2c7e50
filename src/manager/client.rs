//! Client collaborator
//!
//! The application's chain client (a blockchain API, a block explorer, a recorded
//! replay) answers the manager's requests asynchronously by calling the
//! `WalletManager::announce_*` entry points, usually from a thread of its own.
//! Implementations must not call back synchronously from inside a request: the
//! request is issued while the manager holds its mutation lock.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::WalletManager;
use crate::network::NetworkFee;
use crate::wallet::{FeeBasis, Transfer};

/// Which kind of bundle a manager requests from its client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRequestStyle {
    /// Account-based chains: one bundle per observed transfer
    Transfers,
    /// UTXO chains: one bundle per raw transaction
    Transactions,
}

/// Status of a bundle as reported by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Submitted,
    Included,
    Errored,
}

/// One observed transfer, as a flat record of strings
///
/// Amounts stay textual until reconciliation so that a malformed value rejects
/// only its own bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferBundle {
    pub status: TransferStatus,
    pub hash: String,
    pub identifier: Option<String>,
    pub from: String,
    pub to: String,
    /// Base-10 integer in the currency's base unit
    pub amount: String,
    pub currency: String,
    /// Base-10 integer in the fee currency's base unit
    #[serde(default)]
    pub fee: Option<String>,
    #[serde(default)]
    pub block_number: u64,
    #[serde(default)]
    pub block_transaction_index: u64,
    #[serde(default)]
    pub block_timestamp: u64,
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
}

impl TransferBundle {
    /// Value of the attribute `key`, compared case-insensitively
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// One raw transaction of a UTXO chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBundle {
    pub status: TransferStatus,
    /// Hex encoded serialization
    pub raw: String,
    #[serde(default)]
    pub block_height: u64,
    #[serde(default)]
    pub timestamp: u64,
}

/// Answer to an `estimate_transfer_fee` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeEstimate {
    pub cost_units: f64,
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
}

impl FeeEstimate {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Failure reported by a client in place of a result
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("client request failed: {0}")]
pub struct ClientError(pub String);

/// Requests a wallet manager issues to the application's client
///
/// Every request carries an `rid` that the matching announcement echoes.
pub trait Client: Send + Sync {
    fn get_block_number(&self, manager: &Arc<WalletManager>, rid: u64);

    /// Transfers touching `addresses` in blocks `[begin, end)`
    fn get_transfers(
        &self,
        manager: &Arc<WalletManager>,
        rid: u64,
        addresses: Vec<String>,
        begin_block: u64,
        end_block: u64,
    );

    /// Raw transactions touching `addresses` in blocks `[begin, end)`
    fn get_transactions(
        &self,
        manager: &Arc<WalletManager>,
        rid: u64,
        addresses: Vec<String>,
        begin_block: u64,
        end_block: u64,
    );

    fn submit_transaction(
        &self,
        manager: &Arc<WalletManager>,
        transfer: Arc<Transfer>,
        serialization: Vec<u8>,
    );

    fn estimate_transfer_fee(
        &self,
        manager: &Arc<WalletManager>,
        cookie: u64,
        transfer: Arc<Transfer>,
        network_fee: NetworkFee,
        initial: FeeBasis,
        serialization: Vec<u8>,
    );
}
