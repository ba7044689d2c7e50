//! Transfer reconciliation
//!
//! Client-reported bundles are turned into a `RecoveredRecord` by the family
//! handler, then merged into the wallet here. The same path serves live
//! announcements and startup replay of persisted bundles.
//!
//! A transfer is found by hash *and* burn classification: one Tezos operation can
//! carry a burn next to the ordinary transfer, both under the same hash.

use std::sync::Arc;

use tracing::{debug, warn};

use super::client::TransferStatus;
use crate::error::{Error, Result};
use crate::network::{Address, TxHash};
use crate::wallet::{
    FeeBasis, Inclusion, SubmitError, Transfer, TransferAttribute, TransferDirection,
    TransferInit, TransferPayload, TransferState, Wallet,
};

/// A bundle after the family handler validated and decoded it
#[derive(Debug, Clone)]
pub struct RecoveredRecord {
    pub hash: TxHash,
    pub source: Address,
    pub target: Address,
    pub amount: u64,
    pub fee_basis: FeeBasis,
    pub status: TransferStatus,
    pub block_number: u64,
    pub transaction_index: u64,
    pub timestamp: u64,
    pub error: Option<String>,
    pub attributes: Vec<(String, String)>,
    pub payload: TransferPayload,
}

impl RecoveredRecord {
    pub fn is_burn(&self) -> bool {
        self.target.is_unknown()
    }

    pub fn storage_key(&self) -> String {
        storage_key(&self.hash, self.is_burn())
    }
}

/// Key under which a reconciled bundle is persisted
pub fn storage_key(hash: &TxHash, is_burn: bool) -> String {
    format!("{}:{}", hash.encode(), if is_burn { "burn" } else { "transfer" })
}

/// How a reconciled bundle moves the wallet's sequence counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterRule {
    /// UTXO chains have no account counter
    None,
    /// `next = max(next, c + 1)` with `c` from `source_counter` (or
    /// `destination_counter` for received transfers)
    Sequence,
}

pub const SOURCE_COUNTER: &str = "source_counter";
pub const DESTINATION_COUNTER: &str = "destination_counter";

#[derive(Debug)]
pub struct ReconcileOutcome {
    pub transfer: Arc<Transfer>,
    /// The transfer was not known before this bundle
    pub created: bool,
    /// Recovered counter problem; the state was applied regardless
    pub counter_error: Option<Error>,
}

/// Parse a base-10 unsigned amount field
pub fn parse_amount(field: &str, value: &str) -> Result<u64> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidAmount(format!("{} = {:?}", field, value)));
    }
    trimmed
        .parse::<u64>()
        .map_err(|e| Error::InvalidAmount(format!("{} = {:?}: {}", field, value, e)))
}

/// Transfer state reported by a bundle
///
/// An errored bundle that still made it into a block is a mined failure: the fee
/// was paid.
pub fn state_for(record: &RecoveredRecord) -> TransferState {
    match record.status {
        TransferStatus::Submitted => TransferState::Submitted,
        TransferStatus::Included => TransferState::Included(Inclusion {
            block_number: record.block_number,
            transaction_index: record.transaction_index,
            timestamp: record.timestamp,
            fee_basis: Some(record.fee_basis),
            success: true,
            error: None,
        }),
        TransferStatus::Errored if record.block_number != 0 && record.timestamp != 0 => {
            TransferState::Included(Inclusion {
                block_number: record.block_number,
                transaction_index: record.transaction_index,
                timestamp: record.timestamp,
                fee_basis: Some(record.fee_basis),
                success: false,
                error: Some(record.error.clone().unwrap_or_else(|| "unknown".to_string())),
            })
        }
        TransferStatus::Errored => TransferState::Errored(SubmitError::Unknown),
    }
}

/// Merge `record` into `wallet`, creating the transfer if it is new
pub fn reconcile(wallet: &Wallet, record: RecoveredRecord, rule: CounterRule) -> ReconcileOutcome {
    let state = state_for(&record);
    let existing = wallet
        .transfers_by_hash(&record.hash)
        .into_iter()
        .find(|t| t.is_burn() == record.is_burn());

    let (transfer, created) = match existing {
        Some(transfer) => (transfer, false),
        None => {
            let transfer = Transfer::create(TransferInit {
                network_type: wallet.network_type(),
                direction: wallet.direction_of(&record.source, &record.target),
                source: record.source.clone(),
                target: record.target.clone(),
                amount: record.amount,
                payload: record.payload.clone(),
                estimated_fee_basis: Some(record.fee_basis),
                attributes: record
                    .attributes
                    .iter()
                    .map(|(key, value)| TransferAttribute {
                        key: key.clone(),
                        value: Some(value.clone()),
                        is_required: false,
                    })
                    .collect(),
                unit: wallet.unit().clone(),
                unit_for_fee: wallet.unit_for_fee().clone(),
                hash: Some(record.hash),
                state: TransferState::Created,
            });
            wallet.add_transfer(&transfer);
            (transfer, true)
        }
    };

    let mut counter_error = None;
    if rule == CounterRule::Sequence {
        match apply_counter(wallet, transfer.direction(), &record.attributes) {
            Ok(next) => debug!(hash = %record.hash, next, "Counter reconciled"),
            Err(e) => {
                warn!(hash = %record.hash, error = %e, "Counter left unchanged");
                counter_error = Some(e);
            }
        }
    }

    debug!(
        hash = %record.hash,
        burn = record.is_burn(),
        created,
        state = %state,
        "Transfer reconciled"
    );
    wallet.set_transfer_state(&transfer, state);

    ReconcileOutcome {
        transfer,
        created,
        counter_error,
    }
}

fn apply_counter(
    wallet: &Wallet,
    direction: TransferDirection,
    attributes: &[(String, String)],
) -> Result<u64> {
    let key = match direction {
        TransferDirection::Received => DESTINATION_COUNTER,
        TransferDirection::Sent | TransferDirection::Recovered => SOURCE_COUNTER,
    };
    let counter = parse_counter(attributes, key)?;
    Ok(wallet.raise_counter(counter.saturating_add(1)))
}

/// Counter attribute `key`, looked up case-insensitively
pub fn parse_counter(attributes: &[(String, String)], key: &str) -> Result<u64> {
    let raw = attributes
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim())
        .ok_or_else(|| Error::MissingAttribute(key.to_string()))?;
    raw.parse::<u64>().map_err(|e| Error::InvalidAttribute {
        key: key.to_string(),
        reason: format!("{:?}: {}", raw, e),
    })
}
