//! Transfers and their lifecycle state

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};

use super::fee::FeeBasis;
use crate::entity::EntityId;
use crate::network::{Address, NetworkType, TxHash, Unit};

/// Why a submission failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitError {
    /// Cause not decodable from what the client reported
    Unknown,
    Rejected(String),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}

/// Where and how a transfer was included in a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inclusion {
    pub block_number: u64,
    pub transaction_index: u64,
    pub timestamp: u64,
    pub fee_basis: Option<FeeBasis>,
    /// False for a mined transaction that failed
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferState {
    Created,
    Signed,
    Submitted,
    Included(Inclusion),
    Errored(SubmitError),
    Deleted,
}

impl TransferState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Signed => "signed",
            Self::Submitted => "submitted",
            Self::Included(_) => "included",
            Self::Errored(_) => "errored",
            Self::Deleted => "deleted",
        }
    }

    pub fn is_included(&self) -> bool {
        matches!(self, Self::Included(_))
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Included(inclusion) => write!(
                f,
                "included(block={}, success={})",
                inclusion.block_number, inclusion.success
            ),
            Self::Errored(error) => write!(f, "errored({})", error),
            other => write!(f, "{}", other.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Sent,
    Received,
    /// Sent from the wallet to itself
    Recovered,
}

/// Optional per-transfer key/value supplied by the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAttribute {
    pub key: String,
    pub value: Option<String>,
    pub is_required: bool,
}

/// One side of a UTXO transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEndpoint {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TezosOperationKind {
    Transaction,
    Delegation,
}

/// Chain-specific part of a transfer, fixed at creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPayload {
    Bitcoin {
        inputs: Vec<TxEndpoint>,
        outputs: Vec<TxEndpoint>,
    },
    Tezos {
        /// Operation counter; `None` when a recovered operation did not carry a valid one
        counter: Option<u64>,
        operation: TezosOperationKind,
    },
}

/// Everything needed to create a transfer
#[derive(Debug, Clone)]
pub struct TransferInit {
    pub network_type: NetworkType,
    pub source: Address,
    pub target: Address,
    pub amount: u64,
    pub direction: TransferDirection,
    pub payload: TransferPayload,
    pub estimated_fee_basis: Option<FeeBasis>,
    pub attributes: Vec<TransferAttribute>,
    pub unit: Unit,
    pub unit_for_fee: Unit,
    pub hash: Option<TxHash>,
    pub state: TransferState,
}

pub struct Transfer {
    id: EntityId,
    me: Weak<Transfer>,
    network_type: NetworkType,
    source: Address,
    target: Address,
    amount: u64,
    direction: TransferDirection,
    payload: TransferPayload,
    estimated_fee_basis: Option<FeeBasis>,
    attributes: Vec<TransferAttribute>,
    unit: Unit,
    unit_for_fee: Unit,
    hash: Mutex<Option<TxHash>>,
    serialization: Mutex<Option<Vec<u8>>>,
    state: Mutex<TransferState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Transfer {
    pub fn create(init: TransferInit) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: EntityId::new(),
            me: me.clone(),
            network_type: init.network_type,
            source: init.source,
            target: init.target,
            amount: init.amount,
            direction: init.direction,
            payload: init.payload,
            estimated_fee_basis: init.estimated_fee_basis,
            attributes: init.attributes,
            unit: init.unit,
            unit_for_fee: init.unit_for_fee,
            hash: Mutex::new(init.hash),
            serialization: Mutex::new(None),
            state: Mutex::new(init.state),
        })
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// A new strong reference to this transfer
    pub fn retain(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    pub fn source(&self) -> &Address {
        &self.source
    }

    pub fn target(&self) -> &Address {
        &self.target
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn payload(&self) -> &TransferPayload {
        &self.payload
    }

    pub fn attributes(&self) -> &[TransferAttribute] {
        &self.attributes
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    pub fn unit_for_fee(&self) -> &Unit {
        &self.unit_for_fee
    }

    pub fn estimated_fee_basis(&self) -> Option<FeeBasis> {
        self.estimated_fee_basis
    }

    /// Fee basis of the inclusion if known, otherwise the estimate
    pub fn confirmed_fee_basis(&self) -> Option<FeeBasis> {
        match &*lock(&self.state) {
            TransferState::Included(inclusion) => inclusion.fee_basis.or(self.estimated_fee_basis),
            _ => self.estimated_fee_basis,
        }
    }

    pub fn fee(&self) -> u64 {
        self.confirmed_fee_basis().map_or(0, |basis| basis.fee())
    }

    /// Directed to the unknown/unrevealed sentinel
    pub fn is_burn(&self) -> bool {
        self.target.is_unknown()
    }

    pub fn hash(&self) -> Option<TxHash> {
        *lock(&self.hash)
    }

    pub(crate) fn set_hash(&self, hash: TxHash) {
        *lock(&self.hash) = Some(hash);
    }

    pub fn serialization(&self) -> Option<Vec<u8>> {
        lock(&self.serialization).clone()
    }

    pub(crate) fn set_serialization(&self, bytes: Vec<u8>) {
        *lock(&self.serialization) = Some(bytes);
    }

    pub fn state(&self) -> TransferState {
        lock(&self.state).clone()
    }

    /// Swap in `state`, returning the previous one
    ///
    /// Only the owning wallet calls this, so the change is always announced.
    pub(crate) fn replace_state(&self, state: TransferState) -> TransferState {
        std::mem::replace(&mut *lock(&self.state), state)
    }

    /// Effect on the wallet balance in base units
    pub fn balance_delta(&self) -> i128 {
        let amount = i128::from(self.amount);
        let fee = i128::from(self.fee());
        let (counted, success) = match &*lock(&self.state) {
            TransferState::Included(inclusion) => (true, inclusion.success),
            // Pending outgoing funds are spent already; pending incoming ones are not ours yet
            TransferState::Submitted => (self.direction != TransferDirection::Received, true),
            _ => (false, false),
        };
        if !counted {
            return 0;
        }

        match (self.direction, success) {
            _ if self.is_burn() => {
                if success {
                    -amount
                } else {
                    0
                }
            }
            (TransferDirection::Received, true) => amount,
            (TransferDirection::Received, false) => 0,
            (TransferDirection::Sent, true) => -(amount + fee),
            (TransferDirection::Sent, false) | (TransferDirection::Recovered, _) => -fee,
        }
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("hash", &self.hash())
            .field("direction", &self.direction)
            .field("amount", &self.amount)
            .field("state", &self.state().name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn received(state: TransferState) -> Arc<Transfer> {
        let mut init = test_support::btc_transfer_init(TransferDirection::Received, 1_000);
        init.state = state;
        Transfer::create(init)
    }

    fn included(success: bool) -> TransferState {
        TransferState::Included(Inclusion {
            block_number: 100,
            transaction_index: 0,
            timestamp: 1_600_000_000,
            fee_basis: Some(FeeBasis::bitcoin_actual(200, 200)),
            success,
            error: None,
        })
    }

    #[test]
    fn test_received_balance_only_when_included() {
        assert_eq!(received(TransferState::Created).balance_delta(), 0);
        assert_eq!(received(TransferState::Submitted).balance_delta(), 0);
        assert_eq!(received(included(true)).balance_delta(), 1_000);
        assert_eq!(received(included(false)).balance_delta(), 0);
    }

    #[test]
    fn test_sent_balance_includes_fee() {
        let mut init = test_support::btc_transfer_init(TransferDirection::Sent, 1_000);
        init.state = included(true);
        let sent = Transfer::create(init.clone());
        assert_eq!(sent.fee(), 200);
        assert_eq!(sent.balance_delta(), -1_200);

        init.state = included(false);
        assert_eq!(Transfer::create(init.clone()).balance_delta(), -200);

        init.direction = TransferDirection::Recovered;
        init.state = included(true);
        assert_eq!(Transfer::create(init).balance_delta(), -200);
    }

    #[test]
    fn test_replace_state_returns_previous() {
        let transfer = received(TransferState::Created);
        let old = transfer.replace_state(TransferState::Signed);
        assert_eq!(old, TransferState::Created);
        assert_eq!(transfer.state(), TransferState::Signed);
        assert_eq!(transfer.state().to_string(), "signed");
        assert!(transfer.retain().is_some());
    }
}
