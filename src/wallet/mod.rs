//! Wallets
//!
//! A wallet holds the transfers of one currency on one network, plus the derived
//! balance and (account-based chains) the next sequence counter. Wallets are
//! created and mutated by their `WalletManager`; every change is announced on the
//! manager's listener.

pub mod account;
pub mod fee;
pub mod transfer;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use crate::entity::EntityId;
use crate::listener::{Listener, TransferEvent, WalletEvent};
use crate::manager::WalletManager;
use crate::network::{Address, Currency, NetworkType, TxHash, Unit};

pub use account::{Account, Credential};
pub use fee::{FeeBasis, TezosFeeBasis};
pub use transfer::{
    Inclusion, SubmitError, Transfer, TransferAttribute, TransferDirection, TransferInit,
    TransferPayload, TransferState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletState {
    Created,
    Deleted,
}

/// Creation parameters of a wallet
pub struct WalletInit {
    pub manager: Weak<WalletManager>,
    pub listener: Arc<Listener>,
    pub network_type: NetworkType,
    pub currency: Currency,
    pub unit: Unit,
    pub unit_for_fee: Unit,
    /// Addresses owned by the account on this network, primary first
    pub addresses: Vec<Address>,
    pub default_fee_basis: Option<FeeBasis>,
}

struct WalletInner {
    state: WalletState,
    transfers: Vec<Arc<Transfer>>,
    balance: u64,
    default_fee_basis: Option<FeeBasis>,
    /// Next sequence counter for an outgoing operation
    counter: u64,
}

pub struct Wallet {
    id: EntityId,
    me: Weak<Wallet>,
    manager: Weak<WalletManager>,
    listener: Arc<Listener>,
    network_type: NetworkType,
    currency: Currency,
    unit: Unit,
    unit_for_fee: Unit,
    addresses: Vec<Address>,
    inner: Mutex<WalletInner>,
}

impl Wallet {
    pub fn create(init: WalletInit) -> Arc<Self> {
        assert!(!init.addresses.is_empty(), "wallet needs at least one address");
        Arc::new_cyclic(|me| Self {
            id: EntityId::new(),
            me: me.clone(),
            manager: init.manager,
            listener: init.listener,
            network_type: init.network_type,
            currency: init.currency,
            unit: init.unit,
            unit_for_fee: init.unit_for_fee,
            addresses: init.addresses,
            inner: Mutex::new(WalletInner {
                state: WalletState::Created,
                transfers: Vec::new(),
                balance: 0,
                default_fee_basis: init.default_fee_basis,
                counter: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, WalletInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    pub fn unit_for_fee(&self) -> &Unit {
        &self.unit_for_fee
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn primary_address(&self) -> &Address {
        &self.addresses[0]
    }

    pub fn is_ours(&self, address: &Address) -> bool {
        self.addresses.contains(address)
    }

    /// Direction of a transfer between `source` and `target` seen from this wallet
    ///
    /// A transfer touching none of our addresses is reported as received.
    pub fn direction_of(&self, source: &Address, target: &Address) -> TransferDirection {
        match (self.is_ours(source), self.is_ours(target)) {
            (true, true) => TransferDirection::Recovered,
            (true, false) => TransferDirection::Sent,
            _ => TransferDirection::Received,
        }
    }

    pub fn state(&self) -> WalletState {
        self.lock().state
    }

    pub fn balance(&self) -> u64 {
        self.lock().balance
    }

    pub fn transfers(&self) -> Vec<Arc<Transfer>> {
        self.lock().transfers.clone()
    }

    pub fn transfer_count(&self) -> usize {
        self.lock().transfers.len()
    }

    pub fn has_transfer(&self, transfer: &Transfer) -> bool {
        self.lock().transfers.iter().any(|t| t.id() == transfer.id())
    }

    /// Every transfer carrying `hash`; there may be more than one
    pub fn transfers_by_hash(&self, hash: &TxHash) -> Vec<Arc<Transfer>> {
        self.lock()
            .transfers
            .iter()
            .filter(|t| t.hash().as_ref() == Some(hash))
            .cloned()
            .collect()
    }

    pub fn default_fee_basis(&self) -> Option<FeeBasis> {
        self.lock().default_fee_basis
    }

    pub fn set_default_fee_basis(&self, fee_basis: FeeBasis) {
        self.lock().default_fee_basis = Some(fee_basis);
        self.signal(WalletEvent::FeeBasisUpdated { fee_basis });
    }

    pub fn counter(&self) -> u64 {
        self.lock().counter
    }

    /// Raise the next counter to at least `value`; never lowers it
    pub(crate) fn raise_counter(&self, value: u64) -> u64 {
        let mut inner = self.lock();
        inner.counter = inner.counter.max(value);
        inner.counter
    }

    /// An account that has never sent must reveal its key with its first operation
    pub fn needs_reveal(&self) -> bool {
        self.counter() == 0
    }

    fn strong_parts(&self) -> Option<(Arc<WalletManager>, Arc<Wallet>)> {
        match (self.manager.upgrade(), self.me.upgrade()) {
            (Some(manager), Some(wallet)) => Some((manager, wallet)),
            _ => {
                debug!(wallet = %self.id, "Wallet event dropped; owner released");
                None
            }
        }
    }

    pub(crate) fn signal(&self, event: WalletEvent) {
        let Some((manager, wallet)) = self.strong_parts() else {
            return;
        };
        if let Err(e) = self.listener.signal_wallet_event(manager, wallet, event) {
            debug!(wallet = %self.id, error = %e, "Wallet event not delivered");
        }
    }

    fn signal_transfer(&self, transfer: Arc<Transfer>, event: TransferEvent) {
        let Some((manager, wallet)) = self.strong_parts() else {
            return;
        };
        if let Err(e) = self
            .listener
            .signal_transfer_event(manager, wallet, transfer, event)
        {
            debug!(wallet = %self.id, error = %e, "Transfer event not delivered");
        }
    }

    /// Insert a transfer; no-op when it is already held
    pub(crate) fn add_transfer(&self, transfer: &Arc<Transfer>) {
        {
            let mut inner = self.lock();
            if inner.transfers.iter().any(|t| t.id() == transfer.id()) {
                return;
            }
            inner.transfers.push(transfer.clone());
        }
        self.signal_transfer(transfer.clone(), TransferEvent::Created);
        self.signal(WalletEvent::TransferAdded {
            transfer: transfer.clone(),
        });
        self.update_balance();
    }

    pub(crate) fn remove_transfer(&self, transfer: &Arc<Transfer>) {
        let removed = {
            let mut inner = self.lock();
            let before = inner.transfers.len();
            inner.transfers.retain(|t| t.id() != transfer.id());
            before != inner.transfers.len()
        };
        if !removed {
            return;
        }
        transfer.replace_state(TransferState::Deleted);
        self.signal(WalletEvent::TransferDeleted {
            transfer: transfer.clone(),
        });
        self.signal_transfer(transfer.clone(), TransferEvent::Deleted);
        self.update_balance();
    }

    /// Apply `state` and announce it, even when equal to the current state
    pub(crate) fn set_transfer_state(&self, transfer: &Arc<Transfer>, state: TransferState) {
        let old = transfer.replace_state(state.clone());
        self.signal_transfer(transfer.clone(), TransferEvent::Changed { old, new: state });
        self.signal(WalletEvent::TransferChanged {
            transfer: transfer.clone(),
        });
        self.update_balance();
    }

    fn update_balance(&self) {
        let balance = {
            let mut inner = self.lock();
            let total: i128 = inner.transfers.iter().map(|t| t.balance_delta()).sum();
            let balance = u64::try_from(total.max(0)).unwrap_or(u64::MAX);
            if balance == inner.balance {
                return;
            }
            inner.balance = balance;
            balance
        };
        self.signal(WalletEvent::BalanceUpdated { balance });
    }

    /// Mark deleted and hand this reference to the listener with `Deleted`
    pub(crate) fn release(self: Arc<Self>, manager: Arc<WalletManager>) {
        {
            let mut inner = self.lock();
            if inner.state == WalletState::Deleted {
                return;
            }
            inner.state = WalletState::Deleted;
        }
        self.signal(WalletEvent::Changed {
            old: WalletState::Created,
            new: WalletState::Deleted,
        });
        let listener = self.listener.clone();
        if let Err(e) = listener.signal_wallet_event(manager, self, WalletEvent::Deleted) {
            debug!(error = %e, "Wallet deletion not delivered");
        }
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("id", &self.id)
            .field("currency", &self.currency.code)
            .field("network_type", &self.network_type)
            .finish()
    }
}
