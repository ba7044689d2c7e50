//! Listener event types
//!
//! An event pairs a subject (with a strong reference taken when it was signalled)
//! and a reason. Subjects stay alive at least until the callback returns.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::entity::EntityKind;
use crate::manager::{SyncDepth, SyncStoppedReason, WalletManager, WalletManagerState};
use crate::network::Network;
use crate::wallet::fee::FeeBasis;
use crate::wallet::transfer::{Transfer, TransferState};
use crate::wallet::{Wallet, WalletState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Created,
    FeesUpdated,
    CurrenciesUpdated,
    Deleted,
}

#[derive(Debug, Clone)]
pub enum ManagerEvent {
    Created,
    Changed {
        old: WalletManagerState,
        new: WalletManagerState,
    },
    Deleted,
    WalletAdded {
        wallet: Arc<Wallet>,
    },
    WalletChanged {
        wallet: Arc<Wallet>,
    },
    WalletDeleted {
        wallet: Arc<Wallet>,
    },
    SyncStarted,
    SyncContinues {
        timestamp: Option<u64>,
        percent_complete: f32,
    },
    SyncStopped {
        reason: SyncStoppedReason,
    },
    SyncRecommended {
        depth: SyncDepth,
    },
    BlockHeightUpdated {
        height: u64,
    },
}

/// Outcome of a fee estimate correlated by cookie
pub type FeeEstimateResult = std::result::Result<FeeBasis, String>;

#[derive(Debug, Clone)]
pub enum WalletEvent {
    Created,
    Changed {
        old: WalletState,
        new: WalletState,
    },
    TransferAdded {
        transfer: Arc<Transfer>,
    },
    TransferChanged {
        transfer: Arc<Transfer>,
    },
    TransferSubmitted {
        transfer: Arc<Transfer>,
    },
    TransferDeleted {
        transfer: Arc<Transfer>,
    },
    BalanceUpdated {
        balance: u64,
    },
    FeeBasisUpdated {
        fee_basis: FeeBasis,
    },
    FeeBasisEstimated {
        cookie: u64,
        result: FeeEstimateResult,
    },
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Created,
    Changed {
        old: TransferState,
        new: TransferState,
    },
    Deleted,
}

impl NetworkEvent {
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::FeesUpdated => "fees_updated",
            Self::CurrenciesUpdated => "currencies_updated",
            Self::Deleted => "deleted",
        }
    }
}

impl ManagerEvent {
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Changed { .. } => "changed",
            Self::Deleted => "deleted",
            Self::WalletAdded { .. } => "wallet_added",
            Self::WalletChanged { .. } => "wallet_changed",
            Self::WalletDeleted { .. } => "wallet_deleted",
            Self::SyncStarted => "sync_started",
            Self::SyncContinues { .. } => "sync_continues",
            Self::SyncStopped { .. } => "sync_stopped",
            Self::SyncRecommended { .. } => "sync_recommended",
            Self::BlockHeightUpdated { .. } => "block_height_updated",
        }
    }
}

impl WalletEvent {
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Changed { .. } => "changed",
            Self::TransferAdded { .. } => "transfer_added",
            Self::TransferChanged { .. } => "transfer_changed",
            Self::TransferSubmitted { .. } => "transfer_submitted",
            Self::TransferDeleted { .. } => "transfer_deleted",
            Self::BalanceUpdated { .. } => "balance_updated",
            Self::FeeBasisUpdated { .. } => "fee_basis_updated",
            Self::FeeBasisEstimated { .. } => "fee_basis_estimated",
            Self::Deleted => "deleted",
        }
    }
}

impl TransferEvent {
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Changed { .. } => "changed",
            Self::Deleted => "deleted",
        }
    }
}

/// Subject plus reason, keyed by subject kind
#[derive(Debug, Clone)]
pub enum EventPayload {
    Network {
        network: Arc<Network>,
        event: NetworkEvent,
    },
    Manager {
        manager: Arc<WalletManager>,
        event: ManagerEvent,
    },
    Wallet {
        manager: Arc<WalletManager>,
        wallet: Arc<Wallet>,
        event: WalletEvent,
    },
    Transfer {
        manager: Arc<WalletManager>,
        wallet: Arc<Wallet>,
        transfer: Arc<Transfer>,
        event: TransferEvent,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Network { .. } => EntityKind::Network,
            Self::Manager { .. } => EntityKind::Manager,
            Self::Wallet { .. } => EntityKind::Wallet,
            Self::Transfer { .. } => EntityKind::Transfer,
        }
    }

    /// True for the terminal notification of the subject
    pub fn is_deleted(&self) -> bool {
        match self {
            Self::Network { event, .. } => event.is_deleted(),
            Self::Manager { event, .. } => event.is_deleted(),
            Self::Wallet { event, .. } => event.is_deleted(),
            Self::Transfer { event, .. } => event.is_deleted(),
        }
    }
}

/// A queued event
#[derive(Debug, Clone)]
pub struct ListenerEvent {
    /// Per-listener stamp, strictly increasing in queue order
    pub sequence: u64,
    pub signalled_at: DateTime<Utc>,
    pub payload: EventPayload,
}
