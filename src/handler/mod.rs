//! Per-network handler dispatch
//!
//! Every chain family implements the whole `ChainHandler` contract. A capability a
//! family lacks answers with an explicit `Error::Unsupported` (or `None` where the
//! contract is optional, as for the P2P manager), never with a silent no-op, except
//! where a no-op is the real semantic (UTXO account initialization).
//!
//! `HandlerRegistry` maps a `NetworkType` to its handler; it is built once at start
//! and shared, so there is no global mutable table.

pub mod btc;
pub mod serializer;
pub mod xtz;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::manager::client::{FeeEstimate, TransactionBundle, TransferBundle};
use crate::manager::file_service::FileService;
use crate::manager::reconcile::ReconcileOutcome;
use crate::manager::{ManagerInit, SyncDepth, WalletManager};
use crate::network::{
    Address, CurrencyAssociation, Network, NetworkFee, NetworkSpec, NetworkType, TxHash,
};
use crate::wallet::{Account, FeeBasis, Transfer, TransferAttribute, Wallet};

pub use btc::BitcoinHandler;
pub use serializer::{DigestSerializer, TransactionSerializer};
pub use xtz::TezosHandler;

/// Answer of `estimate_transfer_limit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimit {
    /// Base units of the wallet currency
    pub amount: u64,
    /// The amount still has to be reduced by a fee estimate
    pub need_estimate: bool,
    /// Report zero rather than a negative amount when funds are short
    pub zero_if_insufficient_funds: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweeperStatus {
    Success,
    UnsupportedCurrency,
    InvalidKey,
    InvalidSourceWallet,
    InsufficientFunds,
}

/// Moves the funds controlled by a foreign private key into a wallet
pub trait WalletSweeper: Send + Sync {
    fn key_address(&self) -> Address;
    fn balance(&self) -> u64;
}

/// Peer-to-peer sync engine of a UTXO wallet manager
pub trait P2pManager: Send + Sync {
    fn connect(&self);
    fn disconnect(&self);
    fn sync(&self, depth: SyncDepth);
    fn send(&self, transfer: Arc<Transfer>);
}

/// Builds the P2P engine for a manager; peer networking itself lives outside the core
pub trait P2pManagerFactory: Send + Sync {
    fn create(&self, manager: &Arc<WalletManager>) -> Arc<dyn P2pManager>;
}

/// The per-family contract
///
/// Handlers panic when handed a network of another family: that is a caller bug.
pub trait ChainHandler: Send + Sync {
    fn network_type(&self) -> NetworkType;

    // --- Network -------------------------------------------------------------

    /// Create a network; `spec.desc` must be `mainnet` or `testnet` to match `is_mainnet`
    fn create_network(&self, listener: Option<Arc<Listener>>, spec: NetworkSpec) -> Arc<Network>;

    fn create_address(&self, network: &Network, address: &str) -> Result<Address>;

    /// Height of the latest checkpoint at or before `timestamp`, 0 if none
    fn estimate_block_number_at_or_before_timestamp(&self, network: &Network, timestamp: u64)
        -> u64;

    fn is_account_initialized(&self, network: &Network, account: &Account) -> bool;

    fn account_initialization_data(&self, network: &Network, account: &Account) -> Option<Vec<u8>>;

    fn initialize_account(&self, network: &Network, account: &Account, data: &[u8]) -> Result<()>;

    fn create_hash_from_string(&self, network: &Network, hash: &str) -> Result<TxHash>;

    fn encode_hash(&self, hash: &TxHash) -> String;

    // --- Wallet manager ------------------------------------------------------

    fn create_wallet_manager(&self, init: ManagerInit) -> Result<Arc<WalletManager>>;

    fn release_wallet_manager(&self, manager: &WalletManager);

    fn create_file_service(
        &self,
        base_path: &Path,
        currency: &str,
        network: &str,
    ) -> Result<FileService>;

    /// Names of the family-specific event types the manager produces
    fn event_types(&self) -> &'static [&'static str];

    /// Whether a P2P sync mode can run on this handler's managers
    fn supports_p2p(&self) -> bool;

    /// `None` means client-only sync: no P2P mode is available
    fn create_p2p_manager(&self, manager: &Arc<WalletManager>) -> Option<Arc<dyn P2pManager>>;

    fn create_wallet(
        &self,
        manager: &Arc<WalletManager>,
        association: &CurrencyAssociation,
    ) -> Result<Arc<Wallet>>;

    /// Build an outgoing transfer (not yet added to the wallet)
    fn create_transfer(
        &self,
        manager: &WalletManager,
        wallet: &Wallet,
        target: &Address,
        amount: u64,
        fee_basis: FeeBasis,
        attributes: Vec<TransferAttribute>,
    ) -> Result<Arc<Transfer>>;

    fn sign_transaction_with_seed(
        &self,
        manager: &WalletManager,
        wallet: &Wallet,
        transfer: &Transfer,
        seed: &[u8; 64],
    ) -> Result<()>;

    fn sign_transaction_with_key(
        &self,
        manager: &WalletManager,
        wallet: &Wallet,
        transfer: &Transfer,
        key: &[u8],
    ) -> Result<()>;

    fn estimate_transfer_limit(
        &self,
        manager: &WalletManager,
        wallet: &Wallet,
        as_maximum: bool,
        target: &Address,
        network_fee: &NetworkFee,
    ) -> Result<TransferLimit>;

    /// `Some` when the estimate is computed locally; `None` when the answer will
    /// arrive later through `recover_fee_basis_from_fee_estimate`, keyed by `cookie`
    #[allow(clippy::too_many_arguments)]
    fn estimate_fee_basis(
        &self,
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        cookie: u64,
        target: &Address,
        amount: u64,
        network_fee: &NetworkFee,
        attributes: &[TransferAttribute],
    ) -> Result<Option<FeeBasis>>;

    fn recover_transfers_from_transaction_bundle(
        &self,
        manager: &WalletManager,
        bundle: &TransactionBundle,
    ) -> Result<ReconcileOutcome>;

    fn recover_transfer_from_transfer_bundle(
        &self,
        manager: &WalletManager,
        bundle: &TransferBundle,
    ) -> Result<ReconcileOutcome>;

    fn recover_fee_basis_from_fee_estimate(
        &self,
        manager: &WalletManager,
        network_fee: &NetworkFee,
        initial: &FeeBasis,
        estimate: &FeeEstimate,
    ) -> Result<FeeBasis>;

    fn validate_sweeper_support(
        &self,
        manager: &WalletManager,
        wallet: &Wallet,
        key: &[u8],
    ) -> SweeperStatus;

    fn create_sweeper(
        &self,
        manager: &WalletManager,
        wallet: &Wallet,
        key: &[u8],
    ) -> Result<Arc<dyn WalletSweeper>>;
}

/// Panic unless `network` belongs to `expected`
pub(crate) fn assert_family(expected: NetworkType, network: &Network) {
    assert_eq!(
        expected,
        network.network_type(),
        "{} handler invoked with {} network {}",
        expected,
        network.network_type(),
        network.uids()
    );
}

/// Panic unless `desc` agrees with `is_mainnet`
pub(crate) fn assert_desc(spec: &NetworkSpec) {
    let expected = if spec.is_mainnet { "mainnet" } else { "testnet" };
    assert_eq!(
        spec.desc, expected,
        "network {} described as {} but is_mainnet = {}",
        spec.uids, spec.desc, spec.is_mainnet
    );
}

/// Handler lookup by network type
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<NetworkType, Arc<dyn ChainHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in family
    pub fn with_defaults(serializer: Arc<dyn TransactionSerializer>) -> Self {
        let mut registry = Self::new();
        for family in [NetworkType::Btc, NetworkType::Bch, NetworkType::Bsv] {
            registry.register(Arc::new(BitcoinHandler::new(family, serializer.clone())));
        }
        registry.register(Arc::new(TezosHandler::new(serializer)));
        registry
    }

    /// Register (or replace) the handler of its family
    pub fn register(&mut self, handler: Arc<dyn ChainHandler>) {
        self.handlers.insert(handler.network_type(), handler);
    }

    pub fn get(&self, network_type: NetworkType) -> Result<Arc<dyn ChainHandler>> {
        self.handlers
            .get(&network_type)
            .cloned()
            .ok_or_else(|| Error::UnknownNetworkType(network_type.to_string()))
    }

    pub fn network_types(&self) -> Vec<NetworkType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    pub fn create_network(
        &self,
        network_type: NetworkType,
        listener: Option<Arc<Listener>>,
        spec: NetworkSpec,
    ) -> Result<Arc<Network>> {
        Ok(self.get(network_type)?.create_network(listener, spec))
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("network_types", &self.network_types())
            .finish()
    }
}
