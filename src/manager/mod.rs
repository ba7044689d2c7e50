//! Wallet manager
//!
//! One `WalletManager` runs one account on one network. It owns the wallets,
//! drives the connect/sync lifecycle, turns client announcements into reconciled
//! transfers and forwards every change to its listener.
//!
//! Compound operations (transfer creation, signing, submission, announcements)
//! are serialized by the manager's operation lock; wallet and transfer state is
//! only mutated while it is held.

pub mod client;
pub mod file_service;
pub mod reconcile;
pub mod replay;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::entity::EntityId;
use crate::error::{Error, Result};
use crate::handler::{ChainHandler, HandlerRegistry, P2pManager, TransferLimit};
use crate::listener::{Listener, ManagerEvent, WalletEvent};
use crate::network::{Address, AddressScheme, CurrencyAssociation, Network, NetworkFee, SyncMode, TxHash};
use crate::wallet::{
    Account, Credential, FeeBasis, SubmitError, Transfer, TransferAttribute, TransferState, Wallet,
};

use client::{Client, ClientError, ClientRequestStyle, FeeEstimate, TransactionBundle, TransferBundle};
use file_service::FileService;
use reconcile::ReconcileOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletManagerState {
    Created,
    Connected,
    Syncing,
    Disconnected,
    Deleted,
}

impl fmt::Display for WalletManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Connected => "connected",
            Self::Syncing => "syncing",
            Self::Disconnected => "disconnected",
            Self::Deleted => "deleted",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStoppedReason {
    Complete,
    Requested,
    ClientFailure(String),
}

/// How far back a sync reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDepth {
    FromLastConfirmedSend,
    FromLastTrustedBlock,
    FromCreation,
}

/// Everything a family handler needs to allocate a manager
pub struct ManagerInit {
    pub handler: Arc<dyn ChainHandler>,
    pub listener: Arc<Listener>,
    pub client: Arc<dyn Client>,
    pub account: Arc<Account>,
    pub network: Arc<Network>,
    pub sync_mode: SyncMode,
    pub address_scheme: AddressScheme,
    /// Account addresses parsed for the network, primary first
    pub addresses: Vec<Address>,
    pub file_service: Option<FileService>,
}

/// A deferred fee estimate waiting for its client answer
struct PendingEstimate {
    wallet: Arc<Wallet>,
    network_fee: NetworkFee,
    initial: FeeBasis,
}

#[derive(Debug)]
struct ManagerStatus {
    state: WalletManagerState,
    sync_mode: SyncMode,
    address_scheme: AddressScheme,
}

pub struct WalletManager {
    id: EntityId,
    me: Weak<WalletManager>,
    handler: Arc<dyn ChainHandler>,
    listener: Arc<Listener>,
    client: Arc<dyn Client>,
    account: Arc<Account>,
    network: Arc<Network>,
    request_style: ClientRequestStyle,
    addresses: Vec<Address>,
    file_service: Option<FileService>,
    operation: Mutex<()>,
    status: Mutex<ManagerStatus>,
    wallets: RwLock<Vec<Arc<Wallet>>>,
    pending_estimates: Mutex<HashMap<u64, PendingEstimate>>,
    p2p: Mutex<Option<Arc<dyn P2pManager>>>,
    next_rid: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl WalletManager {
    /// Create a manager for `account` on `network`
    ///
    /// Selects the family handler, opens the file service under `storage_path`,
    /// creates the primary wallet and replays persisted bundles.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        registry: &HandlerRegistry,
        listener: Arc<Listener>,
        client: Arc<dyn Client>,
        account: Arc<Account>,
        network: Arc<Network>,
        sync_mode: SyncMode,
        address_scheme: AddressScheme,
        storage_path: Option<&Path>,
    ) -> Result<Arc<Self>> {
        let network_type = network.network_type();
        let handler = registry.get(network_type)?;

        if !address_scheme.is_supported_by(network_type) {
            return Err(Error::unsupported(network_type, "address scheme"));
        }

        let addresses = account
            .addresses_for(network.uids())
            .iter()
            .map(|a| handler.create_address(&network, a))
            .collect::<Result<Vec<_>>>()?;
        if addresses.is_empty() {
            return Err(Error::InvalidAddress(format!(
                "account {} has no address on {}",
                account.uids(),
                network.uids()
            )));
        }

        let association = network.native_association()?;
        let file_service = storage_path
            .map(|path| {
                handler.create_file_service(path, &association.currency.code, network.uids())
            })
            .transpose()?;

        let manager = handler.create_wallet_manager(ManagerInit {
            handler: handler.clone(),
            listener,
            client,
            account,
            network,
            sync_mode,
            address_scheme,
            addresses,
            file_service,
        })?;
        manager.signal(ManagerEvent::Created);

        if sync_mode.is_p2p() {
            match handler.create_p2p_manager(&manager) {
                Some(p2p) => *lock(&manager.p2p) = Some(p2p),
                None => {
                    warn!(
                        network = %manager.network.uids(),
                        mode = %sync_mode,
                        "No P2P sync on this network, using the API"
                    );
                    lock(&manager.status).sync_mode = SyncMode::ApiOnly;
                }
            }
        }

        manager.create_wallet(&association)?;
        manager.replay_persisted();

        info!(
            manager = %manager.id,
            network = %manager.network.uids(),
            addresses = manager.addresses.len(),
            "Wallet manager created"
        );
        Ok(manager)
    }

    /// Allocate the manager; called by the family handler
    pub(crate) fn alloc(init: ManagerInit, request_style: ClientRequestStyle) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: EntityId::new(),
            me: me.clone(),
            handler: init.handler,
            listener: init.listener,
            client: init.client,
            account: init.account,
            network: init.network,
            request_style,
            addresses: init.addresses,
            file_service: init.file_service,
            operation: Mutex::new(()),
            status: Mutex::new(ManagerStatus {
                state: WalletManagerState::Created,
                sync_mode: init.sync_mode,
                address_scheme: init.address_scheme,
            }),
            wallets: RwLock::new(Vec::new()),
            pending_estimates: Mutex::new(HashMap::new()),
            p2p: Mutex::new(None),
            next_rid: AtomicU64::new(0),
        })
    }

    // --- Accessors ---------------------------------------------------------------

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn account(&self) -> &Arc<Account> {
        &self.account
    }

    pub fn handler(&self) -> &Arc<dyn ChainHandler> {
        &self.handler
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn request_style(&self) -> ClientRequestStyle {
        self.request_style
    }

    pub fn file_service(&self) -> Option<&FileService> {
        self.file_service.as_ref()
    }

    pub fn state(&self) -> WalletManagerState {
        lock(&self.status).state
    }

    pub fn sync_mode(&self) -> SyncMode {
        lock(&self.status).sync_mode
    }

    pub fn address_scheme(&self) -> AddressScheme {
        lock(&self.status).address_scheme
    }

    pub fn wallets(&self) -> Vec<Arc<Wallet>> {
        self.wallets.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The wallet of the network's native currency; gone once the manager is released
    pub fn primary_wallet(&self) -> Result<Arc<Wallet>> {
        self.wallets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .first()
            .cloned()
            .ok_or(Error::ManagerReleased)
    }

    pub fn wallet_for_currency(&self, code: &str) -> Option<Arc<Wallet>> {
        self.wallets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|w| w.currency().code.eq_ignore_ascii_case(code))
            .cloned()
    }

    fn next_rid(&self) -> u64 {
        self.next_rid.fetch_add(1, Ordering::Relaxed)
    }

    fn strong(&self) -> Result<Arc<Self>> {
        self.me.upgrade().ok_or(Error::ManagerReleased)
    }

    /// Client answers arriving after `release` find no wallets to reconcile into
    fn ensure_live(&self) -> Result<()> {
        if self.state() == WalletManagerState::Deleted {
            return Err(Error::ManagerReleased);
        }
        Ok(())
    }

    fn signal(&self, event: ManagerEvent) {
        let Some(manager) = self.me.upgrade() else {
            debug!(manager = %self.id, "Manager event dropped; manager released");
            return;
        };
        if let Err(e) = self.listener.signal_manager_event(manager, event) {
            debug!(manager = %self.id, error = %e, "Manager event not delivered");
        }
    }

    /// Move to `new` if the current state is one of `from`
    fn transition(
        &self,
        from: &[WalletManagerState],
        new: WalletManagerState,
    ) -> Result<WalletManagerState> {
        let old = {
            let mut status = lock(&self.status);
            if !from.contains(&status.state) {
                return Err(Error::InvalidStateTransition {
                    from: status.state.to_string(),
                    to: new.to_string(),
                });
            }
            std::mem::replace(&mut status.state, new)
        };
        debug!(manager = %self.id, %old, %new, "Manager state changed");
        self.signal(ManagerEvent::Changed { old, new });
        Ok(old)
    }

    fn p2p(&self) -> Option<Arc<dyn P2pManager>> {
        lock(&self.p2p).clone()
    }

    // --- Lifecycle ---------------------------------------------------------------

    pub fn connect(&self) -> Result<()> {
        use WalletManagerState::*;
        self.transition(&[Created, Disconnected], Connected)?;

        match self.p2p() {
            Some(p2p) => p2p.connect(),
            None => {
                let manager = self.strong()?;
                self.client.get_block_number(&manager, self.next_rid());
            }
        }
        Ok(())
    }

    /// Full sync from the account creation
    pub fn sync(&self) -> Result<()> {
        self.sync_to_depth(SyncDepth::FromCreation)
    }

    pub fn sync_to_depth(&self, depth: SyncDepth) -> Result<()> {
        use WalletManagerState::*;
        self.transition(&[Connected], Syncing)?;
        self.signal(ManagerEvent::SyncStarted);

        if let Some(p2p) = self.p2p() {
            p2p.sync(depth);
            return Ok(());
        }

        let begin_block = self.sync_begin_block(depth);
        let end_block = self.network.height().max(begin_block) + 1;
        let addresses: Vec<String> = self.addresses.iter().map(|a| a.to_string()).collect();
        let manager = self.strong()?;
        let rid = self.next_rid();
        info!(
            manager = %self.id,
            rid,
            begin_block,
            end_block,
            ?depth,
            "Requesting sync from client"
        );
        match self.request_style {
            ClientRequestStyle::Transfers => {
                self.client
                    .get_transfers(&manager, rid, addresses, begin_block, end_block)
            }
            ClientRequestStyle::Transactions => {
                self.client
                    .get_transactions(&manager, rid, addresses, begin_block, end_block)
            }
        }
        Ok(())
    }

    fn sync_begin_block(&self, depth: SyncDepth) -> u64 {
        let creation_block = self
            .handler
            .estimate_block_number_at_or_before_timestamp(&self.network, self.account.timestamp());
        match depth {
            SyncDepth::FromCreation => creation_block,
            SyncDepth::FromLastTrustedBlock => {
                let now = chrono::Utc::now().timestamp().max(0) as u64;
                self.handler
                    .estimate_block_number_at_or_before_timestamp(&self.network, now)
                    .max(creation_block)
            }
            SyncDepth::FromLastConfirmedSend => self
                .primary_wallet()
                .map(|wallet| wallet.transfers())
                .unwrap_or_default()
                .into_iter()
                .filter(|t| t.direction() != crate::wallet::TransferDirection::Received)
                .filter_map(|t| match t.state() {
                    TransferState::Included(inclusion) => Some(inclusion.block_number),
                    _ => None,
                })
                .max()
                .unwrap_or(creation_block),
        }
    }

    /// Client progress report during a sync
    pub fn announce_sync_progress(&self, timestamp: Option<u64>, percent_complete: f32) {
        if self.state() != WalletManagerState::Syncing {
            debug!(manager = %self.id, "Sync progress outside of a sync ignored");
            return;
        }
        self.signal(ManagerEvent::SyncContinues {
            timestamp,
            percent_complete: percent_complete.clamp(0.0, 100.0),
        });
    }

    fn finish_sync(&self, reason: SyncStoppedReason) {
        if self
            .transition(&[WalletManagerState::Syncing], WalletManagerState::Connected)
            .is_ok()
        {
            self.signal(ManagerEvent::SyncStopped { reason });
        }
    }

    pub fn disconnect(&self) -> Result<()> {
        use WalletManagerState::*;
        let old = self.transition(&[Connected, Syncing], Disconnected)?;
        if old == Syncing {
            self.signal(ManagerEvent::SyncStopped {
                reason: SyncStoppedReason::Requested,
            });
        }
        if let Some(p2p) = self.p2p() {
            p2p.disconnect();
        }
        Ok(())
    }

    /// Select how the manager syncs and submits
    ///
    /// P2P modes need a P2P manager from the family handler.
    pub fn set_mode(&self, mode: SyncMode) -> Result<()> {
        if mode.is_p2p() {
            if self.p2p().is_none() {
                let manager = self.strong()?;
                let p2p = self
                    .handler
                    .create_p2p_manager(&manager)
                    .ok_or_else(|| Error::unsupported(self.network.network_type(), "P2P sync mode"))?;
                *lock(&self.p2p) = Some(p2p);
            }
        } else {
            *lock(&self.p2p) = None;
        }
        lock(&self.status).sync_mode = mode;
        info!(manager = %self.id, %mode, "Sync mode set");
        Ok(())
    }

    /// Ask the listener's application to sync, e.g. after a gap was detected
    pub fn recommend_sync(&self, depth: SyncDepth) {
        self.signal(ManagerEvent::SyncRecommended { depth });
    }

    // --- Wallets -----------------------------------------------------------------

    /// Create the wallet of `association`, or return the existing one
    pub fn create_wallet(&self, association: &CurrencyAssociation) -> Result<Arc<Wallet>> {
        self.ensure_live()?;
        if let Some(wallet) = self.wallet_for_currency(&association.currency.code) {
            return Ok(wallet);
        }
        let manager = self.strong()?;
        let wallet = self.handler.create_wallet(&manager, association)?;
        self.wallets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(wallet.clone());

        wallet.signal(WalletEvent::Created);
        self.signal(ManagerEvent::WalletAdded {
            wallet: wallet.clone(),
        });
        debug!(manager = %self.id, wallet = %wallet.id(), currency = %association.currency.code, "Wallet added");
        Ok(wallet)
    }

    // --- Transfers ---------------------------------------------------------------

    pub fn create_transfer(
        &self,
        wallet: &Wallet,
        target: &Address,
        amount: u64,
        fee_basis: FeeBasis,
        attributes: Vec<TransferAttribute>,
    ) -> Result<Arc<Transfer>> {
        let _op = lock(&self.operation);
        self.ensure_live()?;
        if let Some(missing) = attributes
            .iter()
            .find(|a| a.is_required && a.value.is_none())
        {
            return Err(Error::MissingAttribute(missing.key.clone()));
        }

        let transfer = self
            .handler
            .create_transfer(self, wallet, target, amount, fee_basis, attributes)?;
        wallet.add_transfer(&transfer);
        debug!(manager = %self.id, transfer = %transfer.id(), amount, "Transfer created");
        Ok(transfer)
    }

    /// Sign `transfer`; on success it is `Signed`, on failure it is left untouched
    pub fn sign_transaction(
        &self,
        wallet: &Wallet,
        transfer: &Arc<Transfer>,
        credential: &Credential,
    ) -> Result<()> {
        let _op = lock(&self.operation);
        let state = transfer.state();
        if state != TransferState::Created {
            return Err(Error::InvalidStateTransition {
                from: state.to_string(),
                to: TransferState::Signed.to_string(),
            });
        }

        match credential {
            Credential::Seed(seed) => self
                .handler
                .sign_transaction_with_seed(self, wallet, transfer, seed)?,
            Credential::Key(key) => self
                .handler
                .sign_transaction_with_key(self, wallet, transfer, key)?,
        }
        wallet.set_transfer_state(transfer, TransferState::Signed);
        info!(manager = %self.id, transfer = %transfer.id(), hash = ?transfer.hash(), "Transfer signed");
        Ok(())
    }

    /// Mark `transfer` submitted and hand it to the client (or the P2P engine)
    pub fn submit_transfer(&self, wallet: &Wallet, transfer: &Arc<Transfer>) -> Result<()> {
        let _op = lock(&self.operation);
        let state = transfer.state();
        let serialization = match (&state, transfer.serialization()) {
            (TransferState::Signed, Some(bytes)) => bytes,
            _ => {
                return Err(Error::InvalidStateTransition {
                    from: state.to_string(),
                    to: TransferState::Submitted.to_string(),
                })
            }
        };

        wallet.set_transfer_state(transfer, TransferState::Submitted);
        wallet.signal(WalletEvent::TransferSubmitted {
            transfer: transfer.clone(),
        });

        match self.p2p() {
            Some(p2p) => p2p.send(transfer.clone()),
            None => {
                let manager = self.strong()?;
                self.client
                    .submit_transaction(&manager, transfer.clone(), serialization);
            }
        }
        info!(manager = %self.id, hash = ?transfer.hash(), "Transfer submitted");
        Ok(())
    }

    /// Drop a transfer that never reached the chain: one still `Created` or one `Errored`
    pub fn delete_transfer(&self, wallet: &Arc<Wallet>, transfer: &Arc<Transfer>) -> Result<()> {
        let _op = lock(&self.operation);
        self.ensure_live()?;
        let state = transfer.state();
        if !matches!(state, TransferState::Created | TransferState::Errored(_))
            || !wallet.has_transfer(transfer)
        {
            return Err(Error::InvalidStateTransition {
                from: state.to_string(),
                to: TransferState::Deleted.to_string(),
            });
        }

        wallet.remove_transfer(transfer);
        self.signal(ManagerEvent::WalletChanged {
            wallet: wallet.clone(),
        });
        debug!(manager = %self.id, transfer = %transfer.id(), "Transfer deleted");
        Ok(())
    }

    pub fn estimate_limit(
        &self,
        wallet: &Wallet,
        as_maximum: bool,
        target: &Address,
        network_fee: &NetworkFee,
    ) -> Result<TransferLimit> {
        self.handler
            .estimate_transfer_limit(self, wallet, as_maximum, target, network_fee)
    }

    /// Estimate the fee of a prospective transfer
    ///
    /// The answer arrives as `WalletEvent::FeeBasisEstimated { cookie, .. }`, either
    /// right away or once the client answers `announce_estimate_transfer_fee`.
    #[allow(clippy::too_many_arguments)]
    pub fn estimate_fee_basis(
        &self,
        wallet: &Arc<Wallet>,
        cookie: u64,
        target: &Address,
        amount: u64,
        network_fee: &NetworkFee,
        attributes: &[TransferAttribute],
    ) -> Result<()> {
        let _op = lock(&self.operation);
        self.ensure_live()?;
        let manager = self.strong()?;
        match self.handler.estimate_fee_basis(
            &manager,
            wallet,
            cookie,
            target,
            amount,
            network_fee,
            attributes,
        ) {
            Ok(Some(fee_basis)) => {
                wallet.signal(WalletEvent::FeeBasisEstimated {
                    cookie,
                    result: Ok(fee_basis),
                });
                Ok(())
            }
            Ok(None) => {
                debug!(manager = %self.id, cookie, "Fee estimate deferred to client");
                Ok(())
            }
            Err(e) => {
                wallet.signal(WalletEvent::FeeBasisEstimated {
                    cookie,
                    result: Err(e.to_string()),
                });
                Err(e)
            }
        }
    }

    /// Remember a deferred estimate; the handler registers it before asking the client
    pub(crate) fn register_fee_estimate(
        &self,
        cookie: u64,
        wallet: Arc<Wallet>,
        network_fee: NetworkFee,
        initial: FeeBasis,
    ) {
        lock(&self.pending_estimates).insert(
            cookie,
            PendingEstimate {
                wallet,
                network_fee,
                initial,
            },
        );
    }

    pub fn pending_fee_estimates(&self) -> usize {
        lock(&self.pending_estimates).len()
    }

    // --- Client announcements ----------------------------------------------------

    pub fn announce_block_number(&self, rid: u64, height: u64, verified_block_hash: Option<TxHash>) {
        if self.ensure_live().is_err() {
            debug!(manager = %self.id, rid, "Block number for a released manager ignored");
            return;
        }
        if let Some(hash) = verified_block_hash {
            self.network.set_verified_block_hash(hash);
        }
        if self.network.set_height(height) {
            debug!(manager = %self.id, rid, height, "Block height updated");
            self.signal(ManagerEvent::BlockHeightUpdated { height });
        }
    }

    /// Reconcile transfer bundles; returns how many were applied
    pub fn announce_transfers(
        &self,
        rid: u64,
        result: std::result::Result<Vec<TransferBundle>, ClientError>,
    ) -> Result<usize> {
        let _op = lock(&self.operation);
        self.ensure_live()?;
        let bundles = self.bundles_or_stop(rid, result)?;
        let applied = self.reconcile_bundles(&bundles, true, |bundle| {
            self.handler.recover_transfer_from_transfer_bundle(self, bundle)
        });
        self.finish_sync(SyncStoppedReason::Complete);
        Ok(applied)
    }

    /// Reconcile raw transaction bundles; returns how many were applied
    pub fn announce_transactions(
        &self,
        rid: u64,
        result: std::result::Result<Vec<TransactionBundle>, ClientError>,
    ) -> Result<usize> {
        let _op = lock(&self.operation);
        self.ensure_live()?;
        let bundles = self.bundles_or_stop(rid, result)?;
        let applied = self.reconcile_bundles(&bundles, true, |bundle| {
            self.handler
                .recover_transfers_from_transaction_bundle(self, bundle)
        });
        self.finish_sync(SyncStoppedReason::Complete);
        Ok(applied)
    }

    fn bundles_or_stop<B>(
        &self,
        rid: u64,
        result: std::result::Result<Vec<B>, ClientError>,
    ) -> Result<Vec<B>> {
        result.map_err(|e| {
            warn!(manager = %self.id, rid, error = %e, "Client sync request failed");
            self.finish_sync(SyncStoppedReason::ClientFailure(e.0.clone()));
            Error::Client(e.0)
        })
    }

    /// Apply each bundle; a bundle with a data error is skipped, the rest go on
    fn reconcile_bundles<B, F>(&self, bundles: &[B], persist: bool, recover: F) -> usize
    where
        B: Serialize,
        F: Fn(&B) -> Result<ReconcileOutcome>,
    {
        let mut applied = 0;
        for bundle in bundles {
            match recover(bundle) {
                Ok(outcome) => {
                    applied += 1;
                    if persist {
                        self.persist(&outcome, bundle);
                    }
                }
                Err(e) if e.is_data_error() => {
                    warn!(manager = %self.id, error = %e, "Bundle rejected");
                }
                Err(e) => {
                    warn!(manager = %self.id, error = %e, "Bundle not reconciled");
                }
            }
        }
        applied
    }

    fn persist<B: Serialize>(&self, outcome: &ReconcileOutcome, bundle: &B) {
        let (Some(service), Some(hash)) = (&self.file_service, outcome.transfer.hash()) else {
            return;
        };
        let key = reconcile::storage_key(&hash, outcome.transfer.is_burn());
        if let Err(e) = service.save(&key, bundle) {
            warn!(manager = %self.id, %key, error = %e, "Bundle not persisted");
        }
    }

    /// Re-reconcile every persisted bundle
    fn replay_persisted(&self) {
        let Some(service) = &self.file_service else {
            return;
        };
        let _op = lock(&self.operation);
        let applied = match self.request_style {
            ClientRequestStyle::Transfers => match service.load_all::<TransferBundle>() {
                Ok(bundles) => self.reconcile_bundles(&bundles, false, |bundle| {
                    self.handler.recover_transfer_from_transfer_bundle(self, bundle)
                }),
                Err(e) => {
                    warn!(manager = %self.id, error = %e, "Persisted transfers not loaded");
                    0
                }
            },
            ClientRequestStyle::Transactions => match service.load_all::<TransactionBundle>() {
                Ok(bundles) => self.reconcile_bundles(&bundles, false, |bundle| {
                    self.handler
                        .recover_transfers_from_transaction_bundle(self, bundle)
                }),
                Err(e) => {
                    warn!(manager = %self.id, error = %e, "Persisted transactions not loaded");
                    0
                }
            },
        };
        if applied > 0 {
            info!(manager = %self.id, applied, "Persisted bundles replayed");
        }
    }

    /// Client verdict on a submission
    pub fn announce_submit(
        &self,
        transfer: &Arc<Transfer>,
        result: std::result::Result<(), ClientError>,
    ) {
        let _op = lock(&self.operation);
        if self.ensure_live().is_err() {
            warn!(manager = %self.id, transfer = %transfer.id(), "Submit result for a released manager");
            return;
        }
        let Some(wallet) = self.wallets().into_iter().find(|w| w.has_transfer(transfer)) else {
            warn!(manager = %self.id, transfer = %transfer.id(), "Submit result for an unknown transfer");
            return;
        };
        match result {
            Ok(()) => debug!(manager = %self.id, hash = ?transfer.hash(), "Submission accepted"),
            Err(e) => {
                warn!(manager = %self.id, hash = ?transfer.hash(), error = %e, "Submission rejected");
                wallet.set_transfer_state(transfer, TransferState::Errored(SubmitError::Rejected(e.0)));
            }
        }
    }

    /// Client answer to a deferred fee estimate
    pub fn announce_estimate_transfer_fee(
        &self,
        cookie: u64,
        result: std::result::Result<FeeEstimate, ClientError>,
    ) -> Result<()> {
        let _op = lock(&self.operation);
        self.ensure_live()?;
        let pending = lock(&self.pending_estimates)
            .remove(&cookie)
            .ok_or(Error::UnknownCookie(cookie))?;

        let result = match result {
            Ok(estimate) => self
                .handler
                .recover_fee_basis_from_fee_estimate(
                    self,
                    &pending.network_fee,
                    &pending.initial,
                    &estimate,
                )
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(reason) = &result {
            warn!(manager = %self.id, cookie, %reason, "Fee estimate failed");
        }
        pending
            .wallet
            .signal(WalletEvent::FeeBasisEstimated { cookie, result });
        Ok(())
    }

    // --- Teardown ----------------------------------------------------------------

    /// Disconnect, delete every wallet and hand this reference to the listener
    pub fn release(self: Arc<Self>) {
        if matches!(
            self.state(),
            WalletManagerState::Connected | WalletManagerState::Syncing
        ) {
            if let Err(e) = self.disconnect() {
                debug!(manager = %self.id, error = %e, "Disconnect during release failed");
            }
        }
        self.handler.release_wallet_manager(&self);
        lock(&self.pending_estimates).clear();
        lock(&self.p2p).take();

        let old = std::mem::replace(&mut lock(&self.status).state, WalletManagerState::Deleted);
        self.signal(ManagerEvent::Changed {
            old,
            new: WalletManagerState::Deleted,
        });

        let wallets = std::mem::take(&mut *self.wallets.write().unwrap_or_else(|e| e.into_inner()));
        for wallet in wallets {
            self.signal(ManagerEvent::WalletDeleted {
                wallet: wallet.clone(),
            });
            wallet.release(self.clone());
        }

        info!(manager = %self.id, network = %self.network.uids(), "Wallet manager released");
        let listener = self.listener.clone();
        if let Err(e) = listener.signal_manager_event(self, ManagerEvent::Deleted) {
            debug!(error = %e, "Manager deletion not delivered");
        }
    }
}

impl fmt::Debug for WalletManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletManager")
            .field("id", &self.id)
            .field("network", &self.network.uids())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkType;
    use crate::test_support::{self, ManagerHarness};

    #[test]
    fn test_create_emits_created_then_wallet_added() {
        let harness = ManagerHarness::new(NetworkType::Btc);
        assert_eq!(harness.manager.wallets().len(), 1);
        assert_eq!(harness.manager.request_style(), ClientRequestStyle::Transactions);
        harness.finish();

        let labels = harness.recorder.manager_labels();
        assert_eq!(&labels[..2], &["created".to_string(), "wallet_added".to_string()]);
    }

    #[test]
    fn test_request_style_per_family() {
        let harness = ManagerHarness::new(NetworkType::Xtz);
        assert_eq!(harness.manager.request_style(), ClientRequestStyle::Transfers);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let harness = ManagerHarness::new(NetworkType::Xtz);
        let manager = &harness.manager;

        assert!(matches!(manager.sync(), Err(Error::InvalidStateTransition { .. })));
        manager.connect().unwrap();
        assert_eq!(manager.state(), WalletManagerState::Connected);
        assert_eq!(harness.client.count("get_block_number"), 1);

        manager.sync().unwrap();
        assert_eq!(manager.state(), WalletManagerState::Syncing);
        assert_eq!(harness.client.count("get_transfers"), 1);

        manager.announce_transfers(0, Ok(vec![])).unwrap();
        assert_eq!(manager.state(), WalletManagerState::Connected);

        manager.disconnect().unwrap();
        assert!(manager.disconnect().is_err());
        manager.connect().unwrap();
        harness.finish();

        let labels = harness.recorder.manager_labels();
        assert!(labels.contains(&"sync_started".to_string()));
        assert!(labels.contains(&"sync_stopped".to_string()));
    }

    #[test]
    fn test_client_failure_stops_sync() {
        let harness = ManagerHarness::new(NetworkType::Btc);
        let manager = &harness.manager;
        manager.connect().unwrap();
        manager.sync().unwrap();
        assert_eq!(harness.client.count("get_transactions"), 1);

        let result = manager.announce_transactions(1, Err(ClientError("timeout".into())));
        assert!(matches!(result, Err(Error::Client(_))));
        assert_eq!(manager.state(), WalletManagerState::Connected);
    }

    #[test]
    fn test_p2p_mode_rejected_without_p2p() {
        let harness = ManagerHarness::new(NetworkType::Xtz);
        let err = harness.manager.set_mode(SyncMode::P2pOnly).unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!(harness.manager.sync_mode(), SyncMode::ApiOnly);
        harness.manager.set_mode(SyncMode::ApiWithP2pSend).unwrap_err();
    }

    #[test]
    fn test_sync_progress_only_while_syncing() {
        let harness = ManagerHarness::new(NetworkType::Xtz);
        harness.manager.announce_sync_progress(None, 10.0);
        harness.manager.connect().unwrap();
        harness.manager.sync().unwrap();
        harness.manager.announce_sync_progress(Some(1_600_000_000), 150.0);
        harness.finish();

        let progress: Vec<_> = harness
            .recorder
            .manager_labels()
            .into_iter()
            .filter(|l| l == "sync_continues")
            .collect();
        assert_eq!(progress.len(), 1);
    }

    #[test]
    fn test_block_number_announcement() {
        let harness = ManagerHarness::new(NetworkType::Btc);
        harness.manager.announce_block_number(0, 700_000, None);
        harness.manager.announce_block_number(1, 700_000, None);
        assert_eq!(harness.manager.network().height(), 700_000);
        harness.finish();

        let updates = harness
            .recorder
            .manager_labels()
            .into_iter()
            .filter(|l| l == "block_height_updated")
            .count();
        assert_eq!(updates, 1);
    }

    #[test]
    fn test_unknown_cookie() {
        let harness = ManagerHarness::new(NetworkType::Xtz);
        let err = harness
            .manager
            .announce_estimate_transfer_fee(99, Err(ClientError("nope".into())))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownCookie(99)));
    }

    #[test]
    fn test_required_attribute_must_have_value() {
        let harness = ManagerHarness::new(NetworkType::Xtz);
        let wallet = harness.manager.primary_wallet().unwrap();
        let attribute = TransferAttribute {
            key: "memo".into(),
            value: None,
            is_required: true,
        };
        let err = harness
            .manager
            .create_transfer(
                &wallet,
                &harness.foreign_address(2),
                10,
                test_support::xtz_fee_basis(),
                vec![attribute],
            )
            .unwrap_err();
        assert!(matches!(err, Error::MissingAttribute(key) if key == "memo"));
    }

    #[test]
    fn test_sign_and_submit() {
        let harness = ManagerHarness::new(NetworkType::Btc);
        let manager = &harness.manager;
        let wallet = manager.primary_wallet().unwrap();

        let transfer = manager
            .create_transfer(&wallet, &harness.foreign_address(2), 10_000, FeeBasis::bitcoin(1_000, 250), vec![])
            .unwrap();
        assert!(matches!(
            manager.submit_transfer(&wallet, &transfer),
            Err(Error::InvalidStateTransition { .. })
        ));

        // An empty key produces no serialization
        let err = manager
            .sign_transaction(&wallet, &transfer, &Credential::Key(vec![]))
            .unwrap_err();
        assert!(matches!(err, Error::SigningFailed(_)));
        assert_eq!(transfer.state(), TransferState::Created);

        manager
            .sign_transaction(&wallet, &transfer, &Credential::Seed([5u8; 64]))
            .unwrap();
        assert_eq!(transfer.state(), TransferState::Signed);
        assert!(transfer.hash().is_some());

        manager.submit_transfer(&wallet, &transfer).unwrap();
        assert_eq!(transfer.state(), TransferState::Submitted);
        assert_eq!(harness.client.count("submit_transaction"), 1);

        manager.announce_submit(&transfer, Err(ClientError("insufficient fee".into())));
        assert_eq!(
            transfer.state(),
            TransferState::Errored(SubmitError::Rejected("insufficient fee".into()))
        );
    }

    fn included_bundle(harness: &ManagerHarness, hash: u8) -> TransferBundle {
        TransferBundle {
            status: client::TransferStatus::Included,
            hash: TxHash::new(NetworkType::Xtz, [hash; 32]).encode(),
            identifier: None,
            from: harness.foreign_address(2).to_string(),
            to: harness.own_address().to_string(),
            amount: "7000".to_string(),
            currency: "xtz".to_string(),
            fee: Some("1300".to_string()),
            block_number: 120,
            block_transaction_index: 3,
            block_timestamp: 1_600_000_500,
            attributes: vec![("destination_counter".to_string(), "4".to_string())],
        }
    }

    #[test]
    fn test_persisted_bundles_survive_restart() {
        let harness = ManagerHarness::new(NetworkType::Xtz);
        let applied = harness
            .manager
            .announce_transfers(0, Ok(vec![included_bundle(&harness, 1), included_bundle(&harness, 2)]))
            .unwrap();
        assert_eq!(applied, 2);

        let network = test_support::xtz_mainnet(Some(harness.listener.clone()));
        network.set_fees(vec![test_support::network_fee(NetworkType::Xtz)]);
        let restarted = WalletManager::create(
            &test_support::registry(),
            harness.listener.clone(),
            harness.client.clone(),
            harness.manager.account().clone(),
            network,
            SyncMode::ApiOnly,
            AddressScheme::Native,
            Some(harness.dir.path()),
        )
        .unwrap();

        let wallet = restarted.primary_wallet().unwrap();
        assert_eq!(wallet.transfer_count(), 2);
        assert_eq!(wallet.counter(), 5);
        assert_eq!(wallet.balance(), 14_000);

        // The same bundle from the client again is not a new transfer
        restarted
            .announce_transfers(1, Ok(vec![included_bundle(&harness, 1)]))
            .unwrap();
        assert_eq!(wallet.transfer_count(), 2);
    }

    #[test]
    fn test_announcements_after_release_report_released() {
        let harness = ManagerHarness::new(NetworkType::Xtz);
        let bundle = included_bundle(&harness, 3);
        let wallet = harness.manager.primary_wallet().unwrap();
        let transfer = harness
            .manager
            .create_transfer(&wallet, &harness.foreign_address(2), 10, test_support::xtz_fee_basis(), vec![])
            .unwrap();
        let live = harness.manager.clone();
        let height = live.network().height();
        harness.manager.clone().release();

        assert!(matches!(live.primary_wallet(), Err(Error::ManagerReleased)));
        assert!(live.wallets().is_empty());
        assert!(matches!(
            live.announce_transfers(9, Ok(vec![bundle])),
            Err(Error::ManagerReleased)
        ));
        assert!(matches!(
            live.announce_transactions(10, Ok(vec![])),
            Err(Error::ManagerReleased)
        ));
        assert!(matches!(
            live.announce_estimate_transfer_fee(1, Err(ClientError("late".into()))),
            Err(Error::ManagerReleased)
        ));
        live.announce_block_number(11, 500, None);
        live.announce_submit(&transfer, Err(ClientError("late".into())));
        assert_eq!(live.network().height(), height);
        assert_eq!(transfer.state(), TransferState::Created);
        assert!(matches!(
            live.create_wallet(&live.network().native_association().unwrap()),
            Err(Error::ManagerReleased)
        ));
    }

    #[test]
    fn test_delete_transfer_only_before_submission() {
        let harness = ManagerHarness::new(NetworkType::Btc);
        let manager = &harness.manager;
        let wallet = manager.primary_wallet().unwrap();
        let pending = manager
            .create_transfer(&wallet, &harness.foreign_address(2), 10_000, FeeBasis::bitcoin(1_000, 250), vec![])
            .unwrap();
        let signed = manager
            .create_transfer(&wallet, &harness.foreign_address(3), 20_000, FeeBasis::bitcoin(1_000, 250), vec![])
            .unwrap();
        manager
            .sign_transaction(&wallet, &signed, &Credential::Seed([5u8; 64]))
            .unwrap();
        assert_eq!(wallet.transfer_count(), 2);

        assert!(matches!(
            manager.delete_transfer(&wallet, &signed),
            Err(Error::InvalidStateTransition { .. })
        ));
        manager.delete_transfer(&wallet, &pending).unwrap();
        assert_eq!(pending.state(), TransferState::Deleted);
        assert_eq!(wallet.transfer_count(), 1);
        assert!(!wallet.has_transfer(&pending));
        // Already gone
        assert!(manager.delete_transfer(&wallet, &pending).is_err());

        manager.submit_transfer(&wallet, &signed).unwrap();
        manager.announce_submit(&signed, Err(ClientError("rejected".into())));
        manager.delete_transfer(&wallet, &signed).unwrap();
        assert_eq!(wallet.transfer_count(), 0);
        harness.finish();

        let manager_labels = harness.recorder.manager_labels();
        assert_eq!(manager_labels.iter().filter(|l| *l == "wallet_changed").count(), 2);
        let wallet_labels = harness.recorder.wallet_labels();
        assert_eq!(wallet_labels.iter().filter(|l| *l == "transfer_deleted").count(), 2);
        assert!(harness.recorder.transfer_labels().contains(&"deleted".to_string()));
    }

    #[test]
    fn test_release_hands_last_references_to_listener() {
        let ManagerHarness {
            recorder,
            listener,
            manager,
            ..
        } = ManagerHarness::new(NetworkType::Xtz);
        let weak = Arc::downgrade(&manager);
        let wallet_weak = Arc::downgrade(&manager.primary_wallet().unwrap());
        manager.connect().unwrap();

        manager.release();
        listener.stop();

        assert!(weak.upgrade().is_none());
        assert!(wallet_weak.upgrade().is_none());
        let labels = recorder.manager_labels();
        assert_eq!(labels.last().map(String::as_str), Some("deleted"));
        assert!(labels.contains(&"wallet_deleted".to_string()));
        assert_eq!(recorder.wallet_labels().last().map(String::as_str), Some("deleted"));
    }
}
