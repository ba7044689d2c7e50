//! Bitcoin-family handler (BTC, BCH, BSV)
//!
//! One implementation parameterised by family; the families differ only in their
//! static chain parameters (address encodings, fork id, checkpoints).

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use super::serializer::{SerializationContext, TransactionSerializer};
use super::{
    assert_desc, assert_family, ChainHandler, P2pManager, P2pManagerFactory, SweeperStatus,
    TransferLimit, WalletSweeper,
};
use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::manager::client::{ClientRequestStyle, FeeEstimate, TransactionBundle, TransferBundle};
use crate::manager::file_service::FileService;
use crate::manager::reconcile::{self, CounterRule, ReconcileOutcome, RecoveredRecord};
use crate::manager::{ManagerInit, WalletManager};
use crate::network::address::parse_bitcoin;
use crate::network::params::bitcoin_params;
use crate::network::{
    Address, CurrencyAssociation, Network, NetworkFee, NetworkParams, NetworkSpec, NetworkType,
    TxHash,
};
use crate::wallet::transfer::TxEndpoint;
use crate::wallet::{
    Account, Credential, FeeBasis, Transfer, TransferAttribute, TransferInit, TransferPayload,
    TransferState, Wallet, WalletInit,
};

/// Outputs below this many satoshis are not relayed
pub const DUST_LIMIT_SATOSHIS: u64 = 546;

/// Size assumed for the default fee basis of a new wallet: one input, two outputs
const DEFAULT_TX_SIZE: u64 = 226;

const TRANSACTIONS_FILE_TYPE: &str = "transactions";
const TRANSACTIONS_FILE_VERSION: u32 = 1;

const UTXO_EVENT_TYPES: &[&str] = &[
    "utxo: transaction bundle",
    "utxo: p2p sync",
    "utxo: p2p block",
];

pub struct BitcoinHandler {
    family: NetworkType,
    serializer: Arc<dyn TransactionSerializer>,
    p2p_factory: Option<Arc<dyn P2pManagerFactory>>,
}

impl BitcoinHandler {
    pub fn new(family: NetworkType, serializer: Arc<dyn TransactionSerializer>) -> Self {
        assert!(family.is_utxo(), "{} is not a bitcoin family", family);
        Self {
            family,
            serializer,
            p2p_factory: None,
        }
    }

    /// Enable P2P sync modes through `factory`
    pub fn with_p2p_factory(mut self, factory: Arc<dyn P2pManagerFactory>) -> Self {
        self.p2p_factory = Some(factory);
        self
    }

    fn context(&self, network: &Network) -> SerializationContext {
        SerializationContext {
            network_type: self.family,
            fork_id: network.bitcoin_params().fork_id,
            block_hash: None,
            needs_reveal: false,
        }
    }

    fn parse(&self, network: &Network, address: &str) -> Result<Address> {
        parse_bitcoin(network.bitcoin_params(), address)
    }

    fn sign(
        &self,
        manager: &WalletManager,
        transfer: &Transfer,
        credential: &Credential,
    ) -> Result<()> {
        let network = manager.network();
        assert_family(self.family, network);

        let serialized =
            self.serializer
                .serialize_and_sign(transfer, credential, &self.context(network));
        if serialized.is_empty() {
            return Err(Error::SigningFailed(format!(
                "{} serializer produced no transaction",
                self.family
            )));
        }
        transfer.set_hash(TxHash::new(self.family, serialized.hash));
        transfer.set_serialization(serialized.bytes);
        Ok(())
    }

    /// Turn a decoded transaction into a record seen from `wallet`
    fn record_from_transaction(
        &self,
        network: &Network,
        wallet: &Wallet,
        bundle: &TransactionBundle,
    ) -> Result<RecoveredRecord> {
        let bytes = hex::decode(bundle.raw.trim()).map_err(|e| Error::InvalidAttribute {
            key: "raw".to_string(),
            reason: e.to_string(),
        })?;
        let summary = self
            .serializer
            .decode_transaction(self.family, &bytes)
            .ok_or_else(|| Error::InvalidAttribute {
                key: "raw".to_string(),
                reason: format!("not a {} transaction", self.family),
            })?;

        let parse = |endpoint: &TxEndpoint| self.parse(network, &endpoint.address).ok();
        let ours = |endpoint: &TxEndpoint| parse(endpoint).is_some_and(|a| wallet.is_ours(&a));

        let our_input = summary.inputs.iter().find(|i| ours(*i));
        let (source, target, amount) = match our_input {
            Some(input) => {
                let source = parse(input).unwrap_or(Address::Unknown);
                let external: Vec<&TxEndpoint> =
                    summary.outputs.iter().filter(|o| !ours(*o)).collect();
                match external.first().copied() {
                    // Outgoing: the amount leaving the wallet
                    Some(first) => (
                        source,
                        parse(first).unwrap_or(Address::Unknown),
                        external.iter().map(|o| o.amount).sum(),
                    ),
                    // Every output comes back to us
                    None => {
                        let target = summary
                            .outputs
                            .first()
                            .and_then(parse)
                            .unwrap_or_else(|| source.clone());
                        (source, target, summary.outputs.iter().map(|o| o.amount).sum())
                    }
                }
            }
            None => {
                let received: Vec<&TxEndpoint> =
                    summary.outputs.iter().filter(|o| ours(*o)).collect();
                let target = received.first().copied().and_then(parse).ok_or_else(|| {
                    Error::InvalidAddress(format!(
                        "transaction {} does not touch the wallet",
                        hex::encode(summary.hash)
                    ))
                })?;
                // A coinbase has no input to name a source
                let source = summary
                    .inputs
                    .first()
                    .and_then(parse)
                    .unwrap_or(Address::Unknown);
                (source, target, received.iter().map(|o| o.amount).sum())
            }
        };

        Ok(RecoveredRecord {
            hash: TxHash::new(self.family, summary.hash),
            source,
            target,
            amount,
            fee_basis: FeeBasis::bitcoin_actual(summary.fee, summary.size as u64),
            status: bundle.status,
            block_number: bundle.block_height,
            transaction_index: 0,
            timestamp: bundle.timestamp,
            error: None,
            attributes: Vec::new(),
            payload: TransferPayload::Bitcoin {
                inputs: summary.inputs,
                outputs: summary.outputs,
            },
        })
    }
}

impl ChainHandler for BitcoinHandler {
    fn network_type(&self) -> NetworkType {
        self.family
    }

    fn create_network(&self, listener: Option<Arc<Listener>>, spec: NetworkSpec) -> Arc<Network> {
        assert_desc(&spec);
        let params = bitcoin_params(self.family, spec.is_mainnet);
        debug!(network = %spec.uids, params = params.name, "Creating network");
        Network::create(self.family, spec, NetworkParams::Bitcoin(params), listener)
    }

    fn create_address(&self, network: &Network, address: &str) -> Result<Address> {
        assert_family(self.family, network);
        self.parse(network, address)
    }

    fn estimate_block_number_at_or_before_timestamp(&self, network: &Network, timestamp: u64) -> u64 {
        assert_family(self.family, network);
        network
            .bitcoin_params()
            .checkpoint_before(timestamp)
            .map_or(0, |c| c.height)
    }

    fn is_account_initialized(&self, network: &Network, _account: &Account) -> bool {
        assert_family(self.family, network);
        true
    }

    fn account_initialization_data(&self, network: &Network, _account: &Account) -> Option<Vec<u8>> {
        assert_family(self.family, network);
        None
    }

    fn initialize_account(&self, network: &Network, _account: &Account, _data: &[u8]) -> Result<()> {
        assert_family(self.family, network);
        Ok(())
    }

    fn create_hash_from_string(&self, network: &Network, hash: &str) -> Result<TxHash> {
        assert_family(self.family, network);
        TxHash::parse(self.family, hash)
    }

    fn encode_hash(&self, hash: &TxHash) -> String {
        hash.encode()
    }

    fn create_wallet_manager(&self, init: ManagerInit) -> Result<Arc<WalletManager>> {
        assert_family(self.family, &init.network);
        Ok(WalletManager::alloc(init, ClientRequestStyle::Transactions))
    }

    fn release_wallet_manager(&self, manager: &WalletManager) {
        debug!(manager = %manager.id(), family = %self.family, "Releasing wallet manager");
    }

    fn create_file_service(&self, base_path: &Path, currency: &str, network: &str) -> Result<FileService> {
        FileService::create(
            base_path,
            currency,
            network,
            TRANSACTIONS_FILE_TYPE,
            TRANSACTIONS_FILE_VERSION,
        )
    }

    fn event_types(&self) -> &'static [&'static str] {
        UTXO_EVENT_TYPES
    }

    fn supports_p2p(&self) -> bool {
        self.p2p_factory.is_some()
    }

    fn create_p2p_manager(&self, manager: &Arc<WalletManager>) -> Option<Arc<dyn P2pManager>> {
        let factory = self.p2p_factory.as_ref()?;
        info!(manager = %manager.id(), family = %self.family, "Creating P2P manager");
        Some(factory.create(manager))
    }

    fn create_wallet(
        &self,
        manager: &Arc<WalletManager>,
        association: &CurrencyAssociation,
    ) -> Result<Arc<Wallet>> {
        let network = manager.network();
        assert_family(self.family, network);
        Ok(Wallet::create(WalletInit {
            manager: Arc::downgrade(manager),
            listener: manager.listener().clone(),
            network_type: self.family,
            currency: association.currency.clone(),
            unit: association.base_unit.clone(),
            unit_for_fee: association.base_unit.clone(),
            addresses: manager.addresses().to_vec(),
            default_fee_basis: network
                .minimum_fee()
                .map(|fee| FeeBasis::bitcoin(fee.price_per_cost_factor, DEFAULT_TX_SIZE)),
        }))
    }

    fn create_transfer(
        &self,
        manager: &WalletManager,
        wallet: &Wallet,
        target: &Address,
        amount: u64,
        fee_basis: FeeBasis,
        attributes: Vec<TransferAttribute>,
    ) -> Result<Arc<Transfer>> {
        assert_family(self.family, manager.network());
        match target {
            Address::Bitcoin(addr) if addr.network_type == self.family => {}
            other => {
                return Err(Error::InvalidAddress(format!(
                    "{} is not a {} address",
                    other, self.family
                )))
            }
        }
        if amount < DUST_LIMIT_SATOSHIS {
            return Err(Error::InvalidAmount(format!(
                "{} is below the dust limit of {}",
                amount, DUST_LIMIT_SATOSHIS
            )));
        }

        let source = wallet.primary_address().clone();
        let fee = fee_basis.fee();
        let payload = TransferPayload::Bitcoin {
            inputs: vec![TxEndpoint {
                address: source.to_string(),
                amount: amount.saturating_add(fee),
            }],
            outputs: vec![TxEndpoint {
                address: target.to_string(),
                amount,
            }],
        };

        Ok(Transfer::create(TransferInit {
            network_type: self.family,
            direction: wallet.direction_of(&source, target),
            source,
            target: target.clone(),
            amount,
            payload,
            estimated_fee_basis: Some(fee_basis),
            attributes,
            unit: wallet.unit().clone(),
            unit_for_fee: wallet.unit_for_fee().clone(),
            hash: None,
            state: TransferState::Created,
        }))
    }

    fn sign_transaction_with_seed(
        &self,
        manager: &WalletManager,
        _wallet: &Wallet,
        transfer: &Transfer,
        seed: &[u8; 64],
    ) -> Result<()> {
        self.sign(manager, transfer, &Credential::Seed(*seed))
    }

    fn sign_transaction_with_key(
        &self,
        manager: &WalletManager,
        _wallet: &Wallet,
        transfer: &Transfer,
        key: &[u8],
    ) -> Result<()> {
        self.sign(manager, transfer, &Credential::Key(key.to_vec()))
    }

    fn estimate_transfer_limit(
        &self,
        manager: &WalletManager,
        wallet: &Wallet,
        as_maximum: bool,
        _target: &Address,
        _network_fee: &NetworkFee,
    ) -> Result<TransferLimit> {
        assert_family(self.family, manager.network());
        Ok(if as_maximum {
            TransferLimit {
                amount: wallet.balance(),
                need_estimate: true,
                zero_if_insufficient_funds: true,
            }
        } else {
            TransferLimit {
                amount: DUST_LIMIT_SATOSHIS,
                need_estimate: false,
                zero_if_insufficient_funds: false,
            }
        })
    }

    fn estimate_fee_basis(
        &self,
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        cookie: u64,
        target: &Address,
        amount: u64,
        network_fee: &NetworkFee,
        attributes: &[TransferAttribute],
    ) -> Result<Option<FeeBasis>> {
        let network = manager.network();
        assert_family(self.family, network);
        let provisional = FeeBasis::bitcoin(network_fee.price_per_cost_factor, 0);
        let skeleton =
            self.create_transfer(manager, wallet, target, amount, provisional, attributes.to_vec())?;

        let size = self
            .serializer
            .serialize_for_fee_estimation(&skeleton, &self.context(network))
            .size();
        if size == 0 {
            return Err(Error::Serialization(
                "fee estimation produced no transaction".to_string(),
            ));
        }

        let fee_basis = FeeBasis::bitcoin(network_fee.price_per_cost_factor, size as u64);
        debug!(cookie, size, fee = fee_basis.fee(), "Fee estimated locally");
        Ok(Some(fee_basis))
    }

    fn recover_transfers_from_transaction_bundle(
        &self,
        manager: &WalletManager,
        bundle: &TransactionBundle,
    ) -> Result<ReconcileOutcome> {
        let network = manager.network();
        assert_family(self.family, network);
        let wallet = manager.primary_wallet()?;
        let record = self.record_from_transaction(network, &wallet, bundle)?;
        Ok(reconcile::reconcile(&wallet, record, CounterRule::None))
    }

    fn recover_transfer_from_transfer_bundle(
        &self,
        manager: &WalletManager,
        bundle: &TransferBundle,
    ) -> Result<ReconcileOutcome> {
        let network = manager.network();
        assert_family(self.family, network);
        let wallet = manager.primary_wallet()?;

        let amount = reconcile::parse_amount("amount", &bundle.amount)?;
        let fee = match &bundle.fee {
            Some(fee) => reconcile::parse_amount("fee", fee)?,
            None => 0,
        };
        let hash = TxHash::parse(self.family, &bundle.hash)?;
        let source = self.parse(network, &bundle.from).unwrap_or(Address::Unknown);
        let target = self.parse(network, &bundle.to)?;

        let record = RecoveredRecord {
            hash,
            payload: TransferPayload::Bitcoin {
                inputs: vec![TxEndpoint {
                    address: bundle.from.clone(),
                    amount: amount.saturating_add(fee),
                }],
                outputs: vec![TxEndpoint {
                    address: bundle.to.clone(),
                    amount,
                }],
            },
            source,
            target,
            amount,
            fee_basis: FeeBasis::bitcoin_actual(fee, 0),
            status: bundle.status,
            block_number: bundle.block_number,
            transaction_index: bundle.block_transaction_index,
            timestamp: bundle.block_timestamp,
            error: None,
            attributes: bundle.attributes.clone(),
        };
        Ok(reconcile::reconcile(&wallet, record, CounterRule::None))
    }

    fn recover_fee_basis_from_fee_estimate(
        &self,
        _manager: &WalletManager,
        _network_fee: &NetworkFee,
        _initial: &FeeBasis,
        _estimate: &FeeEstimate,
    ) -> Result<FeeBasis> {
        Err(Error::unsupported(self.family, "fee estimate recovery"))
    }

    fn validate_sweeper_support(
        &self,
        _manager: &WalletManager,
        _wallet: &Wallet,
        _key: &[u8],
    ) -> SweeperStatus {
        SweeperStatus::UnsupportedCurrency
    }

    fn create_sweeper(
        &self,
        _manager: &WalletManager,
        _wallet: &Wallet,
        _key: &[u8],
    ) -> Result<Arc<dyn WalletSweeper>> {
        Err(Error::unsupported(self.family, "wallet sweeper"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DigestSerializer;
    use crate::manager::client::TransferStatus;
    use crate::manager::SyncDepth;
    use crate::test_support::{self, ManagerHarness};
    use crate::wallet::TransferDirection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler() -> BitcoinHandler {
        BitcoinHandler::new(NetworkType::Btc, Arc::new(DigestSerializer::new()))
    }

    /// Signed bytes of a transfer from `from` to `to`, hex encoded
    fn raw_transaction(harness: &ManagerHarness, to: Address, amount: u64) -> String {
        let wallet = harness.manager.primary_wallet().unwrap();
        let transfer = handler()
            .create_transfer(&harness.manager, &wallet, &to, amount, FeeBasis::bitcoin(1_000, 200), vec![])
            .unwrap();
        handler()
            .sign_transaction_with_seed(&harness.manager, &wallet, &transfer, &[1u8; 64])
            .unwrap();
        hex::encode(transfer.serialization().unwrap())
    }

    #[test]
    fn test_checkpoint_estimate() {
        let network = test_support::btc_testnet(None);
        let h = handler();
        assert_eq!(h.estimate_block_number_at_or_before_timestamp(&network, 0), 0);
        let late = h.estimate_block_number_at_or_before_timestamp(&network, u64::MAX);
        let last = network.bitcoin_params().checkpoints.last().map_or(0, |c| c.height);
        assert_eq!(late, last);
    }

    #[test]
    fn test_transfer_below_dust_is_rejected() {
        let harness = ManagerHarness::new(NetworkType::Btc);
        let wallet = harness.manager.primary_wallet().unwrap();
        let err = handler()
            .create_transfer(&harness.manager, &wallet, &harness.foreign_address(2), 10, FeeBasis::bitcoin(1_000, 0), vec![])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
    }

    #[test]
    fn test_fee_estimate_is_immediate() {
        let harness = ManagerHarness::new(NetworkType::Btc);
        let wallet = harness.manager.primary_wallet().unwrap();
        let fee = test_support::network_fee(NetworkType::Btc);
        let basis = handler()
            .estimate_fee_basis(&harness.manager, &wallet, 7, &harness.foreign_address(2), 10_000, &fee, &[])
            .unwrap()
            .unwrap();
        assert!(basis.fee() > 0);
        assert_eq!(basis.price_per_cost_factor(), fee.price_per_cost_factor);
        assert_eq!(wallet.transfer_count(), 0);
    }

    #[test]
    fn test_limit() {
        let harness = ManagerHarness::new(NetworkType::Btc);
        let wallet = harness.manager.primary_wallet().unwrap();
        let fee = test_support::network_fee(NetworkType::Btc);
        let target = harness.foreign_address(2);
        let max = handler()
            .estimate_transfer_limit(&harness.manager, &wallet, true, &target, &fee)
            .unwrap();
        assert!(max.need_estimate);
        let min = handler()
            .estimate_transfer_limit(&harness.manager, &wallet, false, &target, &fee)
            .unwrap();
        assert_eq!(min.amount, DUST_LIMIT_SATOSHIS);
    }

    #[test]
    fn test_received_transaction_bundle() {
        let sender = ManagerHarness::with_address_index(NetworkType::Btc, 3);
        let harness = ManagerHarness::new(NetworkType::Btc);
        let raw = raw_transaction(&sender, harness.own_address(), 40_000);

        let bundle = TransactionBundle {
            status: TransferStatus::Included,
            raw,
            block_height: 2_000_000,
            timestamp: 1_600_000_000,
        };
        let outcome = harness
            .manager
            .handler()
            .recover_transfers_from_transaction_bundle(&harness.manager, &bundle)
            .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.transfer.direction(), TransferDirection::Received);
        assert_eq!(outcome.transfer.amount(), 40_000);
        assert_eq!(harness.manager.primary_wallet().unwrap().balance(), 40_000);
    }

    #[test]
    fn test_transaction_bundle_not_touching_wallet() {
        let sender = ManagerHarness::with_address_index(NetworkType::Btc, 3);
        let harness = ManagerHarness::new(NetworkType::Btc);
        let raw = raw_transaction(&sender, harness.foreign_address(4), 40_000);
        let bundle = TransactionBundle {
            status: TransferStatus::Included,
            raw,
            block_height: 1,
            timestamp: 1,
        };
        let err = harness
            .manager
            .handler()
            .recover_transfers_from_transaction_bundle(&harness.manager, &bundle)
            .unwrap_err();
        assert!(err.is_data_error());

        let garbage = TransactionBundle {
            raw: "zz".to_string(),
            ..bundle
        };
        assert!(harness
            .manager
            .handler()
            .recover_transfers_from_transaction_bundle(&harness.manager, &garbage)
            .unwrap_err()
            .is_data_error());
    }

    #[test]
    fn test_fee_estimate_recovery_unsupported() {
        let harness = ManagerHarness::new(NetworkType::Bch);
        let fee = test_support::network_fee(NetworkType::Bch);
        let estimate = FeeEstimate {
            cost_units: 1.0,
            attributes: vec![],
        };
        let err = harness
            .manager
            .handler()
            .recover_fee_basis_from_fee_estimate(&harness.manager, &fee, &FeeBasis::bitcoin(1, 1), &estimate)
            .unwrap_err();
        assert!(err.is_unsupported());
    }

    struct CountingP2p {
        connects: AtomicUsize,
        syncs: AtomicUsize,
    }

    impl P2pManager for CountingP2p {
        fn connect(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
        fn disconnect(&self) {}
        fn sync(&self, _depth: SyncDepth) {
            self.syncs.fetch_add(1, Ordering::SeqCst);
        }
        fn send(&self, _transfer: Arc<Transfer>) {}
    }

    struct Factory(Arc<CountingP2p>);

    impl P2pManagerFactory for Factory {
        fn create(&self, _manager: &Arc<WalletManager>) -> Arc<dyn P2pManager> {
            self.0.clone()
        }
    }

    #[test]
    #[should_panic]
    fn test_fee_estimate_for_another_family_is_fatal() {
        let harness = ManagerHarness::new(NetworkType::Bch);
        let handler = BitcoinHandler::new(NetworkType::Btc, Arc::new(DigestSerializer::new()));
        let wallet = harness.manager.primary_wallet().unwrap();
        let target = harness.foreign_address(2);
        let fee = test_support::network_fee(NetworkType::Bch);
        let _ = handler.estimate_fee_basis(&harness.manager, &wallet, 1, &target, 10_000, &fee, &[]);
    }

    #[test]
    fn test_p2p_from_injected_factory() {
        let p2p = Arc::new(CountingP2p {
            connects: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
        });
        let handler = BitcoinHandler::new(NetworkType::Btc, Arc::new(DigestSerializer::new()))
            .with_p2p_factory(Arc::new(Factory(p2p.clone())));
        assert!(handler.supports_p2p());
        let harness = ManagerHarness::with_handler(Arc::new(handler));

        harness.manager.set_mode(crate::network::SyncMode::P2pOnly).unwrap();
        harness.manager.connect().unwrap();
        harness.manager.sync().unwrap();
        assert_eq!(p2p.connects.load(Ordering::SeqCst), 1);
        assert_eq!(p2p.syncs.load(Ordering::SeqCst), 1);
        assert_eq!(harness.client.count("get_block_number"), 0);
    }
}
