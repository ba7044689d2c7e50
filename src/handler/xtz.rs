//! Tezos handler
//!
//! Account-based: the client reports one transfer bundle per observed transfer,
//! fees are estimated by the client (two-phase, keyed by a cookie) and every
//! reconciled bundle moves the wallet's operation counter.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use super::serializer::{SerializationContext, TransactionSerializer};
use super::{
    assert_desc, assert_family, ChainHandler, P2pManager, SweeperStatus, TransferLimit,
    WalletSweeper,
};
use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::manager::client::{ClientRequestStyle, FeeEstimate, TransactionBundle, TransferBundle};
use crate::manager::file_service::FileService;
use crate::manager::reconcile::{self, CounterRule, ReconcileOutcome, RecoveredRecord, SOURCE_COUNTER};
use crate::manager::{ManagerInit, WalletManager};
use crate::network::address::parse_tezos;
use crate::network::params::tezos_params;
use crate::network::{
    Address, CurrencyAssociation, Network, NetworkFee, NetworkParams, NetworkSpec, NetworkType,
    TxHash,
};
use crate::wallet::transfer::TezosOperationKind;
use crate::wallet::{
    Account, Credential, FeeBasis, TezosFeeBasis, Transfer, TransferAttribute, TransferInit,
    TransferPayload, TransferState, Wallet, WalletInit,
};

const TRANSFERS_FILE_TYPE: &str = "transfers";
const TRANSFERS_FILE_VERSION: u32 = 1;

/// Transfer attribute selecting a delegation instead of a transaction
pub const DELEGATION_ATTRIBUTE: &str = "delegation_op";

const CONSUMED_GAS: &str = "consumed_gas";
const STORAGE_SIZE: &str = "storage_size";

pub struct TezosHandler {
    serializer: Arc<dyn TransactionSerializer>,
}

/// Network fees are quoted per kilobyte
fn mutez_per_byte(network_fee: &NetworkFee) -> u64 {
    network_fee.price_per_cost_factor / 1000
}

fn operation_kind(attributes: &[TransferAttribute]) -> TezosOperationKind {
    let delegation = attributes.iter().any(|a| {
        a.key.eq_ignore_ascii_case(DELEGATION_ATTRIBUTE)
            && a
                .value
                .as_deref()
                .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    });
    if delegation {
        TezosOperationKind::Delegation
    } else {
        TezosOperationKind::Transaction
    }
}

fn required_u64(estimate: &FeeEstimate, key: &str) -> Result<u64> {
    let raw = estimate
        .attribute(key)
        .ok_or_else(|| Error::MissingAttribute(key.to_string()))?;
    raw.trim().parse::<u64>().map_err(|e| Error::InvalidAttribute {
        key: key.to_string(),
        reason: format!("{:?}: {}", raw, e),
    })
}

impl TezosHandler {
    pub fn new(serializer: Arc<dyn TransactionSerializer>) -> Self {
        Self { serializer }
    }

    fn context(&self, network: &Network, wallet: &Wallet, transfer: &Transfer) -> SerializationContext {
        let is_transaction = matches!(
            transfer.payload(),
            TransferPayload::Tezos {
                operation: TezosOperationKind::Transaction,
                ..
            }
        );
        SerializationContext {
            network_type: NetworkType::Xtz,
            fork_id: 0,
            block_hash: network.verified_block_hash(),
            needs_reveal: is_transaction && wallet.needs_reveal(),
        }
    }
}

impl ChainHandler for TezosHandler {
    fn network_type(&self) -> NetworkType {
        NetworkType::Xtz
    }

    fn create_network(&self, listener: Option<Arc<Listener>>, spec: NetworkSpec) -> Arc<Network> {
        assert_desc(&spec);
        let params = tezos_params(spec.is_mainnet);
        debug!(network = %spec.uids, params = params.name, "Creating network");
        Network::create(NetworkType::Xtz, spec, NetworkParams::Tezos(params), listener)
    }

    fn create_address(&self, network: &Network, address: &str) -> Result<Address> {
        assert_family(NetworkType::Xtz, network);
        parse_tezos(address, true)
    }

    fn estimate_block_number_at_or_before_timestamp(&self, network: &Network, timestamp: u64) -> u64 {
        assert_family(NetworkType::Xtz, network);
        network
            .tezos_params()
            .checkpoint_before(timestamp)
            .map_or(0, |c| c.height)
    }

    fn is_account_initialized(&self, network: &Network, _account: &Account) -> bool {
        assert_family(NetworkType::Xtz, network);
        true
    }

    fn account_initialization_data(&self, network: &Network, _account: &Account) -> Option<Vec<u8>> {
        assert_family(NetworkType::Xtz, network);
        None
    }

    fn initialize_account(&self, network: &Network, _account: &Account, _data: &[u8]) -> Result<()> {
        assert_family(NetworkType::Xtz, network);
        Ok(())
    }

    fn create_hash_from_string(&self, network: &Network, hash: &str) -> Result<TxHash> {
        assert_family(NetworkType::Xtz, network);
        TxHash::parse(NetworkType::Xtz, hash)
    }

    fn encode_hash(&self, hash: &TxHash) -> String {
        hash.encode()
    }

    fn create_wallet_manager(&self, init: ManagerInit) -> Result<Arc<WalletManager>> {
        assert_family(NetworkType::Xtz, &init.network);
        Ok(WalletManager::alloc(init, ClientRequestStyle::Transfers))
    }

    fn release_wallet_manager(&self, _manager: &WalletManager) {}

    fn create_file_service(&self, base_path: &Path, currency: &str, network: &str) -> Result<FileService> {
        FileService::create(
            base_path,
            currency,
            network,
            TRANSFERS_FILE_TYPE,
            TRANSFERS_FILE_VERSION,
        )
    }

    fn event_types(&self) -> &'static [&'static str] {
        &[]
    }

    fn supports_p2p(&self) -> bool {
        false
    }

    fn create_p2p_manager(&self, _manager: &Arc<WalletManager>) -> Option<Arc<dyn P2pManager>> {
        None
    }

    fn create_wallet(
        &self,
        manager: &Arc<WalletManager>,
        association: &CurrencyAssociation,
    ) -> Result<Arc<Wallet>> {
        let network = manager.network();
        assert_family(NetworkType::Xtz, network);
        let params = network.tezos_params();
        Ok(Wallet::create(WalletInit {
            manager: Arc::downgrade(manager),
            listener: manager.listener().clone(),
            network_type: NetworkType::Xtz,
            currency: association.currency.clone(),
            unit: association.base_unit.clone(),
            unit_for_fee: association.base_unit.clone(),
            addresses: manager.addresses().to_vec(),
            default_fee_basis: network.minimum_fee().map(|fee| {
                FeeBasis::Tezos(TezosFeeBasis::Default {
                    mutez_per_byte: mutez_per_byte(&fee),
                    gas_limit: params.default_gas_limit,
                    storage_limit: params.default_storage_limit,
                })
            }),
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
        assert_family(NetworkType::Xtz, manager.network());
        if !matches!(target, Address::Tezos(_)) {
            return Err(Error::InvalidAddress(format!("{} is not a tezos address", target)));
        }
        if !matches!(fee_basis, FeeBasis::Tezos(_)) {
            return Err(Error::InvalidAttribute {
                key: "fee_basis".to_string(),
                reason: "not a tezos fee basis".to_string(),
            });
        }

        let source = wallet.primary_address().clone();
        let payload = TransferPayload::Tezos {
            counter: Some(wallet.counter()),
            operation: operation_kind(&attributes),
        };
        Ok(Transfer::create(TransferInit {
            network_type: NetworkType::Xtz,
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
        wallet: &Wallet,
        transfer: &Transfer,
        seed: &[u8; 64],
    ) -> Result<()> {
        let network = manager.network();
        assert_family(NetworkType::Xtz, network);

        let ctx = self.context(network, wallet, transfer);
        let serialized = self
            .serializer
            .serialize_and_sign(transfer, &Credential::Seed(*seed), &ctx);
        if serialized.is_empty() {
            return Err(Error::SigningFailed(
                "tezos serializer produced no operation".to_string(),
            ));
        }
        debug!(reveal = ctx.needs_reveal, size = serialized.size(), "Operation signed");
        transfer.set_hash(TxHash::new(NetworkType::Xtz, serialized.hash));
        transfer.set_serialization(serialized.bytes);
        Ok(())
    }

    fn sign_transaction_with_key(
        &self,
        _manager: &WalletManager,
        _wallet: &Wallet,
        _transfer: &Transfer,
        _key: &[u8],
    ) -> Result<()> {
        Err(Error::unsupported(NetworkType::Xtz, "signing with a single key"))
    }

    fn estimate_transfer_limit(
        &self,
        manager: &WalletManager,
        wallet: &Wallet,
        as_maximum: bool,
        _target: &Address,
        _network_fee: &NetworkFee,
    ) -> Result<TransferLimit> {
        assert_family(NetworkType::Xtz, manager.network());
        // The fee is unknown until estimated, so a maximum always needs an estimate
        Ok(TransferLimit {
            amount: if as_maximum { wallet.balance() } else { 0 },
            need_estimate: as_maximum,
            zero_if_insufficient_funds: false,
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
        assert_family(NetworkType::Xtz, manager.network());
        let network = manager.network();
        let params = network.tezos_params();
        let per_byte = mutez_per_byte(network_fee);
        let provisional = FeeBasis::Tezos(TezosFeeBasis::Default {
            mutez_per_byte: per_byte,
            gas_limit: params.default_gas_limit,
            storage_limit: params.default_storage_limit,
        });
        let skeleton =
            self.create_transfer(manager, wallet, target, amount, provisional, attributes.to_vec())?;

        let serialized = self
            .serializer
            .serialize_for_fee_estimation(&skeleton, &self.context(network, wallet, &skeleton));
        if serialized.is_empty() {
            return Err(Error::Serialization(
                "fee estimation produced no operation".to_string(),
            ));
        }

        let initial = FeeBasis::Tezos(TezosFeeBasis::Estimate {
            mutez_per_byte: per_byte,
            size_in_bytes: serialized.size() as u64,
            gas_limit: params.default_gas_limit,
            storage_limit: params.default_storage_limit,
        });
        manager.register_fee_estimate(cookie, wallet.clone(), network_fee.clone(), initial);
        debug!(cookie, size = serialized.size(), "Fee estimate requested from client");
        manager.client().estimate_transfer_fee(
            manager,
            cookie,
            skeleton,
            network_fee.clone(),
            initial,
            serialized.bytes,
        );
        Ok(None)
    }

    fn recover_transfers_from_transaction_bundle(
        &self,
        _manager: &WalletManager,
        _bundle: &TransactionBundle,
    ) -> Result<ReconcileOutcome> {
        Err(Error::unsupported(NetworkType::Xtz, "transaction bundles"))
    }

    fn recover_transfer_from_transfer_bundle(
        &self,
        manager: &WalletManager,
        bundle: &TransferBundle,
    ) -> Result<ReconcileOutcome> {
        assert_family(NetworkType::Xtz, manager.network());
        let amount = reconcile::parse_amount("amount", &bundle.amount)?;
        let fee = match &bundle.fee {
            Some(fee) => reconcile::parse_amount("fee", fee)?,
            None => 0,
        };
        let hash = TxHash::parse(NetworkType::Xtz, &bundle.hash)?;
        let source = parse_tezos(&bundle.from, false)?;
        let target = parse_tezos(&bundle.to, false)?;

        let counter = match reconcile::parse_counter(&bundle.attributes, SOURCE_COUNTER) {
            Ok(counter) => Some(counter),
            Err(e) => {
                debug!(hash = %bundle.hash, error = %e, "Operation counter unknown");
                None
            }
        };
        let record = RecoveredRecord {
            hash,
            source,
            target,
            amount,
            fee_basis: FeeBasis::Tezos(TezosFeeBasis::Actual { fee }),
            status: bundle.status,
            block_number: bundle.block_number,
            transaction_index: bundle.block_transaction_index,
            timestamp: bundle.block_timestamp,
            error: None,
            attributes: bundle.attributes.clone(),
            payload: TransferPayload::Tezos {
                counter,
                operation: TezosOperationKind::Transaction,
            },
        };
        let wallet = manager.primary_wallet()?;
        Ok(reconcile::reconcile(&wallet, record, CounterRule::Sequence))
    }

    fn recover_fee_basis_from_fee_estimate(
        &self,
        manager: &WalletManager,
        network_fee: &NetworkFee,
        initial: &FeeBasis,
        estimate: &FeeEstimate,
    ) -> Result<FeeBasis> {
        assert_family(NetworkType::Xtz, manager.network());
        let gas_limit = required_u64(estimate, CONSUMED_GAS)?;
        let storage_limit = required_u64(estimate, STORAGE_SIZE)?;
        let size_in_bytes = match initial {
            FeeBasis::Tezos(TezosFeeBasis::Estimate { size_in_bytes, .. }) => *size_in_bytes,
            _ => 0,
        };
        Ok(FeeBasis::Tezos(TezosFeeBasis::Estimate {
            mutez_per_byte: mutez_per_byte(network_fee),
            size_in_bytes,
            gas_limit,
            storage_limit,
        }))
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
        Err(Error::unsupported(NetworkType::Xtz, "wallet sweeper"))
    }
}
