//! Fixtures shared by the unit tests

use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};

use crate::config::NetworkConfig;
use crate::handler::{ChainHandler, DigestSerializer, HandlerRegistry};
use crate::listener::{
    FeeEstimateResult, Listener, ListenerCallbacks, ListenerEvent, ManagerEvent, NetworkEvent,
    TransferEvent, WalletEvent,
};
use crate::manager::client::Client;
use crate::manager::WalletManager;
use crate::network::address::{base58check_encode, TezosAddress, TezosAddressKind};
use crate::network::{Address, AddressScheme, Network, NetworkFee, NetworkType, SyncMode};
use crate::wallet::transfer::TxEndpoint;
use crate::wallet::{
    Account, FeeBasis, TezosFeeBasis, Transfer, TransferDirection, TransferInit, TransferPayload,
    TransferState, Wallet,
};

pub fn registry() -> HandlerRegistry {
    HandlerRegistry::with_defaults(Arc::new(DigestSerializer::new()))
}

fn is_mainnet(network_type: NetworkType) -> bool {
    network_type == NetworkType::Xtz
}

/// Harness network of a family: tezos mainnet, testnet for the UTXO families
pub fn network(network_type: NetworkType, listener: Option<Arc<Listener>>) -> Arc<Network> {
    let config = NetworkConfig::preset(network_type, is_mainnet(network_type));
    registry()
        .create_network(network_type, listener, config.spec())
        .unwrap()
}

pub fn btc_testnet(listener: Option<Arc<Listener>>) -> Arc<Network> {
    network(NetworkType::Btc, listener)
}

pub fn xtz_mainnet(listener: Option<Arc<Listener>>) -> Arc<Network> {
    network(NetworkType::Xtz, listener)
}

pub fn network_fee(network_type: NetworkType) -> NetworkFee {
    match network_type {
        NetworkType::Xtz => NetworkFee {
            confirmation_time_ms: 60_000,
            price_per_cost_factor: 1_000,
        },
        _ => NetworkFee {
            confirmation_time_ms: 600_000,
            price_per_cost_factor: 10_000,
        },
    }
}

pub fn xtz_fee_basis() -> FeeBasis {
    FeeBasis::Tezos(TezosFeeBasis::Default {
        mutez_per_byte: 1,
        gas_limit: 10_600,
        storage_limit: 300,
    })
}

/// Address string number `index` of `network`
pub fn address_string(network: &Network, index: u8) -> String {
    match network.network_type() {
        NetworkType::Xtz => TezosAddress {
            kind: TezosAddressKind::Tz1,
            hash: [index; 20],
        }
        .encode(),
        _ => {
            let mut data = vec![network.bitcoin_params().pubkey_prefix];
            data.extend_from_slice(&[index; 20]);
            base58check_encode(&data)
        }
    }
}

/// A sent BTC testnet transfer paying a 200 sat fee
pub fn btc_transfer_init(direction: TransferDirection, amount: u64) -> TransferInit {
    let network = btc_testnet(None);
    let handler = registry().get(NetworkType::Btc).unwrap();
    let source = handler
        .create_address(&network, &address_string(&network, 1))
        .unwrap();
    let target = handler
        .create_address(&network, &address_string(&network, 2))
        .unwrap();
    let unit = network.native_association().unwrap().base_unit;

    TransferInit {
        network_type: NetworkType::Btc,
        payload: TransferPayload::Bitcoin {
            inputs: vec![TxEndpoint {
                address: source.to_string(),
                amount: amount + 200,
            }],
            outputs: vec![TxEndpoint {
                address: target.to_string(),
                amount,
            }],
        },
        source,
        target,
        amount,
        direction,
        estimated_fee_basis: Some(FeeBasis::bitcoin(1_000, 200)),
        attributes: vec![],
        unit: unit.clone(),
        unit_for_fee: unit,
        hash: None,
        state: TransferState::Created,
    }
}

/// Records what the listener delivered, without keeping any subject alive
#[derive(Default)]
pub struct RecordingCallbacks {
    sequences: Mutex<Vec<u64>>,
    network_events: Mutex<Vec<NetworkEvent>>,
    manager_labels: Mutex<Vec<String>>,
    wallet_labels: Mutex<Vec<String>>,
    transfer_labels: Mutex<Vec<String>>,
    fee_estimates: Mutex<Vec<(u64, FeeEstimateResult)>>,
}

impl RecordingCallbacks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.sequences.lock().unwrap().clone()
    }

    pub fn network_events(&self) -> Vec<NetworkEvent> {
        self.network_events.lock().unwrap().clone()
    }

    pub fn manager_labels(&self) -> Vec<String> {
        self.manager_labels.lock().unwrap().clone()
    }

    pub fn wallet_labels(&self) -> Vec<String> {
        self.wallet_labels.lock().unwrap().clone()
    }

    pub fn transfer_labels(&self) -> Vec<String> {
        self.transfer_labels.lock().unwrap().clone()
    }

    pub fn fee_estimates(&self) -> Vec<(u64, FeeEstimateResult)> {
        self.fee_estimates.lock().unwrap().clone()
    }
}

impl ListenerCallbacks for RecordingCallbacks {
    fn handle_event(&self, event: &ListenerEvent) {
        self.sequences.lock().unwrap().push(event.sequence);
        crate::listener::dispatch(self, event);
    }

    fn handle_network_event(&self, _network: &Arc<Network>, event: &NetworkEvent) {
        self.network_events.lock().unwrap().push(event.clone());
    }

    fn handle_manager_event(&self, _manager: &Arc<WalletManager>, event: &ManagerEvent) {
        self.manager_labels.lock().unwrap().push(event.name().to_string());
    }

    fn handle_wallet_event(
        &self,
        _manager: &Arc<WalletManager>,
        _wallet: &Arc<Wallet>,
        event: &WalletEvent,
    ) {
        if let WalletEvent::FeeBasisEstimated { cookie, result } = event {
            self.fee_estimates
                .lock()
                .unwrap()
                .push((*cookie, result.clone()));
        }
        self.wallet_labels.lock().unwrap().push(event.name().to_string());
    }

    fn handle_transfer_event(
        &self,
        _manager: &Arc<WalletManager>,
        _wallet: &Arc<Wallet>,
        _transfer: &Arc<Transfer>,
        event: &TransferEvent,
    ) {
        self.transfer_labels.lock().unwrap().push(event.name().to_string());
    }
}

/// Client that only counts requests; tests answer through the manager directly
#[derive(Default)]
pub struct RecordingClient {
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, request: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == request)
            .count()
    }

    fn record(&self, request: &'static str) {
        self.calls.lock().unwrap().push(request);
    }
}

impl Client for RecordingClient {
    fn get_block_number(&self, _manager: &Arc<WalletManager>, _rid: u64) {
        self.record("get_block_number");
    }

    fn get_transfers(
        &self,
        _manager: &Arc<WalletManager>,
        _rid: u64,
        _addresses: Vec<String>,
        _begin_block: u64,
        _end_block: u64,
    ) {
        self.record("get_transfers");
    }

    fn get_transactions(
        &self,
        _manager: &Arc<WalletManager>,
        _rid: u64,
        _addresses: Vec<String>,
        _begin_block: u64,
        _end_block: u64,
    ) {
        self.record("get_transactions");
    }

    fn submit_transaction(
        &self,
        _manager: &Arc<WalletManager>,
        _transfer: Arc<Transfer>,
        _serialization: Vec<u8>,
    ) {
        self.record("submit_transaction");
    }

    fn estimate_transfer_fee(
        &self,
        _manager: &Arc<WalletManager>,
        _cookie: u64,
        _transfer: Arc<Transfer>,
        _network_fee: NetworkFee,
        _initial: FeeBasis,
        _serialization: Vec<u8>,
    ) {
        self.record("estimate_transfer_fee");
    }
}

/// A started listener, a recording client and a manager with persistence in a scratch dir
pub struct ManagerHarness {
    pub recorder: Arc<RecordingCallbacks>,
    pub listener: Arc<Listener>,
    pub client: Arc<RecordingClient>,
    pub manager: Arc<WalletManager>,
    pub dir: tempfile::TempDir,
    own_index: u8,
}

impl ManagerHarness {
    pub fn new(network_type: NetworkType) -> Self {
        Self::with_address_index(network_type, 1)
    }

    /// Harness whose account owns address number `index`
    pub fn with_address_index(network_type: NetworkType, index: u8) -> Self {
        Self::build(registry(), network_type, index)
    }

    /// Harness running `handler` in place of the default one of its family
    pub fn with_handler(handler: Arc<dyn ChainHandler>) -> Self {
        let network_type = handler.network_type();
        let mut registry = registry();
        registry.register(handler);
        Self::build(registry, network_type, 1)
    }

    fn build(registry: HandlerRegistry, network_type: NetworkType, index: u8) -> Self {
        let recorder = RecordingCallbacks::new();
        let listener = Listener::new(format!("harness-{}", network_type), recorder.clone());
        listener.start().unwrap();

        let network = network(network_type, Some(listener.clone()));
        network.set_fees(vec![network_fee(network_type)]);
        let created_at = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        let account = Arc::new(
            Account::new("harness-account", created_at)
                .with_addresses(network.uids(), [address_string(&network, index)]),
        );
        let client = RecordingClient::new();
        let dir = tempfile::tempdir().unwrap();

        let manager = WalletManager::create(
            &registry,
            listener.clone(),
            client.clone(),
            account,
            network,
            SyncMode::ApiOnly,
            AddressScheme::supported_by(network_type)[0],
            Some(dir.path()),
        )
        .unwrap();

        Self {
            recorder,
            listener,
            client,
            manager,
            dir,
            own_index: index,
        }
    }

    /// Address number `index` on the harness network
    pub fn foreign_address(&self, index: u8) -> Address {
        let network = self.manager.network();
        self.manager
            .handler()
            .create_address(network, &address_string(network, index))
            .unwrap()
    }

    pub fn own_address(&self) -> Address {
        self.foreign_address(self.own_index)
    }

    /// Drain and stop the listener so every signalled event has been recorded
    pub fn finish(&self) {
        self.listener.stop();
    }
}
