//! A UTXO testnet wallet manager fed one included transfer bundle

use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use sha2::{Digest, Sha256};

use wkcore::config::NetworkConfig;
use wkcore::handler::{DigestSerializer, HandlerRegistry};
use wkcore::listener::{EventPayload, Listener, ListenerCallbacks, ListenerEvent, TransferEvent};
use wkcore::manager::client::{Client, TransferBundle, TransferStatus};
use wkcore::manager::WalletManager;
use wkcore::network::{AddressScheme, NetworkFee, NetworkType, SyncMode};
use wkcore::wallet::{Account, FeeBasis, Transfer, TransferDirection, TransferState};

const TESTNET_PUBKEY_PREFIX: u8 = 111;

fn testnet_address(index: u8) -> String {
    let mut data = vec![TESTNET_PUBKEY_PREFIX];
    data.extend_from_slice(&[index; 20]);
    let digest = Sha256::digest(Sha256::digest(&data));
    data.extend_from_slice(&digest[..4]);
    bs58::encode(data).into_string()
}

/// The scenario answers on the manager directly, so requests are ignored
struct SilentClient;

impl Client for SilentClient {
    fn get_block_number(&self, _manager: &Arc<WalletManager>, _rid: u64) {}

    fn get_transfers(
        &self,
        _manager: &Arc<WalletManager>,
        _rid: u64,
        _addresses: Vec<String>,
        _begin_block: u64,
        _end_block: u64,
    ) {
    }

    fn get_transactions(
        &self,
        _manager: &Arc<WalletManager>,
        _rid: u64,
        _addresses: Vec<String>,
        _begin_block: u64,
        _end_block: u64,
    ) {
    }

    fn submit_transaction(
        &self,
        _manager: &Arc<WalletManager>,
        _transfer: Arc<Transfer>,
        _serialization: Vec<u8>,
    ) {
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
    }
}

#[derive(Default)]
struct TransferLog {
    events: Mutex<Vec<(u64, TransferEvent)>>,
}

impl ListenerCallbacks for TransferLog {
    fn handle_event(&self, event: &ListenerEvent) {
        if let EventPayload::Transfer { event: inner, .. } = &event.payload {
            self.events
                .lock()
                .unwrap()
                .push((event.sequence, inner.clone()));
        }
    }
}

#[test]
fn test_included_bundle_reaches_wallet_and_listener() {
    let registry = HandlerRegistry::with_defaults(Arc::new(DigestSerializer::new()));
    let log = Arc::new(TransferLog::default());
    let listener = Listener::new("e2e", log.clone());
    listener.start().unwrap();

    let network_config = NetworkConfig::preset(NetworkType::Btc, false);
    let network = registry
        .create_network(NetworkType::Btc, Some(listener.clone()), network_config.spec())
        .unwrap();
    network.set_fees(network_config.fees.clone());

    let own = testnet_address(1);
    let account = Account::new("e2e-account", Utc.timestamp_opt(1_600_000_000, 0).unwrap())
        .with_addresses(network.uids(), [own.clone()]);
    let manager = WalletManager::create(
        &registry,
        listener.clone(),
        Arc::new(SilentClient),
        Arc::new(account),
        network,
        SyncMode::ApiOnly,
        AddressScheme::supported_by(NetworkType::Btc)[0],
        None,
    )
    .unwrap();
    let wallet = manager.primary_wallet().unwrap();
    assert_eq!(wallet.transfer_count(), 0);

    let bundle = TransferBundle {
        status: TransferStatus::Included,
        hash: "ab".repeat(32),
        identifier: None,
        from: testnet_address(2),
        to: own,
        amount: "1000".to_string(),
        currency: "btc".to_string(),
        fee: Some("150".to_string()),
        block_number: 100,
        block_transaction_index: 0,
        block_timestamp: 1_600_000_600,
        attributes: vec![],
    };
    let applied = manager.announce_transfers(1, Ok(vec![bundle])).unwrap();
    assert_eq!(applied, 1);

    let transfers = wallet.transfers();
    assert_eq!(transfers.len(), 1);
    let transfer = &transfers[0];
    assert_eq!(transfer.amount(), 1000);
    assert_eq!(transfer.direction(), TransferDirection::Received);
    assert_eq!(transfer.unit(), wallet.unit());
    match transfer.state() {
        TransferState::Included(inclusion) => {
            assert_eq!(inclusion.block_number, 100);
            assert!(inclusion.success);
        }
        other => panic!("unexpected state {}", other),
    }
    assert_eq!(wallet.balance(), 1000);

    manager.release();
    listener.stop();

    let events = log.events.lock().unwrap().clone();
    let changes: Vec<_> = events
        .iter()
        .filter(|(_, e)| matches!(e, TransferEvent::Changed { .. }))
        .collect();
    assert_eq!(changes.len(), 1);
    assert!(matches!(
        &changes[0].1,
        TransferEvent::Changed {
            new: TransferState::Included(_),
            ..
        }
    ));

    let created_at = events
        .iter()
        .position(|(_, e)| *e == TransferEvent::Created)
        .unwrap();
    let changed_at = events
        .iter()
        .position(|(_, e)| matches!(e, TransferEvent::Changed { .. }))
        .unwrap();
    assert!(created_at < changed_at);
    assert!(events.windows(2).all(|w| w[0].0 < w[1].0));
}
