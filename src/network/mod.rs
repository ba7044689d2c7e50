//! Networks, currencies and chain parameters
//!
//! A `Network` is one chain instance (e.g. bitcoin-testnet). Its identity and chain
//! parameters are fixed at creation; height, verified block hash, fees and
//! currency associations change as the client reports them.

pub mod address;
pub mod hash;
pub mod params;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entity::EntityId;
use crate::error::{Error, Result};
use crate::listener::event::NetworkEvent;
use crate::listener::Listener;

pub use address::Address;
pub use hash::TxHash;
pub use params::{BitcoinChainParams, CheckPoint, TezosChainParams};

/// Chain family tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Btc,
    Bch,
    Bsv,
    Xtz,
}

impl NetworkType {
    pub const ALL: [NetworkType; 4] = [Self::Btc, Self::Bch, Self::Bsv, Self::Xtz];

    pub fn code(&self) -> &'static str {
        match self {
            Self::Btc => "btc",
            Self::Bch => "bch",
            Self::Bsv => "bsv",
            Self::Xtz => "xtz",
        }
    }

    /// Member of the Bitcoin-derived UTXO family
    pub fn is_utxo(&self) -> bool {
        matches!(self, Self::Btc | Self::Bch | Self::Bsv)
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for NetworkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.code().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnknownNetworkType(s.to_string()))
    }
}

/// Address encoding a wallet manager hands out for receiving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressScheme {
    BtcLegacy,
    BtcSegwit,
    BchCashaddr,
    Native,
}

impl AddressScheme {
    /// Schemes a family can produce
    pub fn supported_by(network_type: NetworkType) -> &'static [AddressScheme] {
        match network_type {
            NetworkType::Btc => &[Self::BtcSegwit, Self::BtcLegacy],
            NetworkType::Bch => &[Self::BchCashaddr, Self::BtcLegacy],
            NetworkType::Bsv => &[Self::BtcLegacy],
            NetworkType::Xtz => &[Self::Native],
        }
    }

    pub fn is_supported_by(&self, network_type: NetworkType) -> bool {
        Self::supported_by(network_type).contains(self)
    }
}

/// How a wallet manager learns about blocks and transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    ApiOnly,
    ApiWithP2pSend,
    P2pWithApiSync,
    P2pOnly,
}

impl SyncMode {
    /// True when the mode needs a peer-to-peer manager
    pub fn is_p2p(&self) -> bool {
        !matches!(self, Self::ApiOnly)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiOnly => write!(f, "api_only"),
            Self::ApiWithP2pSend => write!(f, "api_with_p2p_send"),
            Self::P2pWithApiSync => write!(f, "p2p_with_api_sync"),
            Self::P2pOnly => write!(f, "p2p_only"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    pub uids: String,
    pub code: String,
    pub name: String,
}

/// A denomination of a currency; `decimals` relative to the base unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub code: String,
    pub symbol: String,
    pub decimals: u8,
}

/// A currency carried by a network together with its units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyAssociation {
    pub currency: Currency,
    pub base_unit: Unit,
    pub default_unit: Unit,
}

impl CurrencyAssociation {
    /// Native currency with an integer base unit and a `decimals` default unit
    pub fn native(network_uids: &str, code: &str, name: &str, base_code: &str, decimals: u8) -> Self {
        Self {
            currency: Currency {
                uids: format!("{}:__native__", network_uids),
                code: code.to_string(),
                name: name.to_string(),
            },
            base_unit: Unit {
                code: base_code.to_string(),
                symbol: base_code.to_string(),
                decimals: 0,
            },
            default_unit: Unit {
                code: code.to_string(),
                symbol: code.to_uppercase(),
                decimals,
            },
        }
    }
}

/// Fee offered to the network, priced per cost factor in the fee currency's base unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFee {
    pub confirmation_time_ms: u64,
    pub price_per_cost_factor: u64,
}

/// Creation parameters of a network
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub uids: String,
    pub name: String,
    /// `mainnet` or `testnet`, must agree with `is_mainnet`
    pub desc: String,
    pub is_mainnet: bool,
    pub confirmation_period_secs: u32,
    pub address_scheme: AddressScheme,
    pub sync_mode: SyncMode,
    pub currency: CurrencyAssociation,
}

/// Family-specific static parameters
#[derive(Debug, Clone, Copy)]
pub enum NetworkParams {
    Bitcoin(&'static BitcoinChainParams),
    Tezos(&'static TezosChainParams),
}

#[derive(Debug, Default)]
struct NetworkState {
    height: u64,
    verified_block_hash: Option<TxHash>,
    fees: Vec<NetworkFee>,
    associations: Vec<CurrencyAssociation>,
}

pub struct Network {
    id: EntityId,
    me: Weak<Network>,
    network_type: NetworkType,
    uids: String,
    name: String,
    desc: String,
    is_mainnet: bool,
    confirmation_period_secs: u32,
    default_address_scheme: AddressScheme,
    default_sync_mode: SyncMode,
    native_currency: Currency,
    params: NetworkParams,
    listener: Option<Arc<Listener>>,
    state: RwLock<NetworkState>,
}

impl Network {
    /// Allocate a network and announce it
    ///
    /// Called by the family handlers once the parameters are selected.
    pub(crate) fn create(
        network_type: NetworkType,
        spec: NetworkSpec,
        params: NetworkParams,
        listener: Option<Arc<Listener>>,
    ) -> Arc<Self> {
        let network = Arc::new_cyclic(|me| Self {
            id: EntityId::new(),
            me: me.clone(),
            network_type,
            uids: spec.uids,
            name: spec.name,
            desc: spec.desc,
            is_mainnet: spec.is_mainnet,
            confirmation_period_secs: spec.confirmation_period_secs,
            default_address_scheme: spec.address_scheme,
            default_sync_mode: spec.sync_mode,
            native_currency: spec.currency.currency.clone(),
            params,
            listener,
            state: RwLock::new(NetworkState {
                associations: vec![spec.currency],
                ..NetworkState::default()
            }),
        });

        network.signal(NetworkEvent::Created);
        network
    }

    fn signal(&self, event: NetworkEvent) {
        let (Some(listener), Some(network)) = (&self.listener, self.me.upgrade()) else {
            return;
        };
        if let Err(e) = listener.signal_network_event(network, event) {
            debug!(network = %self.uids, error = %e, "Network event not delivered");
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    pub fn uids(&self) -> &str {
        &self.uids
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn is_mainnet(&self) -> bool {
        self.is_mainnet
    }

    pub fn confirmation_period_secs(&self) -> u32 {
        self.confirmation_period_secs
    }

    pub fn default_address_scheme(&self) -> AddressScheme {
        self.default_address_scheme
    }

    pub fn default_sync_mode(&self) -> SyncMode {
        self.default_sync_mode
    }

    pub fn native_currency(&self) -> &Currency {
        &self.native_currency
    }

    pub fn params(&self) -> NetworkParams {
        self.params
    }

    /// Bitcoin-family parameters; panics on any other family
    pub fn bitcoin_params(&self) -> &'static BitcoinChainParams {
        match self.params {
            NetworkParams::Bitcoin(params) => params,
            NetworkParams::Tezos(_) => panic!("network {} is not bitcoin-family", self.uids),
        }
    }

    /// Tezos parameters; panics on any other family
    pub fn tezos_params(&self) -> &'static TezosChainParams {
        match self.params {
            NetworkParams::Tezos(params) => params,
            NetworkParams::Bitcoin(_) => panic!("network {} is not tezos", self.uids),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, NetworkState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, NetworkState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn height(&self) -> u64 {
        self.read().height
    }

    /// Record a new chain height; returns false when the height is unchanged
    pub fn set_height(&self, height: u64) -> bool {
        let mut state = self.write();
        let changed = state.height != height;
        state.height = height;
        changed
    }

    pub fn verified_block_hash(&self) -> Option<TxHash> {
        self.read().verified_block_hash
    }

    pub fn set_verified_block_hash(&self, hash: TxHash) {
        self.write().verified_block_hash = Some(hash);
    }

    pub fn fees(&self) -> Vec<NetworkFee> {
        self.read().fees.clone()
    }

    /// Cheapest fee, i.e. the one with the longest confirmation time
    pub fn minimum_fee(&self) -> Option<NetworkFee> {
        self.read()
            .fees
            .iter()
            .max_by_key(|fee| fee.confirmation_time_ms)
            .cloned()
    }

    pub fn set_fees(&self, fees: Vec<NetworkFee>) {
        self.write().fees = fees;
        self.signal(NetworkEvent::FeesUpdated);
    }

    pub fn associations(&self) -> Vec<CurrencyAssociation> {
        self.read().associations.clone()
    }

    pub fn add_association(&self, association: CurrencyAssociation) {
        {
            let mut state = self.write();
            state
                .associations
                .retain(|a| a.currency.code != association.currency.code);
            state.associations.push(association);
        }
        self.signal(NetworkEvent::CurrenciesUpdated);
    }

    /// Association of the currency with `code`, case-insensitively
    pub fn association_for(&self, code: &str) -> Result<CurrencyAssociation> {
        self.read()
            .associations
            .iter()
            .find(|a| a.currency.code.eq_ignore_ascii_case(code))
            .cloned()
            .ok_or_else(|| Error::UnknownCurrency(code.to_string()))
    }

    pub fn native_association(&self) -> Result<CurrencyAssociation> {
        self.association_for(&self.native_currency.code)
    }

    /// Hand the network's last reference to its listener along with `Deleted`
    pub fn release(self: Arc<Self>) {
        match &self.listener {
            Some(listener) => {
                let listener = listener.clone();
                if let Err(e) = listener.signal_network_event(self, NetworkEvent::Deleted) {
                    debug!(error = %e, "Network deletion not delivered");
                }
            }
            None => drop(self),
        }
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("id", &self.id)
            .field("uids", &self.uids)
            .field("type", &self.network_type)
            .finish()
    }
}
