//! Configuration loading and validation

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

use crate::network::{
    AddressScheme, CurrencyAssociation, NetworkFee, NetworkSpec, NetworkType, SyncMode,
};

lazy_static! {
    static ref NETWORK_UIDS: Regex = Regex::new(r"^[a-z0-9]+-(mainnet|testnet)$").unwrap();
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default = "default_networks")]
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            thread_name: default_thread_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            enabled: true,
        }
    }
}

impl StorageConfig {
    /// Directory handed to wallet managers, `None` when persistence is off
    pub fn path(&self) -> Option<&Path> {
        self.enabled.then(|| Path::new(&self.base_path))
    }
}

/// Timing of the replay client's answers
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_latency_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

/// One network instance the engine can run
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub uids: String,
    pub name: String,
    pub network_type: NetworkType,
    #[serde(default)]
    pub is_mainnet: bool,
    #[serde(default = "default_confirmation_period_secs")]
    pub confirmation_period_secs: u32,
    pub address_scheme: AddressScheme,
    #[serde(default = "default_sync_mode")]
    pub sync_mode: SyncMode,
    pub currency_code: String,
    pub decimals: u8,
    /// Fees offered to the network; the slowest one prices new wallets
    #[serde(default)]
    pub fees: Vec<NetworkFee>,
}

fn default_log_filter() -> String {
    "wkcore=info".to_string()
}

fn default_thread_name() -> String {
    "wkcore-listener".to_string()
}

fn default_base_path() -> String {
    "wkcore-data".to_string()
}

fn default_latency_ms() -> u64 {
    25
}

fn default_jitter_ms() -> u64 {
    10
}

fn default_confirmation_period_secs() -> u32 {
    600
}

fn default_sync_mode() -> SyncMode {
    SyncMode::ApiOnly
}

fn default_true() -> bool {
    true
}

fn default_networks() -> Vec<NetworkConfig> {
    vec![
        NetworkConfig::preset(NetworkType::Btc, false),
        NetworkConfig::preset(NetworkType::Xtz, true),
    ]
}

fn family_name(network_type: NetworkType) -> &'static str {
    match network_type {
        NetworkType::Btc => "bitcoin",
        NetworkType::Bch => "bitcoincash",
        NetworkType::Bsv => "bitcoinsv",
        NetworkType::Xtz => "tezos",
    }
}

fn base_unit(network_type: NetworkType) -> &'static str {
    if network_type.is_utxo() {
        "sat"
    } else {
        "mutez"
    }
}

impl NetworkConfig {
    /// The stock definition of a family's mainnet or testnet
    pub fn preset(network_type: NetworkType, is_mainnet: bool) -> Self {
        let desc = if is_mainnet { "mainnet" } else { "testnet" };
        let family = family_name(network_type);
        let (confirmation_period_secs, decimals, fees) = match network_type {
            NetworkType::Xtz => (
                60,
                6,
                vec![NetworkFee {
                    confirmation_time_ms: 60_000,
                    price_per_cost_factor: 1_000,
                }],
            ),
            _ => (
                600,
                8,
                vec![
                    NetworkFee {
                        confirmation_time_ms: 600_000,
                        price_per_cost_factor: 20_000,
                    },
                    NetworkFee {
                        confirmation_time_ms: 3_600_000,
                        price_per_cost_factor: 10_000,
                    },
                ],
            ),
        };

        Self {
            uids: format!("{}-{}", family, desc),
            name: format!("{} {}", family, desc),
            network_type,
            is_mainnet,
            confirmation_period_secs,
            address_scheme: AddressScheme::supported_by(network_type)[0],
            sync_mode: SyncMode::ApiOnly,
            currency_code: network_type.code().to_string(),
            decimals,
            fees,
        }
    }

    pub fn desc(&self) -> &'static str {
        if self.is_mainnet {
            "mainnet"
        } else {
            "testnet"
        }
    }

    /// Creation parameters for `HandlerRegistry::create_network`
    pub fn spec(&self) -> NetworkSpec {
        NetworkSpec {
            uids: self.uids.clone(),
            name: self.name.clone(),
            desc: self.desc().to_string(),
            is_mainnet: self.is_mainnet,
            confirmation_period_secs: self.confirmation_period_secs,
            address_scheme: self.address_scheme,
            sync_mode: self.sync_mode,
            currency: CurrencyAssociation::native(
                &self.uids,
                &self.currency_code,
                family_name(self.network_type),
                base_unit(self.network_type),
                self.decimals,
            ),
        }
    }

    fn validate(&self) -> Result<()> {
        let caps = NETWORK_UIDS
            .captures(&self.uids)
            .with_context(|| format!("Invalid network uids: {}", self.uids))?;
        if &caps[1] != self.desc() {
            anyhow::bail!(
                "Network {} is_mainnet = {} contradicts its uids",
                self.uids,
                self.is_mainnet
            );
        }
        if !self.address_scheme.is_supported_by(self.network_type) {
            anyhow::bail!(
                "Address scheme {:?} is not available on {} ({})",
                self.address_scheme,
                self.network_type,
                self.uids
            );
        }
        if !self.network_type.is_utxo() && self.sync_mode.is_p2p() {
            anyhow::bail!("Sync mode {} needs P2P, unavailable on {}", self.sync_mode, self.uids);
        }
        if self.decimals > 18 {
            anyhow::bail!("decimals cannot exceed 18 ({})", self.uids);
        }
        if self.currency_code.trim().is_empty() {
            anyhow::bail!("currency_code must be set ({})", self.uids);
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("logging.filter", default_log_filter())?
            .set_default("logging.json", false)?
            .set_default("listener.thread_name", default_thread_name())?
            .set_default("storage.base_path", default_base_path())?
            .set_default("storage.enabled", true)?
            .set_default("replay.latency_ms", default_latency_ms() as i64)?
            .set_default("replay.jitter_ms", default_jitter_ms() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix WKCORE_)
            .add_source(
                config::Environment::with_prefix("WKCORE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for network in &self.networks {
            network.validate()?;
            if !seen.insert(network.uids.as_str()) {
                anyhow::bail!("Duplicate network uids: {}", network.uids);
            }
        }

        if self.listener.thread_name.trim().is_empty() {
            anyhow::bail!("listener.thread_name must not be empty");
        }

        if self.storage.enabled && self.storage.base_path.trim().is_empty() {
            anyhow::bail!("storage.base_path must be set when storage is enabled");
        }

        Ok(())
    }

    pub fn network(&self, uids: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.uids == uids)
    }

    /// Effective configuration for display
    pub fn masked_display(&self) -> String {
        let mut out = format!(
            r#"Configuration:
  Logging:
    filter: {}
    json: {}
  Listener:
    thread_name: {}
  Storage:
    enabled: {}
    base_path: {}
  Replay:
    latency: {}ms
    jitter: {}ms
  Networks:
"#,
            self.logging.filter,
            self.logging.json,
            self.listener.thread_name,
            self.storage.enabled,
            mask_home(&self.storage.base_path),
            self.replay.latency_ms,
            self.replay.jitter_ms,
        );
        for network in &self.networks {
            out.push_str(&format!(
                "    {} ({}): scheme={:?} sync={} currency={} decimals={}\n",
                network.uids,
                network.network_type,
                network.address_scheme,
                network.sync_mode,
                network.currency_code,
                network.decimals,
            ));
        }
        out
    }
}

/// Replace the user's home directory prefix with `~`
fn mask_home(path: &str) -> String {
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() && path.starts_with(&home) => {
            format!("~{}", &path[home.len()..])
        }
        _ => path.to_string(),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            listener: ListenerConfig::default(),
            storage: StorageConfig::default(),
            replay: ReplayConfig::default(),
            networks: default_networks(),
        }
    }
}
