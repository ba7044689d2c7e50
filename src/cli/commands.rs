//! CLI command implementations

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::config::{Config, NetworkConfig};
use crate::handler::{ChainHandler, DigestSerializer, HandlerRegistry};
use crate::listener::{
    EventPayload, Listener, ListenerCallbacks, ListenerEvent, ManagerEvent, WalletEvent,
};
use crate::manager::replay::{fee_estimates_from_file, ReplayBundles, ReplayClient};
use crate::manager::{WalletManager, WalletManagerState};
use crate::network::{AddressScheme, Network, NetworkType};
use crate::wallet::Account;

/// How long `replay` waits for each recorded answer to arrive
const REPLAY_STEP_TIMEOUT: Duration = Duration::from_secs(10);

fn registry() -> HandlerRegistry {
    HandlerRegistry::with_defaults(Arc::new(DigestSerializer::new()))
}

fn network_config<'a>(config: &'a Config, uids: &str) -> Result<&'a NetworkConfig> {
    config.network(uids).with_context(|| {
        let known: Vec<&str> = config.networks.iter().map(|n| n.uids.as_str()).collect();
        format!("Unknown network {} (configured: {})", uids, known.join(", "))
    })
}

fn create_network(
    registry: &HandlerRegistry,
    network: &NetworkConfig,
    listener: Option<Arc<Listener>>,
) -> Result<Arc<Network>> {
    let created = registry.create_network(network.network_type, listener, network.spec())?;
    if !network.fees.is_empty() {
        created.set_fees(network.fees.clone());
    }
    Ok(created)
}

fn p2p_label(handler: &dyn ChainHandler) -> &'static str {
    if handler.supports_p2p() {
        "available"
    } else {
        "client only"
    }
}

/// List configured networks and what their handlers support
pub fn networks(config: &Config) -> Result<()> {
    let registry = registry();

    println!("\n=== NETWORKS ===\n");
    for network_config in &config.networks {
        let handler = registry.get(network_config.network_type)?;
        let network = create_network(&registry, network_config, None)?;
        let currency = network.native_currency();
        let schemes: Vec<String> = AddressScheme::supported_by(network.network_type())
            .iter()
            .map(|s| format!("{:?}", s).to_lowercase())
            .collect();

        println!("{} ({})", network.uids(), network.name());
        println!("  Type:          {}", network.network_type());
        println!("  Mainnet:       {}", network.is_mainnet());
        println!("  Currency:      {} ({})", currency.code, currency.name);
        println!("  Address:       {}", schemes.join(", "));
        println!("  Sync mode:     {}", network.default_sync_mode());
        println!("  Peer-to-peer:  {}", p2p_label(handler.as_ref()));
        match network.minimum_fee() {
            Some(fee) => println!(
                "  Minimum fee:   {} per cost unit, {}s",
                fee.price_per_cost_factor,
                fee.confirmation_time_ms / 1000
            ),
            None => println!("  Minimum fee:   none configured"),
        }
        println!("  Events:        {}", handler.event_types().join(", "));
        println!();

        network.release();
    }
    Ok(())
}

/// Block height of the last checkpoint at or before `timestamp`
pub fn checkpoint(config: &Config, uids: &str, timestamp: u64) -> Result<()> {
    let registry = registry();
    let network_config = network_config(config, uids)?;
    let handler = registry.get(network_config.network_type)?;
    let network = create_network(&registry, network_config, None)?;

    let height = handler.estimate_block_number_at_or_before_timestamp(&network, timestamp);
    let when = Utc
        .timestamp_opt(timestamp as i64, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| timestamp.to_string());
    println!("{} at {}: block {}", network.uids(), when, height);

    network.release();
    Ok(())
}

/// Prints every delivered event on stdout
struct PrintingCallbacks;

impl ListenerCallbacks for PrintingCallbacks {
    fn handle_event(&self, event: &ListenerEvent) {
        let detail = match &event.payload {
            EventPayload::Network { network, event } => {
                format!("network  {:<22} {}", event.name(), network.uids())
            }
            EventPayload::Manager { manager, event } => {
                let extra = match event {
                    ManagerEvent::Changed { old, new } => format!("{} -> {}", old, new),
                    ManagerEvent::BlockHeightUpdated { height } => format!("height {}", height),
                    ManagerEvent::SyncStopped { reason } => format!("{:?}", reason),
                    _ => String::new(),
                };
                format!("manager  {:<22} {} {}", event.name(), manager.network().uids(), extra)
            }
            EventPayload::Wallet { wallet, event, .. } => {
                let extra = match event {
                    WalletEvent::BalanceUpdated { balance } => format!("balance {}", balance),
                    WalletEvent::FeeBasisEstimated { cookie, result } => match result {
                        Ok(basis) => format!("cookie {} fee {}", cookie, basis.fee()),
                        Err(reason) => format!("cookie {} failed: {}", cookie, reason),
                    },
                    _ => String::new(),
                };
                format!("wallet   {:<22} {} {}", event.name(), wallet.currency().code, extra)
            }
            EventPayload::Transfer {
                transfer, event, ..
            } => {
                let hash = transfer
                    .hash()
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "-".to_string());
                format!(
                    "transfer {:<22} {} {:?} {} [{}]",
                    event.name(),
                    hash,
                    transfer.direction(),
                    transfer.amount(),
                    transfer.state()
                )
            }
        };
        println!("#{:<5} {}", event.sequence, detail);
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) -> Result<()> {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(REPLAY_STEP_TIMEOUT, poll)
        .await
        .with_context(|| format!("Timed out waiting for {}", what))
}

/// Run a wallet manager against recorded client answers and print its events
pub async fn replay(
    config: &Config,
    uids: &str,
    bundles_path: &Path,
    address: &str,
    fee_estimates_path: Option<&Path>,
) -> Result<()> {
    let registry = registry();
    let network_config = network_config(config, uids)?;

    let bundles = ReplayBundles::from_file(bundles_path)
        .with_context(|| format!("Cannot read bundles from {}", bundles_path.display()))?;
    let fee_estimates = match fee_estimates_path {
        Some(path) => fee_estimates_from_file(path)
            .with_context(|| format!("Cannot read fee estimates from {}", path.display()))?,
        None => Vec::new(),
    };
    info!(
        network = %uids,
        transfers = bundles.transfers.len(),
        transactions = bundles.transactions.len(),
        fee_estimates = fee_estimates.len(),
        "Replaying recorded chain data"
    );

    let listener = Listener::with_thread_name(
        "replay",
        config.listener.thread_name.clone(),
        Arc::new(PrintingCallbacks),
    );
    listener.start()?;

    let network = create_network(&registry, network_config, Some(listener.clone()))?;
    // Recorded history may start anywhere, so the account dates back to the epoch
    let created_at = Utc.timestamp_opt(0, 0).single().context("Invalid epoch")?;
    let account = Arc::new(Account::new("replay", created_at).with_addresses(uids, [address]));
    let client = ReplayClient::new(
        Handle::current(),
        bundles,
        config.replay.latency_ms,
        config.replay.jitter_ms,
    )
    .with_fee_estimates(fee_estimates);

    let manager = WalletManager::create(
        &registry,
        listener.clone(),
        Arc::new(client),
        account,
        network,
        network_config.sync_mode,
        network_config.address_scheme,
        config.storage.path(),
    )?;

    let outcome = drive(&manager).await;

    manager.release();
    listener.stop();
    outcome
}

async fn drive(manager: &Arc<WalletManager>) -> Result<()> {
    manager.connect()?;
    wait_for("the block height", || manager.network().height() > 0).await?;

    manager.sync()?;
    wait_for("the sync to finish", || {
        manager.state() != WalletManagerState::Syncing
    })
    .await?;

    let wallet = manager.primary_wallet()?;
    match manager.network().minimum_fee() {
        Some(fee) => {
            let target = wallet.primary_address().clone();
            if let Err(e) = manager.estimate_fee_basis(&wallet, 1, &target, 0, &fee, &[]) {
                warn!(error = %e, "Fee estimate not started");
            }
            wait_for("the fee estimate", || manager.pending_fee_estimates() == 0).await?;
        }
        None => warn!(network = %manager.network().uids(), "No network fee, skipping the fee estimate"),
    }

    println!();
    println!("Wallet:    {}", wallet.currency().code);
    println!("Balance:   {}", wallet.balance());
    println!("Transfers: {}", wallet.transfer_count());
    if manager.network().network_type() == NetworkType::Xtz {
        println!("Counter:   {}", wallet.counter());
    }
    Ok(())
}

/// Show the effective configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_network_lists_configured() {
        let config = Config::default();
        let err = network_config(&config, "dogecoin-mainnet").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("dogecoin-mainnet"));
        assert!(message.contains("bitcoin-testnet"));
    }

    #[test]
    fn test_create_network_applies_configured_fees() {
        let config = Config::default();
        let xtz = network_config(&config, "tezos-mainnet").unwrap();
        let network = create_network(&registry(), xtz, None).unwrap();
        assert_eq!(network.fees(), xtz.fees);
        assert!(network.minimum_fee().is_some());
    }

    #[test]
    fn test_p2p_label_follows_handler() {
        let registry = registry();
        for network_type in NetworkType::ALL {
            let handler = registry.get(network_type).unwrap();
            assert_eq!(p2p_label(handler.as_ref()), "client only");
        }
    }

    #[test]
    fn test_listing_and_checkpoint_commands() {
        let config = Config::default();
        networks(&config).unwrap();
        checkpoint(&config, "bitcoin-testnet", 1_600_000_000).unwrap();
        assert!(checkpoint(&config, "nope-testnet", 0).is_err());
    }
}
