//! Replay client
//!
//! Answers a manager's requests from recorded bundles. Each answer is delivered
//! on a tokio task after the configured latency plus a random jitter, so the
//! manager sees announcements arriving from another thread, as with a live client.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::client::{Client, ClientError, FeeEstimate, TransactionBundle, TransferBundle};
use super::WalletManager;
use crate::error::Result;
use crate::network::NetworkFee;
use crate::wallet::{FeeBasis, Transfer};

/// Recorded chain state served by a `ReplayClient`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayBundles {
    #[serde(default)]
    pub block_number: u64,
    #[serde(default)]
    pub transfers: Vec<TransferBundle>,
    #[serde(default)]
    pub transactions: Vec<TransactionBundle>,
}

impl ReplayBundles {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Load recorded fee estimates, answered in file order
pub fn fee_estimates_from_file(path: &Path) -> Result<Vec<FeeEstimate>> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub struct ReplayClient {
    handle: Handle,
    latency: Duration,
    jitter_ms: u64,
    bundles: ReplayBundles,
    fee_estimates: Mutex<VecDeque<FeeEstimate>>,
    submitted: Mutex<Vec<String>>,
}

/// A block is in `[begin, end)`; pending bundles (block 0) always match
fn in_range(block: u64, begin: u64, end: u64) -> bool {
    block == 0 || (begin..end).contains(&block)
}

impl ReplayClient {
    pub fn new(handle: Handle, bundles: ReplayBundles, latency_ms: u64, jitter_ms: u64) -> Self {
        Self {
            handle,
            latency: Duration::from_millis(latency_ms),
            jitter_ms,
            bundles,
            fee_estimates: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fee_estimates(self, estimates: Vec<FeeEstimate>) -> Self {
        *self.fee_estimates.lock().unwrap_or_else(|e| e.into_inner()) = estimates.into();
        self
    }

    /// Hex serializations handed to `submit_transaction`, in order
    pub fn submitted(&self) -> Vec<String> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn delay(&self) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.latency + Duration::from_millis(jitter)
    }

    /// Run `answer` against the manager later, unless it was released meanwhile
    fn answer<F>(&self, manager: &Arc<WalletManager>, request: &'static str, answer: F)
    where
        F: FnOnce(Arc<WalletManager>) + Send + 'static,
    {
        let weak: Weak<WalletManager> = Arc::downgrade(manager);
        let delay = self.delay();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            match weak.upgrade() {
                Some(manager) => answer(manager),
                None => debug!(request, "Manager released before the replayed answer"),
            }
        });
    }
}

impl Client for ReplayClient {
    fn get_block_number(&self, manager: &Arc<WalletManager>, rid: u64) {
        let height = self.bundles.block_number;
        self.answer(manager, "get_block_number", move |manager| {
            manager.announce_block_number(rid, height, None);
        });
    }

    fn get_transfers(
        &self,
        manager: &Arc<WalletManager>,
        rid: u64,
        addresses: Vec<String>,
        begin_block: u64,
        end_block: u64,
    ) {
        let bundles: Vec<TransferBundle> = self
            .bundles
            .transfers
            .iter()
            .filter(|b| addresses.iter().any(|a| *a == b.from || *a == b.to))
            .filter(|b| in_range(b.block_number, begin_block, end_block))
            .cloned()
            .collect();
        info!(rid, count = bundles.len(), begin_block, end_block, "Replaying transfers");
        self.answer(manager, "get_transfers", move |manager| {
            if let Err(e) = manager.announce_transfers(rid, Ok(bundles)) {
                warn!(rid, error = %e, "Replayed transfers not announced");
            }
        });
    }

    fn get_transactions(
        &self,
        manager: &Arc<WalletManager>,
        rid: u64,
        _addresses: Vec<String>,
        begin_block: u64,
        end_block: u64,
    ) {
        let bundles: Vec<TransactionBundle> = self
            .bundles
            .transactions
            .iter()
            .filter(|b| in_range(b.block_height, begin_block, end_block))
            .cloned()
            .collect();
        info!(rid, count = bundles.len(), begin_block, end_block, "Replaying transactions");
        self.answer(manager, "get_transactions", move |manager| {
            if let Err(e) = manager.announce_transactions(rid, Ok(bundles)) {
                warn!(rid, error = %e, "Replayed transactions not announced");
            }
        });
    }

    fn submit_transaction(
        &self,
        manager: &Arc<WalletManager>,
        transfer: Arc<Transfer>,
        serialization: Vec<u8>,
    ) {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hex::encode(&serialization));
        self.answer(manager, "submit_transaction", move |manager| {
            manager.announce_submit(&transfer, Ok(()));
        });
    }

    fn estimate_transfer_fee(
        &self,
        manager: &Arc<WalletManager>,
        cookie: u64,
        _transfer: Arc<Transfer>,
        _network_fee: NetworkFee,
        _initial: FeeBasis,
        _serialization: Vec<u8>,
    ) {
        let estimate = self
            .fee_estimates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| ClientError("no recorded fee estimate".to_string()));
        self.answer(manager, "estimate_transfer_fee", move |manager| {
            if let Err(e) = manager.announce_estimate_transfer_fee(cookie, estimate) {
                warn!(cookie, error = %e, "Replayed fee estimate not announced");
            }
        });
    }
}

impl std::fmt::Debug for ReplayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayClient")
            .field("latency", &self.latency)
            .field("jitter_ms", &self.jitter_ms)
            .field("transfers", &self.bundles.transfers.len())
            .field("transactions", &self.bundles.transactions.len())
            .finish()
    }
}
