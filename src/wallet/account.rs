//! Accounts
//!
//! An account is the application's identity across networks: a creation time
//! (where syncing starts) and the addresses it owns on each network. Key material
//! never lives here; it reaches the core only as a signing `Credential`.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    uids: String,
    created_at: DateTime<Utc>,
    /// Network uids -> owned addresses, primary address first
    addresses: HashMap<String, Vec<String>>,
}

impl Account {
    pub fn new(uids: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            uids: uids.into(),
            created_at,
            addresses: HashMap::new(),
        }
    }

    /// Add owned addresses on `network_uids`
    pub fn with_addresses<I, S>(mut self, network_uids: &str, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses
            .entry(network_uids.to_string())
            .or_default()
            .extend(addresses.into_iter().map(Into::into));
        self
    }

    pub fn uids(&self) -> &str {
        &self.uids
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Creation time in unix seconds
    pub fn timestamp(&self) -> u64 {
        self.created_at.timestamp().max(0) as u64
    }

    pub fn addresses_for(&self, network_uids: &str) -> &[String] {
        self.addresses
            .get(network_uids)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Secret handed to a signing call
#[derive(Clone)]
pub enum Credential {
    /// 64-byte BIP39 seed
    Seed([u8; 64]),
    /// A single private key
    Key(Vec<u8>),
}

impl Credential {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Seed(seed) => seed,
            Self::Key(key) => key,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seed(_) => write!(f, "Credential::Seed(***)"),
            Self::Key(_) => write!(f, "Credential::Key(***)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_addresses_per_network() {
        let created = Utc.timestamp_opt(1_514_764_800, 0).unwrap();
        let account = Account::new("account-1", created)
            .with_addresses("bitcoin-testnet", ["mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn"])
            .with_addresses("bitcoin-testnet", vec!["tb1qw508d6qejxtdg4c5r3zarvary0c5xw7kxpjzsx"]);

        assert_eq!(account.timestamp(), 1_514_764_800);
        assert_eq!(account.addresses_for("bitcoin-testnet").len(), 2);
        assert!(account.addresses_for("tezos-mainnet").is_empty());
    }

    #[test]
    fn test_credential_debug_is_masked() {
        let credential = Credential::Key(vec![1, 2, 3]);
        assert_eq!(format!("{:?}", credential), "Credential::Key(***)");
        assert_eq!(credential.as_bytes(), &[1, 2, 3]);
    }
}
