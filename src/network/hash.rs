//! Transaction hashes

use std::fmt;

use serde::{Deserialize, Serialize};

use super::address::{base58check_decode, base58check_encode};
use super::NetworkType;
use crate::error::{Error, Result};

/// Base58check prefix of Tezos operation hashes (`o...`)
const TEZOS_OPERATION_PREFIX: [u8; 2] = [5, 116];

/// A 32-byte transaction hash tagged with its chain family
///
/// One hash may identify several transfers (a Tezos operation carrying a burn next
/// to the normal transfer), so a hash is never used as transfer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHash {
    pub network_type: NetworkType,
    pub bytes: [u8; 32],
}

impl TxHash {
    pub fn new(network_type: NetworkType, bytes: [u8; 32]) -> Self {
        Self {
            network_type,
            bytes,
        }
    }

    /// Parse the family's canonical string form
    pub fn parse(network_type: NetworkType, s: &str) -> Result<Self> {
        let invalid = || Error::InvalidHash(format!("{} is not a {} hash", s, network_type));
        let mut bytes = [0u8; 32];

        if network_type.is_utxo() {
            let s = s.trim_start_matches("0x");
            if s.len() != 64 {
                return Err(invalid());
            }
            hex::decode_to_slice(s, &mut bytes).map_err(|_| invalid())?;
        } else {
            let data = base58check_decode(s).ok_or_else(invalid)?;
            if data.len() != 34 || data[..2] != TEZOS_OPERATION_PREFIX {
                return Err(invalid());
            }
            bytes.copy_from_slice(&data[2..]);
        }

        Ok(Self::new(network_type, bytes))
    }

    /// Canonical string form: lowercase hex for UTXO chains, `o...` base58check on Tezos
    pub fn encode(&self) -> String {
        if self.network_type.is_utxo() {
            hex::encode(self.bytes)
        } else {
            let mut data = TEZOS_OPERATION_PREFIX.to_vec();
            data.extend_from_slice(&self.bytes);
            base58check_encode(&data)
        }
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utxo_hash_hex() {
        let s = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";
        let hash = TxHash::parse(NetworkType::Btc, s).unwrap();
        assert_eq!(hash.bytes[0], 0x4a);
        assert_eq!(hash.encode(), s);
        assert_eq!(TxHash::parse(NetworkType::Btc, &s.to_uppercase()).unwrap(), hash);
    }

    #[test]
    fn test_utxo_hash_rejects_malformed() {
        assert!(TxHash::parse(NetworkType::Bch, "abcd").is_err());
        let not_hex = "zz".repeat(32);
        assert!(TxHash::parse(NetworkType::Bsv, &not_hex).is_err());
    }

    #[test]
    fn test_tezos_operation_hash() {
        let hash = TxHash::new(NetworkType::Xtz, [9u8; 32]);
        let encoded = hash.encode();
        assert!(encoded.starts_with('o'));
        assert_eq!(encoded.len(), 51);
        assert_eq!(TxHash::parse(NetworkType::Xtz, &encoded).unwrap(), hash);

        // Hex is not a tezos hash
        assert!(TxHash::parse(NetworkType::Xtz, &hex::encode([9u8; 32])).is_err());
    }

    #[test]
    fn test_hashes_of_different_families_differ() {
        let a = TxHash::new(NetworkType::Btc, [1u8; 32]);
        let b = TxHash::new(NetworkType::Bch, [1u8; 32]);
        assert_ne!(a, b);
    }
}
