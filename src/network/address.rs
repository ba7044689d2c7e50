//! Chain addresses
//!
//! Parsing follows each family's encoding rules:
//! - BTC: base58check P2PKH/P2SH and bech32 segwit
//! - BCH: cashaddr (prefix optional) and legacy base58check
//! - BSV: legacy base58check
//! - XTZ: base58check `tz1`/`tz2`/`tz3`/`KT1`, plus the burn sentinel

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::params::BitcoinChainParams;
use super::NetworkType;
use crate::error::{Error, Result};

/// Strings a Tezos indexer reports for an unrevealed destination
pub const TEZOS_UNKNOWN_ADDRESSES: [&str; 2] = ["unknown", "__unknown__"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    Bitcoin(BitcoinAddress),
    Tezos(TezosAddress),
    /// Unknown or unrevealed destination; target of Tezos burn transfers
    Unknown,
}

impl Address {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Address::Unknown)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Bitcoin(addr) => write!(f, "{}", addr.encoded),
            Address::Tezos(addr) => write!(f, "{}", addr.encode()),
            Address::Unknown => write!(f, "{}", TEZOS_UNKNOWN_ADDRESSES[0]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitcoinAddressKind {
    PubKeyHash,
    ScriptHash,
    Witness { version: u8 },
}

/// A parsed Bitcoin-family address
///
/// `encoded` is canonical for the family: lowercase bech32 on BTC, cashaddr with
/// prefix on BCH (legacy input is re-encoded), base58check otherwise. Two addresses
/// naming the same script compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitcoinAddress {
    pub network_type: NetworkType,
    pub kind: BitcoinAddressKind,
    pub program: Vec<u8>,
    pub encoded: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TezosAddressKind {
    Tz1,
    Tz2,
    Tz3,
    Kt1,
}

impl TezosAddressKind {
    const ALL: [TezosAddressKind; 4] = [Self::Tz1, Self::Tz2, Self::Tz3, Self::Kt1];

    fn prefix(&self) -> [u8; 3] {
        match self {
            Self::Tz1 => [6, 161, 159],
            Self::Tz2 => [6, 161, 161],
            Self::Tz3 => [6, 161, 164],
            Self::Kt1 => [2, 90, 121],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TezosAddress {
    pub kind: TezosAddressKind,
    pub hash: [u8; 20],
}

impl TezosAddress {
    pub fn encode(&self) -> String {
        let mut data = self.kind.prefix().to_vec();
        data.extend_from_slice(&self.hash);
        base58check_encode(&data)
    }
}

// ---------------------------------------------------------------------------
// Base58check

fn checksum(data: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(Sha256::digest(data));
    [digest[0], digest[1], digest[2], digest[3]]
}

pub(crate) fn base58check_encode(data: &[u8]) -> String {
    let mut bytes = data.to_vec();
    bytes.extend_from_slice(&checksum(data));
    bs58::encode(bytes).into_string()
}

pub(crate) fn base58check_decode(s: &str) -> Option<Vec<u8>> {
    let bytes = bs58::decode(s).into_vec().ok()?;
    if bytes.len() < 4 {
        return None;
    }
    let (data, check) = bytes.split_at(bytes.len() - 4);
    (checksum(data) == check).then(|| data.to_vec())
}

// ---------------------------------------------------------------------------
// Cashaddr

const CASHADDR_CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

fn cashaddr_polymod(values: &[u8]) -> u64 {
    let mut c: u64 = 1;
    for value in values {
        let c0 = (c >> 35) as u8;
        c = ((c & 0x07_ffff_ffff) << 5) ^ u64::from(*value);
        if c0 & 0x01 != 0 {
            c ^= 0x98_f2bc_8e61;
        }
        if c0 & 0x02 != 0 {
            c ^= 0x79_b76d_99e2;
        }
        if c0 & 0x04 != 0 {
            c ^= 0xf3_3e5f_b3c4;
        }
        if c0 & 0x08 != 0 {
            c ^= 0xae_2eab_e2a8;
        }
        if c0 & 0x10 != 0 {
            c ^= 0x1e_4f43_e470;
        }
    }
    c ^ 1
}

fn prefix_values(prefix: &str) -> Vec<u8> {
    let mut values: Vec<u8> = prefix.bytes().map(|b| b & 0x1f).collect();
    values.push(0);
    values
}

/// Regroup bits, padding the tail when `pad` is set
fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Option<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let max = (1u32 << to) - 1;
    let mut out = Vec::with_capacity(data.len() * from as usize / to as usize + 1);
    for value in data {
        let v = u32::from(*value);
        if v >> from != 0 {
            return None;
        }
        acc = (acc << from) | v;
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & max) as u8);
        }
    }
    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & max) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & max) != 0 {
        return None;
    }
    Some(out)
}

pub(crate) fn cashaddr_encode(prefix: &str, kind: BitcoinAddressKind, hash: &[u8]) -> String {
    let type_bits: u8 = match kind {
        BitcoinAddressKind::ScriptHash => 8,
        _ => 0,
    };
    let mut payload = vec![type_bits];
    payload.extend_from_slice(hash);
    // 8-to-5 regrouping of arbitrary bytes with padding never fails
    let data = convert_bits(&payload, 8, 5, true).unwrap_or_default();

    let mut values = prefix_values(prefix);
    values.extend_from_slice(&data);
    values.extend_from_slice(&[0u8; 8]);
    let modulus = cashaddr_polymod(&values);

    let mut encoded = format!("{}:", prefix);
    for value in &data {
        encoded.push(CASHADDR_CHARSET[*value as usize] as char);
    }
    for i in 0..8 {
        let value = ((modulus >> (5 * (7 - i))) & 0x1f) as usize;
        encoded.push(CASHADDR_CHARSET[value] as char);
    }
    encoded
}

fn cashaddr_decode(expected_prefix: &str, s: &str) -> Option<(BitcoinAddressKind, Vec<u8>)> {
    let has_upper = s.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = s.chars().any(|c| c.is_ascii_lowercase());
    if has_upper && has_lower {
        return None;
    }
    let lowered = s.to_ascii_lowercase();
    let body = match lowered.split_once(':') {
        Some((prefix, body)) if prefix == expected_prefix => body,
        Some(_) => return None,
        None => lowered.as_str(),
    };

    let mut data = Vec::with_capacity(body.len());
    for c in body.bytes() {
        let value = CASHADDR_CHARSET.iter().position(|x| *x == c)?;
        data.push(value as u8);
    }
    if data.len() <= 8 {
        return None;
    }

    let mut values = prefix_values(expected_prefix);
    values.extend_from_slice(&data);
    if cashaddr_polymod(&values) != 0 {
        return None;
    }

    let payload = convert_bits(&data[..data.len() - 8], 5, 8, false)?;
    let (version, hash) = payload.split_first()?;
    // Only 160-bit hashes are in use
    if version & 0x07 != 0 || hash.len() != 20 {
        return None;
    }
    let kind = match version >> 3 {
        0 => BitcoinAddressKind::PubKeyHash,
        1 => BitcoinAddressKind::ScriptHash,
        _ => return None,
    };
    Some((kind, hash.to_vec()))
}

// ---------------------------------------------------------------------------
// Parsing

fn parse_legacy(params: &BitcoinChainParams, s: &str) -> Option<(BitcoinAddressKind, Vec<u8>)> {
    let data = base58check_decode(s)?;
    let (version, hash) = data.split_first()?;
    if hash.len() != 20 {
        return None;
    }
    if *version == params.pubkey_prefix {
        Some((BitcoinAddressKind::PubKeyHash, hash.to_vec()))
    } else if *version == params.script_prefix {
        Some((BitcoinAddressKind::ScriptHash, hash.to_vec()))
    } else {
        None
    }
}

fn parse_segwit(hrp: &str, s: &str) -> Option<(BitcoinAddressKind, Vec<u8>)> {
    let (parsed_hrp, version, program) = bech32::segwit::decode(s).ok()?;
    if parsed_hrp.to_lowercase() != hrp {
        return None;
    }
    Some((
        BitcoinAddressKind::Witness {
            version: version.to_u8(),
        },
        program,
    ))
}

/// Parse a Bitcoin-family address with the network's encoding parameters
pub fn parse_bitcoin(params: &BitcoinChainParams, s: &str) -> Result<Address> {
    let s = s.trim();
    let invalid = || Error::InvalidAddress(format!("{} is not a {} address", s, params.name));

    let (kind, program, encoded) = match params.family {
        NetworkType::Btc => {
            if let Some((kind, program)) = parse_legacy(params, s) {
                (kind, program, s.to_string())
            } else {
                let hrp = params.bech32_hrp.ok_or_else(invalid)?;
                let (kind, program) = parse_segwit(hrp, s).ok_or_else(invalid)?;
                (kind, program, s.to_ascii_lowercase())
            }
        }
        NetworkType::Bch => {
            let prefix = params.cashaddr_prefix.ok_or_else(invalid)?;
            let (kind, program) = cashaddr_decode(prefix, s)
                .or_else(|| parse_legacy(params, s))
                .ok_or_else(invalid)?;
            let encoded = cashaddr_encode(prefix, kind, &program);
            (kind, program, encoded)
        }
        NetworkType::Bsv => {
            let (kind, program) = parse_legacy(params, s).ok_or_else(invalid)?;
            (kind, program, s.to_string())
        }
        NetworkType::Xtz => panic!("tezos address parsed with bitcoin parameters"),
    };

    Ok(Address::Bitcoin(BitcoinAddress {
        network_type: params.family,
        kind,
        program,
        encoded,
    }))
}

/// Parse a Tezos address
///
/// Unless `strict`, the indexer placeholders for unrevealed destinations parse to
/// `Address::Unknown`.
pub fn parse_tezos(s: &str, strict: bool) -> Result<Address> {
    let s = s.trim();
    if !strict && TEZOS_UNKNOWN_ADDRESSES.contains(&s) {
        return Ok(Address::Unknown);
    }

    let invalid = || Error::InvalidAddress(format!("{} is not a tezos address", s));
    let data = base58check_decode(s).ok_or_else(invalid)?;
    if data.len() != 23 {
        return Err(invalid());
    }
    let kind = TezosAddressKind::ALL
        .into_iter()
        .find(|k| data[..3] == k.prefix())
        .ok_or_else(invalid)?;

    let mut hash = [0u8; 20];
    hash.copy_from_slice(&data[3..]);
    Ok(Address::Tezos(TezosAddress { kind, hash }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::params::bitcoin_params;

    const GENESIS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
    const SEGWIT: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

    #[test]
    fn test_btc_legacy_address() {
        let params = bitcoin_params(NetworkType::Btc, true);
        let addr = parse_bitcoin(params, GENESIS).unwrap();
        match &addr {
            Address::Bitcoin(btc) => {
                assert_eq!(btc.kind, BitcoinAddressKind::PubKeyHash);
                assert_eq!(btc.program.len(), 20);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(addr.to_string(), GENESIS);

        // Mainnet address is not a testnet address
        let testnet = bitcoin_params(NetworkType::Btc, false);
        assert!(parse_bitcoin(testnet, GENESIS).is_err());
    }

    #[test]
    fn test_btc_segwit_address() {
        let params = bitcoin_params(NetworkType::Btc, true);
        let addr = parse_bitcoin(params, &SEGWIT.to_uppercase()).unwrap();
        assert_eq!(addr.to_string(), SEGWIT);
        match addr {
            Address::Bitcoin(btc) => assert_eq!(btc.kind, BitcoinAddressKind::Witness { version: 0 }),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let params = bitcoin_params(NetworkType::Btc, true);
        let err = parse_bitcoin(params, "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNb").unwrap_err();
        assert!(err.is_data_error());
    }

    #[test]
    fn test_bch_accepts_legacy_and_cashaddr() {
        let params = bitcoin_params(NetworkType::Bch, true);
        let legacy = parse_bitcoin(params, GENESIS).unwrap();
        let encoded = legacy.to_string();
        assert!(encoded.starts_with("bitcoincash:q"));

        // Prefix is optional
        let bare = encoded.trim_start_matches("bitcoincash:");
        assert_eq!(parse_bitcoin(params, bare).unwrap(), legacy);
        assert_eq!(parse_bitcoin(params, &encoded.to_uppercase()).unwrap(), legacy);

        // Corrupt the last checksum character
        let mut corrupt = encoded.clone();
        let last = corrupt.pop().unwrap();
        corrupt.push(if last == 'q' { 'p' } else { 'q' });
        assert!(parse_bitcoin(params, &corrupt).is_err());
    }

    #[test]
    fn test_bsv_is_legacy_only() {
        let params = bitcoin_params(NetworkType::Bsv, true);
        assert!(parse_bitcoin(params, GENESIS).is_ok());
        assert!(parse_bitcoin(params, SEGWIT).is_err());

        let bch = bitcoin_params(NetworkType::Bch, true);
        let cash = parse_bitcoin(bch, GENESIS).unwrap().to_string();
        assert!(parse_bitcoin(params, &cash).is_err());
    }

    #[test]
    fn test_tezos_address() {
        let source = TezosAddress {
            kind: TezosAddressKind::Tz1,
            hash: [7u8; 20],
        };
        let encoded = source.encode();
        assert!(encoded.starts_with("tz1"));
        assert_eq!(encoded.len(), 36);
        assert_eq!(parse_tezos(&encoded, true).unwrap(), Address::Tezos(source));

        let contract = TezosAddress {
            kind: TezosAddressKind::Kt1,
            hash: [1u8; 20],
        }
        .encode();
        assert!(contract.starts_with("KT1"));
    }

    #[test]
    fn test_tezos_unknown_sentinel() {
        assert_eq!(parse_tezos("unknown", false).unwrap(), Address::Unknown);
        assert_eq!(parse_tezos("__unknown__", false).unwrap(), Address::Unknown);
        assert!(parse_tezos("unknown", true).is_err());
        assert!(Address::Unknown.is_unknown());
    }
}
