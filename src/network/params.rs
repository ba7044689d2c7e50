//! Static chain parameters
//!
//! One parameter set per (family, mainnet|testnet). Networks keep a `&'static`
//! reference to their parameters, so the sets live for the whole process.

use lazy_static::lazy_static;

use super::NetworkType;

/// A block whose height and timestamp are known ahead of time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckPoint {
    pub height: u64,
    /// Block timestamp, unix seconds
    pub timestamp: u64,
}

const fn cp(height: u64, timestamp: u64) -> CheckPoint {
    CheckPoint { height, timestamp }
}

/// Parameters shared by the Bitcoin-derived family (BTC, BCH, BSV)
#[derive(Debug)]
pub struct BitcoinChainParams {
    pub family: NetworkType,
    pub is_mainnet: bool,
    pub name: &'static str,
    pub standard_port: u16,
    /// Base58check version byte of pay-to-pubkey-hash addresses
    pub pubkey_prefix: u8,
    /// Base58check version byte of pay-to-script-hash addresses
    pub script_prefix: u8,
    /// Segwit human readable part (BTC only)
    pub bech32_hrp: Option<&'static str>,
    /// Cashaddr prefix (BCH only)
    pub cashaddr_prefix: Option<&'static str>,
    /// Sighash fork id, 0 when the chain does not use one
    pub fork_id: u8,
    /// Ascending by height and timestamp
    pub checkpoints: Vec<CheckPoint>,
}

impl BitcoinChainParams {
    /// Latest checkpoint with `timestamp <= at`
    pub fn checkpoint_before(&self, at: u64) -> Option<&CheckPoint> {
        self.checkpoints.iter().rev().find(|c| c.timestamp <= at)
    }

    pub fn is_bitcoin(&self) -> bool {
        self.family == NetworkType::Btc
    }

    pub fn is_bsv(&self) -> bool {
        self.family == NetworkType::Bsv
    }
}

/// Tezos network parameters
#[derive(Debug)]
pub struct TezosChainParams {
    pub is_mainnet: bool,
    pub name: &'static str,
    /// Lower bound of any operation fee, in mutez
    pub minimal_fee_mutez: u64,
    pub default_gas_limit: u64,
    pub default_storage_limit: u64,
    pub checkpoints: Vec<CheckPoint>,
}

impl TezosChainParams {
    pub fn checkpoint_before(&self, at: u64) -> Option<&CheckPoint> {
        self.checkpoints.iter().rev().find(|c| c.timestamp <= at)
    }
}

/// Sighash fork id used by BCH and BSV
pub const BCH_FORK_ID: u8 = 0x40;
pub const BSV_FORK_ID: u8 = 0x40;

/// Bitcoin mainnet difficulty-period checkpoints
const BTC_MAINNET_CHECKPOINTS: &[CheckPoint] = &[
    cp(0, 1231006505),
    cp(20160, 1248481816),
    cp(40320, 1266191579),
    cp(60480, 1276298786),
    cp(80640, 1284861847),
    cp(100800, 1294031411),
    cp(120960, 1304131980),
    cp(141120, 1313451894),
    cp(161280, 1326047176),
    cp(181440, 1337883029),
    cp(201600, 1349226660),
    cp(221760, 1361148470),
    cp(241920, 1371418654),
    cp(262080, 1381070552),
    cp(282240, 1390570126),
    cp(302400, 1400928750),
    cp(322560, 1411680080),
    cp(342720, 1423496415),
    cp(362880, 1435475246),
    cp(383040, 1447236692),
    cp(403200, 1458292068),
    cp(423360, 1470163842),
    cp(443520, 1481765313),
    cp(463680, 1493259601),
    cp(483840, 1503802540),
    cp(504000, 1514595488),
];

const TESTNET_CHECKPOINTS: &[CheckPoint] = &[
    cp(0, 1296688602),
    cp(100800, 1376543922),
    cp(201600, 1393659041),
    cp(302400, 1413127683),
    cp(403200, 1431811463),
    cp(504000, 1436351262),
];

/// Last height shared by BTC and BCH
const BCH_SPLIT_HEIGHT: u64 = 478558;

const BCH_MAINNET_CHECKPOINTS: &[CheckPoint] = &[
    cp(478559, 1501611161),
    cp(504031, 1515827554),
    cp(530359, 1525448353),
];

/// Last height shared by BCH and BSV
const BSV_SPLIT_HEIGHT: u64 = 556766;

const BSV_MAINNET_CHECKPOINTS: &[CheckPoint] = &[cp(556767, 1542304936), cp(584620, 1559010245)];

const BCH_TESTNET_CHECKPOINTS: &[CheckPoint] = &[cp(0, 1296688602), cp(1155875, 1514565123)];

fn chain(parts: &[(&[CheckPoint], u64)]) -> Vec<CheckPoint> {
    // Each part contributes the checkpoints up to its height bound
    parts
        .iter()
        .flat_map(|(points, bound)| points.iter().filter(move |c| c.height <= *bound).copied())
        .collect()
}

lazy_static! {
    pub static ref BTC_MAINNET: BitcoinChainParams = BitcoinChainParams {
        family: NetworkType::Btc,
        is_mainnet: true,
        name: "bitcoin-mainnet",
        standard_port: 8333,
        pubkey_prefix: 0,
        script_prefix: 5,
        bech32_hrp: Some("bc"),
        cashaddr_prefix: None,
        fork_id: 0,
        checkpoints: BTC_MAINNET_CHECKPOINTS.to_vec(),
    };

    pub static ref BTC_TESTNET: BitcoinChainParams = BitcoinChainParams {
        family: NetworkType::Btc,
        is_mainnet: false,
        name: "bitcoin-testnet",
        standard_port: 18333,
        pubkey_prefix: 111,
        script_prefix: 196,
        bech32_hrp: Some("tb"),
        cashaddr_prefix: None,
        fork_id: 0,
        checkpoints: TESTNET_CHECKPOINTS.to_vec(),
    };

    pub static ref BCH_MAINNET: BitcoinChainParams = BitcoinChainParams {
        family: NetworkType::Bch,
        is_mainnet: true,
        name: "bitcoincash-mainnet",
        standard_port: 8333,
        pubkey_prefix: 0,
        script_prefix: 5,
        bech32_hrp: None,
        cashaddr_prefix: Some("bitcoincash"),
        fork_id: BCH_FORK_ID,
        checkpoints: chain(&[
            (BTC_MAINNET_CHECKPOINTS, BCH_SPLIT_HEIGHT),
            (BCH_MAINNET_CHECKPOINTS, u64::MAX),
        ]),
    };

    pub static ref BCH_TESTNET: BitcoinChainParams = BitcoinChainParams {
        family: NetworkType::Bch,
        is_mainnet: false,
        name: "bitcoincash-testnet",
        standard_port: 18333,
        pubkey_prefix: 111,
        script_prefix: 196,
        bech32_hrp: None,
        cashaddr_prefix: Some("bchtest"),
        fork_id: BCH_FORK_ID,
        checkpoints: BCH_TESTNET_CHECKPOINTS.to_vec(),
    };

    pub static ref BSV_MAINNET: BitcoinChainParams = BitcoinChainParams {
        family: NetworkType::Bsv,
        is_mainnet: true,
        name: "bitcoinsv-mainnet",
        standard_port: 8333,
        pubkey_prefix: 0,
        script_prefix: 5,
        bech32_hrp: None,
        cashaddr_prefix: None,
        fork_id: BSV_FORK_ID,
        checkpoints: chain(&[
            (BTC_MAINNET_CHECKPOINTS, BCH_SPLIT_HEIGHT),
            (BCH_MAINNET_CHECKPOINTS, BSV_SPLIT_HEIGHT),
            (BSV_MAINNET_CHECKPOINTS, u64::MAX),
        ]),
    };

    pub static ref BSV_TESTNET: BitcoinChainParams = BitcoinChainParams {
        family: NetworkType::Bsv,
        is_mainnet: false,
        name: "bitcoinsv-testnet",
        standard_port: 18333,
        pubkey_prefix: 111,
        script_prefix: 196,
        bech32_hrp: None,
        cashaddr_prefix: None,
        fork_id: BSV_FORK_ID,
        checkpoints: BCH_TESTNET_CHECKPOINTS.to_vec(),
    };

    pub static ref XTZ_MAINNET: TezosChainParams = TezosChainParams {
        is_mainnet: true,
        name: "tezos-mainnet",
        minimal_fee_mutez: 100,
        default_gas_limit: 10600,
        default_storage_limit: 300,
        checkpoints: vec![cp(0, 1530374852)],
    };

    pub static ref XTZ_TESTNET: TezosChainParams = TezosChainParams {
        is_mainnet: false,
        name: "tezos-testnet",
        minimal_fee_mutez: 100,
        default_gas_limit: 10600,
        default_storage_limit: 300,
        checkpoints: vec![],
    };
}

/// Select the Bitcoin-family parameter set for `family`
///
/// Panics when `family` is not a member of the Bitcoin family.
pub fn bitcoin_params(family: NetworkType, is_mainnet: bool) -> &'static BitcoinChainParams {
    match (family, is_mainnet) {
        (NetworkType::Btc, true) => &*BTC_MAINNET,
        (NetworkType::Btc, false) => &*BTC_TESTNET,
        (NetworkType::Bch, true) => &*BCH_MAINNET,
        (NetworkType::Bch, false) => &*BCH_TESTNET,
        (NetworkType::Bsv, true) => &*BSV_MAINNET,
        (NetworkType::Bsv, false) => &*BSV_TESTNET,
        (other, _) => panic!("{} is not a bitcoin-family network", other),
    }
}

pub fn tezos_params(is_mainnet: bool) -> &'static TezosChainParams {
    if is_mainnet {
        &*XTZ_MAINNET
    } else {
        &*XTZ_TESTNET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_ascending(points: &[CheckPoint]) {
        for pair in points.windows(2) {
            assert!(pair[0].height < pair[1].height);
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[test]
    fn test_checkpoints_ascending() {
        for params in [
            &*BTC_MAINNET,
            &*BTC_TESTNET,
            &*BCH_MAINNET,
            &*BCH_TESTNET,
            &*BSV_MAINNET,
            &*BSV_TESTNET,
        ] {
            assert_ascending(&params.checkpoints);
        }
    }

    #[test]
    fn test_checkpoint_before() {
        let params = bitcoin_params(NetworkType::Btc, true);
        assert!(params.checkpoint_before(1231006504).is_none());
        assert_eq!(params.checkpoint_before(1231006505).unwrap().height, 0);
        assert_eq!(params.checkpoint_before(1294031411).unwrap().height, 100800);
        assert_eq!(params.checkpoint_before(1294031410).unwrap().height, 80640);
        assert_eq!(params.checkpoint_before(u64::MAX).unwrap().height, 504000);
    }

    #[test]
    fn test_forked_chains_share_history() {
        let bch = bitcoin_params(NetworkType::Bch, true);
        let bsv = bitcoin_params(NetworkType::Bsv, true);

        assert_eq!(bch.checkpoint_before(1493259601).unwrap().height, 463680);
        assert_eq!(bch.checkpoint_before(1503802540).unwrap().height, 478559);
        assert_eq!(bsv.checkpoint_before(u64::MAX).unwrap().height, 584620);
        assert_eq!(bch.fork_id, 0x40);
        assert_eq!(bsv.fork_id, 0x40);
        assert_eq!(bitcoin_params(NetworkType::Btc, false).fork_id, 0);
    }

    #[test]
    #[should_panic]
    fn test_tezos_is_not_bitcoin_family() {
        bitcoin_params(NetworkType::Xtz, true);
    }
}
