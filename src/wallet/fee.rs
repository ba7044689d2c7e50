//! Fee bases: the per-family cost model behind an estimated or actual fee

use serde::{Deserialize, Serialize};

/// Tezos fee components, all amounts in mutez
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TezosFeeBasis {
    /// Provisional basis before the operation size is known
    Default {
        mutez_per_byte: u64,
        gas_limit: u64,
        storage_limit: u64,
    },
    Estimate {
        mutez_per_byte: u64,
        size_in_bytes: u64,
        gas_limit: u64,
        storage_limit: u64,
    },
    /// Fee reported for an observed operation
    Actual { fee: u64 },
}

/// Minimal operation fee, mutez
pub const TEZOS_MINIMAL_FEE_MUTEZ: u64 = 100;

/// Gas units per mutez of fee
const TEZOS_GAS_PER_MUTEZ: u64 = 10;

impl TezosFeeBasis {
    pub fn fee(&self) -> u64 {
        match *self {
            Self::Default {
                mutez_per_byte: _,
                gas_limit,
                ..
            } => TEZOS_MINIMAL_FEE_MUTEZ.saturating_add(gas_limit / TEZOS_GAS_PER_MUTEZ),
            Self::Estimate {
                mutez_per_byte,
                size_in_bytes,
                gas_limit,
                ..
            } => TEZOS_MINIMAL_FEE_MUTEZ
                .saturating_add(size_in_bytes.saturating_mul(mutez_per_byte))
                .saturating_add(gas_limit / TEZOS_GAS_PER_MUTEZ),
            Self::Actual { fee } => fee,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeBasis {
    /// Satoshi-per-kilobyte pricing of a transaction of `size_in_bytes`
    Bitcoin {
        fee_per_kb: u64,
        size_in_bytes: u64,
        fee: u64,
    },
    Tezos(TezosFeeBasis),
}

impl FeeBasis {
    pub fn bitcoin(fee_per_kb: u64, size_in_bytes: u64) -> Self {
        Self::Bitcoin {
            fee_per_kb,
            size_in_bytes,
            fee: fee_per_kb.saturating_mul(size_in_bytes) / 1000,
        }
    }

    /// Basis of an observed transaction whose total fee is known
    pub fn bitcoin_actual(fee: u64, size_in_bytes: u64) -> Self {
        let fee_per_kb = if size_in_bytes == 0 {
            0
        } else {
            fee.saturating_mul(1000) / size_in_bytes
        };
        Self::Bitcoin {
            fee_per_kb,
            size_in_bytes,
            fee,
        }
    }

    /// Total fee in the fee unit's base denomination
    pub fn fee(&self) -> u64 {
        match self {
            Self::Bitcoin { fee, .. } => *fee,
            Self::Tezos(basis) => basis.fee(),
        }
    }

    pub fn price_per_cost_factor(&self) -> u64 {
        match self {
            Self::Bitcoin { fee_per_kb, .. } => *fee_per_kb,
            Self::Tezos(TezosFeeBasis::Default { mutez_per_byte, .. })
            | Self::Tezos(TezosFeeBasis::Estimate { mutez_per_byte, .. }) => *mutez_per_byte,
            Self::Tezos(TezosFeeBasis::Actual { fee }) => *fee,
        }
    }

    pub fn cost_factor(&self) -> f64 {
        match self {
            Self::Bitcoin { size_in_bytes, .. } => *size_in_bytes as f64 / 1000.0,
            Self::Tezos(TezosFeeBasis::Estimate { size_in_bytes, .. }) => *size_in_bytes as f64,
            Self::Tezos(_) => 1.0,
        }
    }
}
