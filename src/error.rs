//! Error types for the wallet engine core

use thiserror::Error;

use crate::network::NetworkType;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the wallet engine core
///
/// Programming errors (a handler invoked with a foreign network family, a network
/// description contradicting its mainnet flag) are not represented here: they panic.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No handler registered for network type: {0}")]
    UnknownNetworkType(String),

    // Capability absence
    #[error("{operation} is not supported on {network_type} networks")]
    Unsupported {
        network_type: NetworkType,
        operation: &'static str,
    },

    // Domain / data errors
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid attribute {key}: {reason}")]
    InvalidAttribute { key: String, reason: String },

    #[error("Missing attribute: {0}")]
    MissingAttribute(String),

    #[error("Currency {0} is not associated with this network")]
    UnknownCurrency(String),

    // Transient failures
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Client error: {0}")]
    Client(String),

    // State errors
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Listener {0} has been stopped")]
    ListenerStopped(String),

    #[error("Listener {0} has already been started")]
    ListenerAlreadyStarted(String),

    #[error("Wallet manager has been released")]
    ManagerReleased,

    #[error("No pending fee estimate for cookie {0}")]
    UnknownCookie(u64),

    // Persistence errors
    #[error("File service error: {0}")]
    FileService(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Shorthand for a capability-absence error
    pub fn unsupported(network_type: NetworkType, operation: &'static str) -> Self {
        Error::Unsupported {
            network_type,
            operation,
        }
    }

    /// Check if this error reports a capability the chain family lacks
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported { .. })
    }

    /// Check if this error reports malformed externally supplied data
    ///
    /// Data errors are recovered locally: the offending record is skipped and
    /// processing continues with the remaining records.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidAddress(_)
                | Error::InvalidHash(_)
                | Error::InvalidAmount(_)
                | Error::InvalidAttribute { .. }
                | Error::MissingAttribute(_)
                | Error::UnknownCurrency(_)
        )
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
