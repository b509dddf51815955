//! Error types for the rescue engine

use thiserror::Error;

use crate::chain::TxHash;
use crate::redact;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the rescue engine
#[derive(Error, Debug)]
pub enum Error {
    // Input validation errors
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Untrusted endpoint: {0}")]
    UntrustedEndpoint(String),

    #[error("Vault validation failed: {0}")]
    VaultValidation(String),

    #[error("Insufficient gas: {0}")]
    InsufficientGas(String),

    // Chain errors
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    /// Broadcast, but inclusion could not be confirmed
    #[error("Transaction {hash} unconfirmed: {reason}")]
    Unconfirmed { hash: TxHash, reason: String },

    /// Transport-level failure
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Error object returned by the node
    #[error("JSON-RPC error: {0}")]
    RpcResponse(String),

    #[error("RPC timeout after {0}ms")]
    RpcTimeout(u64),

    // State machine errors
    #[error("State conflict: {0}")]
    StateConflict(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is transient at the transport level and worth a retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Rpc(_) | Error::RpcTimeout(_))
    }

    /// Check if this error blocks entry into Armed/Monitoring
    pub fn is_entry_blocking(&self) -> bool {
        matches!(
            self,
            Error::InvalidFormat(_)
                | Error::KeyDerivation(_)
                | Error::UntrustedEndpoint(_)
                | Error::VaultValidation(_)
                | Error::InsufficientGas(_)
        )
    }

    /// Hash of a transaction that may still land
    pub fn unconfirmed_hash(&self) -> Option<TxHash> {
        match self {
            Error::Unconfirmed { hash, .. } => Some(*hash),
            _ => None,
        }
    }

    /// Display text with address-like and key-like hex scrubbed
    pub fn redacted(&self) -> String {
        redact::scrub(&self.to_string())
    }

    /// Friendly classification of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Unconfirmed { .. } => ErrorClass::Unconfirmed,
            _ => classify(&self.to_string()),
        }
    }
}

/// Operator-facing classification of a chain failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Network,
    InsufficientFunds,
    GasLimit,
    Revert,
    Nonce,
    Unconfirmed,
    Other,
}

impl ErrorClass {
    /// Short hint shown next to the scrubbed error text
    pub fn hint(&self) -> &'static str {
        match self {
            ErrorClass::Network => "network failure, check that the RPC endpoint is reachable",
            ErrorClass::InsufficientFunds => {
                "insufficient funds, top up the ephemeral wallet with native gas token"
            }
            ErrorClass::GasLimit => "gas limit too low for this call",
            ErrorClass::Revert => "contract call reverted, check the vault address and amounts",
            ErrorClass::Nonce => "nonce error, a transaction may still be pending",
            ErrorClass::Unconfirmed => {
                "transaction sent but not confirmed, the ephemeral wallet is re-checked every tick"
            }
            ErrorClass::Other => "unexpected error",
        }
    }
}

/// Classify raw error text by the markers node implementations put in their messages
pub fn classify(message: &str) -> ErrorClass {
    let msg = message.to_ascii_lowercase();

    if msg.contains("insufficient funds") || msg.contains("insufficient balance") {
        ErrorClass::InsufficientFunds
    } else if msg.contains("gas required exceeds allowance") || msg.contains("intrinsic gas") {
        ErrorClass::GasLimit
    } else if msg.contains("revert") {
        ErrorClass::Revert
    } else if msg.contains("nonce") {
        ErrorClass::Nonce
    } else if msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("connect")
        || msg.contains("network")
        || msg.contains("dns")
    {
        ErrorClass::Network
    } else {
        ErrorClass::Other
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::RpcTimeout(0)
        } else {
            Error::Rpc(e.to_string())
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Rpc(format!("malformed JSON-RPC payload: {}", e))
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
