//! Shared error taxonomy for the feed and reconciliation pipelines.

use serde::{Deserialize, Serialize};

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, RelayError>;

/// A single field-level validation error returned by the off-chain API
/// (`{"path": ..., "msg": ...}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub path: String,
    pub msg: String,
}

/// Errors shared by the chain client, the watcher and the coordinator.
///
/// Every variant carries a human-readable reason. Variants are cloneable so a
/// terminal failure can be stored on the action that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RelayError {
    /// RPC call failed or timed out. Retried by the next poll cycle.
    #[error("Provider error: {0}")]
    TransientProvider(String),

    /// The provider does not implement a method. Skipped for the provider's lifetime.
    #[error("Unsupported provider capability: {method}")]
    UnsupportedCapability { method: String },

    /// Provider data could not be interpreted.
    #[error("Malformed data: {0}")]
    MalformedData(String),

    /// Caller lacks the required role or the subject has no linked address.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// User declined or the transaction reverted.
    #[error("Chain write rejected: {0}")]
    ChainWriteRejected(String),

    /// Success was reported without a retrievable transaction hash.
    #[error("Missing proof: {0}")]
    MissingProof(String),

    /// The off-chain endpoint rejected the authorized mutation. The on-chain
    /// action stays in place.
    #[error("Off-chain sync failed{}: {message}", status_suffix(.status))]
    OffchainSyncFailed {
        status: Option<u16>,
        message: String,
        #[serde(default)]
        fields: Vec<FieldError>,
        retryable: bool,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification of a [`RelayError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientProvider,
    UnsupportedCapability,
    MalformedData,
    PreconditionFailed,
    ChainWriteRejected,
    MissingProof,
    OffchainSyncFailed,
    InvalidInput,
    Config,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::TransientProvider(_) => ErrorKind::TransientProvider,
            RelayError::UnsupportedCapability { .. } => ErrorKind::UnsupportedCapability,
            RelayError::MalformedData(_) => ErrorKind::MalformedData,
            RelayError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            RelayError::ChainWriteRejected(_) => ErrorKind::ChainWriteRejected,
            RelayError::MissingProof(_) => ErrorKind::MissingProof,
            RelayError::OffchainSyncFailed { .. } => ErrorKind::OffchainSyncFailed,
            RelayError::InvalidInput(_) => ErrorKind::InvalidInput,
            RelayError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn unsupported(method: impl Into<String>) -> Self {
        RelayError::UnsupportedCapability {
            method: method.into(),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, RelayError::UnsupportedCapability { .. })
    }

    /// Missing proof indicates a provider or integration bug and is never
    /// retried blindly.
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            RelayError::MissingProof(_) | RelayError::OffchainSyncFailed { .. }
        )
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {code})"),
        None => String::new(),
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        RelayError::TransientProvider(e.to_string())
    }
}
