//! Chain access layer
//!
//! Thin abstraction over a JSON-RPC provider. The watcher and the coordinator
//! receive an `Arc<dyn ChainClient>`; nothing in the core looks up a provider
//! on its own.
//!
//! - `rpc`: JSON-RPC 2.0 over HTTP plus WebSocket subscriptions
//! - `abi`: role identifiers, selectors and calldata for the offer factory
//! - `capability`: ordered pending-data sources with cached support

pub mod abi;
pub mod capability;
pub mod rpc;
mod subscription;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::types::{RelayError, Result};

pub use capability::{CapabilityProbe, PendingSource};
pub use rpc::JsonRpcClient;

// =============================================================================
// Addresses
// =============================================================================

/// 20-byte account or contract address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for Address {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.len() != 40 {
            return Err(RelayError::InvalidInput(format!(
                "address must be 20 bytes of hex: {s}"
            )));
        }
        let mut out = [0u8; 20];
        hex::decode_to_slice(digits, &mut out)
            .map_err(|e| RelayError::InvalidInput(format!("invalid address {s}: {e}")))?;
        Ok(Self(out))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Raw provider shapes
// =============================================================================

/// A transaction exactly as the provider returned it.
///
/// Shapes differ between `eth_getBlockByNumber`, `eth_pendingTransactions` and
/// `txpool_content`, so fields are read leniently by the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTransaction(pub Value);

impl RawTransaction {
    pub fn hash(&self) -> Option<&str> {
        self.0.get("hash").and_then(Value::as_str)
    }
}

/// A block with full transaction objects
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub number: Option<u64>,
    pub timestamp: Option<u64>,
    pub transactions: Vec<RawTransaction>,
}

impl RawBlock {
    /// Read a block object. Missing or non-array `transactions` is malformed.
    pub fn from_value(value: Value) -> Result<Self> {
        let number = value.get("number").and_then(parse_quantity).map(|n| n as u64);
        let timestamp = value
            .get("timestamp")
            .and_then(parse_quantity)
            .map(|n| n as u64);

        let transactions = match value.get("transactions") {
            Some(Value::Array(txs)) => txs
                .iter()
                .filter(|tx| tx.is_object())
                .cloned()
                .map(RawTransaction)
                .collect(),
            _ => {
                return Err(RelayError::MalformedData(format!(
                    "block {number:?} has no transaction list"
                )))
            }
        };

        Ok(Self {
            number,
            timestamp,
            transactions,
        })
    }
}

/// `txpool_content` result: `{ pending: {addr: {nonce: tx}}, queued: {...} }`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MempoolContent {
    #[serde(default)]
    pub pending: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub queued: BTreeMap<String, BTreeMap<String, Value>>,
}

impl MempoolContent {
    /// Flatten both buckets, pending first, nonces in numeric order per sender.
    pub fn flatten(self) -> Vec<RawTransaction> {
        let mut out = Vec::new();
        for bucket in [self.pending, self.queued] {
            for (_, by_nonce) in bucket {
                let mut entries: Vec<(u128, Value)> = by_nonce
                    .into_iter()
                    .map(|(nonce, tx)| (nonce.parse().unwrap_or(u128::MAX), tx))
                    .collect();
                entries.sort_by_key(|(nonce, _)| *nonce);
                out.extend(entries.into_iter().map(|(_, tx)| RawTransaction(tx)));
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.queued.is_empty()
    }
}

/// Receipt log entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

/// Transaction receipt as returned by `eth_getTransactionReceipt`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl TransactionReceipt {
    /// `Some(true)` for status 1, `Some(false)` for 0, `None` for pre-Byzantium receipts
    pub fn succeeded(&self) -> Option<bool> {
        self.status
            .as_deref()
            .and_then(parse_hex_u128)
            .map(|status| status == 1)
    }

    pub fn block(&self) -> Option<u64> {
        self.block_number
            .as_deref()
            .and_then(parse_hex_u128)
            .map(|n| n as u64)
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Subscription channels the watcher uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    NewHeads,
    PendingTransactions,
}

impl SubscriptionKind {
    pub fn rpc_name(&self) -> &'static str {
        match self {
            SubscriptionKind::NewHeads => "newHeads",
            SubscriptionKind::PendingTransactions => "newPendingTransactions",
        }
    }
}

/// Provider-assigned subscription identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

/// Events pushed by subscriptions onto the watcher's queue
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    NewBlock(u64),
    PendingTransaction(String),
    SubscriptionLost {
        kind: SubscriptionKind,
        reason: String,
    },
}

// =============================================================================
// Client capability
// =============================================================================

/// Read and subscribe surface of a chain provider
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Identifies the provider instance (capability results are cached per endpoint)
    fn endpoint(&self) -> &str;

    async fn block_number(&self) -> Result<u64>;

    /// `Ok(None)` when the provider does not know the block yet
    async fn block_with_transactions(&self, number: u64) -> Result<Option<RawBlock>>;

    async fn transaction(&self, hash: &str) -> Result<Option<RawTransaction>>;

    /// `eth_pendingTransactions`
    async fn pending_transactions(&self) -> Result<Vec<RawTransaction>>;

    /// `txpool_content`
    async fn mempool_content(&self) -> Result<MempoolContent>;

    /// Transaction count of the pending block, an existence signal only
    async fn pending_transaction_count(&self) -> Result<u64>;

    /// Read-only contract call, returns the raw return data
    async fn call(&self, to: &Address, data: &[u8]) -> Result<Vec<u8>>;

    /// Start pushing `kind` events onto `sink`.
    ///
    /// Returns `UnsupportedCapability` when the provider has no push channel.
    async fn subscribe(
        &self,
        kind: SubscriptionKind,
        sink: mpsc::Sender<ChainEvent>,
    ) -> Result<SubscriptionId>;

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()>;

    /// `hasRole(role, account)` on an AccessControl contract
    async fn has_role(
        &self,
        contract: &Address,
        role: &abi::RoleId,
        account: &Address,
    ) -> Result<bool> {
        let data = abi::encode_has_role(role, account);
        let output = self.call(contract, &data).await?;
        abi::decode_bool(&output)
    }
}

// =============================================================================
// Quantity helpers
// =============================================================================

/// Parse a `0x`-prefixed hex quantity
pub fn parse_hex_u128(s: &str) -> Option<u128> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    if digits.is_empty() {
        return Some(0);
    }
    u128::from_str_radix(digits, 16).ok()
}

/// Parse a JSON quantity: hex string, decimal string, or JSON number
pub fn parse_quantity(value: &Value) -> Option<u128> {
    match value {
        Value::String(s) if s.starts_with("0x") || s.starts_with("0X") => parse_hex_u128(s),
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64().map(u128::from),
        _ => None,
    }
}
