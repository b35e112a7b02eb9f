//! Raw provider transaction → [`TransactionRecord`]
//!
//! Providers disagree on field presence and encoding (hex quantities,
//! decimal strings, JSON numbers). Normalization never fails: anything that
//! cannot be read becomes a sentinel record that the store keeps apart from
//! real hashes.

use serde_json::Value;
use tracing::debug;

use super::record::{TransactionRecord, TxStatus, SENTINEL_HASH, UNKNOWN_SENDER};
use crate::chain::{parse_quantity, RawTransaction};

/// Convert one raw transaction.
///
/// `block_timestamp` is the enclosing block's time (seconds) when known and
/// `observed_at` the store-assigned insertion stamp.
pub fn normalize(
    raw: &RawTransaction,
    is_pending: bool,
    block_timestamp: Option<u64>,
    observed_at: u64,
) -> TransactionRecord {
    let status = if is_pending {
        TxStatus::Pending
    } else {
        TxStatus::Confirmed
    };
    let tx = &raw.0;

    let from = string_field(tx, "from").unwrap_or_else(|| UNKNOWN_SENDER.to_string());
    let to = string_field(tx, "to");

    let value = match tx.get("value") {
        None | Some(Value::Null) => Some(0),
        Some(v) => parse_quantity(v),
    };
    let block_number = match tx.get("blockNumber") {
        None | Some(Value::Null) => Some(None),
        Some(v) => parse_quantity(v).map(|n| Some(n as u64)),
    };

    match (raw.hash().filter(|h| !h.is_empty()), value, block_number) {
        (Some(hash), Some(value), Some(block_number)) => TransactionRecord {
            hash: hash.to_lowercase(),
            raw_hash: None,
            from,
            to,
            value,
            observed_at,
            block_timestamp,
            status,
            block_number,
        },
        (hash, value, block_number) => {
            debug!(
                hash = hash.unwrap_or("<missing>"),
                value_ok = value.is_some(),
                block_ok = block_number.is_some(),
                "Unreadable transaction, keeping as sentinel"
            );
            TransactionRecord {
                hash: SENTINEL_HASH.to_string(),
                raw_hash: hash.map(str::to_string),
                from,
                to,
                value: 0,
                observed_at,
                block_timestamp,
                status,
                block_number: None,
            }
        }
    }
}

fn string_field(tx: &Value, key: &str) -> Option<String> {
    tx.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
