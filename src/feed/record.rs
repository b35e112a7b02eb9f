//! Canonical transaction record and its display view

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hash given to records whose source data could not be read
pub const SENTINEL_HASH: &str = "error-hash";

/// Placeholder sender for transactions that omit `from`
pub const UNKNOWN_SENDER: &str = "unknown";

const WEI_PER_ETHER: u128 = 1_000_000_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
}

/// One transaction as the feed holds it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: String,
    /// Hash as the provider sent it, kept for sentinel records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_hash: Option<String>,
    pub from: String,
    /// `None` for contract creation
    pub to: Option<String>,
    /// Amount in wei
    pub value: u128,
    /// Insertion time in milliseconds, strictly increasing per store batch
    pub observed_at: u64,
    /// Chain-reported block time in seconds
    pub block_timestamp: Option<u64>,
    pub status: TxStatus,
    pub block_number: Option<u64>,
}

impl TransactionRecord {
    pub fn is_sentinel(&self) -> bool {
        self.hash == SENTINEL_HASH
    }

    pub fn is_pending(&self) -> bool {
        self.status == TxStatus::Pending
    }

    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }

    pub fn view(&self) -> TransactionView {
        TransactionView::from(self)
    }
}

// =============================================================================
// Display
// =============================================================================

/// Format a wei amount as ether with 4 to 6 fractional digits.
///
/// Rounds half-up at the sixth digit and groups the integer part with commas.
pub fn format_ether(wei: u128) -> String {
    const SCALE: u128 = WEI_PER_ETHER / 1_000_000;

    let mut micro = wei / SCALE;
    if wei % SCALE >= SCALE / 2 {
        micro += 1;
    }

    let whole = micro / 1_000_000;
    let fraction = format!("{:06}", micro % 1_000_000);
    let trimmed = fraction.trim_end_matches('0');
    let digits = if trimmed.len() < 4 {
        &fraction[..4]
    } else {
        trimmed
    };

    format!("{}.{}", group_thousands(whole), digits)
}

fn group_thousands(n: u128) -> String {
    let raw = n.to_string();
    let mut out = String::with_capacity(raw.len() + raw.len() / 3);
    for (i, c) in raw.chars().enumerate() {
        if i > 0 && (raw.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn shorten(s: &str, head: usize, tail: usize) -> String {
    if s.len() <= head + tail || !s.is_ascii() {
        return s.to_string();
    }
    format!("{}...{}", &s[..head], &s[s.len() - tail..])
}

pub fn short_hash(hash: &str) -> String {
    shorten(hash, 8, 6)
}

pub fn short_address(address: &str) -> String {
    shorten(address, 6, 4)
}

/// Presentation-ready projection of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionView {
    pub hash: String,
    pub short_hash: String,
    pub from: String,
    pub to: String,
    pub value: String,
    pub time: String,
    pub status: TxStatus,
    pub block_number: Option<u64>,
}

impl From<&TransactionRecord> for TransactionView {
    fn from(record: &TransactionRecord) -> Self {
        let to = match &record.to {
            Some(to) => short_address(to),
            None => "Contract Creation".to_string(),
        };

        let millis = record
            .block_timestamp
            .map(|secs| secs.saturating_mul(1000))
            .unwrap_or(record.observed_at);
        let time = DateTime::<Utc>::from_timestamp_millis(millis as i64)
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "--:--:--".to_string());

        Self {
            hash: record.hash.clone(),
            short_hash: short_hash(&record.hash),
            from: short_address(&record.from),
            to,
            value: format!("{} ETH", format_ether(record.value)),
            time,
            status: record.status,
            block_number: record.block_number,
        }
    }
}
