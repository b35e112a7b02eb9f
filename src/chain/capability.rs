//! Pending-transaction sources, probed in order of preference.
//!
//! Public endpoints rarely expose their mempool. Each source is tried once per
//! refresh; a source the provider reports as unsupported is skipped for the
//! rest of the provider's lifetime, while transient failures are retried on
//! the next refresh.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use tracing::{debug, info};

use super::{ChainClient, RawTransaction};
use crate::types::{RelayError, Result};

/// Where pending transactions came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PendingSource {
    /// `eth_pendingTransactions`
    PendingTransactions,
    /// `txpool_content`, pending and queued buckets
    MempoolContent,
}

impl PendingSource {
    pub const PREFERENCE: [PendingSource; 2] =
        [PendingSource::PendingTransactions, PendingSource::MempoolContent];

    pub fn method(&self) -> &'static str {
        match self {
            PendingSource::PendingTransactions => "eth_pendingTransactions",
            PendingSource::MempoolContent => "txpool_content",
        }
    }

    async fn fetch(&self, client: &dyn ChainClient) -> Result<Vec<RawTransaction>> {
        match self {
            PendingSource::PendingTransactions => client.pending_transactions().await,
            PendingSource::MempoolContent => Ok(client.mempool_content().await?.flatten()),
        }
    }
}

/// Known support state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    Unknown,
    Supported,
    Unsupported,
}

/// Outcome of one pass over the sources
#[derive(Debug, Clone, Default)]
pub struct PendingFetch {
    pub source: Option<PendingSource>,
    pub transactions: Vec<RawTransaction>,
}

/// Ordered capability probe with per-provider cached results
pub struct CapabilityProbe {
    order: Vec<PendingSource>,
    support: RwLock<HashMap<PendingSource, Support>>,
}

impl CapabilityProbe {
    pub fn new() -> Self {
        Self::with_order(PendingSource::PREFERENCE.to_vec())
    }

    pub fn with_order(order: Vec<PendingSource>) -> Self {
        Self {
            order,
            support: RwLock::new(HashMap::new()),
        }
    }

    pub fn support(&self, source: PendingSource) -> Support {
        self.support
            .read()
            .map(|s| s.get(&source).copied().unwrap_or(Support::Unknown))
            .unwrap_or(Support::Unknown)
    }

    fn record(&self, source: PendingSource, support: Support) {
        if let Ok(mut map) = self.support.write() {
            map.insert(source, support);
        }
    }

    /// Try each source once. Never fails: when nothing answers the result is empty.
    pub async fn fetch_pending(&self, client: &dyn ChainClient) -> PendingFetch {
        for source in &self.order {
            if self.support(*source) == Support::Unsupported {
                continue;
            }

            match source.fetch(client).await {
                Ok(transactions) => {
                    self.record(*source, Support::Supported);
                    debug!(
                        method = source.method(),
                        count = transactions.len(),
                        "Fetched pending transactions"
                    );
                    return PendingFetch {
                        source: Some(*source),
                        transactions,
                    };
                }
                Err(RelayError::UnsupportedCapability { .. }) => {
                    info!(
                        endpoint = client.endpoint(),
                        method = source.method(),
                        "Provider does not support method, skipping from now on"
                    );
                    self.record(*source, Support::Unsupported);
                }
                Err(e) => {
                    debug!(method = source.method(), error = %e, "Pending source failed");
                }
            }
        }

        PendingFetch::default()
    }
}

impl Default for CapabilityProbe {
    fn default() -> Self {
        Self::new()
    }
}
