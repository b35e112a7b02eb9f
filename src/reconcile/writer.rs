//! Chain write capability
//!
//! The coordinator only needs two things from a signer: send a call, then
//! learn how it ended. Outcomes mirror the wallet status values
//! `Success`, `Fail` and `Exception`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::chain::{Address, ChainClient, JsonRpcClient, LogEntry};
use crate::types::{RelayError, Result};

/// Blocks on top of the receipt's block before a write counts as confirmed
pub const DEFAULT_CONFIRMATIONS: u64 = 3;

/// A state-changing contract call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractCall {
    pub to: Address,
    #[serde(serialize_with = "hex_bytes")]
    pub data: Vec<u8>,
    /// Human-readable summary for logs
    pub description: String,
}

fn hex_bytes<S: serde::Serializer>(data: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format!("0x{}", hex::encode(data)))
}

/// Handle on a submitted write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedWrite {
    /// Hash reported by the signer, if it reported one
    pub tx_hash: Option<String>,
}

/// Terminal outcome of a write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatus {
    Success {
        tx_hash: Option<String>,
        block_number: Option<u64>,
        logs: Vec<LogEntry>,
    },
    /// Mined but reverted
    Fail { reason: String },
    /// Signer or provider error while waiting
    Exception { reason: String },
}

#[async_trait]
pub trait ChainWriter: Send + Sync {
    /// Sign and broadcast. Rejections come back as `ChainWriteRejected`.
    async fn submit(&self, call: &ContractCall) -> Result<SubmittedWrite>;

    /// Wait until the write reaches a terminal status
    async fn wait_for_receipt(&self, write: &SubmittedWrite) -> Result<WriteStatus>;
}

/// Writer backed by an account unlocked on the node (`eth_sendTransaction`)
pub struct RpcChainWriter {
    client: Arc<JsonRpcClient>,
    from: Address,
    confirmations: u64,
    poll_interval: Duration,
}

impl RpcChainWriter {
    pub fn new(client: Arc<JsonRpcClient>, from: Address) -> Self {
        Self {
            client,
            from,
            confirmations: DEFAULT_CONFIRMATIONS,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = confirmations.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn from_address(&self) -> &Address {
        &self.from
    }
}

/// A receipt in block `mined` has `confirmations` once the head reaches
/// `mined + confirmations - 1`
pub fn is_confirmed(mined: u64, head: u64, confirmations: u64) -> bool {
    head.saturating_add(1) >= mined.saturating_add(confirmations.max(1))
}

#[async_trait]
impl ChainWriter for RpcChainWriter {
    async fn submit(&self, call: &ContractCall) -> Result<SubmittedWrite> {
        info!(to = %call.to, call = %call.description, "Submitting contract call");
        let hash = self
            .client
            .send_transaction(&self.from, &call.to, &call.data)
            .await
            .map_err(|e| RelayError::ChainWriteRejected(e.to_string()))?;
        Ok(SubmittedWrite {
            tx_hash: Some(hash),
        })
    }

    async fn wait_for_receipt(&self, write: &SubmittedWrite) -> Result<WriteStatus> {
        let hash = write
            .tx_hash
            .as_deref()
            .ok_or_else(|| RelayError::MissingProof("no transaction hash to await".into()))?;

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;

            let receipt = match self.client.transaction_receipt(hash).await {
                Ok(Some(receipt)) => receipt,
                Ok(None) => continue,
                Err(e @ RelayError::TransientProvider(_)) => {
                    debug!(%hash, error = %e, "Receipt poll failed, retrying");
                    continue;
                }
                Err(e) => {
                    return Ok(WriteStatus::Exception {
                        reason: e.to_string(),
                    })
                }
            };

            if receipt.succeeded() == Some(false) {
                return Ok(WriteStatus::Fail {
                    reason: "transaction reverted".to_string(),
                });
            }

            let Some(mined) = receipt.block() else {
                continue;
            };
            if self.confirmations > 1 {
                match self.client.block_number().await {
                    Ok(head) if is_confirmed(mined, head, self.confirmations) => {}
                    Ok(head) => {
                        debug!(%hash, mined, head, "Waiting for confirmations");
                        continue;
                    }
                    Err(e) => {
                        debug!(%hash, error = %e, "Head poll failed, retrying");
                        continue;
                    }
                }
            }

            return Ok(WriteStatus::Success {
                tx_hash: receipt.transaction_hash,
                block_number: Some(mined),
                logs: receipt.logs,
            });
        }
    }
}
