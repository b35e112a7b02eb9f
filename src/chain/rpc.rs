//! JSON-RPC 2.0 provider client
//!
//! Requests go over HTTP with `reqwest`. Subscriptions share one WebSocket
//! connection (see `subscription.rs`), opened on the first `subscribe` call and
//! reopened after it drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::subscription::SubscriptionHub;
use super::{
    parse_hex_u128, Address, ChainClient, ChainEvent, MempoolContent, RawBlock, RawTransaction,
    SubscriptionId, SubscriptionKind, TransactionReceipt,
};
use crate::types::{RelayError, Result};

/// Default timeout for a single RPC round trip
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON-RPC error codes and messages that mean "this provider can't do that"
const METHOD_NOT_FOUND: i64 = -32601;
const UNSUPPORTED_HINTS: [&str; 5] = [
    "not supported",
    "does not exist",
    "not available",
    "method not found",
    "unsupported",
];

#[derive(Debug, Deserialize)]
pub(crate) struct RpcErrorObject {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// Map a JSON-RPC error object onto the taxonomy
pub(crate) fn classify_rpc_error(method: &str, error: &RpcErrorObject) -> RelayError {
    let message = error.message.to_lowercase();
    if error.code == METHOD_NOT_FOUND || UNSUPPORTED_HINTS.iter().any(|h| message.contains(h)) {
        return RelayError::unsupported(method);
    }
    RelayError::TransientProvider(format!(
        "{method}: {} (code {})",
        error.message, error.code
    ))
}

fn quantity(n: u64) -> String {
    format!("0x{n:x}")
}

fn decode_hex_bytes(method: &str, value: &Value) -> Result<Vec<u8>> {
    let s = value
        .as_str()
        .ok_or_else(|| RelayError::MalformedData(format!("{method}: expected hex string")))?;
    let digits = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(digits).map_err(|e| RelayError::MalformedData(format!("{method}: {e}")))
}

/// JSON-RPC provider client
pub struct JsonRpcClient {
    http_url: String,
    ws_url: Option<String>,
    http: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
    hub: Mutex<Option<SubscriptionHub>>,
}

impl JsonRpcClient {
    /// Create a client for an HTTP endpoint (no push subscriptions)
    pub fn new(http_url: impl Into<String>) -> Self {
        Self::with_timeout(http_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(http_url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("trust-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            http_url: http_url.into(),
            ws_url: None,
            http,
            timeout,
            next_id: AtomicU64::new(1),
            hub: Mutex::new(None),
        }
    }

    /// Enable push subscriptions over a WebSocket endpoint
    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = Some(ws_url.into());
        self
    }

    pub fn ws_url(&self) -> Option<&str> {
        self.ws_url.as_deref()
    }

    /// Send one JSON-RPC request over HTTP
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.http_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::TransientProvider(format!("{method}: {e}")))?;

        let status = response.status();
        if matches!(status.as_u16(), 404 | 405 | 501) {
            return Err(RelayError::unsupported(method));
        }
        if !status.is_success() {
            return Err(RelayError::TransientProvider(format!(
                "{method}: HTTP {status}"
            )));
        }

        let envelope: RpcResponse = response
            .json()
            .await
            .map_err(|e| RelayError::MalformedData(format!("{method}: invalid response: {e}")))?;

        if let Some(error) = envelope.error {
            return Err(classify_rpc_error(method, &error));
        }

        Ok(envelope.result.unwrap_or(Value::Null))
    }

    /// `eth_sendTransaction` from an account unlocked on the node. Returns the hash.
    pub async fn send_transaction(
        &self,
        from: &Address,
        to: &Address,
        data: &[u8],
    ) -> Result<String> {
        let params = json!([{
            "from": from.to_string(),
            "to": to.to_string(),
            "data": format!("0x{}", hex::encode(data)),
        }]);
        let result = self.request("eth_sendTransaction", params).await?;
        result.as_str().map(str::to_string).ok_or_else(|| {
            RelayError::MalformedData("eth_sendTransaction returned no hash".to_string())
        })
    }

    /// `eth_getTransactionReceipt`, `None` while the transaction is unmined
    pub async fn transaction_receipt(&self, hash: &str) -> Result<Option<TransactionReceipt>> {
        let result = self
            .request("eth_getTransactionReceipt", json!([hash]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| RelayError::MalformedData(format!("eth_getTransactionReceipt: {e}")))
    }

    /// Current hub, connecting a fresh one if none is live
    async fn hub(&self) -> Result<SubscriptionHub> {
        let ws_url = self
            .ws_url
            .as_deref()
            .ok_or_else(|| RelayError::unsupported("eth_subscribe"))?;

        let mut guard = self.hub.lock().await;
        if let Some(hub) = guard.as_ref() {
            if hub.is_connected() {
                return Ok(hub.clone());
            }
        }

        info!(url = ws_url, "Opening subscription connection");
        let hub = SubscriptionHub::connect(ws_url, self.timeout).await?;
        *guard = Some(hub.clone());
        Ok(hub)
    }
}

#[async_trait]
impl ChainClient for JsonRpcClient {
    fn endpoint(&self) -> &str {
        &self.http_url
    }

    async fn block_number(&self) -> Result<u64> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        result
            .as_str()
            .and_then(parse_hex_u128)
            .map(|n| n as u64)
            .ok_or_else(|| RelayError::MalformedData("eth_blockNumber: not a quantity".into()))
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<RawBlock>> {
        let result = self
            .request("eth_getBlockByNumber", json!([quantity(number), true]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        RawBlock::from_value(result).map(Some)
    }

    async fn transaction(&self, hash: &str) -> Result<Option<RawTransaction>> {
        let result = self
            .request("eth_getTransactionByHash", json!([hash]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(RawTransaction(result)))
    }

    async fn pending_transactions(&self) -> Result<Vec<RawTransaction>> {
        match self.request("eth_pendingTransactions", json!([])).await? {
            Value::Array(txs) => Ok(txs.into_iter().map(RawTransaction).collect()),
            Value::Null => Ok(Vec::new()),
            other => Err(RelayError::MalformedData(format!(
                "eth_pendingTransactions: expected array, got {other}"
            ))),
        }
    }

    async fn mempool_content(&self) -> Result<MempoolContent> {
        let result = self.request("txpool_content", json!([])).await?;
        serde_json::from_value(result)
            .map_err(|e| RelayError::MalformedData(format!("txpool_content: {e}")))
    }

    async fn pending_transaction_count(&self) -> Result<u64> {
        let result = self
            .request("eth_getBlockTransactionCountByNumber", json!(["pending"]))
            .await?;
        Ok(result
            .as_str()
            .and_then(parse_hex_u128)
            .map(|n| n as u64)
            .unwrap_or(0))
    }

    async fn call(&self, to: &Address, data: &[u8]) -> Result<Vec<u8>> {
        let params = json!([
            {
                "to": to.to_string(),
                "data": format!("0x{}", hex::encode(data)),
            },
            "latest"
        ]);
        let result = self.request("eth_call", params).await?;
        decode_hex_bytes("eth_call", &result)
    }

    async fn subscribe(
        &self,
        kind: SubscriptionKind,
        sink: mpsc::Sender<ChainEvent>,
    ) -> Result<SubscriptionId> {
        let hub = self.hub().await?;
        let id = hub.subscribe(kind, sink, self.timeout).await?;
        debug!(kind = kind.rpc_name(), id = %id.0, "Subscribed");
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        let hub = {
            let guard = self.hub.lock().await;
            match guard.as_ref() {
                Some(hub) if hub.is_connected() => hub.clone(),
                // Connection already gone, nothing left to cancel
                _ => return Ok(()),
            }
        };
        hub.unsubscribe(id, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_method_not_found() {
        let err = classify_rpc_error(
            "eth_pendingTransactions",
            &RpcErrorObject {
                code: -32601,
                message: "the method eth_pendingTransactions does not exist/is not available"
                    .into(),
            },
        );
        assert!(err.is_unsupported());

        let err = classify_rpc_error(
            "eth_subscribe",
            &RpcErrorObject {
                code: -32000,
                message: "notifications not supported".into(),
            },
        );
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_classify_other_errors_are_transient() {
        let err = classify_rpc_error(
            "eth_getBlockByNumber",
            &RpcErrorObject {
                code: -32005,
                message: "rate limit exceeded".into(),
            },
        );
        assert!(matches!(err, RelayError::TransientProvider(_)));
    }

    #[test]
    fn test_quantity_encoding() {
        assert_eq!(quantity(0), "0x0");
        assert_eq!(quantity(255), "0xff");
    }

    #[tokio::test]
    async fn test_subscribe_without_ws_is_unsupported() {
        let client = JsonRpcClient::new("http://127.0.0.1:8545");
        let (tx, _rx) = mpsc::channel(1);
        let err = client
            .subscribe(SubscriptionKind::NewHeads, tx)
            .await
            .unwrap_err();
        assert!(err.is_unsupported());

        // Unsubscribing with no connection is a no-op
        client
            .unsubscribe(&SubscriptionId("0x1".into()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let client = JsonRpcClient::with_timeout("http://127.0.0.1:1", Duration::from_millis(500));
        let err = client.block_number().await.unwrap_err();
        assert!(matches!(err, RelayError::TransientProvider(_)));
    }
}
