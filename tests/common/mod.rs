//! Shared fakes for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::routing::{delete, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use trust_relay::chain::abi::{self, RoleId};
use trust_relay::chain::{
    Address, ChainClient, ChainEvent, LogEntry, MempoolContent, RawBlock, RawTransaction,
    SubscriptionId, SubscriptionKind,
};
use trust_relay::reconcile::{
    ActionKind, ChainProof, ChainWriter, ContractCall, OffchainResponse, OffchainSync,
    SubmittedWrite, WriteStatus,
};
use trust_relay::{RelayError, Result};

// =============================================================================
// Helpers
// =============================================================================

pub fn hash(n: u64) -> String {
    format!("0x{:064x}", n)
}

pub fn address(n: u8) -> Address {
    Address::from_bytes([n; 20])
}

pub fn tx(hash: &str) -> Value {
    json!({
        "hash": hash,
        "from": address(1).to_string(),
        "to": address(2).to_string(),
        "value": "0xde0b6b3a7640000",
    })
}

pub fn block(number: u64, hashes: &[String]) -> Value {
    let txs: Vec<Value> = hashes
        .iter()
        .map(|h| {
            let mut t = tx(h);
            t["blockNumber"] = json!(format!("0x{number:x}"));
            t
        })
        .collect();
    json!({
        "number": format!("0x{number:x}"),
        "timestamp": "0x6553f100",
        "transactions": txs,
    })
}

/// Poll `check` until it holds or the deadline passes
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// =============================================================================
// Scripted chain client
// =============================================================================

/// How a scripted method answers
#[derive(Debug, Clone)]
pub enum Script<T> {
    Ok(T),
    Unsupported,
    Transient,
}

impl<T: Clone> Script<T> {
    fn answer(&self, method: &str) -> Result<T> {
        match self {
            Script::Ok(v) => Ok(v.clone()),
            Script::Unsupported => Err(RelayError::unsupported(method)),
            Script::Transient => Err(RelayError::TransientProvider(format!("{method}: timeout"))),
        }
    }
}

pub struct ChainState {
    pub head: Script<u64>,
    pub blocks: HashMap<u64, Value>,
    pub transactions: HashMap<String, Value>,
    pub pending: Script<Vec<Value>>,
    pub mempool: Script<Value>,
    pub pending_count: Script<u64>,
    pub subscriptions: Script<()>,
    pub roles: HashSet<(RoleId, Address)>,
}

impl Default for ChainState {
    fn default() -> Self {
        Self {
            head: Script::Ok(0),
            blocks: HashMap::new(),
            transactions: HashMap::new(),
            pending: Script::Ok(Vec::new()),
            mempool: Script::Unsupported,
            pending_count: Script::Ok(0),
            subscriptions: Script::Unsupported,
            roles: HashSet::new(),
        }
    }
}

#[derive(Default)]
pub struct FakeChain {
    pub state: Mutex<ChainState>,
    sinks: Mutex<Vec<(SubscriptionKind, SubscriptionId, mpsc::Sender<ChainEvent>)>>,
    pub pending_calls: AtomicUsize,
    pub mempool_calls: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
    pub unsubscribed: Mutex<Vec<SubscriptionId>>,
}

impl FakeChain {
    pub fn new(state: ChainState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            ..Default::default()
        })
    }

    pub fn edit<F: FnOnce(&mut ChainState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn grant(&self, role: &str, account: Address) {
        self.edit(|s| {
            s.roles.insert((RoleId::from_name(role), account));
        });
    }

    /// Push an event to every live subscription of `kind`
    pub async fn emit(&self, kind: SubscriptionKind, event: ChainEvent) -> usize {
        let sinks: Vec<_> = self
            .sinks
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, s)| s.clone())
            .collect();
        for sink in &sinks {
            sink.send(event.clone()).await.unwrap();
        }
        sinks.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn endpoint(&self) -> &str {
        "fake://chain"
    }

    async fn block_number(&self) -> Result<u64> {
        self.state.lock().unwrap().head.answer("eth_blockNumber")
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<RawBlock>> {
        let block = self.state.lock().unwrap().blocks.get(&number).cloned();
        block.map(RawBlock::from_value).transpose()
    }

    async fn transaction(&self, hash: &str) -> Result<Option<RawTransaction>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .transactions
            .get(hash)
            .cloned()
            .map(RawTransaction))
    }

    async fn pending_transactions(&self) -> Result<Vec<RawTransaction>> {
        self.pending_calls.fetch_add(1, Ordering::SeqCst);
        let txs = self
            .state
            .lock()
            .unwrap()
            .pending
            .answer("eth_pendingTransactions")?;
        Ok(txs.into_iter().map(RawTransaction).collect())
    }

    async fn mempool_content(&self) -> Result<MempoolContent> {
        self.mempool_calls.fetch_add(1, Ordering::SeqCst);
        let content = self.state.lock().unwrap().mempool.answer("txpool_content")?;
        serde_json::from_value(content).map_err(|e| RelayError::MalformedData(e.to_string()))
    }

    async fn pending_transaction_count(&self) -> Result<u64> {
        self.state
            .lock()
            .unwrap()
            .pending_count
            .answer("eth_getBlockTransactionCountByNumber")
    }

    async fn call(&self, _to: &Address, _data: &[u8]) -> Result<Vec<u8>> {
        Err(RelayError::unsupported("eth_call"))
    }

    async fn has_role(
        &self,
        _contract: &Address,
        role: &RoleId,
        account: &Address,
    ) -> Result<bool> {
        Ok(self.state.lock().unwrap().roles.contains(&(*role, *account)))
    }

    async fn subscribe(
        &self,
        kind: SubscriptionKind,
        sink: mpsc::Sender<ChainEvent>,
    ) -> Result<SubscriptionId> {
        let n = self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .answer("eth_subscribe")?;
        let id = SubscriptionId(format!("0xsub{n}"));
        self.sinks.lock().unwrap().push((kind, id.clone(), sink));
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        self.sinks.lock().unwrap().retain(|(_, sid, _)| sid != id);
        self.unsubscribed.lock().unwrap().push(id.clone());
        Ok(())
    }
}

// =============================================================================
// Scripted chain writer
// =============================================================================

pub struct FakeWriter {
    pub submit_result: Mutex<Result<SubmittedWrite>>,
    pub status: Mutex<Result<WriteStatus>>,
    /// When set, `wait_for_receipt` blocks until notified
    pub gate: Option<Arc<Notify>>,
    pub submits: AtomicUsize,
    pub calls: Mutex<Vec<ContractCall>>,
}

impl FakeWriter {
    pub fn succeeding(tx_hash: &str) -> Self {
        Self::new(
            Ok(SubmittedWrite {
                tx_hash: Some(tx_hash.to_string()),
            }),
            Ok(WriteStatus::Success {
                tx_hash: Some(tx_hash.to_string()),
                block_number: Some(10),
                logs: Vec::new(),
            }),
        )
    }

    pub fn new(submit: Result<SubmittedWrite>, status: Result<WriteStatus>) -> Self {
        Self {
            submit_result: Mutex::new(submit),
            status: Mutex::new(status),
            gate: None,
            submits: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn set_status(&self, status: Result<WriteStatus>) {
        *self.status.lock().unwrap() = status;
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainWriter for FakeWriter {
    async fn submit(&self, call: &ContractCall) -> Result<SubmittedWrite> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(call.clone());
        self.submit_result.lock().unwrap().clone()
    }

    async fn wait_for_receipt(&self, _write: &SubmittedWrite) -> Result<WriteStatus> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.status.lock().unwrap().clone()
    }
}

/// Receipt log announcing a new offer contract
pub fn offer_created_log(factory: &Address, offer: &Address, tender: &Address) -> LogEntry {
    let word = |a: &Address| format!("0x{}{}", "0".repeat(24), hex::encode(a.as_bytes()));
    LogEntry {
        address: factory.to_string(),
        topics: vec![
            format!(
                "0x{}",
                hex::encode(abi::keccak256(abi::OFFER_CREATED_EVENT.as_bytes()))
            ),
            word(offer),
            word(tender),
        ],
        data: "0x".to_string(),
    }
}

// =============================================================================
// Off-chain fakes
// =============================================================================

/// In-process off-chain sync that records calls
pub struct RecordingOffchain {
    pub result: Mutex<Result<OffchainResponse>>,
    pub calls: Mutex<Vec<(ActionKind, ChainProof)>>,
}

impl RecordingOffchain {
    pub fn ok() -> Self {
        Self {
            result: Mutex::new(Ok(OffchainResponse {
                status: 200,
                body: json!({"message": "ok"}),
            })),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl OffchainSync for RecordingOffchain {
    async fn apply(&self, kind: &ActionKind, proof: &ChainProof) -> Result<OffchainResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((kind.clone(), proof.clone()));
        self.result.lock().unwrap().clone()
    }
}

/// Request seen by the fake application server
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub tx_hash: Option<String>,
    pub authorization: Option<String>,
    pub body: String,
}

pub struct ApiState {
    pub status: StatusCode,
    pub response: String,
    pub requests: Mutex<Vec<RecordedRequest>>,
}

async fn record(
    State(api): State<Arc<ApiState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    api.requests.lock().unwrap().push(RecordedRequest {
        method,
        path: uri.path().to_string(),
        tx_hash: header("x-tx-hash"),
        authorization: header("authorization"),
        body,
    });
    (api.status, api.response.clone())
}

/// Start an application server that answers every route with `status`/`response`
pub async fn spawn_api(status: StatusCode, response: &str) -> (String, Arc<ApiState>) {
    let api = Arc::new(ApiState {
        status,
        response: response.to_string(),
        requests: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route("/user/:user_id/roles", post(record))
        .route("/user/:user_id/roles/:role_id", delete(record))
        .route("/tender/offer", post(record))
        .with_state(Arc::clone(&api));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), api)
}

// =============================================================================
// JSON-RPC node
// =============================================================================

/// Scripted JSON-RPC node. Unscripted methods answer "method not found".
pub struct FakeNode {
    /// Replies per method, consumed in order; the last one repeats
    pub replies: Mutex<HashMap<String, Vec<Value>>>,
    pub http_status: Mutex<StatusCode>,
    pub seen: Mutex<Vec<Value>>,
}

impl FakeNode {
    pub fn result(&self, method: &str, result: Value) {
        self.push(method, json!({ "result": result }));
    }

    pub fn error(&self, method: &str, code: i64, message: &str) {
        self.push(method, json!({ "error": { "code": code, "message": message } }));
    }

    fn push(&self, method: &str, reply: Value) {
        self.replies
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push(reply);
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r["method"] == method)
            .cloned()
            .collect()
    }
}

async fn answer_rpc(
    State(node): State<Arc<FakeNode>>,
    axum::Json(request): axum::Json<Value>,
) -> (StatusCode, axum::Json<Value>) {
    node.seen.lock().unwrap().push(request.clone());
    let status = *node.http_status.lock().unwrap();

    let method = request["method"].as_str().unwrap_or_default().to_string();
    let reply = {
        let mut replies = node.replies.lock().unwrap();
        match replies.get_mut(&method) {
            Some(queue) if queue.len() > 1 => Some(queue.remove(0)),
            Some(queue) => queue.first().cloned(),
            None => None,
        }
    };
    let mut body = reply.unwrap_or_else(|| {
        json!({ "error": {
            "code": -32601,
            "message": format!("the method {method} does not exist/is not available"),
        }})
    });
    body["jsonrpc"] = json!("2.0");
    body["id"] = request["id"].clone();
    (status, axum::Json(body))
}

/// Start a JSON-RPC node on a random local port
pub async fn spawn_node() -> (String, Arc<FakeNode>) {
    let node = Arc::new(FakeNode {
        replies: Mutex::new(HashMap::new()),
        http_status: Mutex::new(StatusCode::OK),
        seen: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/", post(answer_rpc))
        .with_state(Arc::clone(&node));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), node)
}
