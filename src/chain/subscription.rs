//! Single WebSocket connection carrying every `eth_subscribe` stream.
//!
//! A background task owns the socket. Callers talk to it over a command
//! channel and get replies on oneshot channels, so no lock is held while
//! waiting on the provider. Notifications are pushed onto each subscriber's
//! queue with `try_send`; a full queue drops the event (the periodic refresh
//! picks the data up) rather than stalling the socket. The loss notice sent
//! when the connection ends is the one event that always waits for room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use super::rpc::{classify_rpc_error, RpcErrorObject};
use super::{parse_quantity, ChainEvent, SubscriptionId, SubscriptionKind};
use crate::types::{RelayError, Result};

enum HubCommand {
    Subscribe {
        kind: SubscriptionKind,
        sink: mpsc::Sender<ChainEvent>,
        reply: oneshot::Sender<Result<SubscriptionId>>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<Result<()>>,
    },
}

enum PendingReply {
    Subscribe {
        kind: SubscriptionKind,
        sink: mpsc::Sender<ChainEvent>,
        reply: oneshot::Sender<Result<SubscriptionId>>,
    },
    Unsubscribe {
        reply: oneshot::Sender<Result<()>>,
    },
}

impl PendingReply {
    fn fail(self, error: RelayError) {
        match self {
            PendingReply::Subscribe { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            PendingReply::Unsubscribe { reply } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Handle to the connection task
#[derive(Clone)]
pub(crate) struct SubscriptionHub {
    commands: mpsc::Sender<HubCommand>,
    connected: Arc<AtomicBool>,
}

impl SubscriptionHub {
    /// Open the WebSocket and start the connection task
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let (ws, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| RelayError::TransientProvider(format!("timeout connecting to {url}")))?
            .map_err(|e| RelayError::TransientProvider(format!("websocket connect failed: {e}")))?;

        let (commands, rx) = mpsc::channel(64);
        let connected = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&connected);

        tokio::spawn(async move {
            connection_task(ws, rx, flag).await;
        });

        Ok(Self {
            commands,
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.commands.is_closed()
    }

    pub async fn subscribe(
        &self,
        kind: SubscriptionKind,
        sink: mpsc::Sender<ChainEvent>,
        timeout: Duration,
    ) -> Result<SubscriptionId> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Subscribe { kind, sink, reply })
            .await
            .map_err(|_| RelayError::TransientProvider("subscription connection closed".into()))?;
        await_reply(rx, timeout).await
    }

    pub async fn unsubscribe(&self, id: &SubscriptionId, timeout: Duration) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Unsubscribe {
                id: id.clone(),
                reply,
            })
            .await
            .map_err(|_| RelayError::TransientProvider("subscription connection closed".into()))?;
        await_reply(rx, timeout).await
    }
}

async fn await_reply<T>(rx: oneshot::Receiver<Result<T>>, timeout: Duration) -> Result<T> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(RelayError::TransientProvider(
            "subscription connection dropped the request".into(),
        )),
        Err(_) => Err(RelayError::TransientProvider(
            "timeout waiting for subscription reply".into(),
        )),
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connection_task(
    ws: WsStream,
    mut commands: mpsc::Receiver<HubCommand>,
    connected: Arc<AtomicBool>,
) {
    let (mut write, mut read) = ws.split();
    let mut next_id: u64 = 1;
    let mut pending: HashMap<u64, PendingReply> = HashMap::new();
    let mut subscriptions: HashMap<String, (SubscriptionKind, mpsc::Sender<ChainEvent>)> =
        HashMap::new();

    let reason = loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break "client dropped".to_string();
                };

                let id = next_id;
                next_id += 1;

                let (request, waiter) = match command {
                    HubCommand::Subscribe { kind, sink, reply } => (
                        json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "method": "eth_subscribe",
                            "params": [kind.rpc_name()],
                        }),
                        PendingReply::Subscribe { kind, sink, reply },
                    ),
                    HubCommand::Unsubscribe { id: sub, reply } => {
                        subscriptions.remove(&sub.0);
                        (
                            json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "method": "eth_unsubscribe",
                                "params": [sub.0],
                            }),
                            PendingReply::Unsubscribe { reply },
                        )
                    }
                };

                if let Err(e) = write.send(Message::Text(request.to_string())).await {
                    let reason = format!("websocket send failed: {e}");
                    waiter.fail(RelayError::TransientProvider(reason.clone()));
                    break reason;
                }
                pending.insert(id, waiter);
            }

            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let Some(orphan) = handle_text(&text, &mut pending, &mut subscriptions) else {
                        continue;
                    };
                    let request = json!({
                        "jsonrpc": "2.0",
                        "id": next_id,
                        "method": "eth_unsubscribe",
                        "params": [orphan],
                    });
                    next_id += 1;
                    if let Err(e) = write.send(Message::Text(request.to_string())).await {
                        break format!("websocket send failed: {e}");
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    break "connection closed by provider".to_string()
                }
                Some(Err(e)) => break format!("websocket error: {e}"),
                Some(Ok(_)) => {}
            }
        }
    };

    connected.store(false, Ordering::SeqCst);
    info!(%reason, subscriptions = subscriptions.len(), "Subscription connection ended");

    for (_, waiter) in pending {
        waiter.fail(RelayError::TransientProvider(reason.clone()));
    }
    let _ = write.close().await;

    for (_, (kind, sink)) in subscriptions {
        let lost = ChainEvent::SubscriptionLost {
            kind,
            reason: reason.clone(),
        };
        if sink.send(lost).await.is_err() {
            debug!(kind = kind.rpc_name(), "Subscriber gone before loss notice");
        }
    }
}

/// Route one frame. Returns the id of a subscription the provider opened
/// after its caller stopped waiting, which must be cancelled.
fn handle_text(
    text: &str,
    pending: &mut HashMap<u64, PendingReply>,
    subscriptions: &mut HashMap<String, (SubscriptionKind, mpsc::Sender<ChainEvent>)>,
) -> Option<String> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Ignoring non-JSON subscription frame");
            return None;
        }
    };

    // Reply to one of our requests
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let waiter = pending.remove(&id)?;
        let error = value
            .get("error")
            .and_then(|e| serde_json::from_value::<RpcErrorObject>(e.clone()).ok());

        match waiter {
            PendingReply::Subscribe { kind, sink, reply } => {
                let sub_id = value.get("result").and_then(Value::as_str);
                if reply.is_closed() {
                    if let (None, Some(sub_id)) = (&error, sub_id) {
                        warn!(kind = kind.rpc_name(), sub_id, "Late subscribe reply, cancelling");
                        return Some(sub_id.to_string());
                    }
                    return None;
                }
                let outcome = match (error, sub_id) {
                    (Some(err), _) => Err(classify_rpc_error("eth_subscribe", &err)),
                    (None, Some(sub_id)) => {
                        subscriptions.insert(sub_id.to_string(), (kind, sink));
                        Ok(SubscriptionId(sub_id.to_string()))
                    }
                    (None, None) => Err(RelayError::MalformedData(
                        "eth_subscribe returned no subscription id".into(),
                    )),
                };
                let _ = reply.send(outcome);
            }
            PendingReply::Unsubscribe { reply } => {
                let outcome = match error {
                    Some(err) => Err(classify_rpc_error("eth_unsubscribe", &err)),
                    None => Ok(()),
                };
                let _ = reply.send(outcome);
            }
        }
        return None;
    }

    // Notification: { method: "eth_subscription", params: { subscription, result } }
    if value.get("method").and_then(Value::as_str) != Some("eth_subscription") {
        return None;
    }
    let params = value.get("params")?;
    let sub_id = params.get("subscription").and_then(Value::as_str)?;
    let Some((kind, sink)) = subscriptions.get(sub_id) else {
        debug!(sub_id, "Notification for unknown subscription");
        return None;
    };

    let result = params.get("result").cloned().unwrap_or(Value::Null);
    if let Some(event) = notification_event(*kind, &result) {
        if sink.try_send(event).is_err() {
            warn!(kind = kind.rpc_name(), "Subscriber queue full, dropping event");
        }
    }
    None
}

/// Translate a notification payload into a watcher event
fn notification_event(kind: SubscriptionKind, result: &Value) -> Option<ChainEvent> {
    match kind {
        SubscriptionKind::NewHeads => result
            .get("number")
            .and_then(parse_quantity)
            .map(|n| ChainEvent::NewBlock(n as u64)),
        SubscriptionKind::PendingTransactions => match result {
            Value::String(hash) => Some(ChainEvent::PendingTransaction(hash.clone())),
            // Some providers push full transaction objects
            Value::Object(_) => result
                .get("hash")
                .and_then(Value::as_str)
                .map(|h| ChainEvent::PendingTransaction(h.to_string())),
            _ => None,
        },
    }
}
