//! Transport over a protocol sidecar: JSON frames on one WebSocket per session.

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::traits::{CloseReason, Connector, InboundMessage, Transport, TransportEvent};

/// Event channel depth per session.
const EVENT_BUFFER: usize = 256;

type PendingTx = oneshot::Sender<Result<Value, String>>;

struct BridgeCommand {
    op: &'static str,
    params: Value,
    response_tx: PendingTx,
}

/// Opens sessions on the sidecar at `ws://host:port/sessions/<instance_id>`.
pub struct BridgeConnector {
    base_url: String,
    command_timeout: Duration,
}

impl BridgeConnector {
    pub fn new(base_url: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            command_timeout,
        }
    }

    fn session_url(&self, instance_id: &str, session_dir: &Path) -> anyhow::Result<String> {
        let mut url = reqwest::Url::parse(&format!(
            "{}/sessions/{}",
            self.base_url.trim_end_matches('/'),
            instance_id
        ))
        .with_context(|| format!("invalid bridge url '{}'", self.base_url))?;
        url.query_pairs_mut()
            .append_pair("authDir", &session_dir.to_string_lossy());
        Ok(url.into())
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn open(
        &self,
        instance_id: &str,
        session_dir: &Path,
    ) -> anyhow::Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
        let url = self.session_url(instance_id, session_dir)?;
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("bridge connect failed for {instance_id}"))?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<BridgeCommand>(32);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let handler = tokio::spawn(bridge_loop(instance_id.to_string(), ws, cmd_rx, event_tx));

        tracing::debug!("bridge session opened for {instance_id}");
        let transport = BridgeTransport {
            cmd_tx,
            command_timeout: self.command_timeout,
            handler,
        };
        Ok((Arc::new(transport), event_rx))
    }
}

/// One sidecar session. Dropping it tears the socket down.
pub struct BridgeTransport {
    cmd_tx: mpsc::Sender<BridgeCommand>,
    command_timeout: Duration,
    handler: JoinHandle<()>,
}

impl BridgeTransport {
    async fn call(&self, op: &'static str, params: Value) -> anyhow::Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(BridgeCommand {
                op,
                params,
                response_tx: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("bridge session closed"))?;

        let reply = tokio::time::timeout(self.command_timeout, rx)
            .await
            .map_err(|_| anyhow::anyhow!("bridge {op} timed out after {:?}", self.command_timeout))?
            .map_err(|_| anyhow::anyhow!("bridge {op} response dropped"))?;
        reply.map_err(|e| anyhow::anyhow!("bridge {op} failed: {e}"))
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn send_text(&self, to: &str, content: &str) -> anyhow::Result<String> {
        let reply = self
            .call("send", json!({ "to": to, "text": content }))
            .await?;
        Ok(reply["messageId"].as_str().unwrap_or_default().to_string())
    }

    async fn probe(&self) -> anyhow::Result<()> {
        self.call("probe", json!({})).await.map(|_| ())
    }

    async fn warmup(&self) -> anyhow::Result<()> {
        self.call("presence", json!({ "state": "available" }))
            .await
            .map(|_| ())
    }

    async fn logout(&self) -> anyhow::Result<()> {
        self.call("logout", json!({})).await.map(|_| ())
    }

    async fn close(&self) {
        self.handler.abort();
    }
}

impl Drop for BridgeTransport {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum BridgeEvent {
    Qr {
        code: String,
    },
    Open {
        #[serde(rename = "phoneNumber")]
        phone_number: Option<String>,
    },
    Close {
        #[serde(rename = "loggedOut", default)]
        logged_out: bool,
        code: Option<u16>,
        reason: Option<String>,
    },
    Message {
        #[serde(rename = "messageId")]
        message_id: Option<String>,
        #[serde(rename = "remoteJid")]
        remote_jid: String,
        #[serde(rename = "fromMe", default)]
        from_me: bool,
        text: Option<String>,
        #[serde(default)]
        timestamp: i64,
    },
}

impl From<BridgeEvent> for TransportEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Qr { code } => TransportEvent::Qr(code),
            BridgeEvent::Open { phone_number } => TransportEvent::Open { phone_number },
            BridgeEvent::Close {
                logged_out: true, ..
            } => TransportEvent::Closed(CloseReason::LoggedOut),
            BridgeEvent::Close { code, reason, .. } => TransportEvent::Closed(CloseReason::Other {
                code,
                detail: reason.unwrap_or_else(|| "connection closed".into()),
            }),
            BridgeEvent::Message {
                message_id,
                remote_jid,
                from_me,
                text,
                timestamp,
            } => TransportEvent::Message(InboundMessage {
                id: message_id,
                remote_jid,
                from_me,
                text,
                timestamp,
            }),
        }
    }
}

/// A decoded sidecar frame.
#[derive(Debug)]
enum Frame {
    Event(TransportEvent),
    Reply { id: u64, result: Result<Value, String> },
}

fn parse_frame(text: &str) -> Option<Frame> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("event").is_some() {
        return serde_json::from_value::<BridgeEvent>(value)
            .ok()
            .map(|e| Frame::Event(e.into()));
    }
    let id = value.get("id").and_then(Value::as_u64)?;
    let result = if value["ok"].as_bool().unwrap_or(false) {
        Ok(value)
    } else {
        Err(value["error"]
            .as_str()
            .unwrap_or("bridge error")
            .to_string())
    };
    Some(Frame::Reply { id, result })
}

async fn bridge_loop<S>(
    instance_id: String,
    ws: S,
    mut cmd_rx: mpsc::Receiver<BridgeCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending: HashMap<u64, PendingTx> = HashMap::new();
    let mut next_id: u64 = 1;

    let close_reason = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    let _ = ws_tx.close().await;
                    return;
                };
                let id = next_id;
                next_id += 1;
                let mut frame = cmd.params;
                frame["id"] = json!(id);
                frame["op"] = json!(cmd.op);
                pending.insert(id, cmd.response_tx);
                if let Err(e) = ws_tx.send(Message::Text(frame.to_string())).await {
                    break format!("bridge write failed: {e}");
                }
            }
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break "bridge stream ended".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break format!("bridge read failed: {e}"),
                };
                match parse_frame(&text) {
                    Some(Frame::Reply { id, result }) => {
                        if let Some(tx) = pending.remove(&id) {
                            let _ = tx.send(result);
                        }
                    }
                    Some(Frame::Event(event)) => {
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    None => tracing::debug!("bridge {instance_id}: ignoring unrecognized frame"),
                }
            }
        }
    };

    tracing::warn!("bridge {instance_id}: {close_reason}");
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(close_reason.clone()));
    }
    let _ = event_tx
        .send(TransportEvent::Closed(CloseReason::Other {
            code: None,
            detail: close_reason,
        }))
        .await;
}
