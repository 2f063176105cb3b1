mod common;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use common::*;
use wafleet::channels::{BridgeConnector, CloseReason, Connector, TransportEvent};
use wafleet::instance::ConnectionStatus;
use wafleet::{Collaborators, InstanceManager};

/// Frames the fake sidecar received, with the request path of each session.
#[derive(Clone, Default)]
struct Sidecar {
    paths: Arc<Mutex<Vec<String>>>,
    ops: Arc<Mutex<Vec<Value>>>,
}

/// Accept sessions forever. Each session announces a QR then `open`, answers
/// `send`, `probe` and `presence`, and reports a logout after `logout`.
/// A `send` to `drop-me` makes the sidecar hang up.
async fn start_sidecar() -> (String, Sidecar) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sidecar = Sidecar::default();
    let recorded = sidecar.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let paths = recorded.paths.clone();
                let ws = tokio_tungstenite::accept_hdr_async(
                    stream,
                    move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        paths.lock().unwrap().push(req.uri().to_string());
                        Ok(resp)
                    },
                )
                .await
                .unwrap();
                let (mut tx, mut rx) = ws.split();
                tx.send(Message::Text(json!({"event": "qr", "code": "2@qr"}).to_string()))
                    .await
                    .unwrap();
                tx.send(Message::Text(
                    json!({"event": "open", "phoneNumber": "5511999990000"}).to_string(),
                ))
                .await
                .unwrap();

                let mut sent = 0;
                while let Some(Ok(Message::Text(text))) = rx.next().await {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    recorded.ops.lock().unwrap().push(frame.clone());
                    let id = frame["id"].clone();
                    match frame["op"].as_str() {
                        Some("send") if frame["to"] == "drop-me" => return,
                        Some("send") => {
                            sent += 1;
                            let reply = json!({"id": id, "ok": true, "messageId": format!("WA-{sent}")});
                            tx.send(Message::Text(reply.to_string())).await.unwrap();
                        }
                        Some("logout") => {
                            let reply = json!({"id": id, "ok": true});
                            tx.send(Message::Text(reply.to_string())).await.unwrap();
                            let close = json!({"event": "close", "loggedOut": true, "code": 401});
                            tx.send(Message::Text(close.to_string())).await.unwrap();
                        }
                        Some(_) => {
                            let reply = json!({"id": id, "ok": true});
                            tx.send(Message::Text(reply.to_string())).await.unwrap();
                        }
                        None => {}
                    }
                }
            });
        }
    });
    (format!("ws://{addr}"), sidecar)
}

#[tokio::test]
async fn gate1_bridge_transport_speaks_the_sidecar_protocol() -> Result<()> {
    let (url, sidecar) = start_sidecar().await;
    let connector = BridgeConnector::new(url, Duration::from_secs(5));
    let tmp = TempDir::new()?;

    let (transport, mut events) = connector.open("i1", &tmp.path().join("i1")).await?;
    assert!(matches!(events.recv().await, Some(TransportEvent::Qr(code)) if code == "2@qr"));
    match events.recv().await {
        Some(TransportEvent::Open { phone_number }) => {
            assert_eq!(phone_number.as_deref(), Some("5511999990000"))
        }
        other => panic!("expected open, got {other:?}"),
    }

    assert_eq!(transport.send_text("5511988887777", "hello").await?, "WA-1");
    transport.probe().await?;
    transport.warmup().await?;
    transport.logout().await?;
    match events.recv().await {
        Some(TransportEvent::Closed(reason)) => assert!(reason.is_logout()),
        other => panic!("expected logout close, got {other:?}"),
    }

    let ops: Vec<String> = sidecar
        .ops
        .lock()
        .unwrap()
        .iter()
        .map(|f| f["op"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ops, ["send", "probe", "presence", "logout"]);
    let first = sidecar.ops.lock().unwrap()[0].clone();
    assert_eq!(first["to"], "5511988887777");
    assert_eq!(first["text"], "hello");
    assert!(sidecar.paths.lock().unwrap()[0].starts_with("/sessions/i1?authDir="));
    Ok(())
}

#[tokio::test]
async fn gate1_sidecar_hangup_fails_pending_call_and_reports_close() -> Result<()> {
    let (url, _sidecar) = start_sidecar().await;
    let connector = BridgeConnector::new(url, Duration::from_secs(5));
    let tmp = TempDir::new()?;

    let (transport, mut events) = connector.open("i1", &tmp.path().join("i1")).await?;
    events.recv().await;
    events.recv().await;

    assert!(transport.send_text("drop-me", "bye").await.is_err());
    match events.recv().await {
        Some(TransportEvent::Closed(CloseReason::Other { code, .. })) => assert_eq!(code, None),
        other => panic!("expected stream close, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn gate1_unreachable_sidecar_is_an_open_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);
    let connector = BridgeConnector::new(url, Duration::from_secs(1));
    assert!(connector.open("i1", std::path::Path::new("/tmp/i1")).await.is_err());
}

// ══════════════════════════════════════════════════════════════════
// Gate 2: manager over the real bridge
// ══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn gate2_manager_connects_and_sends_through_bridge() -> Result<()> {
    let (url, sidecar) = start_sidecar().await;
    let tmp = TempDir::new()?;
    let mut config = test_config(tmp.path());
    config.rate_limit.min_interval_ms = 0;
    let manager = InstanceManager::open(
        config,
        Collaborators {
            connector: Arc::new(BridgeConnector::new(url, Duration::from_secs(5))),
            heartbeat: Arc::new(RecordingHeartbeat::default()),
            inbound: Arc::new(RecordingInbound::default()),
            backup_store: None,
        },
    )?;

    manager.create_instance(Some("i1".into()), "sales").await?;
    manager.connect_instance("i1").await?;
    let status = wait_for(&manager, "i1", "ready", |s| s.ready_to_send).await;
    assert_eq!(status.status, ConnectionStatus::Connected);
    assert_eq!(status.phone_number.as_deref(), Some("5511999990000"));
    assert!(status.qr_code.is_none());

    let receipt = manager.send_message("i1", "5511988887777", "hello").await?;
    assert_eq!(receipt.message_id, "WA-1");

    manager.disconnect_instance("i1").await?;
    assert_eq!(
        manager.get_status("i1")?.status,
        ConnectionStatus::Disconnected
    );
    let ops: Vec<String> = sidecar
        .ops
        .lock()
        .unwrap()
        .iter()
        .filter_map(|f| f["op"].as_str().map(String::from))
        .collect();
    assert!(ops.contains(&"presence".to_string()));
    assert!(ops.contains(&"logout".to_string()));

    manager.shutdown().await;
    Ok(())
}
