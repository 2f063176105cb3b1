#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use wafleet::backup::BackupStore;
use wafleet::channels::{CloseReason, Connector, InboundMessage, Transport, TransportEvent};
use wafleet::engines::{EnginePayload, InboundHandler};
use wafleet::heartbeat::{HeartbeatPayload, HeartbeatSink};
use wafleet::instance::InstanceStatus;
use wafleet::{Collaborators, Config, InstanceManager};

// ── Scripted transport ──────────────────────────────────────────

/// What one `Connector::open` call does.
#[derive(Clone)]
pub enum Script {
    /// Open successfully and emit these events right away.
    Events(Vec<TransportEvent>),
    /// Fail to open.
    Fail(String),
    /// Never finish opening.
    Stall,
}

#[derive(Default)]
pub struct MockTransport {
    pub sent: Mutex<Vec<(String, String)>>,
    pub fail_sends: AtomicBool,
    pub fail_probes: AtomicBool,
    pub probes: AtomicUsize,
    pub warmups: AtomicUsize,
    pub logouts: AtomicUsize,
    pub closed: AtomicBool,
}

impl MockTransport {
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&self, to: &str, content: &str) -> anyhow::Result<String> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("send rejected");
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), content.to_string()));
        Ok(format!("MSG-{}", sent.len()))
    }

    async fn probe(&self) -> anyhow::Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.fail_probes.load(Ordering::SeqCst) {
            anyhow::bail!("probe failed");
        }
        Ok(())
    }

    async fn warmup(&self) -> anyhow::Result<()> {
        self.warmups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&self) -> anyhow::Result<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector whose every `open` follows the next queued [`Script`] for that
/// instance, then the next shared one, then the default script.
pub struct ScriptedConnector {
    per_instance: Mutex<HashMap<String, VecDeque<Script>>>,
    scripts: Mutex<VecDeque<Script>>,
    default_script: Mutex<Script>,
    opens: AtomicUsize,
    transports: Mutex<Vec<Arc<MockTransport>>>,
    senders: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
}

impl ScriptedConnector {
    /// Opens that stay in `connecting` until the test emits events.
    pub fn new() -> Arc<Self> {
        Self::with_default(Script::Events(Vec::new()))
    }

    pub fn with_default(default_script: Script) -> Arc<Self> {
        Arc::new(Self {
            per_instance: Mutex::new(HashMap::new()),
            scripts: Mutex::new(VecDeque::new()),
            default_script: Mutex::new(default_script),
            opens: AtomicUsize::new(0),
            transports: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn push_for(&self, instance_id: &str, script: Script) {
        self.per_instance
            .lock()
            .unwrap()
            .entry(instance_id.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn set_default(&self, script: Script) {
        *self.default_script.lock().unwrap() = script;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn last_transport(&self) -> Arc<MockTransport> {
        self.transports
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no transport opened yet")
    }

    /// Emit an event on the most recently opened connection.
    pub async fn emit(&self, event: TransportEvent) {
        let tx = self
            .senders
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no transport opened yet");
        tx.send(event).await.expect("controller dropped the event stream");
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(
        &self,
        instance_id: &str,
        _session_dir: &Path,
    ) -> anyhow::Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let own = self
            .per_instance
            .lock()
            .unwrap()
            .get_mut(instance_id)
            .and_then(|queue| queue.pop_front());
        let script = own
            .or_else(|| self.scripts.lock().unwrap().pop_front())
            .unwrap_or_else(|| self.default_script.lock().unwrap().clone());
        match script {
            Script::Fail(msg) => anyhow::bail!(msg),
            Script::Stall => std::future::pending().await,
            Script::Events(events) => {
                let (tx, rx) = mpsc::channel(64);
                for event in events {
                    tx.try_send(event).expect("script larger than channel");
                }
                let transport = Arc::new(MockTransport::default());
                self.transports.lock().unwrap().push(transport.clone());
                self.senders.lock().unwrap().push(tx);
                Ok((transport, rx))
            }
        }
    }
}

pub fn open_event(phone: &str) -> TransportEvent {
    TransportEvent::Open {
        phone_number: Some(phone.to_string()),
    }
}

pub fn close_event(code: u16) -> TransportEvent {
    TransportEvent::Closed(CloseReason::Other {
        code: Some(code),
        detail: "connection closed".into(),
    })
}

pub fn private_message(id: &str, from: &str, text: &str) -> TransportEvent {
    TransportEvent::Message(InboundMessage {
        id: Some(id.to_string()),
        remote_jid: from.to_string(),
        from_me: false,
        text: Some(text.to_string()),
        timestamp: 1_700_000_000,
    })
}

// ── Recording collaborators ─────────────────────────────────────

#[derive(Default)]
pub struct RecordingHeartbeat {
    pub payloads: Mutex<Vec<HeartbeatPayload>>,
}

#[async_trait]
impl HeartbeatSink for RecordingHeartbeat {
    async fn report(&self, payload: &HeartbeatPayload) {
        self.payloads.lock().unwrap().push(payload.clone());
    }
}

#[derive(Default)]
pub struct RecordingInbound {
    pub payloads: Mutex<Vec<EnginePayload>>,
}

#[async_trait]
impl InboundHandler for RecordingInbound {
    async fn handle(&self, payload: EnginePayload) {
        self.payloads.lock().unwrap().push(payload);
    }
}

// ── Harness ─────────────────────────────────────────────────────

/// Defaults with fast pacing so tests do not wait on stabilization or
/// startup stagger.
pub fn test_config(data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.data_dir = data_dir.to_string_lossy().into_owned();
    config.send.stabilization_ms = 0;
    config.send.stabilization_jitter_ms = 0;
    config.startup.stagger_min_ms = 0;
    config.startup.stagger_max_ms = 0;
    config
}

pub struct Harness {
    pub tmp: TempDir,
    pub manager: Arc<InstanceManager>,
    pub connector: Arc<ScriptedConnector>,
    pub heartbeats: Arc<RecordingHeartbeat>,
    pub inbound: Arc<RecordingInbound>,
}

pub fn harness(configure: impl FnOnce(&mut Config)) -> Harness {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    configure(&mut config);
    harness_in(tmp, config, ScriptedConnector::new(), None)
}

pub fn harness_in(
    tmp: TempDir,
    config: Config,
    connector: Arc<ScriptedConnector>,
    backup_store: Option<Arc<dyn BackupStore>>,
) -> Harness {
    let heartbeats = Arc::new(RecordingHeartbeat::default());
    let inbound = Arc::new(RecordingInbound::default());
    let manager = InstanceManager::open(
        config,
        Collaborators {
            connector: connector.clone(),
            heartbeat: heartbeats.clone(),
            inbound: inbound.clone(),
            backup_store,
        },
    )
    .unwrap();
    Harness {
        tmp,
        manager: Arc::new(manager),
        connector,
        heartbeats,
        inbound,
    }
}

/// Poll an instance's status until `pred` holds. Works with both paused and
/// real time.
pub async fn wait_for(
    manager: &InstanceManager,
    id: &str,
    what: &str,
    pred: impl Fn(&InstanceStatus) -> bool,
) -> InstanceStatus {
    for _ in 0..500 {
        let status = manager.get_status(id).expect("instance exists");
        if pred(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for {what}; last status: {:?}",
        manager.get_status(id)
    );
}

/// Create `id` and bring it to `connected` + ready to send.
pub async fn connect_ready(h: &Harness, id: &str) -> Arc<MockTransport> {
    h.manager.create_instance(Some(id.to_string()), id).await.unwrap();
    h.connector
        .push(Script::Events(vec![open_event("5511999990000")]));
    h.manager.connect_instance(id).await.unwrap();
    wait_for(&h.manager, id, "ready to send", |s| s.ready_to_send).await;
    h.connector.last_transport()
}
