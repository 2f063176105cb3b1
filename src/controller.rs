//! Per-instance connection controller.
//!
//! Each instance gets one task that owns its transport and every timer tied
//! to it (reconnect, warmup, probe, heartbeat, degradation recovery). Callers
//! talk to the task through [`ConnectionController`], which forwards commands
//! over a channel and reads state snapshots. Because a single task applies
//! every transition, operations on one instance are serialized and a timer
//! that was cancelled can never fire late.

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::channels::traits::{CloseReason, Connector, InboundMessage, Transport, TransportEvent};
use crate::config::Config;
use crate::db::{InstanceRecord, Registry};
use crate::engines::{EnginePayload, InboundHandler};
use crate::error::{ManagerError, ManagerResult};
use crate::heartbeat::{HeartbeatEmitter, HeartbeatPayload, HeartbeatSink};
use crate::instance::{ConnectionStatus, InstanceState, InstanceStatus};
use crate::observability::Metrics;
use crate::protection::rate_limit::ceil_secs;
use crate::protection::{dedup_key, BackoffScheduler, FailureOutcome, HealthMonitor, InboundDedup};

const COMMAND_BUFFER: usize = 32;

/// Collaborators shared by every controller of one manager.
pub struct ControllerContext {
    pub config: Arc<Config>,
    pub connector: Arc<dyn Connector>,
    pub heartbeat: Arc<dyn HeartbeatSink>,
    pub inbound: Arc<dyn InboundHandler>,
    pub registry: Arc<Mutex<Registry>>,
    pub metrics: Metrics,
    pub sessions_dir: PathBuf,
}

impl ControllerContext {
    pub fn session_dir(&self, instance_id: &str) -> PathBuf {
        self.sessions_dir.join(instance_id)
    }
}

/// Result of a `connect` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectOutcome {
    /// A transport was opened; pairing progress is reported through status.
    Started,
    AlreadyConnected,
    /// A connection attempt or QR pairing is already under way.
    AlreadyInProgress,
}

/// Result of an accepted send.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub message_id: String,
    pub to: String,
    /// Pacing delay applied before the send, in milliseconds.
    pub delayed_ms: u64,
}

type ConnectReply = oneshot::Sender<ManagerResult<ConnectOutcome>>;
type OpenResult = anyhow::Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)>;

enum Command {
    Connect(ConnectReply),
    Disconnect(oneshot::Sender<()>),
    BeginRestore(oneshot::Sender<ManagerResult<()>>),
    Send {
        to: String,
        content: String,
        reply: oneshot::Sender<ManagerResult<SendReceipt>>,
    },
    Shutdown {
        logout: bool,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one instance's controller task.
pub struct ConnectionController {
    id: String,
    created_at: String,
    state: Arc<Mutex<InstanceState>>,
    restoring: Arc<AtomicBool>,
    commands: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock_state(state: &Mutex<InstanceState>) -> MutexGuard<'_, InstanceState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl ConnectionController {
    /// Spawn the controller task for a registered instance. Must be called
    /// from within a Tokio runtime.
    pub fn spawn(record: &InstanceRecord, ctx: Arc<ControllerContext>) -> Self {
        let state = Arc::new(Mutex::new(InstanceState::new(
            &record.id,
            &record.name,
            record.phone_number.clone(),
            &ctx.config.rate_limit,
        )));
        let restoring = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let task = ControllerTask::new(record.id.clone(), state.clone(), restoring.clone(), ctx);
        let handle = tokio::spawn(task.run(rx));
        Self {
            id: record.id.clone(),
            created_at: record.created_at.clone(),
            state,
            restoring,
            commands: tx,
            task: Mutex::new(Some(handle)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn status(&self) -> InstanceStatus {
        lock_state(&self.state).status_at(Instant::now())
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> ManagerResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ManagerError::NotFound(self.id.clone()))?;
        rx.await.map_err(|_| ManagerError::NotFound(self.id.clone()))
    }

    /// Resolves once the transport is open or the attempt has failed, been
    /// cancelled or timed out.
    pub async fn connect(&self) -> ManagerResult<ConnectOutcome> {
        self.request(Command::Connect).await?
    }

    pub async fn disconnect(&self) -> ManagerResult<()> {
        self.request(Command::Disconnect).await
    }

    pub async fn send_message(&self, to: &str, content: &str) -> ManagerResult<SendReceipt> {
        self.request(|reply| Command::Send {
            to: to.to_string(),
            content: content.to_string(),
            reply,
        })
        .await?
    }

    /// Hold the instance disconnected while its session files are replaced.
    /// Fails with a conflict unless the instance is idle; pending automatic
    /// reconnects are dropped. Release with [`Self::end_restore`].
    pub async fn begin_restore(&self) -> ManagerResult<()> {
        self.request(Command::BeginRestore).await?
    }

    pub fn end_restore(&self) {
        self.restoring.store(false, Ordering::SeqCst);
    }

    /// Stop the task and wait for it to exit. With `logout`, the account is
    /// logged out first (best effort).
    pub async fn shutdown(&self, logout: bool) {
        if let Err(e) = self.request(|reply| Command::Shutdown { logout, reply }).await {
            tracing::debug!("{}: controller already stopped: {e}", self.id);
        }
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("{}: controller task ended abnormally: {e}", self.id);
            }
        }
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

// ── Task ────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct Timers {
    reconnect_at: Option<Instant>,
    warmup_at: Option<Instant>,
    probe_at: Option<Instant>,
    heartbeat_at: Option<Instant>,
    recovery_at: Option<Instant>,
}

impl Timers {
    /// Timers that only make sense while connected.
    fn clear_session(&mut self) {
        self.warmup_at = None;
        self.probe_at = None;
        self.heartbeat_at = None;
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// A transport open running off the controller task, so commands and
/// timers keep flowing while it is in flight. Dropping it aborts the open.
struct PendingOpen {
    handle: JoinHandle<OpenResult>,
    reply: Option<ConnectReply>,
}

impl Drop for PendingOpen {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn wait_open(opening: &mut Option<PendingOpen>) -> Result<OpenResult, JoinError> {
    match opening {
        Some(pending) => (&mut pending.handle).await,
        None => std::future::pending().await,
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

struct ControllerTask {
    id: String,
    state: Arc<Mutex<InstanceState>>,
    restoring: Arc<AtomicBool>,
    ctx: Arc<ControllerContext>,
    backoff: BackoffScheduler,
    health: HealthMonitor,
    heartbeat: HeartbeatEmitter,
    dedup: InboundDedup,
    transport: Option<Arc<dyn Transport>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    opening: Option<PendingOpen>,
    timers: Timers,
    side_tasks: JoinSet<()>,
}

impl ControllerTask {
    fn new(
        id: String,
        state: Arc<Mutex<InstanceState>>,
        restoring: Arc<AtomicBool>,
        ctx: Arc<ControllerContext>,
    ) -> Self {
        let config = &ctx.config;
        Self {
            backoff: BackoffScheduler::new(&config.reconnect),
            health: HealthMonitor::new(&config.health),
            heartbeat: HeartbeatEmitter::new(&config.heartbeat),
            dedup: InboundDedup::new(&config.dedup),
            id,
            state,
            restoring,
            ctx,
            transport: None,
            events: None,
            opening: None,
            timers: Timers::default(),
            side_tasks: JoinSet::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::debug!("{}: controller started", self.id);
        loop {
            let timers = self.timers;
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        self.stop(false).await;
                        break;
                    };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        self.on_closed(CloseReason::Other {
                            code: None,
                            detail: "event stream ended".into(),
                        })
                        .await;
                    }
                },
                result = wait_open(&mut self.opening) => {
                    self.on_open_finished(result).await;
                }
                () = wait_until(timers.reconnect_at) => {
                    self.timers.reconnect_at = None;
                    self.on_reconnect_due();
                }
                () = wait_until(timers.warmup_at) => {
                    self.timers.warmup_at = None;
                    self.on_warmup_due().await;
                }
                () = wait_until(timers.probe_at) => {
                    self.timers.probe_at = None;
                    self.on_probe_due().await;
                }
                () = wait_until(timers.heartbeat_at) => {
                    self.timers.heartbeat_at = None;
                    self.on_heartbeat_due();
                }
                () = wait_until(timers.recovery_at) => {
                    self.timers.recovery_at = None;
                    self.on_recovery_due();
                }
                Some(res) = self.side_tasks.join_next(), if !self.side_tasks.is_empty() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            tracing::error!("{}: background task panicked: {e}", self.id);
                        }
                    }
                }
            }
        }
        self.opening = None;
        self.side_tasks.abort_all();
        tracing::debug!("{}: controller stopped", self.id);
    }

    /// Returns `false` once the task should exit.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect(reply) => self.connect(reply),
            Command::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::BeginRestore(reply) => {
                let _ = reply.send(self.begin_restore());
            }
            Command::Send { to, content, reply } => {
                let result = self.send(to, content).await;
                let _ = reply.send(result);
            }
            Command::Shutdown { logout, reply } => {
                self.stop(logout).await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    // ── Lifecycle ───────────────────────────────────────────────

    fn connect(&mut self, reply: ConnectReply) {
        match self.connect_gate(Instant::now()) {
            Some(early) => {
                let _ = reply.send(early);
            }
            None => self.start_open(Some(reply)),
        }
    }

    /// The answer for a connect that must not open a transport, or `None`
    /// when the open should go ahead. Clears an elapsed cooldown.
    fn connect_gate(&self, now: Instant) -> Option<ManagerResult<ConnectOutcome>> {
        if self.restoring.load(Ordering::SeqCst) {
            return Some(Err(ManagerError::Conflict(
                "a session restore is in progress".into(),
            )));
        }
        let mut s = lock_state(&self.state);
        match s.status {
            ConnectionStatus::Connected => return Some(Ok(ConnectOutcome::AlreadyConnected)),
            ConnectionStatus::Connecting | ConnectionStatus::WaitingQr => {
                return Some(Ok(ConnectOutcome::AlreadyInProgress))
            }
            ConnectionStatus::Disconnected => {}
        }
        if let Some(remaining) = s.protection.cooldown_remaining(now) {
            return Some(Err(ManagerError::InCooldown {
                remaining_secs: ceil_secs(remaining),
            }));
        }
        if s.protection.in_cooldown {
            s.protection.clear_cooldown();
            s.protection.reconnect_attempts = 0;
        }
        None
    }

    /// Mark the instance connecting and open the transport in the
    /// background. The outcome arrives through [`Self::on_open_finished`].
    fn start_open(&mut self, reply: Option<ConnectReply>) {
        self.timers.reconnect_at = None;
        {
            let mut s = lock_state(&self.state);
            s.status = ConnectionStatus::Connecting;
            s.next_reconnect_at = None;
            s.qr_code = None;
        }

        let connector = self.ctx.connector.clone();
        let id = self.id.clone();
        let dir = self.ctx.session_dir(&self.id);
        let limit = self.ctx.config.bridge.connect_timeout();
        let handle = tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                tracing::warn!("{id}: could not create session dir {}: {e}", dir.display());
            }
            match tokio::time::timeout(limit, connector.open(&id, &dir)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "no connection after {}s",
                    limit.as_secs()
                )),
            }
        });
        self.opening = Some(PendingOpen { handle, reply });
    }

    async fn on_open_finished(&mut self, result: Result<OpenResult, JoinError>) {
        let reply = self.opening.take().and_then(|mut pending| pending.reply.take());
        let result = result.unwrap_or_else(|e| Err(anyhow::anyhow!("connect task failed: {e}")));
        let outcome = match result {
            Ok((transport, events)) => {
                tracing::info!("{}: transport opened", self.id);
                self.transport = Some(transport);
                self.events = Some(events);
                Ok(ConnectOutcome::Started)
            }
            Err(e) => {
                tracing::warn!("{}: failed to open transport: {e:#}", self.id);
                self.on_closed(CloseReason::Other {
                    code: None,
                    detail: format!("connect failed: {e:#}"),
                })
                .await;
                Err(ManagerError::transport(&e))
            }
        };
        match reply {
            Some(reply) => {
                let _ = reply.send(outcome);
            }
            None => {
                if let Err(e) = outcome {
                    tracing::debug!("{}: scheduled reconnect failed: {e}", self.id);
                }
            }
        }
    }

    /// Abort an in-flight open. A caller still waiting on it is told so.
    fn cancel_open(&mut self) {
        if let Some(mut pending) = self.opening.take() {
            tracing::info!("{}: connection attempt cancelled", self.id);
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(Err(ManagerError::TransportError(
                    "connection attempt cancelled".into(),
                )));
            }
        }
    }

    fn begin_restore(&mut self) -> ManagerResult<()> {
        if self.restoring.load(Ordering::SeqCst) {
            return Err(ManagerError::Conflict(
                "a session restore is already in progress".into(),
            ));
        }
        {
            let mut s = lock_state(&self.state);
            if self.opening.is_some() || s.status != ConnectionStatus::Disconnected {
                return Err(ManagerError::Conflict(
                    "disconnect the instance before restoring its session".into(),
                ));
            }
            s.next_reconnect_at = None;
            s.protection.reconnect_attempts = 0;
        }
        self.timers.reconnect_at = None;
        self.restoring.store(true, Ordering::SeqCst);
        tracing::info!("{}: holding disconnected for session restore", self.id);
        Ok(())
    }

    /// User-initiated disconnect: logs out, cancels every pending timer and
    /// never schedules a reconnect.
    async fn disconnect(&mut self) {
        self.cancel_open();
        self.events = None;
        self.timers.reconnect_at = None;
        self.timers.clear_session();
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.logout().await {
                tracing::debug!("{}: logout during disconnect failed: {e:#}", self.id);
            }
            transport.close().await;
        }
        {
            let mut s = lock_state(&self.state);
            s.status = ConnectionStatus::Disconnected;
            s.ready_to_send = false;
            s.connected_since = None;
            s.next_reconnect_at = None;
            s.qr_code = None;
        }
        tracing::info!("{}: disconnected by request", self.id);
        self.report_status();
    }

    async fn stop(&mut self, logout: bool) {
        self.cancel_open();
        self.events = None;
        self.timers = Timers::default();
        if let Some(transport) = self.transport.take() {
            if logout {
                if let Err(e) = transport.logout().await {
                    tracing::debug!("{}: logout during shutdown failed: {e:#}", self.id);
                }
            }
            transport.close().await;
        }
        let mut s = lock_state(&self.state);
        s.status = ConnectionStatus::Disconnected;
        s.ready_to_send = false;
        s.connected_since = None;
        s.next_reconnect_at = None;
    }

    /// The transport went away (or never came up). Counts the failure and
    /// decides between a backoff reconnect, a cooldown, or waiting for a new
    /// pairing after logout.
    async fn on_closed(&mut self, reason: CloseReason) {
        let now = Instant::now();
        self.events = None;
        self.timers.clear_session();
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }

        let degraded_deadline;
        {
            let mut s = lock_state(&self.state);
            s.status = ConnectionStatus::Disconnected;
            s.ready_to_send = false;
            s.connected_since = None;
            s.qr_code = None;
            s.protection.consecutive_failures = s.protection.consecutive_failures.saturating_add(1);
            degraded_deadline = match self.health.evaluate(&mut s.protection, now) {
                FailureOutcome::Degraded => self.health.recovery_deadline(&s.protection),
                FailureOutcome::Counted => None,
            };

            if reason.is_logout() {
                s.protection.reconnect_attempts = 0;
                s.next_reconnect_at = None;
                self.timers.reconnect_at = None;
                tracing::warn!("{}: logged out; a new QR pairing is required", self.id);
            } else {
                s.protection.reconnect_attempts = s.protection.reconnect_attempts.saturating_add(1);
                let attempts = s.protection.reconnect_attempts;
                if self.backoff.should_cool_down(attempts) {
                    let until = now + self.backoff.cooldown();
                    s.protection.in_cooldown = true;
                    s.protection.cooldown_until = Some(until);
                    s.next_reconnect_at = Some(until);
                    self.timers.reconnect_at = Some(until);
                    Metrics::inc(&self.ctx.metrics.cooldowns_entered, &self.id);
                    tracing::warn!(
                        "{}: connection closed ({reason}); {attempts} failed attempts, cooling down for {}s",
                        self.id,
                        self.backoff.cooldown().as_secs()
                    );
                } else {
                    let delay = self.backoff.delay(attempts);
                    let at = now + delay;
                    s.next_reconnect_at = Some(at);
                    self.timers.reconnect_at = Some(at);
                    Metrics::inc(&self.ctx.metrics.reconnects_scheduled, &self.id);
                    tracing::info!(
                        "{}: connection closed ({reason}); reconnect attempt {attempts} in {}ms",
                        self.id,
                        delay.as_millis()
                    );
                }
            }
        }
        if let Some(deadline) = degraded_deadline {
            self.on_degraded(deadline);
        }
        self.report_status();
    }

    fn on_reconnect_due(&mut self) {
        let now = Instant::now();
        {
            let mut s = lock_state(&self.state);
            s.next_reconnect_at = None;
            if s.status != ConnectionStatus::Disconnected || self.restoring.load(Ordering::SeqCst) {
                return;
            }
            if s.protection.in_cooldown {
                if s.protection.cooldown_remaining(now).is_some() {
                    self.timers.reconnect_at = s.protection.cooldown_until;
                    s.next_reconnect_at = s.protection.cooldown_until;
                    return;
                }
                s.protection.clear_cooldown();
                s.protection.reconnect_attempts = 0;
                tracing::info!("{}: cooldown over, reconnecting", self.id);
            }
        }
        self.start_open(None);
    }

    // ── Transport events ────────────────────────────────────────

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Qr(code) => {
                {
                    let mut s = lock_state(&self.state);
                    s.status = ConnectionStatus::WaitingQr;
                    s.protection.reconnect_attempts = 0;
                    s.qr_code = Some(code);
                }
                tracing::info!("{}: waiting for QR scan", self.id);
                self.report_status();
            }
            TransportEvent::Open { phone_number } => self.on_open(phone_number),
            TransportEvent::Closed(reason) => self.on_closed(reason).await,
            TransportEvent::Message(msg) => self.on_inbound(msg),
        }
    }

    fn on_open(&mut self, phone_number: Option<String>) {
        let now = Instant::now();
        let send = &self.ctx.config.send;
        let jitter = if send.stabilization_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=send.stabilization_jitter_ms)
        };
        let stabilization = Duration::from_millis(send.stabilization_ms + jitter);

        let learned_phone = {
            let mut s = lock_state(&self.state);
            s.status = ConnectionStatus::Connected;
            s.ready_to_send = false;
            s.connected_since = Some(now);
            s.qr_code = None;
            s.next_reconnect_at = None;
            let p = &mut s.protection;
            p.reconnect_attempts = 0;
            p.consecutive_failures = 0;
            p.degraded = false;
            p.degradation_detected_at = None;
            p.session_healthy = true;
            p.silent_pause_until = None;
            p.clear_cooldown();
            match phone_number {
                Some(phone) if s.phone_number.as_deref() != Some(phone.as_str()) => {
                    s.phone_number = Some(phone.clone());
                    Some(phone)
                }
                _ => None,
            }
        };

        self.timers.reconnect_at = None;
        self.timers.recovery_at = None;
        self.timers.warmup_at = Some(now + stabilization);
        self.timers.probe_at = Some(now + self.health.interval());
        self.timers.heartbeat_at = Some(now + self.heartbeat.next_interval(false));

        if let Some(phone) = learned_phone {
            self.persist_phone(phone);
        }
        tracing::info!(
            "{}: connected; ready to send in {}ms",
            self.id,
            stabilization.as_millis()
        );
        self.report_status();
    }

    fn on_inbound(&mut self, msg: InboundMessage) {
        if !msg.is_forwardable() {
            return;
        }
        let text = msg.text.unwrap_or_default();
        let key = dedup_key(msg.id.as_deref(), &msg.remote_jid, &text, msg.timestamp);
        if self.dedup.check(&key, Instant::now()) {
            tracing::debug!("{}: dropping duplicate inbound from {}", self.id, msg.remote_jid);
            Metrics::inc(&self.ctx.metrics.inbound_duplicates, &self.id);
            return;
        }
        lock_state(&self.state).last_activity_at = Some(Utc::now());

        let payload = EnginePayload {
            from: msg.remote_jid,
            message: text,
            instance_id: self.id.clone(),
            message_id: msg.id,
            timestamp: msg.timestamp,
        };
        let handler = self.ctx.inbound.clone();
        self.side_tasks.spawn(async move { handler.handle(payload).await });
    }

    // ── Timers ──────────────────────────────────────────────────

    async fn on_warmup_due(&mut self) {
        if lock_state(&self.state).status != ConnectionStatus::Connected {
            return;
        }
        if let Some(transport) = self.transport.clone() {
            match tokio::time::timeout(self.health.probe_timeout(), transport.warmup()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("{}: warmup failed: {e:#}", self.id),
                Err(_) => tracing::warn!("{}: warmup timed out", self.id),
            }
        }
        lock_state(&self.state).ready_to_send = true;
        tracing::info!("{}: ready to send", self.id);
        self.report_status();
    }

    async fn on_probe_due(&mut self) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        if lock_state(&self.state).status != ConnectionStatus::Connected {
            return;
        }

        let result = match tokio::time::timeout(self.health.probe_timeout(), transport.probe()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("probe timed out")),
        };
        let now = Instant::now();
        let degraded_deadline = {
            let mut s = lock_state(&self.state);
            match result {
                Ok(()) => {
                    self.health.record_probe_success(&mut s.protection);
                    None
                }
                Err(e) => {
                    tracing::warn!(
                        "{}: health probe failed ({} in a row): {e:#}",
                        self.id,
                        s.protection.consecutive_failures + 1
                    );
                    match self.health.record_probe_failure(&mut s.protection, now) {
                        FailureOutcome::Degraded => self.health.recovery_deadline(&s.protection),
                        FailureOutcome::Counted => None,
                    }
                }
            }
        };
        if let Some(deadline) = degraded_deadline {
            self.on_degraded(deadline);
        }
        self.timers.probe_at = Some(now + self.health.interval());
    }

    fn on_heartbeat_due(&mut self) {
        let status = lock_state(&self.state).status_at(Instant::now());
        let degraded = status.degraded;
        self.spawn_report(status);
        if lock_state(&self.state).status == ConnectionStatus::Connected {
            self.timers.heartbeat_at = Some(Instant::now() + self.heartbeat.next_interval(degraded));
        }
    }

    fn on_recovery_due(&mut self) {
        let recovered = {
            let mut s = lock_state(&self.state);
            self.health.maybe_recover(&mut s.protection, Instant::now())
        };
        if recovered {
            tracing::info!("{}: degradation cleared after recovery window", self.id);
            self.report_status();
        }
    }

    fn on_degraded(&mut self, recovery_deadline: Instant) {
        self.timers.recovery_at = Some(recovery_deadline);
        Metrics::inc(&self.ctx.metrics.degradations, &self.id);
        tracing::warn!(
            "{}: marked degraded after {} consecutive failures",
            self.id,
            self.health.threshold()
        );
    }

    // ── Sending ─────────────────────────────────────────────────

    async fn send(&mut self, to: String, content: String) -> ManagerResult<SendReceipt> {
        let now = Instant::now();
        let (degraded, transport) = {
            let mut s = lock_state(&self.state);
            if self.health.maybe_recover(&mut s.protection, now) {
                self.timers.recovery_at = None;
            }
            if s.status != ConnectionStatus::Connected || !s.ready_to_send {
                return Err(ManagerError::NotReady);
            }
            if let Some(remaining) = s.protection.silent_pause_remaining(now) {
                return Err(ManagerError::SilentPause {
                    retry_after_secs: ceil_secs(remaining),
                });
            }
            if let Err(rejection) = s.limiter.check(now) {
                Metrics::inc(&self.ctx.metrics.rate_limited, &self.id);
                tracing::debug!("{}: send to {to} rate limited ({})", self.id, rejection.window);
                return Err(ManagerError::RateLimited {
                    window: rejection.window,
                    retry_after_secs: rejection.retry_after_secs(),
                });
            }
            (s.protection.degraded, self.transport.clone())
        };
        let Some(transport) = transport else {
            return Err(ManagerError::NotReady);
        };

        let delay = if degraded {
            self.ctx.config.send.degraded_delay()
        } else {
            Duration::ZERO
        };
        if !delay.is_zero() {
            tracing::debug!("{}: degraded, pacing send by {}ms", self.id, delay.as_millis());
            tokio::time::sleep(delay).await;
        }

        match transport.send_text(&to, &content).await {
            Ok(message_id) => {
                {
                    let mut s = lock_state(&self.state);
                    s.limiter.record(Instant::now());
                    s.last_activity_at = Some(Utc::now());
                    self.health.record_send_success(&mut s.protection);
                }
                self.timers.recovery_at = None;
                Metrics::inc(&self.ctx.metrics.messages_sent, &self.id);
                tracing::debug!("{}: sent {message_id} to {to}", self.id);
                Ok(SendReceipt {
                    message_id,
                    to,
                    delayed_ms: delay.as_millis() as u64,
                })
            }
            Err(e) => {
                Metrics::inc(&self.ctx.metrics.send_failures, &self.id);
                tracing::warn!("{}: send to {to} failed: {e:#}", self.id);
                let degraded_deadline = {
                    let mut s = lock_state(&self.state);
                    s.protection.consecutive_failures =
                        s.protection.consecutive_failures.saturating_add(1);
                    match self.health.evaluate(&mut s.protection, Instant::now()) {
                        FailureOutcome::Degraded => self.health.recovery_deadline(&s.protection),
                        FailureOutcome::Counted => None,
                    }
                };
                if let Some(deadline) = degraded_deadline {
                    self.on_degraded(deadline);
                }
                Err(ManagerError::transport(&e))
            }
        }
    }

    // ── Side effects ────────────────────────────────────────────

    /// Out-of-cycle heartbeat after a state transition.
    fn report_status(&mut self) {
        let status = lock_state(&self.state).status_at(Instant::now());
        self.spawn_report(status);
    }

    fn spawn_report(&mut self, status: InstanceStatus) {
        let sink = self.ctx.heartbeat.clone();
        let payload = HeartbeatPayload::from(&status);
        self.side_tasks.spawn(async move { sink.report(&payload).await });
    }

    fn persist_phone(&mut self, phone: String) {
        let registry = self.ctx.registry.clone();
        let id = self.id.clone();
        self.side_tasks.spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .update_phone(&id, &phone)
                    .map(|()| id)
            })
            .await;
            match result {
                Ok(Ok(id)) => tracing::debug!("{id}: phone number saved"),
                Ok(Err(e)) => tracing::warn!("failed to save phone number: {e:#}"),
                Err(e) => tracing::warn!("phone number task failed: {e}"),
            }
        });
    }
}
