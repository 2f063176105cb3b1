use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::backup::{BackupReceipt, BackupStore, HttpBackupStore, RestoreReceipt, SessionBackupService};
use crate::channels::bridge::BridgeConnector;
use crate::channels::traits::Connector;
use crate::config::Config;
use crate::controller::{ConnectOutcome, ConnectionController, ControllerContext, SendReceipt};
use crate::db::Registry;
use crate::engines::{EngineForwarder, InboundHandler, NoopInboundHandler};
use crate::error::{ManagerError, ManagerResult};
use crate::heartbeat::{HeartbeatSink, HttpHeartbeatSink, NoopHeartbeatSink};
use crate::instance::{InstanceStatus, InstanceSummary};
use crate::observability::Metrics;

const MAX_NAME_LEN: usize = 128;

/// External services the manager talks to. Swappable so tests can script
/// the transport and capture heartbeats and engine calls.
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub heartbeat: Arc<dyn HeartbeatSink>,
    pub inbound: Arc<dyn InboundHandler>,
    pub backup_store: Option<Arc<dyn BackupStore>>,
}

impl Collaborators {
    /// Production wiring: protocol bridge plus whatever HTTP endpoints the
    /// config names. Unset endpoints fall back to no-op implementations.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let connector = Arc::new(BridgeConnector::new(
            config.bridge.url.clone(),
            Duration::from_secs(config.bridge.command_timeout_secs),
        ));

        let heartbeat: Arc<dyn HeartbeatSink> = match &config.heartbeat.url {
            Some(url) => Arc::new(HttpHeartbeatSink::new(
                url.clone(),
                config.heartbeat.api_key.clone(),
                Duration::from_secs(config.heartbeat.timeout_secs),
            )?),
            None => Arc::new(NoopHeartbeatSink),
        };

        let engines = &config.engines;
        let inbound: Arc<dyn InboundHandler> =
            if engines.primary_url.is_some() || engines.fallback_url.is_some() {
                Arc::new(EngineForwarder::new(engines)?)
            } else {
                Arc::new(NoopInboundHandler)
            };

        let backup_store = match &config.backup.url {
            Some(url) => Some(Arc::new(HttpBackupStore::new(
                url.clone(),
                config.backup.api_key.clone(),
                Duration::from_secs(config.backup.timeout_secs),
            )?) as Arc<dyn BackupStore>),
            None => None,
        };

        Ok(Self {
            connector,
            heartbeat,
            inbound,
            backup_store,
        })
    }
}

/// Validate an instance id: it names a directory, so 1-64 characters of
/// letters, digits, `-` or `_`, starting with a letter or digit.
fn validate_instance_id(id: &str) -> Result<(), String> {
    if id.is_empty() || id.len() > 64 {
        return Err("Instance id must be 1-64 characters".into());
    }
    if !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err("Instance id must start with a letter or digit".into());
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("Instance id may only contain letters, digits, '-' and '_'".into());
    }
    Ok(())
}

/// Owns every instance and routes operations to its controller.
pub struct InstanceManager {
    ctx: Arc<ControllerContext>,
    backups: SessionBackupService,
    controllers: RwLock<HashMap<String, Arc<ConnectionController>>>,
}

impl InstanceManager {
    /// Open the registry under `config.data_dir` and spawn a controller for
    /// every registered instance. Nothing connects until asked to.
    pub fn open(config: Config, collaborators: Collaborators) -> anyhow::Result<Self> {
        let registry = Registry::open(&config.registry_path())?;
        let records = registry.list_instances()?;
        let sessions_dir = config.sessions_dir();
        std::fs::create_dir_all(&sessions_dir)?;

        let ctx = Arc::new(ControllerContext {
            config: Arc::new(config),
            connector: collaborators.connector,
            heartbeat: collaborators.heartbeat,
            inbound: collaborators.inbound,
            registry: Arc::new(Mutex::new(registry)),
            metrics: Metrics::new()?,
            sessions_dir: sessions_dir.clone(),
        });

        let mut controllers = HashMap::new();
        for record in &records {
            let controller = ConnectionController::spawn(record, ctx.clone());
            controllers.insert(record.id.clone(), Arc::new(controller));
        }
        tracing::info!("loaded {} instance(s) from registry", controllers.len());

        Ok(Self {
            backups: SessionBackupService::new(sessions_dir, collaborators.backup_store),
            ctx,
            controllers: RwLock::new(controllers),
        })
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.ctx.metrics
    }

    fn controller(&self, id: &str) -> ManagerResult<Arc<ConnectionController>> {
        self.controllers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))
    }

    fn all_controllers(&self) -> Vec<Arc<ConnectionController>> {
        let mut all: Vec<_> = self
            .controllers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| {
            a.created_at()
                .cmp(b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        all
    }

    async fn with_registry<T, F>(&self, f: F) -> ManagerResult<T>
    where
        F: FnOnce(&Registry) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.ctx.registry.clone();
        let result = tokio::task::spawn_blocking(move || {
            let guard = registry.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| anyhow::anyhow!("registry task failed: {e}"))?;
        Ok(result?)
    }

    // ── Instance lifecycle ──────────────────────────────────────

    /// Register a new instance. A missing `id` gets a generated UUID.
    pub async fn create_instance(&self, id: Option<String>, name: &str) -> ManagerResult<InstanceSummary> {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        validate_instance_id(&id).map_err(ManagerError::InvalidInput)?;
        let name = name.trim().to_string();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(ManagerError::InvalidInput(format!(
                "Name must be 1-{MAX_NAME_LEN} characters"
            )));
        }
        if self.controller(&id).is_ok() {
            return Err(ManagerError::AlreadyExists(id));
        }

        let record = {
            let id = id.clone();
            self.with_registry(move |registry| {
                if registry.get_instance(&id)?.is_some() {
                    return Ok(None);
                }
                registry.create_instance(&id, &name).map(Some)
            })
            .await?
        }
        .ok_or_else(|| ManagerError::AlreadyExists(id.clone()))?;

        let controller = Arc::new(ConnectionController::spawn(&record, self.ctx.clone()));
        let summary = summarize(&controller);
        self.controllers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.id.clone(), controller);
        tracing::info!("{}: instance created ({})", record.id, record.name);
        Ok(summary)
    }

    pub async fn connect_instance(&self, id: &str) -> ManagerResult<ConnectOutcome> {
        self.controller(id)?.connect().await
    }

    pub async fn disconnect_instance(&self, id: &str) -> ManagerResult<()> {
        self.controller(id)?.disconnect().await
    }

    /// Log out, stop the controller, forget the registry entry and erase
    /// local credentials.
    pub async fn delete_instance(&self, id: &str) -> ManagerResult<()> {
        let controller = self
            .controllers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        controller.shutdown(true).await;

        let owned = id.to_string();
        self.with_registry(move |registry| registry.delete_instance(&owned))
            .await?;
        if let Err(e) = self.backups.discard(id).await {
            tracing::warn!("{id}: failed to remove session data: {e:#}");
        }
        self.ctx.metrics.forget(id);
        tracing::info!("{id}: instance deleted");
        Ok(())
    }

    pub async fn send_message(&self, id: &str, to: &str, content: &str) -> ManagerResult<SendReceipt> {
        if to.trim().is_empty() {
            return Err(ManagerError::InvalidInput("Recipient must not be empty".into()));
        }
        if content.is_empty() {
            return Err(ManagerError::InvalidInput("Message content must not be empty".into()));
        }
        self.controller(id)?.send_message(to, content).await
    }

    pub fn get_status(&self, id: &str) -> ManagerResult<InstanceStatus> {
        Ok(self.controller(id)?.status())
    }

    pub fn get_all_instances(&self) -> Vec<InstanceSummary> {
        self.all_controllers().iter().map(|c| summarize(c)).collect()
    }

    // ── Backups ─────────────────────────────────────────────────

    pub async fn backup_instance(&self, id: &str) -> ManagerResult<BackupReceipt> {
        self.controller(id)?;
        self.backups.backup(id).await
    }

    /// Restore credentials from backup. Refused while the instance holds a
    /// live or pending connection; while it runs, the instance neither
    /// reconnects on its own nor accepts a connect.
    pub async fn restore_instance(&self, id: &str, backup_id: Option<&str>) -> ManagerResult<RestoreReceipt> {
        let controller = self.controller(id)?;
        controller.begin_restore().await?;
        let _hold = RestoreHold(&controller);
        self.backups.restore(id, backup_id).await
    }

    // ── Startup / shutdown ──────────────────────────────────────

    /// Bring registered instances back after a restart. Instances without
    /// local credentials get a restore attempt first (when enabled); those
    /// still without credentials are left for an explicit connect. Connects
    /// are spaced by a random stagger and run in the background, so one
    /// unresponsive instance never holds up the rest.
    pub async fn auto_reconnect(&self) {
        let startup = &self.ctx.config.startup;
        if !startup.auto_reconnect {
            tracing::info!("auto-reconnect disabled");
            return;
        }

        let mut first = true;
        for controller in self.all_controllers() {
            let id = controller.id().to_string();
            if !self.backups.has_session(&id) {
                if startup.restore_missing_sessions && self.backups.is_enabled() {
                    match self.restore_instance(&id, None).await {
                        Ok(receipt) => tracing::info!(
                            "{id}: restored missing session from backup {}",
                            receipt.backup_id
                        ),
                        Err(ManagerError::NoBackupAvailable(_)) => {
                            tracing::debug!("{id}: no backup to restore")
                        }
                        Err(e) => tracing::warn!("{id}: session restore failed: {e}"),
                    }
                }
                if !self.backups.has_session(&id) {
                    tracing::debug!("{id}: no session data, skipping auto-reconnect");
                    continue;
                }
            }

            if !first {
                let stagger = rand::thread_rng().gen_range(startup.stagger_min_ms..=startup.stagger_max_ms);
                tokio::time::sleep(Duration::from_millis(stagger)).await;
            }
            first = false;

            tokio::spawn(async move {
                match controller.connect().await {
                    Ok(outcome) => tracing::info!("{id}: auto-reconnect {outcome:?}"),
                    Err(e) => tracing::warn!("{id}: auto-reconnect failed: {e}"),
                }
            });
        }
    }

    /// Stop every controller without logging out, so sessions survive a
    /// restart.
    pub async fn shutdown(&self) {
        let all: Vec<_> = self
            .controllers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, c)| c)
            .collect();
        futures_util::future::join_all(all.iter().map(|c| c.shutdown(false))).await;
        tracing::info!("stopped {} controller(s)", all.len());
    }
}

/// Releases a controller's restore hold when the restore ends, including
/// when the restoring future is dropped part-way.
struct RestoreHold<'a>(&'a ConnectionController);

impl Drop for RestoreHold<'_> {
    fn drop(&mut self) {
        self.0.end_restore();
    }
}

fn summarize(controller: &ConnectionController) -> InstanceSummary {
    let status = controller.status();
    InstanceSummary {
        id: status.id,
        name: status.name,
        status: status.status,
        phone_number: status.phone_number,
        ready_to_send: status.ready_to_send,
        degraded: status.degraded,
        in_cooldown: status.in_cooldown,
        created_at: controller.created_at().to_string(),
    }
}
