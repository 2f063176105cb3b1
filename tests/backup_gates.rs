mod common;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use common::*;
use wafleet::backup::{checksum_hex, BackupDescriptor, BackupStore, HttpBackupStore, UploadTarget};
use wafleet::error::ManagerError;

// ── Fake backup storage ─────────────────────────────────────────

#[derive(Clone)]
struct StoredBackup {
    instance_id: String,
    checksum: String,
    bytes: Vec<u8>,
}

#[derive(Clone)]
struct StorageState {
    base_url: String,
    backups: Arc<Mutex<HashMap<String, StoredBackup>>>,
    latest: Arc<Mutex<HashMap<String, String>>>,
    next_id: Arc<AtomicUsize>,
    /// Serve altered bytes on download.
    corrupt: Arc<AtomicBool>,
}

async fn create_backup(
    State(state): State<StorageState>,
    AxumPath(instance_id): AxumPath<String>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let backup_id = format!("b{}", state.next_id.fetch_add(1, Ordering::SeqCst) + 1);
    state.backups.lock().unwrap().insert(
        backup_id.clone(),
        StoredBackup {
            instance_id,
            checksum: body["checksum"].as_str().unwrap_or_default().to_string(),
            bytes: Vec::new(),
        },
    );
    Json(json!({
        "backupId": backup_id,
        "uploadUrl": format!("{}/upload/{backup_id}", state.base_url),
    }))
}

async fn upload(
    State(state): State<StorageState>,
    AxumPath(backup_id): AxumPath<String>,
    body: Bytes,
) -> impl IntoResponse {
    match state.backups.lock().unwrap().get_mut(&backup_id) {
        Some(backup) => {
            backup.bytes = body.to_vec();
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn confirm(
    State(state): State<StorageState>,
    AxumPath(backup_id): AxumPath<String>,
) -> impl IntoResponse {
    let backups = state.backups.lock().unwrap();
    let Some(backup) = backups.get(&backup_id) else {
        return (StatusCode::NOT_FOUND, Json(json!({})));
    };
    state
        .latest
        .lock()
        .unwrap()
        .insert(backup.instance_id.clone(), backup_id.clone());
    (StatusCode::OK, Json(json!({ "version": backup_id.trim_start_matches('b') })))
}

fn descriptor(state: &StorageState, backup_id: &str) -> (StatusCode, Json<serde_json::Value>) {
    match state.backups.lock().unwrap().get(backup_id) {
        Some(backup) => (
            StatusCode::OK,
            Json(json!({
                "backupId": backup_id,
                "downloadUrl": format!("{}/download/{backup_id}", state.base_url),
                "checksum": backup.checksum,
                "version": backup_id.trim_start_matches('b'),
            })),
        ),
        None => (StatusCode::NOT_FOUND, Json(json!({}))),
    }
}

async fn latest(
    State(state): State<StorageState>,
    AxumPath(instance_id): AxumPath<String>,
) -> impl IntoResponse {
    let latest = state.latest.lock().unwrap().get(&instance_id).cloned();
    match latest {
        Some(backup_id) => descriptor(&state, &backup_id),
        None => (StatusCode::NOT_FOUND, Json(json!({}))),
    }
}

async fn by_id(
    State(state): State<StorageState>,
    AxumPath(backup_id): AxumPath<String>,
) -> impl IntoResponse {
    descriptor(&state, &backup_id)
}

async fn download(
    State(state): State<StorageState>,
    AxumPath(backup_id): AxumPath<String>,
) -> impl IntoResponse {
    let Some(mut bytes) = state
        .backups
        .lock()
        .unwrap()
        .get(&backup_id)
        .map(|b| b.bytes.clone())
    else {
        return (StatusCode::NOT_FOUND, Vec::new());
    };
    if state.corrupt.load(Ordering::SeqCst) {
        bytes.extend_from_slice(b"tampered");
    }
    (StatusCode::OK, bytes)
}

/// Start the fake storage on a random port.
async fn start_storage() -> (StorageState, tokio::sync::watch::Sender<bool>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = StorageState {
        base_url: format!("http://127.0.0.1:{}", addr.port()),
        backups: Arc::default(),
        latest: Arc::default(),
        next_id: Arc::default(),
        corrupt: Arc::default(),
    };
    let app = Router::new()
        .route("/instances/:id/backups", post(create_backup))
        .route("/instances/:id/backups/latest", get(latest))
        .route("/backups/:id", get(by_id))
        .route("/backups/:id/confirm", post(confirm))
        .route("/upload/:id", put(upload))
        .route("/download/:id", get(download))
        .with_state(state.clone());

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
            .unwrap();
    });
    (state, shutdown_tx)
}

fn store_for(storage: &StorageState) -> Arc<dyn BackupStore> {
    Arc::new(HttpBackupStore::new(storage.base_url.clone(), None, Duration::from_secs(5)).unwrap())
}

fn seed_session(dir: &Path, creds: &[u8]) {
    std::fs::create_dir_all(dir.join("keys")).unwrap();
    std::fs::write(dir.join("creds.json"), creds).unwrap();
    std::fs::write(dir.join("keys").join("pre-key-1.json"), b"k1").unwrap();
}

/// Holds a single backup in memory; downloads take `download_delay`.
struct MemoryStore {
    stored: Mutex<Option<(String, Vec<u8>)>>,
    download_delay: Duration,
}

impl MemoryStore {
    fn with_download_delay(download_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            stored: Mutex::new(None),
            download_delay,
        })
    }
}

#[async_trait]
impl BackupStore for MemoryStore {
    async fn create_backup(&self, _instance_id: &str, _checksum: &str, _size: usize) -> Result<UploadTarget> {
        Ok(UploadTarget {
            backup_id: "m1".into(),
            upload_url: "memory://m1".into(),
        })
    }

    async fn upload(&self, _target: &UploadTarget, bytes: Vec<u8>) -> Result<()> {
        *self.stored.lock().unwrap() = Some((checksum_hex(&bytes), bytes));
        Ok(())
    }

    async fn confirm_upload(&self, _backup_id: &str) -> Result<String> {
        Ok("1".into())
    }

    async fn find_backup(&self, _instance_id: &str, _backup_id: Option<&str>) -> Result<Option<BackupDescriptor>> {
        Ok(self.stored.lock().unwrap().as_ref().map(|(checksum, _)| BackupDescriptor {
            backup_id: "m1".into(),
            download_url: "memory://m1".into(),
            checksum: checksum.clone(),
            version: "1".into(),
        }))
    }

    async fn download(&self, _descriptor: &BackupDescriptor) -> Result<Vec<u8>> {
        tokio::time::sleep(self.download_delay).await;
        let stored = self.stored.lock().unwrap().clone();
        stored.map(|(_, bytes)| bytes).ok_or_else(|| anyhow::anyhow!("nothing stored"))
    }
}

fn harness_with_storage(storage: &StorageState, connector: Arc<ScriptedConnector>) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    harness_in(tmp, config, connector, Some(store_for(storage)))
}

// ══════════════════════════════════════════════════════════════════
// Gate 1: backup and restore round trip
// ══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn gate1_backup_then_restore_moves_old_session_aside() -> Result<()> {
    let (storage, shutdown) = start_storage().await;
    let h = harness_with_storage(&storage, ScriptedConnector::new());
    h.manager.create_instance(Some("i1".into()), "sales").await?;
    let session = h.manager.config().sessions_dir().join("i1");
    seed_session(&session, br#"{"me":"original"}"#);

    let receipt = h.manager.backup_instance("i1").await?;
    assert_eq!(receipt.backup_id, "b1");
    assert_eq!(receipt.version, "1");
    let stored = storage.backups.lock().unwrap()["b1"].clone();
    assert_eq!(checksum_hex(&stored.bytes), receipt.checksum);
    assert_eq!(stored.bytes.len(), receipt.size);

    std::fs::write(session.join("creds.json"), br#"{"me":"drifted"}"#)?;
    let restored = h.manager.restore_instance("i1", None).await?;
    assert_eq!(restored.backup_id, "b1");
    assert_eq!(restored.files, 2);
    assert_eq!(
        std::fs::read(session.join("creds.json"))?,
        br#"{"me":"original"}"#
    );
    let aside = restored.previous_moved_to.expect("old session kept");
    assert_eq!(std::fs::read(aside.join("creds.json"))?, br#"{"me":"drifted"}"#);

    let _ = shutdown.send(true);
    Ok(())
}

#[tokio::test]
async fn gate1_restore_specific_backup_id() -> Result<()> {
    let (storage, shutdown) = start_storage().await;
    let h = harness_with_storage(&storage, ScriptedConnector::new());
    h.manager.create_instance(Some("i1".into()), "sales").await?;
    let session = h.manager.config().sessions_dir().join("i1");

    seed_session(&session, b"first");
    h.manager.backup_instance("i1").await?;
    std::fs::write(session.join("creds.json"), b"second")?;
    h.manager.backup_instance("i1").await?;

    h.manager.restore_instance("i1", Some("b1")).await?;
    assert_eq!(std::fs::read(session.join("creds.json"))?, b"first");
    h.manager.restore_instance("i1", None).await?;
    assert_eq!(std::fs::read(session.join("creds.json"))?, b"second");

    let _ = shutdown.send(true);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════
// Gate 2: restore fails closed
// ══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn gate2_checksum_mismatch_leaves_local_session_untouched() -> Result<()> {
    let (storage, shutdown) = start_storage().await;
    let h = harness_with_storage(&storage, ScriptedConnector::new());
    h.manager.create_instance(Some("i1".into()), "sales").await?;
    let session = h.manager.config().sessions_dir().join("i1");
    seed_session(&session, b"backed-up");
    h.manager.backup_instance("i1").await?;

    std::fs::write(session.join("creds.json"), b"current")?;
    storage.corrupt.store(true, Ordering::SeqCst);

    match h.manager.restore_instance("i1", None).await {
        Err(ManagerError::ChecksumMismatch { expected, actual }) => assert_ne!(expected, actual),
        other => panic!("expected ChecksumMismatch, got {other:?}"),
    }
    assert_eq!(std::fs::read(session.join("creds.json"))?, b"current");
    let siblings: Vec<String> = std::fs::read_dir(h.manager.config().sessions_dir())?
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(siblings, vec!["i1".to_string()], "nothing moved aside or staged");

    let _ = shutdown.send(true);
    Ok(())
}

#[tokio::test]
async fn gate2_missing_backup_and_empty_session_are_reported() -> Result<()> {
    let (storage, shutdown) = start_storage().await;
    let h = harness_with_storage(&storage, ScriptedConnector::new());
    h.manager.create_instance(Some("i1".into()), "sales").await?;

    assert!(matches!(
        h.manager.restore_instance("i1", None).await,
        Err(ManagerError::NoBackupAvailable(_))
    ));
    assert!(matches!(
        h.manager.restore_instance("i1", Some("b404")).await,
        Err(ManagerError::NoBackupAvailable(_))
    ));
    assert!(matches!(
        h.manager.backup_instance("i1").await,
        Err(ManagerError::NoSessionData(_))
    ));
    assert!(matches!(
        h.manager.backup_instance("ghost").await,
        Err(ManagerError::NotFound(_))
    ));

    let _ = shutdown.send(true);
    Ok(())
}

#[tokio::test]
async fn gate2_restore_refused_while_connected() -> Result<()> {
    let (storage, shutdown) = start_storage().await;
    let h = harness_with_storage(&storage, ScriptedConnector::new());
    connect_ready(&h, "i1").await;

    assert!(matches!(
        h.manager.restore_instance("i1", None).await,
        Err(ManagerError::Conflict(_))
    ));

    let _ = shutdown.send(true);
    Ok(())
}

#[tokio::test]
async fn gate2_backup_without_storage_is_a_storage_error() -> Result<()> {
    let h = harness(|_| {});
    h.manager.create_instance(Some("i1".into()), "sales").await?;
    seed_session(&h.manager.config().sessions_dir().join("i1"), b"x");
    assert!(matches!(
        h.manager.backup_instance("i1").await,
        Err(ManagerError::Storage(_))
    ));
    Ok(())
}

#[tokio::test]
async fn gate2_backup_without_session_or_storage_reports_missing_session() -> Result<()> {
    let h = harness(|_| {});
    h.manager.create_instance(Some("i1".into()), "sales").await?;
    assert!(matches!(
        h.manager.backup_instance("i1").await,
        Err(ManagerError::NoSessionData(id)) if id == "i1"
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn gate2_restore_holds_off_reconnects_until_done() -> Result<()> {
    let tmp = TempDir::new()?;
    let config = test_config(tmp.path());
    let store: Arc<dyn BackupStore> = MemoryStore::with_download_delay(Duration::from_secs(5));
    let h = harness_in(tmp, config, ScriptedConnector::new(), Some(store));
    h.manager.create_instance(Some("i1".into()), "sales").await?;
    seed_session(&h.manager.config().sessions_dir().join("i1"), b"backed-up");
    h.manager.backup_instance("i1").await?;

    h.connector.push(Script::Events(vec![close_event(428)]));
    h.manager.connect_instance("i1").await?;
    wait_for(&h.manager, "i1", "reconnect scheduled", |s| s.reconnect_in_ms.is_some()).await;

    let manager = h.manager.clone();
    let restore = tokio::spawn(async move { manager.restore_instance("i1", None).await });
    wait_for(&h.manager, "i1", "pending reconnect dropped", |s| s.reconnect_in_ms.is_none()).await;

    assert!(matches!(
        h.manager.connect_instance("i1").await,
        Err(ManagerError::Conflict(_))
    ));
    assert!(matches!(
        h.manager.restore_instance("i1", None).await,
        Err(ManagerError::Conflict(_))
    ));

    let receipt = restore.await??;
    assert_eq!(receipt.files, 2);
    tokio::time::sleep(Duration::from_secs(10)).await;
    let status = h.manager.get_status("i1")?;
    assert_eq!(status.reconnect_in_ms, None);
    assert_eq!(h.connector.opens(), 1, "no reconnect raced the restore");

    // Released once the restore finished.
    h.manager.connect_instance("i1").await?;
    assert_eq!(h.connector.opens(), 2);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════
// Gate 3: startup restore + auto-reconnect
// ══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn gate3_auto_reconnect_restores_missing_sessions() -> Result<()> {
    let (storage, shutdown) = start_storage().await;
    let tmp = TempDir::new()?;
    let config = test_config(tmp.path());

    {
        let h = harness_in(
            TempDir::new()?,
            test_config(tmp.path()),
            ScriptedConnector::new(),
            Some(store_for(&storage)),
        );
        h.manager.create_instance(Some("restored".into()), "a").await?;
        h.manager.create_instance(Some("local".into()), "b").await?;
        h.manager.create_instance(Some("fresh".into()), "c").await?;
        let sessions = h.manager.config().sessions_dir();
        seed_session(&sessions.join("restored"), b"from-backup");
        h.manager.backup_instance("restored").await?;
        std::fs::remove_dir_all(sessions.join("restored"))?;
        seed_session(&sessions.join("local"), b"on-disk");
        h.manager.shutdown().await;
    }

    let connector = ScriptedConnector::new();
    let h = harness_in(tmp, config, connector.clone(), Some(store_for(&storage)));
    h.manager.auto_reconnect().await;
    for _ in 0..500 {
        if connector.opens() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let sessions = h.manager.config().sessions_dir();
    assert_eq!(
        std::fs::read(sessions.join("restored").join("creds.json"))?,
        b"from-backup"
    );
    assert_eq!(connector.opens(), 2, "only instances with credentials connect");
    assert!(!sessions.join("fresh").join("creds.json").exists());
    assert_eq!(
        h.manager.get_status("fresh")?.status,
        wafleet::instance::ConnectionStatus::Disconnected
    );

    let _ = shutdown.send(true);
    Ok(())
}

#[tokio::test]
async fn gate3_auto_reconnect_can_be_disabled() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut config = test_config(tmp.path());
    config.startup.auto_reconnect = false;
    let h = harness_in(tmp, config, ScriptedConnector::new(), None);
    h.manager.create_instance(Some("i1".into()), "sales").await?;
    seed_session(&h.manager.config().sessions_dir().join("i1"), b"x");

    h.manager.auto_reconnect().await;
    assert_eq!(h.connector.opens(), 0);
    Ok(())
}
