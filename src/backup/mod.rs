//! Snapshot and restore of per-instance credential material.

pub mod archive;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ManagerError, ManagerResult};
pub use archive::{checksum_hex, install_archive, pack_dir};
pub use store::{BackupDescriptor, BackupStore, HttpBackupStore, UploadTarget};

/// Result of a completed backup.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupReceipt {
    pub backup_id: String,
    pub version: String,
    pub checksum: String,
    pub size: usize,
}

/// Result of a completed restore.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReceipt {
    pub backup_id: String,
    pub version: String,
    pub files: usize,
    /// Where the previous session directory was moved, if there was one.
    pub previous_moved_to: Option<PathBuf>,
}

/// Backs up and restores `<sessions_dir>/<instance_id>/`.
pub struct SessionBackupService {
    sessions_dir: PathBuf,
    store: Option<Arc<dyn BackupStore>>,
}

impl SessionBackupService {
    pub fn new(sessions_dir: PathBuf, store: Option<Arc<dyn BackupStore>>) -> Self {
        Self {
            sessions_dir,
            store,
        }
    }

    pub fn session_dir(&self, instance_id: &str) -> PathBuf {
        self.sessions_dir.join(instance_id)
    }

    /// True when the instance has any local credential files.
    pub fn has_session(&self, instance_id: &str) -> bool {
        dir_has_files(&self.session_dir(instance_id))
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    fn store(&self) -> ManagerResult<&Arc<dyn BackupStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| ManagerError::Storage("backup storage is not configured".into()))
    }

    /// Archive, checksum, upload and confirm. Returns the stored version.
    pub async fn backup(&self, instance_id: &str) -> ManagerResult<BackupReceipt> {
        let dir = self.session_dir(instance_id);
        if !dir_has_files(&dir) {
            return Err(ManagerError::NoSessionData(instance_id.to_string()));
        }
        let store = self.store()?;

        let bytes = tokio::task::spawn_blocking(move || pack_dir(&dir))
            .await
            .map_err(|e| anyhow::anyhow!("archive task failed: {e}"))??;
        let checksum = checksum_hex(&bytes);
        let size = bytes.len();

        let target = store
            .create_backup(instance_id, &checksum, size)
            .await
            .map_err(storage_err)?;
        store.upload(&target, bytes).await.map_err(storage_err)?;
        let version = store
            .confirm_upload(&target.backup_id)
            .await
            .map_err(storage_err)?;

        tracing::info!(
            "{instance_id}: session backed up as {} (version {version}, {size} bytes)",
            target.backup_id
        );
        Ok(BackupReceipt {
            backup_id: target.backup_id,
            version,
            checksum,
            size,
        })
    }

    /// Fetch, verify and install a backup. The current session directory, if
    /// any, is moved aside rather than overwritten. Nothing local changes
    /// unless the download matches its checksum and the archive is well formed.
    pub async fn restore(
        &self,
        instance_id: &str,
        backup_id: Option<&str>,
    ) -> ManagerResult<RestoreReceipt> {
        let store = self.store()?;
        let descriptor = store
            .find_backup(instance_id, backup_id)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| ManagerError::NoBackupAvailable(instance_id.to_string()))?;

        let bytes = store.download(&descriptor).await.map_err(storage_err)?;
        let actual = checksum_hex(&bytes);
        if !actual.eq_ignore_ascii_case(&descriptor.checksum) {
            tracing::error!(
                "{instance_id}: refusing backup {} with bad checksum",
                descriptor.backup_id
            );
            return Err(ManagerError::ChecksumMismatch {
                expected: descriptor.checksum,
                actual,
            });
        }

        let dir = self.session_dir(instance_id);
        let (files, previous_moved_to) =
            tokio::task::spawn_blocking(move || install_archive(&bytes, &dir))
                .await
                .map_err(|e| anyhow::anyhow!("restore task failed: {e}"))??;

        tracing::info!(
            "{instance_id}: restored backup {} (version {}, {files} files)",
            descriptor.backup_id,
            descriptor.version
        );
        Ok(RestoreReceipt {
            backup_id: descriptor.backup_id,
            version: descriptor.version,
            files,
            previous_moved_to,
        })
    }

    /// Delete the instance's local credential material.
    pub async fn discard(&self, instance_id: &str) -> anyhow::Result<()> {
        let dir = self.session_dir(instance_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}

fn storage_err(e: anyhow::Error) -> ManagerError {
    ManagerError::Storage(format!("{e:#}"))
}

fn dir_has_files(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
