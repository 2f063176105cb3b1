use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// Where to upload a new backup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub backup_id: String,
    pub upload_url: String,
}

/// A stored backup ready for download.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDescriptor {
    pub backup_id: String,
    pub download_url: String,
    pub checksum: String,
    pub version: String,
}

/// External storage for session backups.
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn create_backup(&self, instance_id: &str, checksum: &str, size: usize) -> Result<UploadTarget>;

    async fn upload(&self, target: &UploadTarget, bytes: Vec<u8>) -> Result<()>;

    /// Mark the upload complete; returns the stored version.
    async fn confirm_upload(&self, backup_id: &str) -> Result<String>;

    /// A specific backup, or the latest when `backup_id` is `None`.
    /// `Ok(None)` when nothing matches.
    async fn find_backup(&self, instance_id: &str, backup_id: Option<&str>) -> Result<Option<BackupDescriptor>>;

    async fn download(&self, descriptor: &BackupDescriptor) -> Result<Vec<u8>>;
}

/// REST client for the backup service.
pub struct HttpBackupStore {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpBackupStore {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build backup HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

async fn ensure_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    anyhow::bail!("{what} returned {status}: {body}")
}

#[async_trait]
impl BackupStore for HttpBackupStore {
    async fn create_backup(&self, instance_id: &str, checksum: &str, size: usize) -> Result<UploadTarget> {
        let resp = self
            .authed(
                self.client
                    .post(format!("{}/instances/{instance_id}/backups", self.base_url))
                    .json(&serde_json::json!({ "checksum": checksum, "size": size })),
            )
            .send()
            .await
            .context("create-backup request failed")?;
        let resp = ensure_success(resp, "create-backup").await?;
        resp.json().await.context("create-backup returned malformed JSON")
    }

    async fn upload(&self, target: &UploadTarget, bytes: Vec<u8>) -> Result<()> {
        let resp = self
            .client
            .put(&target.upload_url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .context("backup upload failed")?;
        ensure_success(resp, "backup upload").await?;
        Ok(())
    }

    async fn confirm_upload(&self, backup_id: &str) -> Result<String> {
        let resp = self
            .authed(
                self.client
                    .post(format!("{}/backups/{backup_id}/confirm", self.base_url)),
            )
            .send()
            .await
            .context("confirm-upload request failed")?;
        let resp = ensure_success(resp, "confirm-upload").await?;
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        Ok(body["version"]
            .as_str()
            .map(String::from)
            .or_else(|| body["version"].as_u64().map(|v| v.to_string()))
            .unwrap_or_else(|| backup_id.to_string()))
    }

    async fn find_backup(&self, instance_id: &str, backup_id: Option<&str>) -> Result<Option<BackupDescriptor>> {
        let url = match backup_id {
            Some(id) => format!("{}/backups/{id}", self.base_url),
            None => format!("{}/instances/{instance_id}/backups/latest", self.base_url),
        };
        let resp = self
            .authed(self.client.get(url))
            .send()
            .await
            .context("backup lookup failed")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = ensure_success(resp, "backup lookup").await?;
        let descriptor = resp
            .json()
            .await
            .context("backup lookup returned malformed JSON")?;
        Ok(Some(descriptor))
    }

    async fn download(&self, descriptor: &BackupDescriptor) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(&descriptor.download_url)
            .send()
            .await
            .context("backup download failed")?;
        let resp = ensure_success(resp, "backup download").await?;
        Ok(resp.bytes().await?.to_vec())
    }
}
