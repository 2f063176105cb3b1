use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::time::Duration;

use crate::config::HeartbeatConfig;
use crate::instance::{ConnectionStatus, InstanceStatus};

/// Body of one heartbeat POST.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub instance_id: String,
    pub status: ConnectionStatus,
    pub phone_number: Option<String>,
    pub metrics: HeartbeatMetrics,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMetrics {
    pub uptime: u64,
    pub ready_to_send: bool,
    pub degraded: bool,
    pub in_cooldown: bool,
    pub consecutive_failures: u32,
    pub messages_this_minute: u32,
    pub messages_this_hour: u32,
    pub messages_today: u32,
    pub session_healthy: bool,
    pub reconnect_attempts: u32,
}

impl From<&InstanceStatus> for HeartbeatPayload {
    fn from(s: &InstanceStatus) -> Self {
        Self {
            instance_id: s.id.clone(),
            status: s.status,
            phone_number: s.phone_number.clone(),
            metrics: HeartbeatMetrics {
                uptime: s.uptime_secs,
                ready_to_send: s.ready_to_send,
                degraded: s.degraded,
                in_cooldown: s.in_cooldown,
                consecutive_failures: s.consecutive_failures,
                messages_this_minute: s.throughput.messages_this_minute,
                messages_this_hour: s.throughput.messages_this_hour,
                messages_today: s.throughput.messages_today,
                session_healthy: s.session_healthy,
                reconnect_attempts: s.reconnect_attempts,
            },
        }
    }
}

/// Destination for heartbeats. Implementations must not fail loudly: a lost
/// heartbeat never affects the connection.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn report(&self, payload: &HeartbeatPayload);
}

/// Used when no heartbeat endpoint is configured.
pub struct NoopHeartbeatSink;

#[async_trait]
impl HeartbeatSink for NoopHeartbeatSink {
    async fn report(&self, _payload: &HeartbeatPayload) {}
}

/// POSTs heartbeats to the control-plane backend.
pub struct HttpHeartbeatSink {
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpHeartbeatSink {
    pub fn new(url: String, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl HeartbeatSink for HttpHeartbeatSink {
    async fn report(&self, payload: &HeartbeatPayload) {
        let mut req = self.client.post(&self.url).json(payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!("heartbeat sent for {}", payload.instance_id);
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::warn!(
                    "heartbeat for {} returned {}: {}",
                    payload.instance_id,
                    status,
                    body
                );
            }
            Err(e) => {
                tracing::warn!("heartbeat for {} failed: {e}", payload.instance_id);
            }
        }
    }
}

/// Computes the next heartbeat delay.
///
/// Every emission draws a fresh `base + random(0, jitter_max)`, stretched by
/// `degraded_factor` while degraded, so the cadence is never periodic.
#[derive(Debug, Clone)]
pub struct HeartbeatEmitter {
    base: Duration,
    jitter_max: Duration,
    degraded_factor: f64,
}

impl HeartbeatEmitter {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            base: Duration::from_secs(config.base_secs),
            jitter_max: Duration::from_secs(config.jitter_max_secs),
            degraded_factor: config.degraded_factor.max(1.0),
        }
    }

    pub fn next_interval(&self, degraded: bool) -> Duration {
        let jitter_ms = self.jitter_max.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        let interval = self.base + Duration::from_millis(extra);
        if degraded {
            interval.mul_f64(self.degraded_factor)
        } else {
            interval
        }
    }
}
