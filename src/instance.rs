use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::protection::rate_limit::{ceil_secs, RateLimiter, ThroughputCounters};

/// Connection lifecycle state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    WaitingQr,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::WaitingQr => "waiting_qr",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ban-avoidance bookkeeping: reconnect attempts, cooldown, degradation.
#[derive(Debug, Clone)]
pub struct ProtectionState {
    pub reconnect_attempts: u32,
    pub in_cooldown: bool,
    pub cooldown_until: Option<Instant>,
    pub degraded: bool,
    pub degradation_detected_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub session_healthy: bool,
    pub silent_pause_until: Option<Instant>,
}

impl Default for ProtectionState {
    fn default() -> Self {
        Self {
            reconnect_attempts: 0,
            in_cooldown: false,
            cooldown_until: None,
            degraded: false,
            degradation_detected_at: None,
            consecutive_failures: 0,
            session_healthy: true,
            silent_pause_until: None,
        }
    }
}

impl ProtectionState {
    /// Remaining cooldown at `now`, or `None` once it has passed.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        match self.cooldown_until {
            Some(until) if self.in_cooldown && now < until => Some(until - now),
            _ => None,
        }
    }

    pub fn silent_pause_remaining(&self, now: Instant) -> Option<Duration> {
        self.silent_pause_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    pub fn clear_cooldown(&mut self) {
        self.in_cooldown = false;
        self.cooldown_until = None;
    }
}

/// Live, in-memory state of one instance.
///
/// Held behind the controller's `Arc<Mutex<_>>`; only the controller task
/// writes it, everyone else reads snapshots.
#[derive(Debug)]
pub struct InstanceState {
    pub id: String,
    pub name: String,
    pub phone_number: Option<String>,
    pub status: ConnectionStatus,
    pub ready_to_send: bool,
    pub protection: ProtectionState,
    pub limiter: RateLimiter,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub connected_since: Option<Instant>,
    pub next_reconnect_at: Option<Instant>,
    pub qr_code: Option<String>,
}

impl InstanceState {
    pub fn new(
        id: &str,
        name: &str,
        phone_number: Option<String>,
        limits: &RateLimitConfig,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            phone_number,
            status: ConnectionStatus::Disconnected,
            ready_to_send: false,
            protection: ProtectionState::default(),
            limiter: RateLimiter::new(limits, Instant::now()),
            last_activity_at: None,
            connected_since: None,
            next_reconnect_at: None,
            qr_code: None,
        }
    }

    pub fn status_at(&self, now: Instant) -> InstanceStatus {
        let p = &self.protection;
        let cooldown = p.cooldown_remaining(now);
        InstanceStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            phone_number: self.phone_number.clone(),
            ready_to_send: self.ready_to_send,
            degraded: p.degraded,
            in_cooldown: cooldown.is_some(),
            cooldown_remaining: cooldown.map_or(0, ceil_secs),
            throughput: self.limiter.counters(now),
            session_healthy: p.session_healthy,
            consecutive_failures: p.consecutive_failures,
            reconnect_attempts: p.reconnect_attempts,
            reconnect_in_ms: self
                .next_reconnect_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            uptime_secs: self
                .connected_since
                .map_or(0, |since| now.saturating_duration_since(since).as_secs()),
            last_activity_at: self.last_activity_at,
            qr_code: self.qr_code.clone(),
        }
    }
}

/// Read-only status snapshot returned by `get_status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub id: String,
    pub name: String,
    pub status: ConnectionStatus,
    pub phone_number: Option<String>,
    pub ready_to_send: bool,
    pub degraded: bool,
    pub in_cooldown: bool,
    /// Seconds until the cooldown ends; zero when not cooling down.
    pub cooldown_remaining: u64,
    #[serde(flatten)]
    pub throughput: ThroughputCounters,
    pub session_healthy: bool,
    pub consecutive_failures: u32,
    pub reconnect_attempts: u32,
    pub reconnect_in_ms: Option<u64>,
    pub uptime_secs: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
}

/// Compact listing entry for `get_all_instances`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub id: String,
    pub name: String,
    pub status: ConnectionStatus,
    pub phone_number: Option<String>,
    pub ready_to_send: bool,
    pub degraded: bool,
    pub in_cooldown: bool,
    pub created_at: String,
}
