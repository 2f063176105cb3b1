use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_MULTIPLIER: f64 = 100.0;

/// Top-level daemon configuration, loaded from TOML.
///
/// Every section falls back to its defaults, so an empty file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for `registry.db` and `sessions/<instance_id>/`. `~` is expanded.
    pub data_dir: String,
    pub server: ServerConfig,
    pub bridge: BridgeConfig,
    pub reconnect: ReconnectConfig,
    pub rate_limit: RateLimitConfig,
    pub health: HealthConfig,
    pub heartbeat: HeartbeatConfig,
    pub dedup: DedupConfig,
    pub send: SendConfig,
    pub engines: EnginesConfig,
    pub backup: BackupConfig,
    pub startup: StartupConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server: ServerConfig::default(),
            bridge: BridgeConfig::default(),
            reconnect: ReconnectConfig::default(),
            rate_limit: RateLimitConfig::default(),
            health: HealthConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            dedup: DedupConfig::default(),
            send: SendConfig::default(),
            engines: EnginesConfig::default(),
            backup: BackupConfig::default(),
            startup: StartupConfig::default(),
        }
    }
}

fn default_data_dir() -> String {
    directories::ProjectDirs::from("io", "wafleet", "wafleet")
        .map(|dirs| dirs.data_dir().to_string_lossy().into_owned())
        .unwrap_or_else(|| "~/.wafleet".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:18900".into(),
            request_timeout_secs: 30,
        }
    }
}

/// Where the protocol sidecar listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub url: String,
    pub command_timeout_secs: u64,
    /// Upper bound on one connection attempt; a stalled open counts as a
    /// failed attempt once it elapses.
    pub connect_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18901".into(),
            command_timeout_secs: 20,
            connect_timeout_secs: 30,
        }
    }
}

impl BridgeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay used as +/- jitter.
    pub jitter_factor: f64,
    /// Consecutive non-logout closures before cooldown.
    pub max_attempts: u32,
    pub cooldown_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            factor: 2.0,
            max_delay_ms: 300_000,
            jitter_factor: 0.3,
            max_attempts: 5,
            cooldown_secs: 30 * 60,
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
    pub min_interval_ms: u64,
    /// Cooldown armed when the per-minute ceiling is hit.
    pub minute_cooldown_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 8,
            per_hour: 200,
            per_day: 1_000,
            min_interval_ms: 3_000,
            minute_cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub degradation_threshold: u32,
    pub recovery_secs: u64,
    pub silent_pause_enabled: bool,
    pub silent_pause_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            probe_timeout_secs: 10,
            degradation_threshold: 3,
            recovery_secs: 600,
            silent_pause_enabled: false,
            silent_pause_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Endpoint receiving heartbeats. Heartbeats are disabled when unset.
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub base_secs: u64,
    pub jitter_max_secs: u64,
    pub degraded_factor: f64,
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            base_secs: 60,
            jitter_max_secs: 30,
            degraded_factor: 2.0,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    /// Delay after `open` before the warmup operation runs.
    pub stabilization_ms: u64,
    pub stabilization_jitter_ms: u64,
    /// Pacing applied to sends while degraded, multiplied by `degraded_multiplier`.
    pub degraded_pacing_ms: u64,
    pub degraded_multiplier: f64,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            stabilization_ms: 5_000,
            stabilization_jitter_ms: 3_000,
            degraded_pacing_ms: 1_500,
            degraded_multiplier: 3.0,
        }
    }
}

impl SendConfig {
    pub fn degraded_delay(&self) -> Duration {
        Duration::from_millis(self.degraded_pacing_ms).mul_f64(self.degraded_multiplier.max(0.0))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginesConfig {
    pub primary_url: Option<String>,
    pub fallback_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl EnginesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(15))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Base URL of the backup storage service. Backups are disabled when unset.
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub auto_reconnect: bool,
    pub restore_missing_sessions: bool,
    pub stagger_min_ms: u64,
    pub stagger_max_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            restore_missing_sessions: true,
            stagger_min_ms: 1_000,
            stagger_max_ms: 5_000,
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            toml::from_str::<Config>(&raw)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            tracing::debug!("config file {} not found, using defaults", path.display());
            Config::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment wins over the file for a few deployment-specific values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("WAFLEET_DATA_DIR") {
            self.data_dir = dir;
        }
        if let Ok(url) = std::env::var("WAFLEET_HEARTBEAT_URL") {
            self.heartbeat.url = Some(url);
        }
        if let Ok(url) = std::env::var("WAFLEET_BRIDGE_URL") {
            self.bridge.url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.reconnect;
        if !(0.0..1.0).contains(&r.jitter_factor) {
            anyhow::bail!("reconnect.jitter_factor must be in [0, 1), got {}", r.jitter_factor);
        }
        check_multiplier("reconnect.factor", r.factor, 1.0)?;
        if r.max_attempts == 0 {
            anyhow::bail!("reconnect.max_attempts must be at least 1");
        }
        if r.max_delay_ms < r.base_delay_ms {
            anyhow::bail!(
                "reconnect.max_delay_ms ({}) is below base_delay_ms ({})",
                r.max_delay_ms,
                r.base_delay_ms
            );
        }
        let l = &self.rate_limit;
        if l.per_minute == 0 || l.per_hour == 0 || l.per_day == 0 {
            anyhow::bail!("rate_limit ceilings must all be non-zero");
        }
        check_multiplier("send.degraded_multiplier", self.send.degraded_multiplier, 0.0)?;
        check_multiplier("heartbeat.degraded_factor", self.heartbeat.degraded_factor, 1.0)?;
        if self.health.degradation_threshold == 0 {
            anyhow::bail!("health.degradation_threshold must be at least 1");
        }
        if self.dedup.max_entries == 0 {
            anyhow::bail!("dedup.max_entries must be at least 1");
        }
        if self.startup.stagger_max_ms < self.startup.stagger_min_ms {
            anyhow::bail!("startup.stagger_max_ms is below stagger_min_ms");
        }
        Ok(())
    }

    /// `data_dir` with `~` and env vars expanded.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::full(&self.data_dir).map_or_else(
            |_| self.data_dir.clone(),
            |expanded| expanded.into_owned(),
        ))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir().join("registry.db")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir().join("sessions")
    }
}

/// Multipliers scale durations, so they must be finite and bounded.
fn check_multiplier(name: &str, value: f64, min: f64) -> Result<()> {
    if !value.is_finite() || value < min || value > MAX_MULTIPLIER {
        anyhow::bail!("{name} must be between {min} and {MAX_MULTIPLIER}, got {value}");
    }
    Ok(())
}
