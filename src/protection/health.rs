use std::time::Duration;
use tokio::time::Instant;

use crate::config::HealthConfig;
use crate::instance::ProtectionState;

/// What a recorded failure did to the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Counted, still below the threshold or already degraded.
    Counted,
    /// This failure crossed the threshold; the instance is now degraded.
    Degraded,
}

/// Degradation policy applied to probe and send results.
///
/// The probe schedule itself belongs to the controller task; this type only
/// decides what a result means for [`ProtectionState`].
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    interval: Duration,
    probe_timeout: Duration,
    threshold: u32,
    recovery: Duration,
    silent_pause: Option<Duration>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            threshold: config.degradation_threshold.max(1),
            recovery: Duration::from_secs(config.recovery_secs),
            silent_pause: config
                .silent_pause_enabled
                .then(|| Duration::from_secs(config.silent_pause_secs)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// A probe succeeded.
    pub fn record_probe_success(&self, p: &mut ProtectionState) {
        p.session_healthy = true;
        p.consecutive_failures = 0;
    }

    /// A send succeeded: clears degradation immediately.
    pub fn record_send_success(&self, p: &mut ProtectionState) {
        p.consecutive_failures = 0;
        p.session_healthy = true;
        p.degraded = false;
        p.degradation_detected_at = None;
    }

    /// A probe failed.
    pub fn record_probe_failure(&self, p: &mut ProtectionState, now: Instant) -> FailureOutcome {
        p.consecutive_failures = p.consecutive_failures.saturating_add(1);
        p.session_healthy = false;
        self.evaluate(p, now)
    }

    /// Re-evaluate after any counted failure (send error, transport closure).
    pub fn evaluate(&self, p: &mut ProtectionState, now: Instant) -> FailureOutcome {
        if p.consecutive_failures < self.threshold || p.degraded {
            return FailureOutcome::Counted;
        }
        p.degraded = true;
        p.degradation_detected_at = Some(now);
        if let Some(pause) = self.silent_pause {
            p.silent_pause_until = Some(now + pause);
        }
        FailureOutcome::Degraded
    }

    /// When the current degradation will auto-clear.
    pub fn recovery_deadline(&self, p: &ProtectionState) -> Option<Instant> {
        if !p.degraded {
            return None;
        }
        p.degradation_detected_at.map(|at| at + self.recovery)
    }

    /// Clear degradation if it has outlived the recovery window. Returns `true`
    /// when it was cleared.
    pub fn maybe_recover(&self, p: &mut ProtectionState, now: Instant) -> bool {
        match self.recovery_deadline(p) {
            Some(deadline) if now >= deadline => {
                p.degraded = false;
                p.degradation_detected_at = None;
                true
            }
            _ => false,
        }
    }
}
