use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectConfig;

/// Exponent cap: beyond this the delay is pinned by `max_delay` anyway.
const MAX_EXPONENT: u32 = 8;

/// Reconnect delay and cooldown policy.
///
/// `delay(n)` grows as `base * factor^(n-1)` for the n-th consecutive failure,
/// capped at `max_delay`, then jittered by +/- `jitter_factor` of itself and
/// clamped back into `[base, max]`.
#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    base: Duration,
    max: Duration,
    factor: f64,
    jitter_factor: f64,
    max_attempts: u32,
    cooldown: Duration,
}

impl BackoffScheduler {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base: config.base_delay(),
            max: config.max_delay(),
            factor: config.factor,
            jitter_factor: config.jitter_factor,
            max_attempts: config.max_attempts,
            cooldown: config.cooldown(),
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based failure count).
    pub fn delay(&self, attempt: u32) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with_jitter(attempt, unit)
    }

    /// Un-jittered exponential value for `attempt`.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        let millis = self.base.as_millis() as f64 * self.factor.powi(exponent as i32);
        Duration::from_millis(millis as u64).min(self.max)
    }

    /// `unit` in `[-1, 1]` selects where in the jitter band the delay lands.
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let nominal = self.nominal(attempt).as_millis() as f64;
        let jittered = nominal + nominal * self.jitter_factor * unit.clamp(-1.0, 1.0);
        let millis = jittered.max(self.base.as_millis() as f64);
        Duration::from_millis(millis as u64).clamp(self.base, self.max.max(self.base))
    }

    /// True once `attempts` consecutive failures should trip the cooldown.
    pub fn should_cool_down(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    #[cfg(test)]
    fn base(&self) -> Duration {
        self.base
    }
}
