use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::RateLimitWindow;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// A send rejected by the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRejection {
    pub window: RateLimitWindow,
    pub retry_after: Duration,
}

impl RateLimitRejection {
    /// Whole seconds, never zero, for `retryAfter` hints.
    pub fn retry_after_secs(&self) -> u64 {
        ceil_secs(self.retry_after)
    }
}

pub(crate) fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

/// One fixed window: a counter valid until `resets_at`.
#[derive(Debug, Clone)]
struct Window {
    length: Duration,
    limit: u32,
    count: u32,
    resets_at: Instant,
}

impl Window {
    fn new(length: Duration, limit: u32, now: Instant) -> Self {
        Self {
            length,
            limit,
            count: 0,
            resets_at: now + length,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now >= self.resets_at {
            self.count = 0;
            self.resets_at = now + self.length;
        }
    }

    /// Count as seen at `now`; an elapsed window reads as zero.
    fn current(&self, now: Instant) -> u32 {
        if now >= self.resets_at {
            0
        } else {
            self.count
        }
    }
}

/// Snapshot of the three send counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputCounters {
    pub messages_this_minute: u32,
    pub messages_this_hour: u32,
    pub messages_today: u32,
}

/// Per-instance outbound limiter: minute/hour/day fixed windows, a minimum
/// spacing between sends, and a short cooldown armed by the minute ceiling.
///
/// Every gate must pass. When several fail at once the reported window follows
/// the order cooldown, minute, hour, day, interval.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    minute: Window,
    hour: Window,
    day: Window,
    min_interval: Duration,
    minute_cooldown: Duration,
    last_message_at: Option<Instant>,
    limited_until: Option<Instant>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            minute: Window::new(MINUTE, config.per_minute, now),
            hour: Window::new(HOUR, config.per_hour, now),
            day: Window::new(DAY, config.per_day, now),
            min_interval: Duration::from_millis(config.min_interval_ms),
            minute_cooldown: Duration::from_secs(config.minute_cooldown_secs),
            last_message_at: None,
            limited_until: None,
        }
    }

    /// Decide whether a send may go out at `now`. Does not count the send.
    pub fn check(&mut self, now: Instant) -> Result<(), RateLimitRejection> {
        if let Some(until) = self.limited_until {
            if now < until {
                return Err(RateLimitRejection {
                    window: RateLimitWindow::Minute,
                    retry_after: until - now,
                });
            }
            self.limited_until = None;
        }

        self.minute.roll(now);
        self.hour.roll(now);
        self.day.roll(now);

        if self.minute.count >= self.minute.limit {
            let until = now + self.minute_cooldown;
            self.limited_until = Some(until);
            return Err(RateLimitRejection {
                window: RateLimitWindow::Minute,
                retry_after: self.minute_cooldown.max(self.minute.resets_at - now),
            });
        }
        for (window, kind) in [(&self.hour, RateLimitWindow::Hour), (&self.day, RateLimitWindow::Day)] {
            if window.count >= window.limit {
                return Err(RateLimitRejection {
                    window: kind,
                    retry_after: window.resets_at - now,
                });
            }
        }

        if let Some(last) = self.last_message_at {
            let since = now.saturating_duration_since(last);
            if since < self.min_interval {
                return Err(RateLimitRejection {
                    window: RateLimitWindow::Interval,
                    retry_after: self.min_interval - since,
                });
            }
        }

        Ok(())
    }

    /// Count one successful send at `now`.
    pub fn record(&mut self, now: Instant) {
        self.minute.roll(now);
        self.hour.roll(now);
        self.day.roll(now);
        self.minute.count += 1;
        self.hour.count += 1;
        self.day.count += 1;
        self.last_message_at = Some(now);
    }

    pub fn counters(&self, now: Instant) -> ThroughputCounters {
        ThroughputCounters {
            messages_this_minute: self.minute.current(now),
            messages_this_hour: self.hour.current(now),
            messages_today: self.day.current(now),
        }
    }
}
