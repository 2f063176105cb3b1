//! Per-instance safeguards against ban-triggering traffic patterns.

pub mod backoff;
pub mod dedup;
pub mod health;
pub mod rate_limit;

pub use backoff::BackoffScheduler;
pub use dedup::{dedup_key, InboundDedup};
pub use health::{FailureOutcome, HealthMonitor};
pub use rate_limit::{RateLimitRejection, RateLimiter, ThroughputCounters};
