use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::DedupConfig;

/// Dedup key for an inbound message.
///
/// Prefers the transport's message id; without one, hashes the sender, text and
/// timestamp so redelivery of the same event still collapses.
pub fn dedup_key(message_id: Option<&str>, remote_id: &str, content: &str, timestamp: i64) -> String {
    match message_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            let mut hasher = Sha256::new();
            hasher.update(remote_id.as_bytes());
            hasher.update(b"|");
            hasher.update(content.as_bytes());
            hasher.update(b"|");
            hasher.update(timestamp.to_string().as_bytes());
            format!("h:{}", hex::encode(hasher.finalize()))
        }
    }
}

/// Bounded, TTL-limited seen-set for inbound events of one instance.
///
/// Insertion order equals age order, so both TTL expiry and the size cap pop
/// from the front.
pub struct InboundDedup {
    ttl: Duration,
    max_entries: usize,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl InboundDedup {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_secs),
            max_entries: config.max_entries.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `true` if `key` was already seen and is unexpired; otherwise
    /// records it and returns `false`.
    pub fn check(&mut self, key: &str, now: Instant) -> bool {
        self.purge_expired(now);
        if self.seen.contains_key(key) {
            return true;
        }
        self.seen.insert(key.to_string(), now);
        self.order.push_back((key.to_string(), now));
        while self.seen.len() > self.max_entries {
            match self.order.pop_front() {
                Some((old, _)) => {
                    self.seen.remove(&old);
                }
                None => break,
            }
        }
        false
    }

    fn purge_expired(&mut self, now: Instant) {
        while let Some((_, seen_at)) = self.order.front() {
            if now.saturating_duration_since(*seen_at) < self.ttl {
                break;
            }
            if let Some((old, _)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.len()
    }
}
