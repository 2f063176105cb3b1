use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Per-instance counters, labeled by `instance`.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub messages_sent: IntCounterVec,
    pub send_failures: IntCounterVec,
    pub rate_limited: IntCounterVec,
    pub inbound_duplicates: IntCounterVec,
    pub reconnects_scheduled: IntCounterVec,
    pub cooldowns_entered: IntCounterVec,
    pub degradations: IntCounterVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> anyhow::Result<IntCounterVec> {
    let vec = IntCounterVec::new(Opts::new(name, help).namespace("wafleet"), &["instance"])?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            messages_sent: counter(&registry, "messages_sent_total", "Messages accepted by the transport")?,
            send_failures: counter(&registry, "send_failures_total", "Sends rejected by the transport")?,
            rate_limited: counter(&registry, "rate_limited_total", "Sends refused by the rate limiter")?,
            inbound_duplicates: counter(&registry, "inbound_duplicates_total", "Inbound events dropped as duplicates")?,
            reconnects_scheduled: counter(&registry, "reconnects_scheduled_total", "Backoff reconnects scheduled")?,
            cooldowns_entered: counter(&registry, "cooldowns_entered_total", "Reconnect cooldowns entered")?,
            degradations: counter(&registry, "degradations_total", "Times an instance was marked degraded")?,
            registry,
        })
    }

    pub fn inc(vec: &IntCounterVec, instance_id: &str) {
        vec.with_label_values(&[instance_id]).inc();
    }

    /// Drop every series for a deleted instance.
    pub fn forget(&self, instance_id: &str) {
        for vec in [
            &self.messages_sent,
            &self.send_failures,
            &self.rate_limited,
            &self.inbound_duplicates,
            &self.reconnects_scheduled,
            &self.cooldowns_entered,
            &self.degradations,
        ] {
            let _ = vec.remove_label_values(&[instance_id]);
        }
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("failed to encode metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

/// Install the fmt subscriber used by the binary.
pub fn init_logging(level: &str) {
    let level = level.parse().unwrap_or(tracing::Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_labeled_series() {
        let metrics = Metrics::new().unwrap();
        Metrics::inc(&metrics.messages_sent, "i1");
        Metrics::inc(&metrics.messages_sent, "i1");
        let text = metrics.render();
        assert!(text.contains("wafleet_messages_sent_total{instance=\"i1\"} 2"));
    }

    #[test]
    fn forget_removes_instance_series() {
        let metrics = Metrics::new().unwrap();
        Metrics::inc(&metrics.degradations, "gone");
        metrics.forget("gone");
        assert!(!metrics.render().contains("instance=\"gone\""));
    }
}
