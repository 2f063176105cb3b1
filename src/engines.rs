use async_trait::async_trait;
use serde::Serialize;

use crate::config::EnginesConfig;

/// What the engines receive for each qualifying inbound message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnginePayload {
    pub from: String,
    pub message: String,
    pub instance_id: String,
    pub message_id: Option<String>,
    pub timestamp: i64,
}

/// Receives deduplicated inbound private messages.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, payload: EnginePayload);
}

/// Drops everything. Used when no engine is configured.
pub struct NoopInboundHandler;

#[async_trait]
impl InboundHandler for NoopInboundHandler {
    async fn handle(&self, _payload: EnginePayload) {}
}

/// Forwards to the primary engine (chatbot), then to the fallback engine
/// (flow builder) when the primary did not handle the message.
pub struct EngineForwarder {
    primary_url: Option<String>,
    fallback_url: Option<String>,
    client: reqwest::Client,
}

impl EngineForwarder {
    pub fn new(config: &EnginesConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            primary_url: config.primary_url.clone(),
            fallback_url: config.fallback_url.clone(),
            client,
        })
    }

    /// POST to one engine. `Ok(true)` when it reports the message handled.
    async fn post(&self, url: &str, payload: &EnginePayload) -> anyhow::Result<bool> {
        let resp = self.client.post(url).json(payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("engine returned {status}: {body}");
        }
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        Ok(body["handled"].as_bool().unwrap_or(false))
    }
}

#[async_trait]
impl InboundHandler for EngineForwarder {
    async fn handle(&self, payload: EnginePayload) {
        if let Some(url) = &self.primary_url {
            match self.post(url, &payload).await {
                Ok(true) => {
                    tracing::debug!(
                        "{}: message from {} handled by primary engine",
                        payload.instance_id,
                        payload.from
                    );
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("{}: primary engine call failed: {e:#}", payload.instance_id);
                }
            }
        }

        if let Some(url) = &self.fallback_url {
            match self.post(url, &payload).await {
                Ok(handled) => tracing::debug!(
                    "{}: fallback engine answered (handled={handled})",
                    payload.instance_id
                ),
                Err(e) => {
                    tracing::warn!("{}: fallback engine call failed: {e:#}", payload.instance_id);
                }
            }
        }
    }
}
