use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An inbound message as reported by the transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Transport message id, when the network provides one.
    pub id: Option<String>,
    /// Remote JID, e.g. `5511999999999@s.whatsapp.net` or `...@g.us` for groups.
    pub remote_jid: String,
    pub from_me: bool,
    /// Extracted text; `None` for media-only or protocol messages.
    pub text: Option<String>,
    /// Unix seconds.
    pub timestamp: i64,
}

impl InboundMessage {
    pub fn is_group(&self) -> bool {
        self.remote_jid.ends_with("@g.us")
    }

    /// Private message with text we should hand to the engines.
    pub fn is_forwardable(&self) -> bool {
        !self.from_me
            && !self.is_group()
            && !self.remote_jid.ends_with("@broadcast")
            && self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

/// Why a transport connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The account was logged out; credentials are no longer valid.
    LoggedOut,
    /// Anything else: network loss, server restart, stream error.
    Other { code: Option<u16>, detail: String },
}

impl CloseReason {
    pub fn is_logout(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoggedOut => write!(f, "logged out"),
            Self::Other {
                code: Some(code),
                detail,
            } => write!(f, "{detail} (code {code})"),
            Self::Other { code: None, detail } => write!(f, "{detail}"),
        }
    }
}

/// Typed events emitted by a live transport, consumed by the controller task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A fresh credential challenge (QR) to be scanned.
    Qr(String),
    /// Session authenticated and usable.
    Open { phone_number: Option<String> },
    Closed(CloseReason),
    Message(InboundMessage),
}

/// A live connection to the messaging network for one account.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a text message; returns the network message id.
    async fn send_text(&self, to: &str, content: &str) -> anyhow::Result<String>;

    /// Cheap liveness check against the network.
    async fn probe(&self) -> anyhow::Result<()>;

    /// Low-risk operation performed once after connecting (e.g. presence).
    async fn warmup(&self) -> anyhow::Result<()>;

    /// Log the account out, invalidating its credentials.
    async fn logout(&self) -> anyhow::Result<()>;

    /// Close the connection without logging out.
    async fn close(&self);
}

/// Opens transports. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection for `instance_id` using credentials under `session_dir`.
    /// Events for this connection arrive on the returned receiver; it ends when
    /// the connection is gone.
    async fn open(
        &self,
        instance_id: &str,
        session_dir: &Path,
    ) -> anyhow::Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)>;
}
