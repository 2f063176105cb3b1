use std::fmt;

/// Which rate-limit gate rejected a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitWindow {
    Minute,
    Hour,
    Day,
    Interval,
}

impl RateLimitWindow {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Interval => "interval",
        }
    }
}

impl fmt::Display for RateLimitWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the instance manager and its controllers.
///
/// Callers on the control plane never see a panic or a raw transport error:
/// every failure is translated into one of these variants.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("instance '{0}' not found")]
    NotFound(String),

    #[error("instance '{0}' already exists")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("instance is in reconnect cooldown for another {remaining_secs}s")]
    InCooldown { remaining_secs: u64 },

    #[error("rate limited ({window}), retry after {retry_after_secs}s")]
    RateLimited {
        window: RateLimitWindow,
        retry_after_secs: u64,
    },

    #[error("sending paused after degradation, retry after {retry_after_secs}s")]
    SilentPause { retry_after_secs: u64 },

    #[error("instance is not ready to send")]
    NotReady,

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("backup checksum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("no backup available for instance '{0}'")]
    NoBackupAvailable(String),

    #[error("no local session data for instance '{0}'")]
    NoSessionData(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ManagerError {
    /// Seconds the caller should wait before retrying, when the error carries a hint.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::InCooldown { remaining_secs } => Some(*remaining_secs),
            Self::RateLimited {
                retry_after_secs, ..
            }
            | Self::SilentPause { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Short machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidInput(_) => "invalid_input",
            Self::Conflict(_) => "conflict",
            Self::InCooldown { .. } => "in_cooldown",
            Self::RateLimited { .. } => "rate_limited",
            Self::SilentPause { .. } => "silent_pause",
            Self::NotReady => "not_ready",
            Self::TransportError(_) => "transport_error",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::NoBackupAvailable(_) => "no_backup_available",
            Self::NoSessionData(_) => "no_session_data",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal",
        }
    }

    pub(crate) fn transport(err: &anyhow::Error) -> Self {
        Self::TransportError(format!("{err:#}"))
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;
