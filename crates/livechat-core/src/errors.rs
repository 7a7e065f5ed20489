use std::time::Duration;

/// Failures of the realtime connection handshake.
/// Classifies errors as fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConnectionError {
    // Fatal, never retried
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("widget disabled by server")]
    WidgetDisabled,

    // Retryable
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("connection reset")]
    Reset,
}

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServerError { .. } | Self::NetworkError(_) | Self::Timeout(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::InvalidResponse(_) | Self::WidgetDisabled
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidResponse(_) => "invalid_response",
            Self::WidgetDisabled => "widget_disabled",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::Reset => "reset",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidResponse(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Failure of a subsystem lifecycle call (init, reset, evaluate).
#[derive(Clone, Debug, thiserror::Error)]
pub enum SubsystemError {
    #[error("{subsystem}: connection failed: {source}")]
    Connection {
        subsystem: &'static str,
        #[source]
        source: ConnectionError,
    },

    #[error("{subsystem} is not initialized")]
    NotInitialized { subsystem: &'static str },

    #[error("{subsystem}: invalid configuration: {message}")]
    InvalidConfig { subsystem: &'static str, message: String },

    #[error("{subsystem}: {message}")]
    Failed { subsystem: &'static str, message: String },
}

impl SubsystemError {
    pub fn subsystem(&self) -> &'static str {
        match self {
            Self::Connection { subsystem, .. }
            | Self::NotInitialized { subsystem }
            | Self::InvalidConfig { subsystem, .. }
            | Self::Failed { subsystem, .. } => subsystem,
        }
    }

    pub fn failed(subsystem: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            subsystem,
            message: message.into(),
        }
    }
}

/// Failure delivering a command to the host frame. Always swallowed by the bridge.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("no host frame attached")]
    NoHost,
    #[error("host channel closed")]
    ChannelClosed,
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}
