use serde::{Deserialize, Serialize};

/// Errors delivered to readiness waiters, request callbacks and bus callers.
///
/// The first three variants are the broker's core taxonomy: `Invalidated`
/// kills the object, `Transport` kills one attempt, `Application` kills one
/// request. The rest describe local misuse or unfinished surface.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum BrokerError {
    #[error("object invalidated: {reason}")]
    Invalidated { reason: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("{name}: {message}")]
    Application { name: String, message: String },

    #[error("not implemented: {method}")]
    NotImplemented { method: String },

    #[error("not found: {resource}")]
    NotFound { resource: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("timeout: {operation}")]
    Timeout { operation: String },
}

impl BrokerError {
    /// Returns `true` for transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::Transport { .. }
        )
    }

    /// Returns `true` if no further operation on the same object can succeed.
    pub fn is_terminal_for_object(&self) -> bool {
        matches!(self, Self::Invalidated { .. })
    }

    pub fn not_implemented(method: impl Into<String>) -> Self {
        Self::NotImplemented {
            method: method.into(),
        }
    }

    pub fn invalidated(reason: impl Into<String>) -> Self {
        Self::Invalidated {
            reason: reason.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn application(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Application {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }
}
