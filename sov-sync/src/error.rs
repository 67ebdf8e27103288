//! Error types.
//!
//! Transport failures and protocol anomalies are recovered inside the
//! connection driver and the reducers; only REST outcomes and configuration
//! problems reach callers as errors.

use std::time::Duration;

use thiserror::Error;

/// Outcome of a REST call that did not succeed.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No bearer token is available.
    #[error("not authenticated")]
    Unauthenticated,

    /// 403: the caller is not allowed (e.g. not a member of the session).
    #[error("forbidden")]
    Forbidden,

    /// 410: the session has ended.
    #[error("session has ended")]
    Ended,

    /// 404: no such resource.
    #[error("not found")]
    NotFound,

    /// 400: rejected input (e.g. an invalid join code).
    #[error("invalid input")]
    InvalidInput,

    /// 409: the resource already exists (e.g. a duplicate attachment).
    #[error("duplicate")]
    Duplicate,

    /// Join code without a usable shape.
    #[error("invalid join code: {0:?}")]
    InvalidCode(String),

    /// The operation needs an open session.
    #[error("no session is open")]
    NotOpen,

    /// Any other non-success status.
    #[error("unexpected status {0}")]
    Status(u16),

    /// Network or body decoding failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ApiError {
    /// Failures after which the caller should navigate away instead of retrying.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApiError::Unauthenticated
                | ApiError::Forbidden
                | ApiError::Ended
                | ApiError::NotFound
        )
    }

    /// Failures worth a short-interval retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Http(_) => true,
            ApiError::Status(code) => *code >= 500 || *code == 408 || *code == 429,
            _ => false,
        }
    }
}

/// Invalid client configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid base url {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("invalid value for {0}: {1}")]
    InvalidEnv(&'static str, &'static str),
}

/// Socket-level failure. Never surfaced to message handlers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure to encode an outbound message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
