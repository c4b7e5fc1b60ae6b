//! Error handling for the router
//!
//! This module defines the error taxonomy shared by the routing pipeline,
//! the state backends and the provider adapters.

use serde::Serialize;
use thiserror::Error;

use crate::providers::ProviderError;

/// Result type alias for the router
pub type Result<T> = std::result::Result<T, RouterError>;

/// Classification of a failed provider attempt.
///
/// The fallback loop uses the kind to decide whether to advance to the
/// next candidate (retriable) or surface the error immediately
/// (non-retriable). The kind is also carried in [`RouteEvent`]s and in
/// the per-candidate attempt list of [`RouterError::AllProvidersFailed`].
///
/// [`RouteEvent`]: crate::core::types::RouteEvent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Provider returned a 429 or equivalent quota rejection
    RateLimited,
    /// Request exceeded the client-side or budget deadline
    Timeout,
    /// Transient network failure (connect reset, DNS, broken stream)
    Transient,
    /// Provider-side 5xx
    ServerError,
    /// Request rejected as malformed
    BadRequest,
    /// Invalid or missing credentials
    AuthError,
    /// Request is larger than the provider can accept
    TokenLimitExceeded,
    /// Circuit breaker is open; consumed by the fallback loop
    CircuitOpen,
    /// Usage could not be fetched from the state backend
    StateBackendUnavailable,
}

impl ErrorKind {
    /// Whether the fallback loop should try the next candidate.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::Timeout
                | ErrorKind::Transient
                | ErrorKind::ServerError
        )
    }

    /// Stable snake_case label, as emitted in route events.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transient => "transient",
            ErrorKind::ServerError => "server_error",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::TokenLimitExceeded => "token_limit_exceeded",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::StateBackendUnavailable => "state_backend_unavailable",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the per-candidate error list carried by
/// [`RouterError::AllProvidersFailed`], in attempt order.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderAttempt {
    /// Provider that was tried
    pub provider: String,
    /// Classified failure kind
    pub kind: ErrorKind,
    /// Human-readable failure message
    pub message: String,
}

impl ProviderAttempt {
    pub(crate) fn from_error(err: &ProviderError) -> Self {
        Self {
            provider: err.provider().to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Errors surfaced by the state backends.
#[derive(Error, Debug)]
pub enum StateError {
    /// Shared store (Redis) operation failed
    #[error("shared store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Backend cannot serve the request for a non-store reason
    #[error("state backend unavailable: {0}")]
    Unavailable(String),
}

/// Main error type for the router
#[derive(Error, Debug)]
pub enum RouterError {
    /// The registry is empty at call time
    #[error("no providers are registered; register providers via the config or register()")]
    NoProvidersConfigured,

    /// Internal: the circuit for this provider is open. The fallback
    /// loop consumes this error; it is never surfaced to callers.
    #[error("circuit breaker is open for provider '{0}'")]
    CircuitOpen(String),

    /// A provider rejected the request with a non-retriable error
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Every candidate was tried and failed. An empty attempt list means
    /// no provider was eligible for this request at all.
    #[error("all providers failed ({} attempted)", attempts.len())]
    AllProvidersFailed {
        /// Per-candidate failures, in the order they were attempted
        attempts: Vec<ProviderAttempt>,
    },

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// State backend errors
    #[error(transparent)]
    State(#[from] StateError),

    /// IO errors (config file loading)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RouterError {
    /// Classified kind of this error, if it corresponds to an attempt
    /// classification.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RouterError::Provider(e) => Some(e.kind()),
            RouterError::CircuitOpen(_) => Some(ErrorKind::CircuitOpen),
            RouterError::State(_) => Some(ErrorKind::StateBackendUnavailable),
            _ => None,
        }
    }
}
