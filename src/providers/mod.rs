//! Provider adapters
//!
//! An adapter wraps a backend HTTP API behind a uniform capability set so
//! the router never speaks a vendor wire protocol itself. Adapters
//! translate backend-specific failures into [`ProviderError`] and never
//! retry internally; retries belong to the router's fallback loop.

mod anthropic;
mod openai;
mod registry;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAIProvider;
pub use registry::ProviderRegistry;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::core::types::Message;
use crate::error::ErrorKind;

/// Passthrough options forwarded verbatim to the adapter's request body.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Result of a successful non-streaming chat call.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    /// Completion text
    pub content: String,
    /// Prompt tokens consumed
    pub input_tokens: u64,
    /// Completion tokens produced
    pub output_tokens: u64,
}

/// One element of an adapter stream.
///
/// A well-behaved stream yields zero or more `Delta` fragments followed
/// by a single `Done` carrying the actual token counts. Streams are
/// finite and not restartable.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A fragment of completion text
    Delta(String),
    /// Completion signal with the actual token usage
    Done {
        /// Prompt tokens consumed
        input_tokens: u64,
        /// Completion tokens produced
        output_tokens: u64,
    },
}

/// Lazy sequence of stream chunks produced by an adapter.
pub type ChatStream = Pin<Box<dyn Stream<Item = std::result::Result<StreamChunk, ProviderError>> + Send>>;

/// Contract every provider adapter implements.
///
/// The quota attributes are read-only after construction; the router
/// reads them on every scoring pass.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique identifier, e.g. "openai"
    fn name(&self) -> &str;

    /// Model string, e.g. "gpt-4o"
    fn model(&self) -> &str;

    /// Max requests per minute for this provider key
    fn rpm_limit(&self) -> u32;

    /// Max tokens per minute for this provider key
    fn tpm_limit(&self) -> u64;

    /// Static preference weight (0.0–1.0)
    fn weight(&self) -> f64;

    /// Whether this provider participates in routing
    fn enabled(&self) -> bool {
        true
    }

    /// Send a non-streaming chat request.
    async fn chat(
        &self,
        messages: &[Message],
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        options: &JsonMap,
    ) -> std::result::Result<ChatCompletion, ProviderError>;

    /// Open a streaming chat request.
    ///
    /// Errors returned here (before any chunk is produced) allow the
    /// router to fall back to another provider; errors yielded by the
    /// stream itself surface to the caller as-is.
    async fn stream(
        &self,
        messages: &[Message],
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        options: &JsonMap,
    ) -> std::result::Result<ChatStream, ProviderError>;

    /// Release underlying connections.
    async fn close(&self) {}
}

/// Errors produced by provider adapters, classified into the router's
/// taxonomy via [`ProviderError::kind`].
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("rate limit exceeded for {provider}: {message}")]
    RateLimited {
        provider: String,
        message: String,
        /// Seconds the provider asked us to back off, when advertised
        retry_after: Option<u64>,
    },

    #[error("timeout for {provider}: {message}")]
    Timeout { provider: String, message: String },

    #[error("network error for {provider}: {message}")]
    Network { provider: String, message: String },

    #[error("server error for {provider} (status {status}): {message}")]
    Server {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("bad request for {provider}: {message}")]
    BadRequest { provider: String, message: String },

    #[error("authentication failed for {provider}: {message}")]
    Auth { provider: String, message: String },

    #[error("token limit exceeded for {provider}: {message}")]
    TokenLimitExceeded { provider: String, message: String },

    #[error("stream error for {provider}: {message}")]
    Stream { provider: String, message: String },
}

impl ProviderError {
    pub fn rate_limited(provider: &str, message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self::RateLimited {
            provider: provider.to_string(),
            message: message.into(),
            retry_after,
        }
    }

    pub fn timeout(provider: &str, message: impl Into<String>) -> Self {
        Self::Timeout {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn network(provider: &str, message: impl Into<String>) -> Self {
        Self::Network {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn server(provider: &str, status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            provider: provider.to_string(),
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(provider: &str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn auth(provider: &str, message: impl Into<String>) -> Self {
        Self::Auth {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn token_limit(provider: &str, message: impl Into<String>) -> Self {
        Self::TokenLimitExceeded {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn stream(provider: &str, message: impl Into<String>) -> Self {
        Self::Stream {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Name of the provider that produced this error.
    pub fn provider(&self) -> &str {
        match self {
            ProviderError::RateLimited { provider, .. }
            | ProviderError::Timeout { provider, .. }
            | ProviderError::Network { provider, .. }
            | ProviderError::Server { provider, .. }
            | ProviderError::BadRequest { provider, .. }
            | ProviderError::Auth { provider, .. }
            | ProviderError::TokenLimitExceeded { provider, .. }
            | ProviderError::Stream { provider, .. } => provider,
        }
    }

    /// Classified kind for the fallback loop and route events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::RateLimited { .. } => ErrorKind::RateLimited,
            ProviderError::Timeout { .. } => ErrorKind::Timeout,
            ProviderError::Network { .. } | ProviderError::Stream { .. } => ErrorKind::Transient,
            ProviderError::Server { .. } => ErrorKind::ServerError,
            ProviderError::BadRequest { .. } => ErrorKind::BadRequest,
            ProviderError::Auth { .. } => ErrorKind::AuthError,
            ProviderError::TokenLimitExceeded { .. } => ErrorKind::TokenLimitExceeded,
        }
    }

    /// Whether the fallback loop should try the next candidate.
    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Map an HTTP status code to a provider error.
    pub fn from_status(provider: &str, status: u16, body: &str, retry_after: Option<u64>) -> Self {
        match status {
            400 | 404 | 413 | 422 => Self::bad_request(provider, body.to_string()),
            401 | 403 => Self::auth(provider, body.to_string()),
            429 => Self::rate_limited(provider, body.to_string(), retry_after),
            500..=599 => Self::server(provider, status, body.to_string()),
            _ => Self::server(provider, status, body.to_string()),
        }
    }

    /// Map a reqwest transport error to a provider error.
    pub fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(provider, err.to_string())
        } else {
            Self::network(provider, err.to_string())
        }
    }
}
