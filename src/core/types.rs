//! Request, response and event types
//!
//! These are part of the public API surface of the crate. Messages carry
//! an explicit `{role, content}` shape with room for passthrough fields
//! forwarded verbatim to adapters.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::providers::JsonMap;

/// A single chat message.
///
/// Unknown fields survive a deserialize/serialize round trip and are sent
/// to the provider unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message role: "system", "user", "assistant", ...
    pub role: String,
    /// Message text
    pub content: String,
    /// Passthrough fields carried verbatim to the adapter
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl Message {
    /// Create a message with an arbitrary role.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            extra: JsonMap::new(),
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Request priority lane.
///
/// Controls the scoring weight profile, exclusion of at-risk providers
/// and enforcement of the high-priority capacity reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routing request submitted by the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterRequest {
    /// Chat messages, in order
    pub messages: Vec<Message>,
    /// Maximum completion tokens
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Priority lane (default: normal)
    #[serde(default)]
    pub priority: Priority,
    /// Sticky-routing key: requests sharing a session id are routed to
    /// the same provider while the binding is alive
    #[serde(default)]
    pub session_id: Option<String>,
    /// Pin this request to a specific provider. Fallback to the others
    /// still applies on failure unless disabled in the config.
    #[serde(default)]
    pub force_provider: Option<String>,
    /// Passthrough options forwarded to the adapter
    #[serde(default)]
    pub options: JsonMap,
}

impl RouterRequest {
    /// Create a request with defaults for everything but the messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
            priority: Priority::Normal,
            session_id: None,
            force_provider: None,
            options: JsonMap::new(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_force_provider(mut self, provider: impl Into<String>) -> Self {
        self.force_provider = Some(provider.into());
        self
    }
}

/// Result returned to the application after a successful route.
#[derive(Debug, Clone, Serialize)]
pub struct RouterResponse {
    /// Completion text
    pub content: String,
    /// Provider that served the request
    pub provider: String,
    /// Model string used
    pub model: String,
    /// Wall-clock latency of the successful call, in milliseconds
    pub latency_ms: f64,
    /// Providers actually invoked, successful attempt included
    /// (1 = no fallback needed)
    pub attempts: u32,
    /// Prompt tokens consumed
    pub input_tokens: u64,
    /// Completion tokens produced
    pub output_tokens: u64,
}

/// Observability record emitted after each routed request.
#[derive(Debug, Clone, Serialize)]
pub struct RouteEvent {
    /// Provider that served (or last rejected) the request
    pub provider: Option<String>,
    /// Model string, when a provider was reached
    pub model: Option<String>,
    /// Wall-clock latency of the attempt sequence, in milliseconds
    pub latency_ms: f64,
    /// Providers actually invoked
    pub attempts: u32,
    /// Request priority lane
    pub priority: Priority,
    /// Session id, when sticky routing was requested
    pub session_id: Option<String>,
    /// Whether the request ultimately succeeded
    pub success: bool,
    /// Failure classification, set when `success` is false
    pub error_kind: Option<ErrorKind>,
    /// Prompt tokens consumed, on success
    pub input_tokens: Option<u64>,
    /// Completion tokens produced, on success
    pub output_tokens: Option<u64>,
    /// Event creation time
    pub timestamp: DateTime<Utc>,
}

/// Receiver for [`RouteEvent`]s.
///
/// Implementations can forward events to metrics pipelines or logs.
/// Errors returned here are logged and discarded; observability must
/// never affect routing.
#[async_trait]
pub trait RouteObserver: Send + Sync {
    async fn on_route(
        &self,
        event: RouteEvent,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Per-provider snapshot returned by `Router::status()`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub rpm_used: u32,
    pub rpm_limit: u32,
    pub tpm_used: u64,
    pub tpm_limit: u64,
    /// Remaining capacity percentage: the bottleneck of the RPM and TPM
    /// headrooms, times 100
    pub headroom_pct: f64,
    pub circuit_open: bool,
    pub avg_latency_ms: f64,
}

/// Full status snapshot keyed by provider name.
pub type StatusSnapshot = HashMap<String, ProviderStatus>;
