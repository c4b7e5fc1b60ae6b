//! # llm-router
//!
//! Adaptive, rate-limit-aware request router for LLM providers.
//!
//! For every chat or streaming request the router ranks the provider
//! pool on remaining RPM/TPM headroom, observed latency and static
//! preference, calls the best candidate, and transparently falls back to
//! the next one on transient failure. A per-provider circuit breaker
//! keeps repeatedly failing providers out of rotation, and an exhaustion
//! predictor shifts load away from providers that are about to hit their
//! quota.
//!
//! ## Features
//!
//! - **Sliding-window usage tracking**: per-provider RPM/TPM windows,
//!   in-process by default or shared through Redis for multi-instance
//!   deployments
//! - **Priority lanes**: `high`/`normal`/`low` requests use different
//!   scoring profiles; part of each provider's capacity is reserved for
//!   high-priority traffic
//! - **Circuit breaking**: consecutive failures open a per-provider
//!   circuit for a cooldown, shared across instances when Redis is
//!   configured
//! - **Session affinity**: requests carrying the same `session_id`
//!   stick to one provider while the binding lives
//! - **Streaming with fallback**: provider failures before the first
//!   fragment fall back to the next candidate
//! - **BYOC**: register your own pre-configured `reqwest::Client`
//!   instead of handing over credentials
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use llm_router::{Message, Router, RouterConfig, RouterRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RouterConfig::from_yaml_file("router.yaml").await?;
//!     let router = Router::new(config).await?;
//!
//!     let response = router
//!         .chat(RouterRequest::new(vec![
//!             Message::system("You are a helpful assistant."),
//!             Message::user("What is the capital of France?"),
//!         ]))
//!         .await?;
//!
//!     println!("[{} x{}] {}", response.provider, response.attempts, response.content);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod error;
pub mod providers;
pub mod state;

pub use crate::config::{
    CircuitBreakerConfig, ExhaustionConfig, ProviderConfig, RouterConfig, RoutingWeights,
    WeightProfile,
};
pub use crate::core::estimator::estimate_tokens;
pub use crate::core::types::{
    Message, Priority, ProviderStatus, RouteEvent, RouteObserver, RouterRequest, RouterResponse,
    StatusSnapshot,
};
pub use crate::core::{Router, RouterStream};
pub use crate::error::{ErrorKind, ProviderAttempt, Result, RouterError, StateError};
pub use crate::providers::{
    AnthropicProvider, ChatCompletion, ChatStream, JsonMap, OpenAIProvider, Provider,
    ProviderError, ProviderRegistry, StreamChunk,
};
pub use crate::state::{InMemoryStateBackend, RedisStateBackend, StateBackend};

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
