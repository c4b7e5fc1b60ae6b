//! Configuration models
//!
//! All tunable values carry serde defaults so a minimal YAML or dict
//! config stays small. `RouterConfig::validate()` is called at router
//! construction.

use serde::{Deserialize, Serialize};

use crate::core::types::Priority;
use crate::providers::JsonMap;

fn default_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_seconds() -> u64 {
    30
}

fn default_window_seconds() -> u64 {
    60
}

fn default_reserve_fraction() -> f64 {
    0.2
}

fn default_session_ttl_seconds() -> u64 {
    3600
}

fn default_ema_alpha() -> f64 {
    0.2
}

fn default_short_window_seconds() -> u64 {
    30
}

fn default_lookahead_seconds() -> u64 {
    120
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_forced_fallback() -> bool {
    true
}

/// Immutable declaration of a provider's identity and quotas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique identifier, e.g. "openai", "anthropic"
    pub name: String,
    /// Model string, e.g. "gpt-4o"
    pub model: String,
    /// Provider API key
    #[serde(default)]
    pub api_key: String,
    /// Max requests per minute for this provider key
    pub rpm_limit: u32,
    /// Max tokens per minute for this provider key
    pub tpm_limit: u64,
    /// Static preference weight (0.0–1.0), used as the static score
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Toggle without removing from config
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Override the adapter's API base URL
    #[serde(default)]
    pub api_base: Option<String>,
    /// Provider-specific options, passed through to the adapter
    #[serde(default)]
    pub options: JsonMap,
}

/// Scoring weight coefficients for one priority lane.
///
/// The three coefficients must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightProfile {
    pub capacity: f64,
    pub latency: f64,
    #[serde(rename = "static")]
    pub static_weight: f64,
}

impl WeightProfile {
    pub fn sum(&self) -> f64 {
        self.capacity + self.latency + self.static_weight
    }
}

/// Per-priority weight profiles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingWeights {
    pub high: WeightProfile,
    pub normal: WeightProfile,
    pub low: WeightProfile,
}

impl RoutingWeights {
    /// Profile for a priority lane.
    pub fn profile(&self, priority: Priority) -> WeightProfile {
        match priority {
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }
}

impl Default for RoutingWeights {
    fn default() -> Self {
        Self {
            high: WeightProfile {
                capacity: 0.5,
                latency: 0.4,
                static_weight: 0.1,
            },
            normal: WeightProfile {
                capacity: 0.5,
                latency: 0.3,
                static_weight: 0.2,
            },
            low: WeightProfile {
                capacity: 0.3,
                latency: 0.1,
                static_weight: 0.6,
            },
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to trip the circuit
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before the provider is re-admitted
    pub cooldown_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

/// Quota exhaustion prediction tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ExhaustionConfig {
    /// Recent sub-window over which the short-term rate is observed
    pub short_window_seconds: u64,
    /// How far ahead the short-term rate is projected
    pub lookahead_seconds: u64,
    /// Short-term rate must exceed this multiple of the long-term
    /// average before a provider can be flagged
    pub multiplier: f64,
}

impl Default for ExhaustionConfig {
    fn default() -> Self {
        Self {
            short_window_seconds: default_short_window_seconds(),
            lookahead_seconds: default_lookahead_seconds(),
            multiplier: default_multiplier(),
        }
    }
}

/// Top-level router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Providers registered at construction
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Per-priority scoring weight overrides
    #[serde(default)]
    pub routing_weights: RoutingWeights,
    /// Circuit breaker tuning
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Sliding usage window width, in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Fraction of each provider's RPM capacity reserved for
    /// high-priority requests
    #[serde(default = "default_reserve_fraction")]
    pub high_priority_reserve_fraction: f64,
    /// Session affinity binding lifetime, in seconds
    #[serde(default = "default_session_ttl_seconds")]
    pub session_ttl_seconds: u64,
    /// Latency EMA smoothing factor
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    /// Quota exhaustion prediction tuning
    #[serde(default)]
    pub exhaustion: ExhaustionConfig,
    /// Shared store URL. When set, usage windows, session bindings and
    /// circuit OPEN state are shared across router instances.
    #[serde(default)]
    pub shared_store_url: Option<String>,
    /// Whether a request pinned with `force_provider` may fall back to
    /// other providers when the pinned one fails
    #[serde(default = "default_forced_fallback")]
    pub forced_fallback: bool,
    /// Optional overall wall-clock budget for the fallback loop, in
    /// seconds. Unset means unlimited.
    #[serde(default)]
    pub fallback_budget_seconds: Option<f64>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            routing_weights: RoutingWeights::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            window_seconds: default_window_seconds(),
            high_priority_reserve_fraction: default_reserve_fraction(),
            session_ttl_seconds: default_session_ttl_seconds(),
            ema_alpha: default_ema_alpha(),
            exhaustion: ExhaustionConfig::default(),
            shared_store_url: None,
            forced_fallback: default_forced_fallback(),
            fallback_budget_seconds: None,
        }
    }
}

impl RouterConfig {
    /// Validate cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err("provider name must not be empty".to_string());
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(format!("duplicate provider name '{}'", provider.name));
            }
            if provider.rpm_limit == 0 {
                return Err(format!("provider '{}': rpm_limit must be positive", provider.name));
            }
            if provider.tpm_limit == 0 {
                return Err(format!("provider '{}': tpm_limit must be positive", provider.name));
            }
            if !(0.0..=1.0).contains(&provider.weight) {
                return Err(format!(
                    "provider '{}': weight must be within [0.0, 1.0]",
                    provider.name
                ));
            }
        }

        for (lane, profile) in [
            ("high", self.routing_weights.high),
            ("normal", self.routing_weights.normal),
            ("low", self.routing_weights.low),
        ] {
            if (profile.sum() - 1.0).abs() > 1e-6 {
                return Err(format!(
                    "routing_weights.{lane}: capacity + latency + static must sum to 1.0, got {}",
                    profile.sum()
                ));
            }
        }

        if !(0.0..=1.0).contains(&self.high_priority_reserve_fraction) {
            return Err("high_priority_reserve_fraction must be within [0.0, 1.0]".to_string());
        }
        if !(0.0..=1.0).contains(&self.ema_alpha) || self.ema_alpha == 0.0 {
            return Err("ema_alpha must be within (0.0, 1.0]".to_string());
        }
        if self.window_seconds == 0 {
            return Err("window_seconds must be positive".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err("circuit_breaker.failure_threshold must be positive".to_string());
        }

        Ok(())
    }
}
