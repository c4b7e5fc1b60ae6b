//! Per-provider latency EMA
//!
//! Deliberately process-local even when a shared store is configured:
//! scoring tolerates per-instance variance, and skipping a store write on
//! every completion keeps the success path cheap.

use dashmap::DashMap;

/// Default EMA smoothing factor.
pub const DEFAULT_EMA_ALPHA: f64 = 0.2;

/// Tracks an exponential moving average of observed latencies keyed by
/// provider name.
#[derive(Debug)]
pub struct LatencyTracker {
    alpha: f64,
    ema: DashMap<String, f64>,
}

impl LatencyTracker {
    /// Create a tracker with the given smoothing factor.
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            ema: DashMap::new(),
        }
    }

    /// Fold a new observation into the EMA. The first observation for a
    /// provider initializes the EMA to the observed value.
    pub fn update(&self, provider: &str, latency_ms: f64) {
        match self.ema.get_mut(provider) {
            Some(mut current) => {
                *current = self.alpha * latency_ms + (1.0 - self.alpha) * *current;
            }
            None => {
                self.ema.insert(provider.to_string(), latency_ms);
            }
        }
    }

    /// Current EMA for a provider. Unknown providers read as 0, which the
    /// scorer treats as perfect latency.
    pub fn get(&self, provider: &str) -> f64 {
        self.ema.get(provider).map(|v| *v).unwrap_or(0.0)
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_EMA_ALPHA)
    }
}
