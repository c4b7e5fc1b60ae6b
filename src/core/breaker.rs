//! Per-provider circuit breaker
//!
//! State machine: CLOSED counts consecutive failures; reaching the
//! threshold opens the circuit for a cooldown. HALF-OPEN is implicit:
//! once the deadline has passed the guard admits requests again, and the
//! next recorded outcome either resets the circuit (success) or trips it
//! again (failure). All requests arriving after the deadline are
//! admitted; the first completion decides the subsequent state.
//!
//! When a shared store is configured, the OPEN condition is mirrored as
//! a `circuit:{provider}` key with TTL equal to the cooldown so every
//! router instance respects a trip from any of them. Failure counts stay
//! in-process: a cross-instance undercount is acceptable because the
//! first instance to cross the threshold publishes the shared key.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::error::RouterError;
use crate::state::keys;

#[derive(Debug, Default, Clone, Copy)]
struct CircuitState {
    failures: u32,
    open_until: Option<Instant>,
}

/// Snapshot of one provider's circuit, as reported by `status()`.
#[derive(Debug, Clone, Copy)]
pub struct CircuitSnapshot {
    pub open: bool,
    pub failure_count: u32,
}

/// Per-provider failure gate with a timed open state.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    circuits: DashMap<String, CircuitState>,
    shared: Option<MultiplexedConnection>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            circuits: DashMap::new(),
            shared: None,
        }
    }

    /// Mirror OPEN state through the shared store.
    pub fn with_shared(mut self, conn: MultiplexedConnection) -> Self {
        self.shared = Some(conn);
        self
    }

    /// Whether the circuit for `provider` is currently OPEN.
    ///
    /// A local deadline that has passed is cleared here, which is the
    /// implicit transition back to CLOSED.
    pub async fn is_open(&self, provider: &str) -> bool {
        if self.local_is_open(provider) {
            return true;
        }
        self.shared_is_open(provider).await
    }

    /// Fail fast with `CircuitOpen` when the provider is blocked. The
    /// fallback loop consumes this error; it never reaches callers.
    pub async fn guard(&self, provider: &str) -> Result<(), RouterError> {
        if self.is_open(provider).await {
            return Err(RouterError::CircuitOpen(provider.to_string()));
        }
        Ok(())
    }

    /// Record a successful call: the failure count drops to zero and any
    /// open deadline is cleared, in one step.
    pub fn record_success(&self, provider: &str) {
        if let Some(mut state) = self.circuits.get_mut(provider) {
            state.failures = 0;
            state.open_until = None;
        }
    }

    /// Record a failed call. Trips the circuit once consecutive failures
    /// reach the threshold.
    pub async fn record_failure(&self, provider: &str) {
        let tripped = {
            let mut state = self.circuits.entry(provider.to_string()).or_default();
            state.failures += 1;
            if state.failures >= self.threshold {
                state.failures = 0;
                state.open_until = Some(Instant::now() + self.cooldown);
                true
            } else {
                false
            }
        };

        if tripped {
            debug!(provider, cooldown_secs = self.cooldown.as_secs(), "circuit opened");
            self.publish_open(provider).await;
        }
    }

    /// Current circuit state for `provider`.
    pub async fn snapshot(&self, provider: &str) -> CircuitSnapshot {
        let failure_count = self
            .circuits
            .get(provider)
            .map(|s| s.failures)
            .unwrap_or(0);
        CircuitSnapshot {
            open: self.is_open(provider).await,
            failure_count,
        }
    }

    fn local_is_open(&self, provider: &str) -> bool {
        let Some(mut state) = self.circuits.get_mut(provider) else {
            return false;
        };
        match state.open_until {
            Some(deadline) if Instant::now() < deadline => true,
            Some(_) => {
                // Cooldown elapsed: re-admit and forget old failures.
                state.open_until = None;
                state.failures = 0;
                false
            }
            None => false,
        }
    }

    async fn shared_is_open(&self, provider: &str) -> bool {
        let Some(conn) = &self.shared else {
            return false;
        };
        let mut conn = conn.clone();
        match conn.exists::<_, bool>(keys::circuit_key(provider)).await {
            Ok(open) => open,
            Err(err) => {
                // Degrade to the local view rather than blocking routing.
                warn!(provider, error = %err, "shared circuit check failed");
                false
            }
        }
    }

    async fn publish_open(&self, provider: &str) {
        let Some(conn) = &self.shared else {
            return;
        };
        let mut conn = conn.clone();
        let result: Result<(), redis::RedisError> = conn
            .set_ex(keys::circuit_key(provider), 1u8, self.cooldown.as_secs())
            .await;
        if let Err(err) = result {
            warn!(provider, error = %err, "failed to publish circuit open state");
        }
    }
}
