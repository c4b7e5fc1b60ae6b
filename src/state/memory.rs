//! In-process state backend
//!
//! Default backend: zero external dependencies, state dies with the
//! process. Each provider holds a ring of `(timestamp, tokens)` samples
//! in a `VecDeque`; one cooperative mutex guards all windows so readers
//! never observe a partial purge. Sessions expire lazily on read.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::StateBackend;
use crate::error::StateError;

#[derive(Debug, Default)]
pub struct InMemoryStateBackend {
    windows: Mutex<HashMap<String, VecDeque<(Instant, u64)>>>,
    sessions: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_sample(
        windows: &mut HashMap<String, VecDeque<(Instant, u64)>>,
        provider: &str,
        tokens: u64,
        now: Instant,
        window: Duration,
    ) {
        let ring = windows.entry(provider.to_string()).or_default();
        ring.push_back((now, tokens));
        Self::purge(ring, now, window);
    }

    /// Drop samples strictly older than the window. A sample exactly at
    /// `now - window` is still in the window.
    fn purge(ring: &mut VecDeque<(Instant, u64)>, now: Instant, window: Duration) {
        while let Some(&(t, _)) = ring.front() {
            if now.duration_since(t) > window {
                ring.pop_front();
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl StateBackend for InMemoryStateBackend {
    async fn record_request(
        &self,
        provider: &str,
        tokens: u64,
        window_seconds: u64,
    ) -> Result<(), StateError> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        Self::record_sample(
            &mut windows,
            provider,
            tokens,
            now,
            Duration::from_secs(window_seconds),
        );
        Ok(())
    }

    async fn get_usage(&self, provider: &str, window_seconds: u64) -> Result<(u32, u64), StateError> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let Some(ring) = windows.get_mut(provider) else {
            return Ok((0, 0));
        };
        Self::purge(ring, now, Duration::from_secs(window_seconds));
        let rpm = ring.len() as u32;
        let tpm = ring.iter().map(|&(_, t)| t).sum();
        Ok((rpm, tpm))
    }

    async fn get_session_provider(&self, session_id: &str) -> Result<Option<String>, StateError> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        match sessions.get(session_id) {
            Some((provider, expiry)) if now < *expiry => Ok(Some(provider.clone())),
            Some(_) => {
                // Expired bindings are treated as absent and dropped.
                sessions.remove(session_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_session_provider(
        &self,
        session_id: &str,
        provider: &str,
        ttl_seconds: u64,
    ) -> Result<(), StateError> {
        let expiry = Instant::now() + Duration::from_secs(ttl_seconds);
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session_id.to_string(), (provider.to_string(), expiry));
        Ok(())
    }
}
