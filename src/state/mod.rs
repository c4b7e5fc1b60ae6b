//! State backends
//!
//! A state backend owns the per-provider sliding usage windows and the
//! session-affinity bindings. Two interchangeable implementations:
//! in-process ([`InMemoryStateBackend`], the default) and shared-store
//! ([`RedisStateBackend`]) for multi-instance deployments.

mod memory;
mod redis;

pub use memory::InMemoryStateBackend;
pub use redis::RedisStateBackend;

use async_trait::async_trait;

use crate::error::StateError;

/// Shared-store key layout. Every key carries a TTL of at least twice
/// the window (usage) or the cooldown (circuit).
pub(crate) mod keys {
    pub fn rpm_key(provider: &str) -> String {
        format!("usage:rpm:{provider}")
    }

    pub fn tpm_key(provider: &str) -> String {
        format!("usage:tpm:{provider}")
    }

    pub fn circuit_key(provider: &str) -> String {
        format!("circuit:{provider}")
    }

    pub fn session_key(session_id: &str) -> String {
        format!("session:{session_id}")
    }
}

/// Contract every state backend implements. All operations may suspend
/// and are safe under concurrent callers.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Append a usage sample `(now, tokens)` to the provider's window.
    /// Samples older than `window_seconds` are purged along the way.
    async fn record_request(
        &self,
        provider: &str,
        tokens: u64,
        window_seconds: u64,
    ) -> Result<(), StateError>;

    /// Current `(rpm, tpm)` for the provider: the count and token sum of
    /// samples whose timestamp lies within `[now - window, now]`.
    async fn get_usage(&self, provider: &str, window_seconds: u64) -> Result<(u32, u64), StateError>;

    /// Provider currently bound to `session_id`, if the binding has not
    /// expired.
    async fn get_session_provider(&self, session_id: &str) -> Result<Option<String>, StateError>;

    /// Bind `session_id` to `provider` for `ttl_seconds`.
    async fn set_session_provider(
        &self,
        session_id: &str,
        provider: &str,
        ttl_seconds: u64,
    ) -> Result<(), StateError>;

    /// Release resources held by this backend.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::keys;

    #[test]
    fn key_layout() {
        assert_eq!(keys::rpm_key("openai"), "usage:rpm:openai");
        assert_eq!(keys::tpm_key("openai"), "usage:tpm:openai");
        assert_eq!(keys::circuit_key("openai"), "circuit:openai");
        assert_eq!(keys::session_key("s1"), "session:s1");
    }
}
