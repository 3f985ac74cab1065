//! Component F — Rate Limiter (spec §4.F).
//!
//! Keyed by caller principal ARN, never source IP (NAT could aggregate
//! unrelated callers behind one IP). Fixed-window counter with atomic
//! increment; fail-open on backend error — availability over enforcement.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::RateLimitError;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub window_secs: i64,
    pub max_requests: u64,
}

/// Backend capability the orchestrator depends on (spec §9 DI list).
/// `incr` returns the post-increment count for the caller's current window.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn incr(&self, key: &str, window_start_secs: i64, ttl_secs: i64) -> Result<u64, RateLimitError>;
}

#[derive(Default)]
struct Counter {
    window_start_secs: i64,
    count: u64,
}

/// In-memory, single-process limiter. A distributed deployment selects a
/// different `RateLimitStore` via the `rate-limit-table-name` env var
/// (spec §6); this implementation is what's used when that var is unset,
/// which per spec logs a warning at config-load time, not here.
pub struct InMemoryRateLimitStore {
    counters: Arc<DashMap<String, Counter>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        InMemoryRateLimitStore {
            counters: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn incr(&self, key: &str, window_start_secs: i64, _ttl_secs: i64) -> Result<u64, RateLimitError> {
        let mut entry = self.counters.entry(key.to_string()).or_default();
        if entry.window_start_secs != window_start_secs {
            entry.window_start_secs = window_start_secs;
            entry.count = 0;
        }
        entry.count += 1;
        Ok(entry.count)
    }
}

/// Checks whether `principal` may proceed under `config`, given the
/// backend's post-increment count for the current fixed window. Fails
/// open (returns `Ok(true)`) on any store error, logging a warning —
/// availability over enforcement (spec §4.F, §4.I).
pub async fn check(
    store: &dyn RateLimitStore,
    principal: &str,
    config: RateLimitConfig,
    now_unix_secs: i64,
) -> bool {
    let window_start = now_unix_secs - (now_unix_secs % config.window_secs);
    let ttl = config.window_secs * 2;
    match store.incr(principal, window_start, ttl).await {
        Ok(count) => count <= config.max_requests,
        Err(e) => {
            tracing::warn!(error = %e, "rate limit store unavailable, failing open");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_the_limit() {
        let store = InMemoryRateLimitStore::new();
        let config = RateLimitConfig {
            window_secs: 60,
            max_requests: 2,
        };
        assert!(check(&store, "arn:aws:iam::1:user/alice", config, 1_000).await);
        assert!(check(&store, "arn:aws:iam::1:user/alice", config, 1_000).await);
        assert!(!check(&store, "arn:aws:iam::1:user/alice", config, 1_000).await);
    }

    #[tokio::test]
    async fn separate_principals_have_separate_windows() {
        let store = InMemoryRateLimitStore::new();
        let config = RateLimitConfig {
            window_secs: 60,
            max_requests: 1,
        };
        assert!(check(&store, "alice", config, 1_000).await);
        assert!(check(&store, "bob", config, 1_000).await);
    }

    #[tokio::test]
    async fn resets_on_new_window() {
        let store = InMemoryRateLimitStore::new();
        let config = RateLimitConfig {
            window_secs: 60,
            max_requests: 1,
        };
        assert!(check(&store, "alice", config, 1_000).await);
        assert!(!check(&store, "alice", config, 1_010).await);
        assert!(check(&store, "alice", config, 1_100).await);
    }

    struct FailingStore;
    #[async_trait]
    impl RateLimitStore for FailingStore {
        async fn incr(&self, _key: &str, _window_start_secs: i64, _ttl_secs: i64) -> Result<u64, RateLimitError> {
            Err(RateLimitError::Store("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn fails_open_on_store_error() {
        let config = RateLimitConfig {
            window_secs: 60,
            max_requests: 0,
        };
        assert!(check(&FailingStore, "alice", config, 1_000).await);
    }
}
