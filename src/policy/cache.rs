//! Authorization cache
//!
//! Allow-only cache of policy decisions keyed by tenant, action and payload
//! fingerprint. Entries live for the decision's `ttl_ms`
//! (or the configured default). Expired entries are dropped lazily on read
//! and by the periodic sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Decision, Verdict};
use crate::{Error, Result};

/// A cached allow decision
#[derive(Debug, Clone)]
pub struct CachedDecision {
    /// Decision id issued by the decision service
    pub decision_id: String,
    /// Policy that allowed the call
    pub policy_id: Option<String>,
    /// When the entry stops being served
    pub expires_at: Instant,
}

impl CachedDecision {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses (absent or expired)
    pub misses: u64,
    /// Expired entries removed
    pub evictions: u64,
    /// Current number of entries
    pub size: usize,
}

/// Thread-safe allow-decision cache
pub struct AuthorizationCache {
    entries: DashMap<String, CachedDecision>,
    default_ttl: Duration,
    stats: CacheStats,
}

impl AuthorizationCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            stats: CacheStats::default(),
        }
    }

    /// Build a cache key
    ///
    /// Tenant and action may both contain `:`, so each is length-prefixed.
    #[must_use]
    pub fn key(tenant: &str, action: &str, fingerprint: &str) -> String {
        format!("{}:{tenant}:{}:{action}:{fingerprint}", tenant.len(), action.len())
    }

    /// Get a live entry, evicting it if expired
    pub fn get(&self, key: &str) -> Option<CachedDecision> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.clone());
            }
            drop(entry);
            if self
                .entries
                .remove_if(key, |_, e| e.is_expired(now))
                .is_some()
            {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store an allow decision
    ///
    /// # Errors
    ///
    /// Returns `Error::Cache` for a non-allow verdict or a zero TTL.
    pub fn insert(&self, key: &str, decision: &Decision) -> Result<()> {
        if decision.decision != Verdict::Allow {
            return Err(Error::Cache(format!(
                "refusing to cache '{}' decision {}",
                decision.decision, decision.decision_id
            )));
        }

        let ttl = decision
            .ttl_ms
            .map_or(self.default_ttl, Duration::from_millis);
        if ttl.is_zero() {
            return Err(Error::Cache(format!(
                "decision {} has zero TTL",
                decision.decision_id
            )));
        }

        self.entries.insert(
            key.to_string(),
            CachedDecision {
                decision_id: decision.decision_id.clone(),
                policy_id: decision.policy_id.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    /// Remove expired entries, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.stats
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Swept expired authorization entries");
        }
        removed
    }

    /// Sweep every `interval` until cancelled
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => { self.sweep(); }
                () = cancel.cancelled() => return,
            }
        }
    }

    /// Number of entries (including not yet swept expired ones)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort_unstable();
        keys
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Get cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(verdict: Verdict, ttl_ms: Option<u64>) -> Decision {
        Decision {
            decision_id: "dec-1".into(),
            decision: verdict,
            reason: None,
            policy_id: Some("pol-7".into()),
            ttl_ms,
        }
    }

    #[test]
    fn only_allow_is_cached() {
        let cache = AuthorizationCache::new(Duration::from_secs(60));

        for verdict in [Verdict::Deny, Verdict::RequireApproval] {
            let err = cache.insert("k", &decision(verdict, Some(1000))).unwrap_err();
            assert!(matches!(err, Error::Cache(_)));
        }
        assert!(cache.is_empty());

        cache.insert("k", &decision(Verdict::Allow, Some(1000))).unwrap();
        let hit = cache.get("k").unwrap();
        assert_eq!(hit.decision_id, "dec-1");
        assert_eq!(hit.policy_id.as_deref(), Some("pol-7"));
    }

    #[test]
    fn zero_ttl_is_refused() {
        let cache = AuthorizationCache::new(Duration::from_secs(60));
        assert!(cache.insert("k", &decision(Verdict::Allow, Some(0))).is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let cache = AuthorizationCache::new(Duration::from_secs(60));
        cache.insert("k", &decision(Verdict::Allow, Some(1000))).unwrap();

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(cache.get("k").is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get("k").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn default_ttl_applies_without_ttl_ms() {
        let cache = AuthorizationCache::new(Duration::from_secs(60));
        cache.insert("k", &decision(Verdict::Allow, None)).unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get("k").is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired() {
        let cache = AuthorizationCache::new(Duration::from_secs(60));
        cache.insert("short", &decision(Verdict::Allow, Some(100))).unwrap();
        cache.insert("long", &decision(Verdict::Allow, Some(10_000))).unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.keys(), vec!["long".to_string()]);
    }

    #[test]
    fn key_layout() {
        assert_eq!(
            AuthorizationCache::key("acme", "tools/call:fs.read", "abc"),
            "4:acme:18:tools/call:fs.read:abc"
        );
    }

    #[test]
    fn colons_in_tenant_do_not_collide_with_action() {
        // GIVEN: two (tenant, action) pairs whose plain join is identical
        let a = AuthorizationCache::key("acme:tools/call", "tools/call:x", "fp");
        let b = AuthorizationCache::key("acme", "tools/call:tools/call:x", "fp");

        // THEN: their keys differ
        assert_ne!(a, b);

        // AND: an allow cached for one is not served to the other
        let cache = AuthorizationCache::new(Duration::from_secs(60));
        cache.insert(&a, &decision(Verdict::Allow, None)).unwrap();
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&a).is_some());
    }
}
