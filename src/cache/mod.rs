//! Query-result cache backed by `moka`.
//!
//! Caching is a pure optimization: a cold or disabled cache only costs an
//! extra embedding call, never correctness. Entries expire by TTL and are
//! evicted LRU-style once the capacity bound is reached. Re-indexed content
//! may be served stale until expiry or an explicit [`QueryCache::clear`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use itertools::Itertools;
use moka::future::Cache;
use moka::notification::RemovalCause;
use serde::Serialize;

use crate::config::CacheConfig;
use crate::content::ContentType;
use crate::retriever::ContextResult;


/// Assembled retrieval payload shared between the retriever and the cache.
///
/// Stored results always carry their metadata; the retriever strips it per
/// request when `include_metadata` was not asked for.
#[derive(Debug, Clone)]
pub struct CachedContext {
    pub results: Vec<ContextResult>,
    pub average_confidence: f64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: u64,
    pub hit_rate: f64,
    pub evictions: u64,
}

/// Bounded async cache for assembled search results.
///
/// Clones share the underlying store and counters.
#[derive(Clone)]
pub struct QueryCache {
    enabled: bool,
    entries: Cache<String, Arc<CachedContext>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
}

impl QueryCache {
    #[inline]
    pub fn new(config: &CacheConfig) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let evicted = Arc::clone(&evictions);
        let entries = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(Duration::from_secs(config.ttl_seconds))
            .eviction_listener(move |_key, _value, cause| {
                // TTL expiry and explicit invalidation are not capacity evictions.
                if cause == RemovalCause::Size {
                    evicted.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();

        Self {
            enabled: config.enabled,
            entries,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            evictions,
        }
    }

    /// Deterministic cache key for a retrieval request.
    ///
    /// The query is normalized (lowercased, trimmed, inner whitespace
    /// collapsed) so formatting differences share an entry; the remaining
    /// parameters are encoded verbatim so a different `top_n` or `min_score`
    /// never serves an incompatible envelope.
    #[inline]
    pub fn make_key(
        tenant_id: &str,
        content_type: Option<ContentType>,
        top_n: usize,
        min_score: f64,
        query: &str,
    ) -> String {
        let selector = content_type.map_or("all", |content_type| content_type.as_str());
        // Four decimal places of score resolution, without float formatting drift.
        let score_scaled = (min_score * 10_000.0).round() as i64;
        let normalized = query.to_lowercase().split_whitespace().join(" ");
        format!("{tenant_id}:{selector}:{top_n}:{score_scaled}:{normalized}")
    }

    #[inline]
    pub async fn get(&self, key: &str) -> Option<Arc<CachedContext>> {
        if !self.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match self.entries.get(key).await {
            Some(context) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(context)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    #[inline]
    pub async fn insert(&self, key: String, context: Arc<CachedContext>) {
        if !self.enabled {
            return;
        }
        self.entries.insert(key, context).await;
    }

    /// Whether lookups can ever hit. A disabled cache answers every lookup
    /// with a miss and drops every insert.
    #[inline]
    pub fn is_available(&self) -> bool {
        self.enabled
    }

    /// Current counters. Flushes pending maintenance first so `size` and
    /// `evictions` reflect completed housekeeping.
    #[inline]
    pub async fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };

        CacheStats {
            hits,
            misses,
            size: self.entries.entry_count(),
            hit_rate,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Drop every entry. Counters keep accumulating across clears.
    #[inline]
    pub async fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
    }
}
