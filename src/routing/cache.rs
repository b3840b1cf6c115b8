//! Catalog caching with TTL expiry and active invalidation.
//!
//! Two layers: the declared catalog of each backend, and the aggregated
//! catalog of each unified endpoint. Entries are written under a cache
//! token (`endpoint id` + generation); any invalidation bumps the
//! generation so a fetch that started before it cannot repopulate stale
//! data.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::protocol::Tool;

struct Entry<T> {
    value: T,
    cached_at: Instant,
}

struct Aggregate {
    tools: Arc<Vec<Tool>>,
    children: HashSet<String>,
}

/// Cache token captured before a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheToken(u64);

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatalogCacheStats {
    /// Served from cache
    pub hits: u64,
    /// Not cached or expired
    pub misses: u64,
    /// Entries dropped by invalidation
    pub invalidations: u64,
}

/// Backend and endpoint catalog cache
pub struct CatalogCache {
    ttl: Duration,
    generation: AtomicU64,
    backends: DashMap<String, Entry<Arc<Vec<Tool>>>>,
    endpoints: DashMap<String, Entry<Aggregate>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl CatalogCache {
    /// Empty cache with the given TTL
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            generation: AtomicU64::new(0),
            backends: DashMap::new(),
            endpoints: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Token to pass back to an `insert_*` call after fetching
    #[must_use]
    pub fn token(&self) -> CacheToken {
        CacheToken(self.generation.load(Ordering::Acquire))
    }

    fn is_current(&self, token: CacheToken) -> bool {
        self.generation.load(Ordering::Acquire) == token.0
    }

    fn fresh<T>(&self, entry: &Entry<T>) -> bool {
        entry.cached_at.elapsed() < self.ttl
    }

    fn record(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Declared catalog of a backend
    pub fn backend(&self, backend_id: &str) -> Option<Arc<Vec<Tool>>> {
        let hit = self
            .backends
            .get(backend_id)
            .filter(|e| self.fresh(e))
            .map(|e| Arc::clone(&e.value));
        if hit.is_none() {
            self.backends.remove_if(backend_id, |_, e| !self.fresh(e));
        }
        self.record(hit.is_some());
        hit
    }

    /// Store a backend catalog unless an invalidation happened since `token`
    pub fn insert_backend(&self, token: CacheToken, backend_id: &str, tools: Arc<Vec<Tool>>) {
        if self.is_current(token) {
            self.backends.insert(
                backend_id.to_string(),
                Entry {
                    value: tools,
                    cached_at: Instant::now(),
                },
            );
        }
    }

    /// Aggregated catalog of an endpoint
    pub fn endpoint(&self, endpoint_id: &str) -> Option<Arc<Vec<Tool>>> {
        let hit = self
            .endpoints
            .get(endpoint_id)
            .filter(|e| self.fresh(e))
            .map(|e| Arc::clone(&e.value.tools));
        if hit.is_none() {
            self.endpoints.remove_if(endpoint_id, |_, e| !self.fresh(e));
        }
        self.record(hit.is_some());
        hit
    }

    /// Store an aggregate unless an invalidation happened since `token`
    pub fn insert_endpoint(
        &self,
        token: CacheToken,
        endpoint_id: &str,
        children: impl IntoIterator<Item = String>,
        tools: Arc<Vec<Tool>>,
    ) {
        if self.is_current(token) {
            self.endpoints.insert(
                endpoint_id.to_string(),
                Entry {
                    value: Aggregate {
                        tools,
                        children: children.into_iter().collect(),
                    },
                    cached_at: Instant::now(),
                },
            );
        }
    }

    /// Drop a backend's catalog and every aggregate that includes it
    pub fn invalidate_backend(&self, backend_id: &str) -> usize {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut dropped = usize::from(self.backends.remove(backend_id).is_some());
        let before = self.endpoints.len();
        self.endpoints
            .retain(|_, e| !e.value.children.contains(backend_id));
        dropped += before - self.endpoints.len();
        self.invalidations
            .fetch_add(u64::try_from(dropped).unwrap_or(u64::MAX), Ordering::Relaxed);
        dropped
    }

    /// Drop one endpoint's aggregate
    pub fn invalidate_endpoint(&self, endpoint_id: &str) -> bool {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let dropped = self.endpoints.remove(endpoint_id).is_some();
        if dropped {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        dropped
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> CatalogCacheStats {
        CatalogCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}
