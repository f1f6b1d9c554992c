//! Bounded in-memory cache of cover bytes keyed by storage locator.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::storage::{FetchError, ObjectStore};

/// Default number of covers kept in memory.
pub const DEFAULT_COVER_CACHE_CAPACITY: usize = 512;

struct CachedCover {
    bytes: Arc<[u8]>,
    fetched_at: Instant,
}

/// LRU cache in front of an [`ObjectStore`]. Failures are never cached.
pub struct CoverCache {
    store: Box<dyn ObjectStore>,
    entries: LruCache<String, CachedCover>,
    ttl: Option<Duration>,
    hits: u64,
    misses: u64,
}

impl CoverCache {
    /// Wraps `store`; entries older than `ttl` are refetched.
    pub fn new(store: Box<dyn ObjectStore>, capacity: NonZeroUsize, ttl: Option<Duration>) -> Self {
        Self {
            store,
            entries: LruCache::new(capacity),
            ttl,
            hits: 0,
            misses: 0,
        }
    }

    /// Object bytes for `key`, served from cache when fresh.
    pub fn fetch(&mut self, key: &str) -> Result<Arc<[u8]>, FetchError> {
        let locator = self.store.locator(key);
        let ttl = self.ttl;
        if let Some(entry) = self.entries.get(&locator) {
            let fresh = ttl.map_or(true, |ttl| entry.fetched_at.elapsed() < ttl);
            if fresh {
                self.hits += 1;
                return Ok(Arc::clone(&entry.bytes));
            }
        }
        self.misses += 1;
        let bytes: Arc<[u8]> = self.store.get_object(key)?.into();
        self.entries.put(
            locator,
            CachedCover {
                bytes: Arc::clone(&bytes),
                fetched_at: Instant::now(),
            },
        );
        Ok(bytes)
    }

    /// Entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookups served from memory.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Lookups that went to the store.
    pub fn misses(&self) -> u64 {
        self.misses
    }
}
