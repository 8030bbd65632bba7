use std::time::{Duration, Instant};

use super::{CacheEntry, CacheKey};

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct InMemoryItem {
    /// When to evict this item, `None` keeps it for the lifetime of the process.
    deadline: Option<Instant>,
    /// The cached entry.
    entry: CacheEntry,
}

/// A struct implementing [`moka::Expiry`] that uses the [`InMemoryItem`] deadline as the
/// explicit expiration time.
struct CacheExpiration;

impl CacheExpiration {
    fn remaining(current_time: Instant, item: &InMemoryItem) -> Option<Duration> {
        item.deadline
            .map(|deadline| deadline.saturating_duration_since(current_time))
    }
}

impl moka::Expiry<CacheKey, InMemoryItem> for CacheExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &InMemoryItem,
        current_time: Instant,
    ) -> Option<Duration> {
        Self::remaining(current_time, value)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &InMemoryItem,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        Self::remaining(current_time, value)
    }
}

/// The process-lifetime tier, holding successes and failures alike.
#[derive(Clone)]
pub struct MemoryTier {
    cache: moka::sync::Cache<CacheKey, InMemoryItem>,
}

impl std::fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl MemoryTier {
    pub fn new(capacity: u64) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(capacity)
            .name("fetchcache")
            .expire_after(CacheExpiration)
            .build();
        Self { cache }
    }

    /// Returns a live entry. The cache hands out its own copy, which the caller owns.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let item = self.cache.get(key)?;
        if item
            .deadline
            .is_some_and(|deadline| deadline <= Instant::now())
        {
            self.cache.invalidate(key);
            return None;
        }
        Some(item.entry)
    }

    /// Stores an entry, evicting it after `ttl` if one is given.
    pub fn insert(&self, key: CacheKey, entry: CacheEntry, ttl: Option<Duration>) {
        let deadline = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.cache.insert(key, InMemoryItem { deadline, entry });
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}
