use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use super::serializer::{self, clone_entry, is_persistable};
use super::{CacheEntry, CacheKey, CacheOptions, ExpirationLedger, MemoryTier, Storage};

/// How many keys the "cannot persist" warning is deduplicated for.
const WARNED_CAPACITY: u64 = 1024;

/// The in-memory tier layered over the optional persistent tier.
#[derive(Debug)]
pub struct TwoTierCache {
    memory: MemoryTier,
    storage: Storage,
    ledger: ExpirationLedger,
    prefix: String,
    /// Keys for which the "cannot persist" warning was recently emitted.
    warned: moka::sync::Cache<CacheKey, ()>,
}

impl TwoTierCache {
    pub fn new(memory: MemoryTier, storage: Storage, ledger: ExpirationLedger, prefix: &str) -> Self {
        Self {
            memory,
            storage,
            ledger,
            prefix: prefix.to_owned(),
            warned: moka::sync::Cache::new(WARNED_CAPACITY),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn ledger(&self) -> &ExpirationLedger {
        &self.ledger
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Looks up an entry, first in memory, then in the persistent tier.
    ///
    /// Nothing is returned when caching is not allowed or a refresh is forced. Entries older
    /// than `max_age` are reported as a miss, but kept around for callers with a longer or no
    /// `max_age`.
    pub fn get(&self, key: &CacheKey, options: &CacheOptions) -> Option<CacheEntry> {
        if !options.allow_cache || options.force_cache_update {
            return None;
        }
        metric!(counter("caches.access") += 1);

        if let Some(entry) = self.memory.get(key) {
            if is_soft_expired(&entry, options.max_age) {
                tracing::trace!(%key, "Memory entry exceeds max age");
                metric!(counter("caches.soft_expired") += 1, "tier" => "memory");
                return None;
            }
            tracing::trace!(%key, "Memory hit");
            metric!(counter("caches.memory.hit") += 1);
            return Some(entry);
        }

        if !self.storage.is_available() {
            return None;
        }
        let storage_key = key.storage_key(&self.prefix);
        let expires_at = self.ledger.valid_until(&storage_key)?;
        let raw = self.storage.get(&storage_key)?;

        let entry = match serializer::decode(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                sentry::with_scope(
                    |scope| scope.set_extra("key", storage_key.as_str().into()),
                    || {
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            "Failed to decode persisted entry"
                        )
                    },
                );
                self.storage.remove(&storage_key);
                self.ledger.remove(&storage_key);
                return None;
            }
        };

        // Only a negative result for a missing resource is a valid persisted failure.
        if !entry.is_success() && entry.status != 404 {
            tracing::debug!(%key, status = entry.status, "Dropping persisted failure");
            self.storage.remove(&storage_key);
            self.ledger.remove(&storage_key);
            return None;
        }

        if is_soft_expired(&entry, options.max_age) {
            tracing::trace!(%key, "Persisted entry exceeds max age");
            metric!(counter("caches.soft_expired") += 1, "tier" => "persistent");
            return None;
        }

        tracing::trace!(%key, "Persistent hit");
        metric!(counter("caches.persistent.hit") += 1);

        // Persisted failures are served as they are, but never promoted.
        if entry.is_success() {
            if let Some(remaining) = remaining_ttl(expires_at, Utc::now()) {
                self.memory
                    .insert(key.clone(), clone_entry(&entry), Some(remaining));
            }
        }
        Some(entry)
    }

    /// Stores an entry.
    ///
    /// The in-memory tier is always written. The persistent tier is only written for successful
    /// entries with a persistable payload, and only if a `ttl` was given.
    pub fn set(&self, key: &CacheKey, entry: CacheEntry, ttl: Option<Duration>) {
        let persistable = match &entry.contents {
            Ok(payload) => is_persistable(payload),
            Err(_) => false,
        };

        if let Some(ttl) = ttl {
            if persistable {
                self.persist(key, &entry, ttl);
            } else if entry.is_success() && self.first_warning(key) {
                tracing::warn!(%key, "Result cannot be persisted, keeping it in memory only");
            }
        }

        self.memory.insert(key.clone(), entry, ttl);
    }

    fn persist(&self, key: &CacheKey, entry: &CacheEntry, ttl: Duration) {
        let raw = match serializer::encode(entry) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    %key,
                    "Failed to serialize entry"
                );
                return;
            }
        };

        let storage_key = key.storage_key(&self.prefix);
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        // The record goes first, so that a concurrent purge never sees the value as orphaned.
        self.ledger.record_expiration(&storage_key, expires_at);
        if self.storage.set(&storage_key, &raw) {
            metric!(counter("caches.persistent.write") += 1);
        } else {
            self.ledger.remove(&storage_key);
        }
    }

    fn first_warning(&self, key: &CacheKey) -> bool {
        self.warned.entry_by_ref(key).or_insert(()).is_fresh()
    }

    /// Drops the in-memory tier. The persistent tier is left alone.
    pub fn clear_all(&self) {
        self.memory.clear();
    }
}

/// The time left until `expires_at`, or `None` once it has passed.
fn remaining_ttl(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    (expires_at > now)
        .then(|| (expires_at - now).to_std().ok())
        .flatten()
}

fn is_soft_expired(entry: &CacheEntry, max_age: Option<Duration>) -> bool {
    let Some(max_age) = max_age else {
        return false;
    };
    TimeDelta::from_std(max_age)
        .ok()
        .and_then(|max_age| entry.cached_time.checked_add_signed(max_age))
        .is_some_and(|fresh_until| Utc::now() > fresh_until)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_ttl() {
        let now = Utc::now();
        assert_eq!(
            remaining_ttl(now + TimeDelta::seconds(5), now),
            Some(Duration::from_secs(5))
        );
        assert_eq!(remaining_ttl(now, now), None);
        assert_eq!(remaining_ttl(now - TimeDelta::milliseconds(1), now), None);
    }

    #[test]
    fn test_warns_once_per_key() {
        let cache = TwoTierCache::new(
            MemoryTier::new(100),
            Storage::disabled(),
            ExpirationLedger::new(Storage::disabled(), "1", "fetchcache:"),
            "fetchcache:",
        );
        let first = CacheKey::for_testing("/a");
        let second = CacheKey::for_testing("/b");

        assert!(cache.first_warning(&first));
        assert!(!cache.first_warning(&first));
        assert!(cache.first_warning(&second));
    }
}
