use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::ledger::LEDGER_KEY;
use super::{ExpirationLedger, Storage};

/// Ledger written by older builds, mapping keys to epoch milliseconds.
pub const LEGACY_EPOCH_LEDGER_KEY: &str = "fetchcache_expirations";

/// Ledger written by older builds, mapping keys to RFC 3339 timestamps.
pub const LEGACY_MAP_LEDGER_KEY: &str = "fetchcache-expiration-map";

/// Holds the time of the last startup purge.
pub const PURGE_FLAG_KEY: &str = "fetchcache-purge";

fn is_reserved(key: &str) -> bool {
    [
        LEDGER_KEY,
        LEGACY_EPOCH_LEDGER_KEY,
        LEGACY_MAP_LEDGER_KEY,
        PURGE_FLAG_KEY,
    ]
    .contains(&key)
}

/// What a [`purge`] run removed and kept.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PurgeStats {
    /// Entries whose ledger record was past due.
    pub removed_expired: usize,
    /// Entries listed in one of the legacy ledgers.
    pub removed_legacy: usize,
    /// Prefixed entries without any ledger record.
    pub removed_orphans: usize,
    /// Entries with a valid ledger record.
    pub retained: usize,
}

impl PurgeStats {
    pub fn removed(&self) -> usize {
        self.removed_expired + self.removed_legacy + self.removed_orphans
    }
}

/// Removes expired entries from the persistent tier.
///
/// With `remove_all`, every entry recorded in the ledger is removed regardless of its
/// expiration. Entries of the legacy ledger formats are always removed along with the legacy
/// ledgers themselves. Finally, all keys carrying `prefix` that have no ledger record are
/// swept.
pub fn purge(
    storage: &Storage,
    ledger: &ExpirationLedger,
    prefix: &str,
    remove_all: bool,
) -> PurgeStats {
    let mut stats = PurgeStats::default();
    if !storage.is_available() {
        tracing::debug!("No persistent storage, skipping purge");
        return stats;
    }

    for key in ledger.take_expired(remove_all) {
        storage.remove(&key);
        stats.removed_expired += 1;
    }

    let recorded = ledger.recorded_keys();
    stats.removed_legacy += purge_legacy_ledger(storage, LEGACY_EPOCH_LEDGER_KEY, &recorded);
    stats.removed_legacy += purge_legacy_ledger(storage, LEGACY_MAP_LEDGER_KEY, &recorded);

    // Records are written before their values, so listing first never misses a record.
    let keys = storage.list_keys();
    let recorded = ledger.recorded_keys();
    for key in keys {
        if !key.starts_with(prefix) || is_reserved(&key) {
            continue;
        }
        if recorded.contains(&key) {
            stats.retained += 1;
        } else {
            tracing::trace!(%key, "Removing entry without ledger record");
            storage.remove(&key);
            stats.removed_orphans += 1;
        }
    }

    tracing::debug!(
        "Purge removed {} expired, {} legacy and {} orphaned entries, retained {}",
        stats.removed_expired,
        stats.removed_legacy,
        stats.removed_orphans,
        stats.retained,
    );
    metric!(counter("caches.purge.removed") += stats.removed_expired as i64, "reason" => "expired");
    metric!(counter("caches.purge.removed") += stats.removed_legacy as i64, "reason" => "legacy");
    metric!(counter("caches.purge.removed") += stats.removed_orphans as i64, "reason" => "orphan");

    stats
}

/// Removes all entries listed in a legacy ledger, and the ledger itself.
///
/// Both legacy formats are objects keyed by the full storage key, so the values are not
/// looked at. Entries that have since been rewritten under the current ledger are kept.
fn purge_legacy_ledger(storage: &Storage, ledger_key: &str, recorded: &BTreeSet<String>) -> usize {
    let Some(raw) = storage.get(ledger_key) else {
        return 0;
    };

    let mut removed = 0;
    match serde_json::from_str::<BTreeMap<String, Value>>(&raw) {
        Ok(entries) => {
            for key in entries
                .into_keys()
                .filter(|key| !is_reserved(key) && !recorded.contains(key))
            {
                storage.remove(&key);
                removed += 1;
            }
        }
        Err(e) => tracing::warn!(
            error = &e as &dyn std::error::Error,
            ledger_key,
            "Dropping unreadable legacy ledger"
        ),
    }
    storage.remove(ledger_key);
    removed
}

/// Whether another purge ran less than `guard` ago, according to the persisted purge flag.
pub fn purged_recently(storage: &Storage, guard: Duration) -> bool {
    let Some(last_run) = storage
        .get(PURGE_FLAG_KEY)
        .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
    else {
        return false;
    };
    match (Utc::now() - last_run).to_std() {
        Ok(elapsed) => elapsed < guard,
        // the flag lies in the future
        Err(_) => true,
    }
}

/// Persists the current time as the time of the last purge.
pub fn mark_purged(storage: &Storage) {
    storage.set(PURGE_FLAG_KEY, &Utc::now().to_rfc3339());
}
