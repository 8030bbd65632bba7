//! The expiration ledger.
//!
//! A single persisted JSON object maps every persisted payload key to its expiration time,
//! next to the identifier of the build that wrote it:
//!
//! ```json
//! {"build": "25.6.2", "fetchcache:/_api/web|{...}": "2026-10-18T12:00:00Z"}
//! ```
//!
//! The ledger is loaded lazily on first access. When it was written by another build, all
//! persisted payloads are dropped and a fresh ledger is started.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Storage;

/// The reserved key holding the ledger.
pub const LEDGER_KEY: &str = "fetchcache-expirations";

type Expirations = BTreeMap<String, DateTime<Utc>>;

#[derive(Debug, Deserialize)]
struct LedgerData {
    #[serde(default)]
    build: String,
    #[serde(flatten)]
    expirations: Expirations,
}

/// Per-key expiration records of the persistent tier.
#[derive(Debug)]
pub struct ExpirationLedger {
    storage: Storage,
    build: String,
    prefix: String,
    state: Mutex<Option<Expirations>>,
}

impl ExpirationLedger {
    pub fn new(storage: Storage, build: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            build: build.into(),
            prefix: prefix.into(),
            state: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Expirations>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` on the loaded ledger, persisting it afterwards if `f` returns `true`.
    fn with_expirations<R>(&self, f: impl FnOnce(&mut Expirations) -> (R, bool)) -> R {
        let mut state = self.lock();
        let expirations = state.get_or_insert_with(|| self.load());
        let (result, changed) = f(expirations);
        if changed {
            self.persist(expirations);
        }
        result
    }

    fn load(&self) -> Expirations {
        let Some(raw) = self.storage.get(LEDGER_KEY) else {
            return Expirations::new();
        };

        let data = match serde_json::from_str::<LedgerData>(&raw) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    "Expiration ledger is corrupted, starting over"
                );
                self.storage.remove(LEDGER_KEY);
                return Expirations::new();
            }
        };

        if data.build != self.build {
            tracing::debug!(
                previous = %data.build,
                current = %self.build,
                "Build changed, dropping all persisted entries"
            );
            self.drop_build(data.expirations);
            return Expirations::new();
        }

        data.expirations
    }

    /// Removes everything the previous build persisted and writes a fresh ledger.
    fn drop_build(&self, expirations: Expirations) {
        let mut removed: i64 = 0;
        for key in expirations.into_keys() {
            self.storage.remove(&key);
            removed += 1;
        }
        for key in self.storage.list_keys() {
            if key.starts_with(&self.prefix) {
                self.storage.remove(&key);
                removed += 1;
            }
        }
        metric!(counter("caches.purge.removed") += removed, "reason" => "build");
        self.persist(&Expirations::new());
    }

    fn persist(&self, expirations: &Expirations) {
        #[derive(Serialize)]
        struct LedgerRef<'a> {
            build: &'a str,
            #[serde(flatten)]
            expirations: &'a Expirations,
        }

        let data = LedgerRef {
            build: &self.build,
            expirations,
        };
        match serde_json::to_string(&data) {
            Ok(raw) => {
                self.storage.set(LEDGER_KEY, &raw);
            }
            Err(e) => tracing::error!(
                error = &e as &dyn std::error::Error,
                "Failed to serialize expiration ledger"
            ),
        }
    }

    /// Records when the persisted value under `key` expires.
    pub fn record_expiration(&self, key: &str, expires_at: DateTime<Utc>) {
        self.with_expirations(|expirations| {
            expirations.insert(key.to_owned(), expires_at);
            ((), true)
        })
    }

    /// Returns the expiration time of a valid record.
    ///
    /// A missing record counts as expired. A past-due record is removed from the ledger
    /// together with its persisted value.
    pub fn valid_until(&self, key: &str) -> Option<DateTime<Utc>> {
        self.with_expirations(|expirations| match expirations.get(key) {
            None => (None, false),
            Some(&expires_at) if expires_at > Utc::now() => (Some(expires_at), false),
            Some(_) => {
                expirations.remove(key);
                self.storage.remove(key);
                (None, true)
            }
        })
    }

    /// Whether the persisted value under `key` must not be served, see [`valid_until`](Self::valid_until).
    pub fn is_expired(&self, key: &str) -> bool {
        self.valid_until(key).is_none()
    }

    /// Drops the record of `key`.
    pub fn remove(&self, key: &str) {
        self.with_expirations(|expirations| {
            let removed = expirations.remove(key).is_some();
            ((), removed)
        })
    }

    /// Removes and returns all records that are past due, or all records if `remove_all` is set.
    pub fn take_expired(&self, remove_all: bool) -> Vec<String> {
        self.with_expirations(|expirations| {
            let now = Utc::now();
            let expired: Vec<_> = expirations
                .iter()
                .filter(|&(_, &expires_at)| remove_all || expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                expirations.remove(key);
            }
            let changed = !expired.is_empty();
            (expired, changed)
        })
    }

    /// All keys that currently have a record.
    pub fn recorded_keys(&self) -> BTreeSet<String> {
        self.with_expirations(|expirations| (expirations.keys().cloned().collect(), false))
    }
}
