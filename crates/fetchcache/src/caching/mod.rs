//! # Caching infrastructure
//!
//! Every outbound request that goes through [`FetchCache`](crate::FetchCache) passes through
//! the caching layer, which decides whether the request hits the network at all, collapses
//! identical in-flight requests into one, and keeps results across process restarts.
//!
//! ## Cache Layers
//!
//! - An in-memory tier ([`MemoryTier`]) living as long as the process. It holds successes and
//!   failures, including results that cannot be persisted such as binary payloads.
//! - An optional persistent tier ([`Storage`] around a [`PersistentStore`]). It only holds
//!   successful text and JSON results for which the caller asked for a
//!   `local_storage_expiration`. Failures are never persisted.
//! - Request coalescing ([`Coordinator`]), which is always active for requests that have a
//!   [`CacheKey`], independent of whether cached results may be served.
//!
//! A request goes through the following steps:
//! - Its options are split into transport and cache options, and its [`CacheKey`] is derived
//!   ([`normalize`]).
//! - If `allow_cache` is set, the in-memory tier and then the persistent tier are consulted.
//! - On miss, the request attaches to an identical in-flight request, or starts a new one.
//! - The result of the transport call is written to the tiers before any waiter is notified.
//!
//! The blocking request path consults and writes the tiers, but does not take part in request
//! coalescing.
//!
//! ### Expiration
//!
//! Each persisted payload has a record in the [`ExpirationLedger`]. A payload without a record,
//! or with a past-due record, is never served. The ledger carries the build identifier, and
//! everything persisted by a different build is dropped when the ledger is first loaded.
//!
//! Independent of that hard expiration, callers can pass a `max_age`. Entries written longer
//! ago than that are treated as a miss for that caller, but remain available for others.
//!
//! A [`purge`] removes expired entries, entries from legacy ledger formats, and entries with the
//! key prefix but without a ledger record. It runs once shortly after startup, see
//! [`FetchCache::spawn_purge`](crate::FetchCache::spawn_purge).
//!
//! ### Metrics
//!
//! - `caches.access`: All lookups that were allowed to be served from cache.
//! - `caches.memory.hit`: Lookups served by the in-memory tier.
//! - `caches.persistent.hit`: Lookups served by the persistent tier.
//! - `caches.soft_expired`: Lookups that found an entry older than their `max_age`.
//! - `caches.coalesced`: Requests that attached to an in-flight request.
//! - `caches.transport`: Actual transport calls.
//! - `caches.transport.duration`: Time spent in transport calls, tagged by `mode`.
//! - `caches.in_flight`: Number of keys with an in-flight request, sampled when one starts.
//! - `caches.persistent.write`: Entries written to the persistent tier.
//! - `caches.purge.removed`: Entries removed by a purge, tagged by `reason`.
//!
//! ## Errors
//!
//! Only [`FetchError`]s, which describe the outcome of the transport call, ever reach a caller.
//! Failures of the caching layer itself are logged and degrade gracefully: an unavailable store
//! acts like no store, an entry that cannot be encoded is not persisted, and a corrupted ledger
//! is treated as empty.

mod cache_error;
mod cache_key;
mod cleanup;
mod coordinator;
mod entry;
mod ledger;
mod memory;
pub mod serializer;
mod storage;
mod two_tier;


pub use cache_error::FetchError;
pub use cache_key::{
    CacheKey, CacheOptions, NormalizedRequest, RequestOptions, TransportOptions, normalize,
};
pub use cleanup::{
    LEGACY_EPOCH_LEDGER_KEY, LEGACY_MAP_LEDGER_KEY, PURGE_FLAG_KEY, PurgeStats, mark_purged,
    purge, purged_recently,
};
pub use coordinator::Coordinator;
pub use entry::CacheEntry;
pub use ledger::{ExpirationLedger, LEDGER_KEY};
pub use memory::MemoryTier;
pub use storage::{FsStore, MemoryStore, PersistentStore, Storage};
pub use two_tier::TwoTierCache;
