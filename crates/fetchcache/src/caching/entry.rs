use chrono::{DateTime, Utc};

use crate::types::{Payload, Response};

use super::FetchError;

/// The outcome of a transport call, as held by the cache tiers.
///
/// Exactly one of "success with a result" or "failure with error details" holds, which is
/// encoded by [`contents`](Self::contents) being a [`Result`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T = Payload> {
    /// The HTTP status of the response, `0` if none was received.
    pub status: u16,
    /// The entry itself.
    pub contents: Result<T, FetchError>,
    /// When this entry was written; the basis of soft max-age checks.
    pub cached_time: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    /// Creates a successful entry stamped with the current time.
    pub fn success(status: u16, result: T) -> Self {
        Self {
            status,
            contents: Ok(result),
            cached_time: Utc::now(),
        }
    }

    /// Creates a failed entry stamped with the current time.
    pub fn failure(err: FetchError) -> Self {
        Self {
            status: err.status(),
            contents: Err(err),
            cached_time: Utc::now(),
        }
    }

    /// Whether this entry holds a result.
    pub fn is_success(&self) -> bool {
        self.contents.is_ok()
    }

    /// Returns a reference to this entry's contents.
    pub fn contents(&self) -> &Result<T, FetchError> {
        &self.contents
    }

    /// Maps a function over this entry's result.
    pub fn map<U, F>(self, f: F) -> CacheEntry<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheEntry {
            status: self.status,
            contents: self.contents.map(f),
            cached_time: self.cached_time,
        }
    }
}

impl CacheEntry<Payload> {
    /// Consumes this entry and turns it into what callers get to see.
    pub fn into_response(self) -> Result<Response, FetchError> {
        let Self {
            status,
            contents,
            cached_time,
        } = self;
        contents.map(|payload| Response {
            status,
            payload,
            cached_time,
        })
    }
}
