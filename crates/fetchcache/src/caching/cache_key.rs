use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Method, ResponseType};

/// The canonical identity of a cacheable request.
///
/// A [`CacheKey`] is the lowercased concatenation of the request URL and its serialized
/// transport options. It is used as the key of the in-memory tier, the single-flight registry,
/// and, with the configured prefix, as the key in the persistent store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Builds the key from a URL and its transport options.
    ///
    /// `post_cache_key` stands in for a request body that is otherwise not part of the key.
    pub fn new(url: &str, transport: &TransportOptions, post_cache_key: Option<&str>) -> Self {
        let options = KeyMaterial {
            method: transport.method,
            headers: &transport.headers,
            response_type: transport.response_type,
        };
        // Serializing a struct of enums and a string map cannot fail.
        let options = serde_json::to_string(&options).unwrap_or_default();

        let mut key = format!("{url}|{options}");
        if let Some(post_cache_key) = post_cache_key {
            key.push('|');
            key.push_str(post_cache_key);
        }
        Self(key.to_lowercase().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key under which the payload is kept in the persistent store.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.0)
    }

    #[cfg(test)]
    pub fn for_testing(key: &str) -> Self {
        Self(key.to_lowercase().into())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The transport-relevant part of a request that is serialized into the [`CacheKey`].
#[derive(Serialize)]
struct KeyMaterial<'a> {
    method: Method,
    headers: &'a BTreeMap<String, String>,
    response_type: ResponseType,
}

/// All options a caller may pass along with a request.
///
/// These are split by [`normalize`] into [`TransportOptions`] and [`CacheOptions`], which are
/// never merged back together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    /// The HTTP method; inferred from the presence of a body when absent.
    pub method: Option<Method>,
    /// Request headers. Header names are lowercased during normalization.
    pub headers: BTreeMap<String, String>,
    /// How the response body should be interpreted.
    pub response_type: ResponseType,
    /// Whether cached results may be served at all.
    pub allow_cache: bool,
    /// Skips cache lookups and always issues a fresh transport call.
    pub force_cache_update: bool,
    /// A per-call freshness threshold, evaluated against the entry's write time.
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
    /// The hard TTL for the persistent tier. Without it, results stay in memory only.
    #[serde(with = "humantime_serde")]
    pub local_storage_expiration: Option<Duration>,
    /// Makes a request with a body cacheable, e.g. for read-style POST queries.
    pub post_cache_key: Option<String>,
}

/// Options that are relevant to issuing the transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub response_type: ResponseType,
}

/// Options that are relevant to the cache tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOptions {
    pub allow_cache: bool,
    pub force_cache_update: bool,
    pub max_age: Option<Duration>,
    pub local_storage_expiration: Option<Duration>,
}

/// The outcome of [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRequest {
    pub transport: TransportOptions,
    pub cache: CacheOptions,
    /// `None` for requests that must not be cached or coalesced.
    pub cache_key: Option<CacheKey>,
}

/// Splits caller options into their transport and cache parts and derives the [`CacheKey`].
///
/// A request with a body only gets a key if it carries an explicit `post_cache_key`, as a body
/// usually marks a mutating call that must not be deduplicated.
pub fn normalize(url: &str, has_body: bool, options: RequestOptions) -> NormalizedRequest {
    let RequestOptions {
        method,
        headers,
        response_type,
        allow_cache,
        force_cache_update,
        max_age,
        local_storage_expiration,
        post_cache_key,
    } = options;

    let method = method.unwrap_or(if has_body { Method::Post } else { Method::Get });
    let headers = headers
        .into_iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect();

    let transport = TransportOptions {
        method,
        headers,
        response_type,
    };
    let cache = CacheOptions {
        allow_cache,
        force_cache_update,
        max_age,
        local_storage_expiration,
    };

    let cache_key = if has_body && post_cache_key.is_none() {
        None
    } else {
        Some(CacheKey::new(url, &transport, post_cache_key.as_deref()))
    };

    NormalizedRequest {
        transport,
        cache,
        cache_key,
    }
}
