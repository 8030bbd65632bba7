//! Classification, per-caller copies and the persisted representation of results.
//!
//! Text and JSON payloads are plain data and may be written to the persistent tier. Binary and
//! document payloads are runtime handles: they live in the in-memory tier for the lifetime of
//! the process, but are never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::Payload;

use super::{CacheEntry, FetchError};

/// Write time assumed for persisted entries that were written without one.
///
/// Being far in the past, any max-age check against it reports the entry as expired.
pub const LEGACY_CACHED_TIME: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// An error turning an entry into its persisted form.
#[derive(Debug, Error)]
pub enum SerializeError {
    /// The payload is a runtime handle that cannot be persisted.
    #[error("{0} payloads cannot be persisted")]
    NotPersistable(&'static str),
    /// Serializing to JSON failed.
    #[error("failed to serialize entry")]
    Json(#[from] serde_json::Error),
}

/// Whether the payload is plain data that may be written to the persistent tier.
pub fn is_persistable(payload: &Payload) -> bool {
    matches!(payload, Payload::Text(_) | Payload::Json(_))
}

/// Creates a copy of a payload for one caller.
///
/// Plain data is deep-copied, so that a caller mutating its copy can neither corrupt the cached
/// value nor another caller's view. Binary handles are immutable and reference counted, so all
/// callers share the same buffer.
pub fn clone_for_caller(payload: &Payload) -> Payload {
    match payload {
        Payload::Text(text) => Payload::Text(text.as_str().to_owned()),
        Payload::Json(value) => Payload::Json(value.clone()),
        Payload::Blob(bytes) => Payload::Blob(bytes.clone()),
        Payload::ArrayBuffer(bytes) => Payload::ArrayBuffer(bytes.clone()),
        Payload::Document(bytes) => Payload::Document(bytes.clone()),
    }
}

/// Creates a copy of a whole entry for one caller, see [`clone_for_caller`].
pub fn clone_entry(entry: &CacheEntry) -> CacheEntry {
    CacheEntry {
        status: entry.status,
        contents: match &entry.contents {
            Ok(payload) => Ok(clone_for_caller(payload)),
            Err(err) => Err(err.clone()),
        },
        cached_time: entry.cached_time,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PersistedKind {
    Text,
    #[default]
    Json,
}

/// The persisted representation of a [`CacheEntry`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedEntry {
    status: u16,
    success: bool,
    #[serde(default)]
    kind: PersistedKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_data: Option<Value>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    cached_time: Option<DateTime<Utc>>,
}

/// Turns an entry into the string stored in the persistent tier.
pub fn encode(entry: &CacheEntry) -> Result<String, SerializeError> {
    let persisted = match &entry.contents {
        Ok(Payload::Text(text)) => PersistedEntry {
            status: entry.status,
            success: true,
            kind: PersistedKind::Text,
            result: Some(Value::String(text.clone())),
            error_message: None,
            error_data: None,
            cached_time: Some(entry.cached_time),
        },
        Ok(Payload::Json(value)) => PersistedEntry {
            status: entry.status,
            success: true,
            kind: PersistedKind::Json,
            result: Some(value.clone()),
            error_message: None,
            error_data: None,
            cached_time: Some(entry.cached_time),
        },
        Ok(Payload::Blob(_)) => return Err(SerializeError::NotPersistable("blob")),
        Ok(Payload::ArrayBuffer(_)) => return Err(SerializeError::NotPersistable("arraybuffer")),
        Ok(Payload::Document(_)) => return Err(SerializeError::NotPersistable("document")),
        Err(err) => PersistedEntry {
            status: entry.status,
            success: false,
            kind: PersistedKind::default(),
            result: None,
            error_message: Some(err.message()),
            error_data: err.data().cloned(),
            cached_time: Some(entry.cached_time),
        },
    };
    Ok(serde_json::to_string(&persisted)?)
}

/// Parses an entry from the persistent tier.
///
/// A missing `cachedTime` is backfilled with [`LEGACY_CACHED_TIME`].
pub fn decode(raw: &str) -> Result<CacheEntry, serde_json::Error> {
    let persisted: PersistedEntry = serde_json::from_str(raw)?;
    let cached_time = persisted.cached_time.unwrap_or(LEGACY_CACHED_TIME);

    let contents = if persisted.success {
        let result = persisted.result.unwrap_or(Value::Null);
        match (persisted.kind, result) {
            (PersistedKind::Text, Value::String(text)) => Ok(Payload::Text(text)),
            (PersistedKind::Text, other) => Ok(Payload::Text(other.to_string())),
            (PersistedKind::Json, value) => Ok(Payload::Json(value)),
        }
    } else {
        let message = persisted.error_message.unwrap_or_default();
        Err(match persisted.status {
            0 => FetchError::Transport(message),
            status => FetchError::Status {
                status,
                message,
                data: persisted.error_data,
            },
        })
    };

    Ok(CacheEntry {
        status: persisted.status,
        contents,
        cached_time,
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_is_persistable() {
        assert!(is_persistable(&Payload::Text("ok".into())));
        assert!(is_persistable(&Payload::Json(json!({"a": 1}))));
        assert!(is_persistable(&Payload::Json(json!(null))));
        assert!(!is_persistable(&Payload::Blob(Bytes::from_static(b"\x89PNG"))));
        assert!(!is_persistable(&Payload::ArrayBuffer(Bytes::new())));
        assert!(!is_persistable(&Payload::Document(Bytes::from_static(
            b"<html></html>"
        ))));
    }

    #[test]
    fn test_clone_is_deep() {
        let original = Payload::Json(json!({"items": [1, 2, 3]}));
        let mut copy = clone_for_caller(&original);

        if let Payload::Json(value) = &mut copy {
            value["items"].as_array_mut().unwrap().push(json!(4));
        }

        assert_eq!(original, Payload::Json(json!({"items": [1, 2, 3]})));
        assert_eq!(copy, Payload::Json(json!({"items": [1, 2, 3, 4]})));
    }

    #[test]
    fn test_binary_handles_are_shared() {
        let original = Payload::Blob(Bytes::from(vec![1, 2, 3]));
        let copy = clone_for_caller(&original);
        assert_eq!(
            original.as_bytes().unwrap().as_ptr(),
            copy.as_bytes().unwrap().as_ptr()
        );
    }

    #[test]
    fn test_encode_decode_text() {
        let entry = CacheEntry::success(200, Payload::Text("A".into()));
        let raw = encode(&entry).unwrap();
        let decoded = decode(&raw).unwrap();

        assert_eq!(decoded.status, 200);
        assert_eq!(decoded.contents, Ok(Payload::Text("A".into())));
        assert_eq!(
            decoded.cached_time.timestamp_millis(),
            entry.cached_time.timestamp_millis()
        );
    }

    #[test]
    fn test_encode_failure() {
        let entry = CacheEntry::failure(FetchError::Status {
            status: 404,
            message: "Not Found".into(),
            data: Some(json!({"code": "-2147024894"})),
        });
        let raw = encode(&entry).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["success"], json!(false));
        assert_eq!(value["status"], json!(404));
        assert_eq!(value["errorMessage"], json!("Not Found"));
        assert_eq!(value["errorData"], json!({"code": "-2147024894"}));
        assert!(value.get("result").is_none());

        let decoded = decode(&raw).unwrap();
        assert!(decoded.contents.unwrap_err().is_not_found());
    }

    #[test]
    fn test_encode_binary_fails() {
        let entry = CacheEntry::success(200, Payload::Blob(Bytes::from_static(b"blob")));
        assert!(matches!(
            encode(&entry),
            Err(SerializeError::NotPersistable("blob"))
        ));
    }

    #[test]
    fn test_decode_legacy_without_cached_time() {
        let decoded = decode(r#"{"status": 200, "success": true, "result": {"Title": "Docs"}}"#)
            .unwrap();

        assert_eq!(decoded.cached_time, LEGACY_CACHED_TIME);
        assert_eq!(decoded.contents, Ok(Payload::Json(json!({"Title": "Docs"}))));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"success": true}"#).is_err());
    }
}
