use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The HTTP method of an outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selects how a response body is interpreted.
///
/// Only [`Text`](Self::Text) and [`Json`](Self::Json) produce results that may be persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Text,
    Json,
    Blob,
    ArrayBuffer,
    Document,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Blob => "blob",
            Self::ArrayBuffer => "arraybuffer",
            Self::Document => "document",
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A plain text body.
    Text(String),
    /// A structured JSON body.
    Json(Value),
    /// An opaque binary handle.
    Blob(Bytes),
    /// Raw bytes, as requested via [`ResponseType::ArrayBuffer`].
    ArrayBuffer(Bytes),
    /// A markup document that is only meaningful for the lifetime of the process.
    Document(Bytes),
}

impl Payload {
    /// Returns the textual content of a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the JSON value of a JSON payload.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the raw bytes of a binary payload.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Blob(bytes) | Self::ArrayBuffer(bytes) | Self::Document(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// A successful response handed to a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The HTTP status of the original transport call.
    pub status: u16,
    /// The parsed body.
    pub payload: Payload,
    /// When the underlying cache entry was written.
    pub cached_time: DateTime<Utc>,
}
