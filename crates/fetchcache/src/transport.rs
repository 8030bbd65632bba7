//! The HTTP layer beneath the cache.
//!
//! The cache only ever talks to a [`Transport`], which makes it possible to run it against
//! anything that can answer a request. [`ReqwestTransport`] is the implementation used in
//! production.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use thiserror::Error;

use crate::caching::{CacheEntry, FetchError};
use crate::config::TransportConfig;
use crate::types::{Method, Payload, ResponseType};

/// A request as handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub url: String,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
}

/// The raw answer of a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
    pub body: Bytes,
}

/// A request that did not produce any response.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for FetchError {
    fn from(err: TransportError) -> Self {
        FetchError::Transport(err.to_string())
    }
}

/// Sends requests to a remote.
///
/// Transports carry their own timeouts, the cache does not put any limit on how long a request
/// may take.
pub trait Transport: fmt::Debug + Send + Sync {
    /// Sends a request asynchronously.
    fn send(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>>;

    /// Sends a request, blocking the current thread until the response is received.
    ///
    /// This must not be called from within an async context.
    fn send_blocking(&self, request: TransportRequest)
    -> Result<TransportResponse, TransportError>;
}

/// A [`Transport`] backed by [`reqwest`].
#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    config: TransportConfig,
    /// Created on first use, as it must not be created or dropped inside the async runtime.
    blocking: OnceLock<reqwest::blocking::Client>,
}

impl ReqwestTransport {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            config,
            blocking: OnceLock::new(),
        })
    }

    fn blocking_client(&self) -> Result<&reqwest::blocking::Client, TransportError> {
        if let Some(client) = self.blocking.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .gzip(true)
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.timeout)
            .build()?;
        Ok(self.blocking.get_or_init(|| client))
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn status_text(status: reqwest::StatusCode) -> String {
    status.canonical_reason().unwrap_or_default().to_owned()
}

impl Transport for ReqwestTransport {
    fn send(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        let mut builder = self
            .client
            .request(reqwest_method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        async move {
            let response = builder.send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok(TransportResponse {
                status: status.as_u16(),
                status_text: status_text(status),
                body,
            })
        }
        .boxed()
    }

    fn send_blocking(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .blocking_client()?
            .request(reqwest_method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body.to_vec());
        }

        let response = builder.send()?;
        let status = response.status();
        let body = response.bytes()?;
        Ok(TransportResponse {
            status: status.as_u16(),
            status_text: status_text(status),
            body,
        })
    }
}

/// Turns a raw response into a cache entry, interpreting the body as requested.
///
/// Statuses in the 2xx and 3xx ranges are successes. For all other statuses, the body is kept
/// as error data, parsed as JSON if possible.
pub fn parse_response(response: TransportResponse, response_type: ResponseType) -> CacheEntry {
    let TransportResponse {
        status,
        status_text,
        body,
    } = response;

    if !(200..400).contains(&status) {
        let data = (!body.is_empty()).then(|| {
            serde_json::from_slice(&body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
        });
        return CacheEntry::failure(FetchError::Status {
            status,
            message: status_text,
            data,
        });
    }

    let payload = match response_type {
        ResponseType::Text => Payload::Text(String::from_utf8_lossy(&body).into_owned()),
        ResponseType::Json if body.iter().all(u8::is_ascii_whitespace) => Payload::Json(Value::Null),
        ResponseType::Json => match serde_json::from_slice(&body) {
            Ok(value) => Payload::Json(value),
            Err(e) => {
                let mut entry = CacheEntry::failure(FetchError::Malformed(e.to_string()));
                entry.status = status;
                return entry;
            }
        },
        ResponseType::Blob => Payload::Blob(body),
        ResponseType::ArrayBuffer => Payload::ArrayBuffer(body),
        ResponseType::Document => Payload::Document(body),
    };

    CacheEntry::success(status, payload)
}
