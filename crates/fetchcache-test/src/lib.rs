//! Helpers for testing the fetch cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the persistent tier silently loses
//!    everything written so far, which makes restart tests pass for the wrong reason. Assign it
//!    to a variable in the test function (e.g. `let _cache_dir = test::tempdir()`).
//!
//!  - When using [`HitCounter`], make sure that the server is held until all requests to it
//!    have been made. Once dropped, connections to its port are refused.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{self, Request};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `fetchcache` crate and mutes all
///    other logs (such as reqwest or hyper).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("fetchcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A server counting the requests it receives.
///
/// It serves the following routes:
///
///  - `/text/*tail` responds with `tail` as text.
///  - `/json/*tail` responds with `{"path": tail}`.
///  - `/delay/:time/*tail` waits for the given duration, e.g. `100ms`, and then responds with
///    `tail` as text.
///  - `/respond_statuscode/:num/*tail` responds with the given status and `{"error": tail}`.
///  - `POST /echo/*tail` responds with the request body.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri, req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/text/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .route(
                "/json/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move {
                    Json(json!({ "path": tail }))
                }),
            )
            .route(
                "/delay/:time/*tail",
                get(
                    |extract::Path((time, tail)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;
                        tail
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, tail)): extract::Path<(u16, String)>| async move {
                        let status =
                            StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                        (status, Json(json!({ "error": tail })))
                    },
                ),
            )
            .route("/echo/*tail", post(|body: String| async move { body }))
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the number of requests received since the last call, and resets the counts.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the requests per URI received since the last call, and resets the counts.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> String {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}
