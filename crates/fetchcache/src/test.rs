//! Test doubles for the transport layer.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};

use crate::transport::{Transport, TransportError, TransportRequest, TransportResponse};

type Route = Result<(u16, &'static str, Bytes), String>;

/// A [`Transport`] answering from a table of canned responses and recording every request.
///
/// Unknown URLs are answered with an empty `404`.
#[derive(Debug, Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<TransportRequest>>,
    delay: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response, to keep requests in flight for a while.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) {
        let status_text = match status {
            200 => "OK",
            404 => "Not Found",
            500 => "Internal Server Error",
            _ => "",
        };
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_owned(), Ok((status, status_text, body.into())));
    }

    pub fn fail(&self, url: &str, message: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_owned(), Err(message.to_owned()));
    }

    /// The number of requests sent so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn answer(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let route = self.routes.lock().unwrap().get(&request.url).cloned();
        self.requests.lock().unwrap().push(request);

        match route {
            Some(Ok((status, status_text, body))) => Ok(TransportResponse {
                status,
                status_text: status_text.to_owned(),
                body,
            }),
            Some(Err(message)) => Err(TransportError::Other(message)),
            None => Ok(TransportResponse {
                status: 404,
                status_text: "Not Found".to_owned(),
                body: Bytes::new(),
            }),
        }
    }
}

impl Transport for MockTransport {
    fn send(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        let delay = self.delay;
        let response = self.answer(request);
        async move {
            tokio::time::sleep(delay).await;
            response
        }
        .boxed()
    }

    fn send_blocking(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        std::thread::sleep(self.delay);
        self.answer(request)
    }
}
