//! Single bounded network fetch with outcome classification
//!
//! The fetcher performs exactly one request under a caller-supplied timeout
//! and classifies the result; it never retries. Transport is a trait so the
//! retry coordinator and pipeline tests run against scripted stubs instead
//! of the network.

use crate::rate_limit::Permit;
use crate::types::{FetchOutcome, RequestDescriptor};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Transport-level failure, before HTTP status classification
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

/// Minimal HTTP response view the classifier needs
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// One-shot HTTP GET abstraction
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a single GET presenting the given client identity
    async fn get(
        &self,
        url: &str,
        identity: &str,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn get(
        &self,
        url: &str,
        identity: &str,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        (**self).get(url, identity, timeout).await
    }
}

/// Production transport backed by reqwest
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, paddock_common::Error> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| paddock_common::Error::Internal(format!("http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        identity: &str,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, identity)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else if e.is_builder() || e.is_request() {
                    TransportError::MalformedRequest(e.to_string())
                } else {
                    TransportError::Connection(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        Ok(HttpResponse { status, body })
    }
}

/// Issues one bounded request per call; no retry logic here
pub struct Fetcher<T: Transport> {
    transport: T,
    timeout: Duration,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Perform one network call and classify the outcome.
    ///
    /// Timeouts, connection errors, 5xx and rate-limit responses are
    /// transient; other 4xx and malformed descriptors are permanent.
    pub async fn fetch(&self, request: &RequestDescriptor, permit: &Permit) -> FetchOutcome {
        tracing::debug!(
            source = %request.source_id,
            url = %request.url,
            identity = %permit.identity,
            "issuing fetch"
        );

        let result = self
            .transport
            .get(&request.url, &permit.identity, self.timeout)
            .await;

        match result {
            Ok(response) => classify_status(response),
            Err(TransportError::Timeout) => {
                FetchOutcome::TransientFailure("request timed out".to_string())
            }
            Err(TransportError::Connection(reason)) => FetchOutcome::TransientFailure(reason),
            Err(TransportError::MalformedRequest(reason)) => {
                FetchOutcome::PermanentFailure(reason)
            }
        }
    }
}

fn classify_status(response: HttpResponse) -> FetchOutcome {
    match response.status {
        200..=299 => FetchOutcome::Success(response.body),
        // Rate-limit pushback is retryable after backoff
        429 => FetchOutcome::TransientFailure("rate limited (429)".to_string()),
        500..=599 => {
            FetchOutcome::TransientFailure(format!("server error ({})", response.status))
        }
        status => FetchOutcome::PermanentFailure(format!("client error ({})", status)),
    }
}

/// Scripted transport for unit and integration tests; not part of the
/// stable API.
#[doc(hidden)]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted transport: each URL maps to a queue of canned results.
    /// The last entry repeats once the queue drains.
    pub struct StubTransport {
        scripts: Mutex<HashMap<String, Vec<Result<HttpResponse, TransportError>>>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl StubTransport {
        pub fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn script(self, url: &str, results: Vec<Result<HttpResponse, TransportError>>) -> Self {
            self.scripts.lock().unwrap().insert(url.to_string(), results);
            self
        }

        pub fn ok_body(url: &str, body: &str) -> Self {
            Self::new().script(
                url,
                vec![Ok(HttpResponse {
                    status: 200,
                    body: body.to_string(),
                })],
            )
        }

        pub fn call_count(&self, url: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn get(
            &self,
            url: &str,
            _identity: &str,
            _timeout: Duration,
        ) -> Result<HttpResponse, TransportError> {
            self.calls.lock().unwrap().push(url.to_string());

            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts
                .get_mut(url)
                .unwrap_or_else(|| panic!("no script for {}", url));
            let result = if queue.len() > 1 {
                queue.remove(0)
            } else {
                clone_result(&queue[0])
            };
            result
        }
    }

    fn clone_result(
        result: &Result<HttpResponse, TransportError>,
    ) -> Result<HttpResponse, TransportError> {
        match result {
            Ok(response) => Ok(response.clone()),
            Err(TransportError::Timeout) => Err(TransportError::Timeout),
            Err(TransportError::Connection(s)) => Err(TransportError::Connection(s.clone())),
            Err(TransportError::MalformedRequest(s)) => {
                Err(TransportError::MalformedRequest(s.clone()))
            }
        }
    }
}
