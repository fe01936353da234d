//! The HTTP transport seam.
//!
//! This module defines the narrow [`HttpTransport`] trait that
//! [`crate::sts`], [`crate::iam`], and [`crate::sources`] depend on, plus a
//! `reqwest`-backed default implementation. Tests substitute an in-memory
//! fake so single-flight and retry behavior can be checked without real
//! sockets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// A minimal HTTP request, transport-agnostic.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method (e.g. `GET`, `POST`, `PUT`).
    pub method: http::Method,
    /// Absolute request URL.
    pub url: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub body: Option<Bytes>,
    /// Per-request timeout override.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Builds a `GET` request with no body.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: http::Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Builds a `POST` request with the given body.
    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: http::Method::POST,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body.into()),
            timeout: None,
        }
    }

    /// Builds a `PUT` request with the given body.
    pub fn put(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: http::Method::PUT,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body.into()),
            timeout: None,
        }
    }

    /// Adds a header, returning `self` for chaining.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets a per-request timeout, returning `self` for chaining.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The first header value matching `name`, case-insensitively. Distinct
    /// from the builder's [`Self::header`] (which takes a name/value pair
    /// and returns `Self`); this is the read-only counterpart used by tests
    /// inspecting a captured request.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A minimal HTTP response, transport-agnostic.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// `true` iff `status` is in `200..300`.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The response body decoded as UTF-8 text.
    pub fn text(&self) -> std::result::Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.to_vec())
    }

    /// The response body parsed as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// The first header value matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An executor for [`HttpRequest`]s. Implemented by [`ReqwestTransport`] by
/// default; tests implement it in-process.
#[async_trait]
pub trait HttpTransport: Send + Sync + std::fmt::Debug {
    /// Executes a request, returning the raw response. Transport-level
    /// failures (connection errors, timeouts, DNS failures) are reported
    /// through [`std::io::Error`]; non-2xx status codes are *not* errors at
    /// this layer — callers decide how to interpret the status.
    async fn execute(&self, request: HttpRequest) -> std::io::Result<HttpResponse>;
}

/// A shared, cloneable handle to an [`HttpTransport`].
pub type SharedTransport = Arc<dyn HttpTransport>;

/// The default [`HttpTransport`], backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a transport around a fresh `reqwest::Client` with sane
    /// defaults (30s connect timeout, no overall timeout so per-request
    /// timeouts can be set independently).
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client build with only default/static options cannot fail"),
        }
    }

    /// Wraps an existing `reqwest::Client`, e.g. one configured by the
    /// caller with a custom proxy or root CA bundle.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> std::io::Result<HttpResponse> {
        let mut builder = self.client.request(
            request.method,
            request
                .url
                .parse::<reqwest::Url>()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?,
        );
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(HttpResponse { status, headers, body })
    }
}

/// Returns the default [`SharedTransport`].
pub fn default_transport() -> SharedTransport {
    Arc::new(ReqwestTransport::new())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// A canned, in-process [`HttpTransport`] that replays a fixed sequence
    /// of responses (or a closure) and records every request it received.
    #[derive(Debug)]
    pub struct FakeTransport {
        responses: Mutex<Vec<std::io::Result<HttpResponse>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl FakeTransport {
        pub fn new(responses: Vec<std::io::Result<HttpResponse>>) -> Arc<Self> {
            // Reverse so `pop()` yields them in call order.
            let mut responses = responses;
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub fn call_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for FakeTransport {
        async fn execute(&self, request: HttpRequest) -> std::io::Result<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(HttpResponse {
                    status: 500,
                    headers: Vec::new(),
                    body: Bytes::from_static(b"{}"),
                }))
        }
    }

    pub fn json_response(status: u16, body: serde_json::Value) -> HttpResponse {
        HttpResponse {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }
}
