//! Secure Token Service client.
//!
//! Builds and executes RFC 8693 token-exchange requests for both the
//! external-account pipeline and server-side downscoping, and parses the
//! access-token / intermediary-token response shapes.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::SharedClock;
use crate::consts::sts_token_url;
use crate::error::{Error, Result, TokenResponseError};
use crate::http_client::{HttpRequest, SharedTransport};
use crate::token::AccessToken;

const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// `requested_token_type` values used across this crate's STS callers.
pub mod requested_token_type {
    /// Plain OAuth2 access token.
    pub const ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";
    /// Intermediary token used to derive client-side CAB tokens.
    pub const ACCESS_BOUNDARY_INTERMEDIARY_TOKEN: &str =
        "urn:ietf:params:oauth:token-type:access_boundary_intermediary_token";
}

/// A builder for an RFC 8693 token-exchange request, enforcing the field
/// rules the STS endpoint expects.
#[derive(Debug, Default, Clone)]
pub struct StsRequestBuilder {
    audience: Option<String>,
    scopes: Vec<String>,
    requested_token_type: Option<String>,
    subject_token: Option<String>,
    subject_token_type: Option<String>,
    actor_token: Option<String>,
    actor_token_type: Option<String>,
    options: Option<serde_json::Value>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl StsRequestBuilder {
    /// Starts a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `audience` field.
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Sets the ordered `scope` list; space-joined when sent, omitted if
    /// empty.
    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Sets `requested_token_type`.
    pub fn requested_token_type(mut self, t: impl Into<String>) -> Self {
        self.requested_token_type = Some(t.into());
        self
    }

    /// Sets the mandatory `subject_token`/`subject_token_type` pair.
    pub fn subject_token(mut self, token: impl Into<String>, token_type: impl Into<String>) -> Self {
        self.subject_token = Some(token.into());
        self.subject_token_type = Some(token_type.into());
        self
    }

    /// Sets the optional `actor_token`/`actor_token_type` pair.
    pub fn actor_token(mut self, token: impl Into<String>, token_type: impl Into<String>) -> Self {
        self.actor_token = Some(token.into());
        self.actor_token_type = Some(token_type.into());
        self
    }

    /// Sets the `options` JSON payload (e.g. `{"userProject": ...}` or a
    /// downscoping `accessBoundary`).
    pub fn options(mut self, options: serde_json::Value) -> Self {
        self.options = Some(options);
        self
    }

    /// Sets HTTP Basic client credentials, sent as `Authorization: Basic
    /// ...` iff both are present.
    pub fn client_credentials(mut self, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self.client_secret = Some(client_secret.into());
        self
    }

    fn into_form(self) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE.to_string()),
            (
                "subject_token",
                self.subject_token.expect("subject_token is mandatory"),
            ),
            (
                "subject_token_type",
                self.subject_token_type.expect("subject_token_type is mandatory"),
            ),
        ];
        if let Some(audience) = self.audience {
            form.push(("audience", audience));
        }
        if !self.scopes.is_empty() {
            form.push(("scope", self.scopes.join(" ")));
        }
        if let Some(t) = self.requested_token_type {
            form.push(("requested_token_type", t));
        }
        if let Some(t) = self.actor_token {
            form.push(("actor_token", t));
        }
        if let Some(t) = self.actor_token_type {
            form.push(("actor_token_type", t));
        }
        if let Some(options) = self.options {
            form.push((
                "options",
                serde_json::to_string(&options).expect("serde_json::Value always serializes"),
            ));
        }
        form
    }
}

#[derive(Debug, Deserialize)]
struct StsRawResponse {
    access_token: String,
    #[serde(default)]
    issued_token_type: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    access_boundary_session_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StsErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// A successful STS response, covering both the plain access-token shape
/// and the intermediary-token shape used by client-side CAB.
#[derive(Debug, Clone)]
pub struct StsResponse {
    /// The exchanged token.
    pub access_token: AccessToken,
    /// Echoes the request's `requested_token_type`, or the server's
    /// default if omitted.
    pub issued_token_type: Option<String>,
    /// A rotated refresh token, if the exchange returned one.
    pub refresh_token: Option<String>,
    /// Present only for `access_boundary_intermediary_token` exchanges:
    /// the base64 AEAD keyset used to locally encrypt CAB rules.
    pub access_boundary_session_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct StsFormRequest;

/// Client for the STS token-exchange endpoint.
#[derive(Debug, Clone)]
pub struct StsClient {
    transport: SharedTransport,
    universe_domain: String,
    clock: SharedClock,
}

/// Exponential backoff retry policy for STS token-exchange requests.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Initial backoff delay.
    pub initial_delay: Duration,
    /// Backoff multiplier applied after each retryable failure.
    pub multiplier: f64,
    /// Randomization factor (0.1 = ±10%) applied to each delay.
    pub randomization: f64,
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            randomization: 0.1,
            max_attempts: 3,
        }
    }
}

impl StsClient {
    /// Builds a client targeting the STS endpoint for `universe_domain`,
    /// using the real wall clock.
    pub fn new(transport: SharedTransport, universe_domain: impl Into<String>) -> Self {
        Self::with_clock(transport, universe_domain, crate::clock::system())
    }

    /// Like [`Self::new`] but with an explicit [`SharedClock`], so
    /// `expires_in` calculations can be driven deterministically in tests.
    pub fn with_clock(transport: SharedTransport, universe_domain: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            transport,
            universe_domain: universe_domain.into(),
            clock,
        }
    }

    /// Executes a token exchange, retrying per `policy` on retryable
    /// statuses and I/O errors.
    pub async fn exchange(&self, request: StsRequestBuilder) -> Result<StsResponse> {
        self.exchange_with_retry(request, RetryPolicy::default()).await
    }

    /// Like [`StsClient::exchange`] but with an explicit [`RetryPolicy`].
    pub async fn exchange_with_retry(&self, request: StsRequestBuilder, policy: RetryPolicy) -> Result<StsResponse> {
        let client_id = request.client_id.clone();
        let client_secret = request.client_secret.clone();
        let form = request.into_form();
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form.iter().map(|(k, v)| (*k, v.as_str())))
            .finish();

        let mut delay = policy.initial_delay;
        let mut last_err = None;
        for attempt in 0..policy.max_attempts {
            let mut req = HttpRequest::post(sts_token_url(&self.universe_domain), body.clone().into_bytes())
                .header("content-type", "application/x-www-form-urlencoded");
            if let (Some(id), Some(secret)) = (&client_id, &client_secret) {
                let basic = base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    format!("{id}:{secret}"),
                );
                req = req.header("authorization", format!("Basic {basic}"));
            }

            match self.transport.execute(req).await {
                Ok(response) if response.is_success() => {
                    let raw: StsRawResponse = response.json()?;
                    let expiration = raw
                        .expires_in
                        .map(|secs| self.clock.now() + chrono::Duration::seconds(secs));
                    return Ok(StsResponse {
                        access_token: AccessToken::new(
                            raw.access_token,
                            expiration,
                            raw.scope
                                .map(|s| s.split_whitespace().map(str::to_string).collect())
                                .unwrap_or_default(),
                        ),
                        issued_token_type: raw.issued_token_type.or(raw.token_type),
                        refresh_token: raw.refresh_token,
                        access_boundary_session_key: raw.access_boundary_session_key,
                    });
                }
                Ok(response) => {
                    let status = response.status;
                    let body: StsErrorBody = response.json().unwrap_or(StsErrorBody {
                        error: None,
                        error_description: None,
                    });
                    let err = TokenResponseError::new(status, body.error, body.error_description);
                    let retryable = err.retryable;
                    last_err = Some(Error::TokenResponse(err));
                    if !retryable || attempt + 1 == policy.max_attempts {
                        break;
                    }
                }
                Err(io_err) => {
                    last_err = Some(Error::Io(io_err));
                    if attempt + 1 == policy.max_attempts {
                        break;
                    }
                }
            }
            debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying STS exchange");
            tokio::time::sleep(jitter(delay, policy.randomization)).await;
            delay = delay.mul_f64(policy.multiplier);
        }
        Err(last_err.expect("loop always executes at least once"))
    }
}

fn jitter(delay: Duration, randomization: f64) -> Duration {
    use rand::Rng;
    let jitter_range = delay.as_secs_f64() * randomization;
    let offset = rand::rng().random_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
}

/// Builds a downscoping `options` payload from a [`crate::cab::boundary::CredentialAccessBoundary`]
///.
pub fn downscope_options(boundary: &crate::cab::boundary::CredentialAccessBoundary) -> serde_json::Value {
    serde_json::json!({ "accessBoundary": boundary.to_wire() })
}

/// A reference-counted [`StsClient`], convenient for sharing across
/// credential kinds that embed the same transport/universe domain.
pub type SharedStsClient = Arc<StsClient>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::test_support::{json_response, FakeTransport};

    #[tokio::test]
    async fn exchange_parses_access_token_response() {
        let transport = FakeTransport::new(vec![Ok(json_response(
            200,
            serde_json::json!({
                "access_token": "abc123",
                "issued_token_type": "urn:ietf:params:oauth:token-type:access_token",
                "token_type": "Bearer",
                "expires_in": 3600,
            }),
        ))]);
        let client = StsClient::new(transport.clone(), "googleapis.com");
        let req = StsRequestBuilder::new()
            .subject_token("subj", "urn:ietf:params:oauth:token-type:jwt")
            .audience("//iam.googleapis.com/locations/global/workloadIdentityPools/p/providers/p");
        let resp = client.exchange(req).await.unwrap();
        assert_eq!(resp.access_token.value(), "abc123");
        assert!(resp.access_token.expiration().is_some());
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn retryable_status_is_retried_then_succeeds() {
        let transport = FakeTransport::new(vec![
            Ok(json_response(503, serde_json::json!({"error": "unavailable"}))),
            Ok(json_response(200, serde_json::json!({"access_token": "t2"}))),
        ]);
        let client = StsClient::new(transport.clone(), "googleapis.com");
        let req = StsRequestBuilder::new().subject_token("s", "t");
        let resp = client
            .exchange_with_retry(
                req,
                RetryPolicy {
                    initial_delay: Duration::from_millis(1),
                    multiplier: 1.0,
                    randomization: 0.0,
                    max_attempts: 3,
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.access_token.value(), "t2");
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn non_retryable_status_fails_immediately() {
        let transport = FakeTransport::new(vec![Ok(json_response(
            400,
            serde_json::json!({"error": "invalid_request", "error_description": "bad"}),
        ))]);
        let client = StsClient::new(transport.clone(), "googleapis.com");
        let req = StsRequestBuilder::new().subject_token("s", "t");
        let err = client.exchange(req).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(transport.call_count(), 1);
    }
}
