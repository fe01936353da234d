//! IAM Credentials client.
//!
//! One request envelope shared by impersonation's `generateAccessToken`,
//! `generateIdToken`, and `signBlob`, authenticated with the source
//! credential's own `Authorization` header rather than its own.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consts::{iam_generate_access_token_url, iam_generate_id_token_url, iam_sign_blob_url};
use crate::error::{Error, Result, TokenResponseError};
use crate::http_client::{HttpRequest, SharedTransport};
use crate::token::{AccessToken, IdToken};

/// Server-default lifetime (seconds) when `lifetime` is omitted or 0.
pub const DEFAULT_LIFETIME_SECONDS: i64 = 3600;
/// Maximum accepted lifetime (seconds).
pub const MAX_LIFETIME_SECONDS: i64 = 43200;

#[derive(Debug, Serialize)]
struct GenerateAccessTokenRequest<'a> {
    scope: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    delegates: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lifetime: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateAccessTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expireTime")]
    expire_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct GenerateIdTokenRequest<'a> {
    audience: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_email: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delegates: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct GenerateIdTokenResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct SignBlobRequest<'a> {
    payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    delegates: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct SignBlobResponse {
    #[serde(rename = "signedBlob")]
    signed_blob: String,
}

/// An ordered, optional delegate chain shared across `generateAccessToken`,
/// `generateIdToken`, and `signBlob` requests.
#[derive(Debug, Clone, Default)]
pub struct Delegates(Vec<String>);

impl Delegates {
    /// An empty chain.
    pub fn none() -> Self {
        Self(Vec::new())
    }

    /// Builds a chain from an explicit ordered list of delegate principals.
    pub fn new(chain: Vec<String>) -> Self {
        Self(chain)
    }

    fn as_option(&self) -> Option<&[String]> {
        if self.0.is_empty() {
            None
        } else {
            Some(&self.0)
        }
    }
}

/// Client for the `iamcredentials` API.
#[derive(Debug, Clone)]
pub struct IamClient {
    transport: SharedTransport,
    universe_domain: String,
}

impl IamClient {
    /// Builds a client targeting the IAM endpoints for `universe_domain`.
    pub fn new(transport: SharedTransport, universe_domain: impl Into<String>) -> Self {
        Self {
            transport,
            universe_domain: universe_domain.into(),
        }
    }

    /// Calls `generateAccessToken` for `principal`, authenticated with
    /// `source_bearer_token`.
    ///
    /// `lifetime` of `None` or `Some(0)` means "server default (3600s)";
    /// otherwise it must satisfy `0 < lifetime <= 43200`.
    pub async fn generate_access_token(
        &self,
        principal: &str,
        source_bearer_token: &str,
        scope: &[String],
        delegates: &Delegates,
        lifetime_seconds: Option<i64>,
    ) -> Result<AccessToken> {
        if let Some(lifetime) = lifetime_seconds {
            if lifetime < 0 || lifetime > MAX_LIFETIME_SECONDS {
                return Err(Error::Config(crate::error::ConfigError::InvalidImpersonationLifetime(lifetime)));
            }
        }
        let lifetime = lifetime_seconds
            .filter(|&l| l > 0)
            .map(|l| format!("{l}s"));
        let body = GenerateAccessTokenRequest {
            scope,
            delegates: delegates.as_option(),
            lifetime,
        };
        let url = iam_generate_access_token_url(&self.universe_domain, principal);
        let response: GenerateAccessTokenResponse = self.post_json(&url, source_bearer_token, &body).await?;
        Ok(AccessToken::new(
            response.access_token,
            Some(response.expire_time),
            scope.to_vec(),
        ))
    }

    /// Calls `generateIdToken` for `principal`, authenticated with
    /// `source_bearer_token`. The returned [`IdToken`] carries no
    /// expiration here; callers parse `exp` from its claims if needed.
    pub async fn generate_id_token(
        &self,
        principal: &str,
        source_bearer_token: &str,
        audience: &str,
        include_email: bool,
        delegates: &Delegates,
    ) -> Result<IdToken> {
        let body = GenerateIdTokenRequest {
            audience,
            include_email: include_email.then_some(true),
            delegates: delegates.as_option(),
        };
        let url = iam_generate_id_token_url(&self.universe_domain, principal);
        let response: GenerateIdTokenResponse = self.post_json(&url, source_bearer_token, &body).await?;
        Ok(IdToken::new(response.token, None))
    }

    /// Calls `signBlob` for `principal`, authenticated with
    /// `source_bearer_token`. Failures are reported as
    /// [`Error::Signing`] rather than [`Error::TokenResponse`].
    pub async fn sign_blob(
        &self,
        principal: &str,
        source_bearer_token: &str,
        payload: &[u8],
        delegates: &Delegates,
    ) -> Result<Vec<u8>> {
        let body = SignBlobRequest {
            payload: base64::engine::general_purpose::STANDARD.encode(payload),
            delegates: delegates.as_option(),
        };
        let url = iam_sign_blob_url(&self.universe_domain, principal);
        let response: SignBlobResponse = self
            .post_json(&url, source_bearer_token, &body)
            .await
            .map_err(to_signing_error)?;
        base64::engine::general_purpose::STANDARD
            .decode(response.signed_blob)
            .map_err(|e| Error::Signing(TokenResponseError::new(200, None, Some(e.to_string()))))
    }

    async fn post_json<B: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        source_bearer_token: &str,
        body: &B,
    ) -> Result<R> {
        let payload = serde_json::to_vec(body)?;
        let request = HttpRequest::post(url, payload)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {source_bearer_token}"));
        let response = self.transport.execute(request).await.map_err(Error::Io)?;
        if !response.is_success() {
            let status = response.status;
            #[derive(Deserialize, Default)]
            struct ErrBody {
                error: Option<ErrDetail>,
            }
            #[derive(Deserialize)]
            struct ErrDetail {
                message: Option<String>,
                status: Option<String>,
            }
            let parsed: ErrBody = response.json().unwrap_or_default();
            let (code, message) = parsed
                .error
                .map(|e| (e.status, e.message))
                .unwrap_or((None, None));
            return Err(Error::TokenResponse(TokenResponseError::new(status, code, message)));
        }
        Ok(response.json()?)
    }
}

fn to_signing_error(err: Error) -> Error {
    match err {
        Error::TokenResponse(inner) => Error::Signing(inner),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::test_support::{json_response, FakeTransport};

    #[tokio::test]
    async fn generate_access_token_parses_expire_time() {
        let transport = FakeTransport::new(vec![Ok(json_response(
            200,
            serde_json::json!({
                "accessToken": "ya29.impersonated",
                "expireTime": "2024-01-01T00:00:00Z",
            }),
        ))]);
        let client = IamClient::new(transport.clone(), "googleapis.com");
        let token = client
            .generate_access_token(
                "sa@project.iam.gserviceaccount.com",
                "source-bearer",
                &["https://www.googleapis.com/auth/cloud-platform".to_string()],
                &Delegates::none(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(token.value(), "ya29.impersonated");
        assert!(token.expiration().is_some());

        let requests = transport.requests();
        assert_eq!(requests[0].header_value("authorization"), Some("Bearer source-bearer"));
    }

    #[tokio::test]
    async fn rejects_lifetime_above_max() {
        let transport = FakeTransport::new(vec![]);
        let client = IamClient::new(transport, "googleapis.com");
        let err = client
            .generate_access_token("sa", "bearer", &[], &Delegates::none(), Some(50_000))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(crate::error::ConfigError::InvalidImpersonationLifetime(_))
        ));
    }

    #[tokio::test]
    async fn sign_blob_failure_is_reported_as_signing_error() {
        let transport = FakeTransport::new(vec![Ok(json_response(
            403,
            serde_json::json!({"error": {"status": "PERMISSION_DENIED", "message": "no iam.serviceAccounts.signBlob"}}),
        ))]);
        let client = IamClient::new(transport, "googleapis.com");
        let err = client
            .sign_blob("sa", "bearer", b"payload", &Delegates::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Signing(_)));
    }

    #[tokio::test]
    async fn sign_blob_round_trips_base64_payload() {
        let signed = base64::engine::general_purpose::STANDARD.encode(b"signature-bytes");
        let transport = FakeTransport::new(vec![Ok(json_response(
            200,
            serde_json::json!({"signedBlob": signed}),
        ))]);
        let client = IamClient::new(transport, "googleapis.com");
        let out = client
            .sign_blob("sa", "bearer", b"payload", &Delegates::none())
            .await
            .unwrap();
        assert_eq!(out, b"signature-bytes");
    }
}
