//! `ExternalAccountAuthorizedUserCredentials`, sibling of
//! [`crate::credentials::user`].
//!
//! Google's client libraries issue a long-lived refresh token the first time
//! a workforce-identity user completes the external-account exchange
//! interactively (`gcloud auth login --update-adc`), then persist it as an
//! `external_account_authorized_user` JSON document so later process
//! invocations can refresh without repeating the browser flow. The refresh
//! mechanics are identical to plain `authorized_user` credentials; only the
//! document shape and default token endpoint differ.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::credentials::oauth2::{OAuth2Core, TokenRefresher};
use crate::credentials::{oauth2_request_metadata, AccessTokenSource, Credentials, RequestMetadata};
use crate::error::{Error, Result, TokenResponseError};
use crate::http_client::{HttpRequest, SharedTransport};
use crate::token::AccessToken;

/// Default token endpoint for `external_account_authorized_user` credentials.
pub const DEFAULT_TOKEN_URL: &str = "https://sts.googleapis.com/v1/oauthtoken";

/// An `external_account_authorized_user` credentials JSON document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExternalAccountAuthorizedUserInfo {
    /// The workforce pool provider audience this refresh token was issued
    /// against.
    pub audience: String,
    /// OAuth2 client ID used to obtain the refresh token.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: String,
    /// The long-lived refresh token.
    pub refresh_token: String,
    /// Token endpoint, if overridden from the default.
    #[serde(default)]
    pub token_url: Option<String>,
    /// Quota project to attach to outgoing requests.
    #[serde(default)]
    pub quota_project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug)]
struct ExternalAccountAuthorizedUserRefresher {
    transport: SharedTransport,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: Mutex<String>,
}

#[async_trait]
impl TokenRefresher for ExternalAccountAuthorizedUserRefresher {
    async fn refresh_access_token(&self, clock: &dyn Clock) -> Result<AccessToken> {
        let refresh_token = self.refresh_token.lock().unwrap().clone();
        let basic = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            format!("{}:{}", self.client_id, self.client_secret),
        );
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("refresh_token", &refresh_token)
            .finish();
        let request = HttpRequest::post(&self.token_url, body.into_bytes())
            .header("content-type", "application/x-www-form-urlencoded")
            .header("authorization", format!("Basic {basic}"));
        let response = self.transport.execute(request).await.map_err(Error::Io)?;
        if !response.is_success() {
            return Err(Error::TokenResponse(TokenResponseError::new(response.status, None, None)));
        }
        let parsed: RefreshResponse = response.json()?;
        if let Some(rotated) = &parsed.refresh_token {
            *self.refresh_token.lock().unwrap() = rotated.clone();
        }
        let expiration = parsed
            .expires_in
            .map(|secs| clock.now() + chrono::Duration::seconds(secs));
        Ok(AccessToken::new(parsed.access_token, expiration, vec![]))
    }
}

/// Workforce-identity user credentials refreshed through a persisted
/// refresh token, rather than re-running the external-account subject-token
/// exchange on every refresh.
#[derive(Debug)]
pub struct ExternalAccountAuthorizedUserCredentials {
    core: Arc<OAuth2Core>,
    quota_project_id: Option<String>,
    universe_domain: String,
}

impl ExternalAccountAuthorizedUserCredentials {
    /// Builds credentials from a parsed `external_account_authorized_user`
    /// JSON document.
    pub fn from_info(info: ExternalAccountAuthorizedUserInfo, transport: SharedTransport) -> Self {
        let mut builder = Self::builder(info.client_id, info.client_secret, info.refresh_token).transport(transport);
        if let Some(token_url) = info.token_url {
            builder = builder.token_url(token_url);
        }
        builder.quota_project_id(info.quota_project_id.unwrap_or_default()).build()
    }

    /// Starts a builder.
    pub fn builder(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> ExternalAccountAuthorizedUserCredentialsBuilder {
        ExternalAccountAuthorizedUserCredentialsBuilder {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            transport: None,
            quota_project_id: None,
            universe_domain: crate::consts::DEFAULT_UNIVERSE_DOMAIN.to_string(),
        }
    }
}

/// Builds an [`ExternalAccountAuthorizedUserCredentials`].
pub struct ExternalAccountAuthorizedUserCredentialsBuilder {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    token_url: String,
    transport: Option<SharedTransport>,
    quota_project_id: Option<String>,
    universe_domain: String,
}

impl ExternalAccountAuthorizedUserCredentialsBuilder {
    /// Overrides the token endpoint.
    pub fn token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    /// Sets the HTTP transport.
    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the quota project ID.
    pub fn quota_project_id(mut self, quota_project_id: impl Into<String>) -> Self {
        let value = quota_project_id.into();
        self.quota_project_id = (!value.is_empty()).then_some(value);
        self
    }

    /// Sets the universe domain.
    pub fn universe_domain(mut self, universe_domain: impl Into<String>) -> Self {
        self.universe_domain = universe_domain.into();
        self
    }

    /// Builds the credential.
    pub fn build(self) -> ExternalAccountAuthorizedUserCredentials {
        let transport = self.transport.unwrap_or_else(crate::http_client::default_transport);
        let refresher = Arc::new(ExternalAccountAuthorizedUserRefresher {
            transport,
            token_url: self.token_url,
            client_id: self.client_id,
            client_secret: self.client_secret,
            refresh_token: Mutex::new(self.refresh_token),
        });
        let core = OAuth2Core::new(refresher, crate::clock::system());
        ExternalAccountAuthorizedUserCredentials {
            core,
            quota_project_id: self.quota_project_id,
            universe_domain: self.universe_domain,
        }
    }
}

#[async_trait]
impl Credentials for ExternalAccountAuthorizedUserCredentials {
    async fn get_request_metadata(&self, _uri: &str) -> Result<RequestMetadata> {
        oauth2_request_metadata(&self.core, self.quota_project_id.as_deref(), None).await
    }

    async fn refresh(&self) -> Result<()> {
        self.core.refresh().await.map(|_| ())
    }

    fn universe_domain(&self) -> String {
        self.universe_domain.clone()
    }

    fn quota_project_id(&self) -> Option<String> {
        self.quota_project_id.clone()
    }
}

#[async_trait]
impl AccessTokenSource for ExternalAccountAuthorizedUserCredentials {
    async fn access_token(&self) -> Result<AccessToken> {
        self.core.ensure_fresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::test_support::{json_response, FakeTransport};

    #[tokio::test]
    async fn refresh_posts_basic_auth_and_refresh_token() {
        let transport = FakeTransport::new(vec![Ok(json_response(
            200,
            serde_json::json!({"access_token": "T1", "expires_in": 3600}),
        ))]);
        let creds = ExternalAccountAuthorizedUserCredentials::builder("client-id", "client-secret", "R")
            .transport(transport.clone())
            .build();
        let headers = creds.get_request_metadata("https://x").await.unwrap();
        assert_eq!(headers[0].1, vec!["Bearer T1".to_string()]);

        let requests = transport.requests();
        assert!(requests[0].header_value("authorization").unwrap().starts_with("Basic "));
        let body = String::from_utf8(requests[0].body.clone().unwrap().to_vec()).unwrap();
        assert!(body.contains("refresh_token=R"));
    }

    #[test]
    fn deserializes_from_info_json() {
        let json = serde_json::json!({
            "audience": "//iam.googleapis.com/locations/global/workforcePools/p/providers/p",
            "client_id": "cid",
            "client_secret": "secret",
            "refresh_token": "rt",
        });
        let info: ExternalAccountAuthorizedUserInfo = serde_json::from_value(json).unwrap();
        assert_eq!(info.client_id, "cid");
        assert!(info.token_url.is_none());
    }
}
