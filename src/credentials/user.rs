//! `UserCredentials`.
//!
//! Refreshes by posting a standard OAuth2 `refresh_token` grant to the
//! token endpoint. The source's `fromStream` dispatch builds one of these
//! from an `authorized_user` JSON document.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::credentials::oauth2::{ChangeListener, ListenerHandle, OAuth2Core, TokenRefresher};
use crate::credentials::{oauth2_request_metadata, AccessTokenSource, Credentials, RequestMetadata};
use crate::error::{Error, Result, TokenResponseError};
use crate::http_client::{HttpRequest, SharedTransport};
use crate::token::AccessToken;
use crate::trust_boundary::TrustBoundaryCache;

/// Default token endpoint for `authorized_user` credentials.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// An `authorized_user` credentials JSON document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserCredentialsInfo {
    /// OAuth2 client ID that issued the refresh token.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: String,
    /// The long-lived refresh token.
    pub refresh_token: String,
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
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug)]
struct UserRefresher {
    transport: SharedTransport,
    token_uri: String,
    client_id: String,
    client_secret: String,
    refresh_token: Mutex<String>,
}

#[async_trait]
impl TokenRefresher for UserRefresher {
    async fn refresh_access_token(&self, clock: &dyn Clock) -> Result<AccessToken> {
        let refresh_token = self.refresh_token.lock().unwrap().clone();
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("client_id", &self.client_id)
            .append_pair("client_secret", &self.client_secret)
            .append_pair("refresh_token", &refresh_token)
            .finish();
        let request = HttpRequest::post(&self.token_uri, body.into_bytes())
            .header("content-type", "application/x-www-form-urlencoded");
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
        let scopes = parsed
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        Ok(AccessToken::new(parsed.access_token, expiration, scopes))
    }
}

/// End-user OAuth2 credentials backed by a long-lived refresh token.
#[derive(Debug)]
pub struct UserCredentials {
    core: Arc<OAuth2Core>,
    refresher: Arc<UserRefresher>,
    quota_project_id: Option<String>,
    universe_domain: String,
    trust_boundary: Option<Arc<TrustBoundaryCache>>,
}

impl UserCredentials {
    /// Builds user credentials from a parsed `authorized_user` JSON document.
    pub fn from_info(info: UserCredentialsInfo, transport: SharedTransport) -> Self {
        Self::builder(info.client_id, info.client_secret, info.refresh_token)
            .transport(transport)
            .quota_project_id(info.quota_project_id.unwrap_or_default())
            .build()
    }

    /// Starts a builder.
    pub fn builder(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> UserCredentialsBuilder {
        UserCredentialsBuilder {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
            token_uri: DEFAULT_TOKEN_URI.to_string(),
            transport: None,
            quota_project_id: None,
            universe_domain: crate::consts::DEFAULT_UNIVERSE_DOMAIN.to_string(),
            env: crate::env::system(),
        }
    }

    /// Registers a change listener, invoked once per successful refresh.
    pub fn add_change_listener(&self, listener: ChangeListener) -> ListenerHandle {
        self.core.add_change_listener(listener)
    }
}

/// Builds a [`UserCredentials`].
pub struct UserCredentialsBuilder {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    token_uri: String,
    transport: Option<SharedTransport>,
    quota_project_id: Option<String>,
    universe_domain: String,
    env: crate::env::SharedEnv,
}

impl UserCredentialsBuilder {
    /// Overrides the token endpoint (default `https://oauth2.googleapis.com/token`).
    pub fn token_uri(mut self, token_uri: impl Into<String>) -> Self {
        self.token_uri = token_uri.into();
        self
    }

    /// Sets the HTTP transport.
    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the quota project ID attached to outgoing requests.
    pub fn quota_project_id(mut self, quota_project_id: impl Into<String>) -> Self {
        let value = quota_project_id.into();
        self.quota_project_id = (!value.is_empty()).then_some(value);
        self
    }

    /// Sets the universe domain (default `googleapis.com`).
    pub fn universe_domain(mut self, universe_domain: impl Into<String>) -> Self {
        self.universe_domain = universe_domain.into();
        self
    }

    /// Builds the credential.
    pub fn build(self) -> UserCredentials {
        let transport = self.transport.unwrap_or_else(crate::http_client::default_transport);
        let refresher = Arc::new(UserRefresher {
            transport: transport.clone(),
            token_uri: self.token_uri,
            client_id: self.client_id,
            client_secret: self.client_secret,
            refresh_token: Mutex::new(self.refresh_token),
        });
        let core = OAuth2Core::new(refresher.clone(), crate::clock::system());
        let trust_boundary = crate::credentials::wire_trust_boundary(
            &core,
            &self.env,
            transport,
            self.universe_domain.clone(),
            "userCredentials",
        );
        UserCredentials {
            core,
            refresher,
            quota_project_id: self.quota_project_id,
            universe_domain: self.universe_domain,
            trust_boundary,
        }
    }
}

#[async_trait]
impl Credentials for UserCredentials {
    async fn get_request_metadata(&self, _uri: &str) -> Result<RequestMetadata> {
        oauth2_request_metadata(&self.core, self.quota_project_id.as_deref(), self.trust_boundary.as_ref()).await
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
impl AccessTokenSource for UserCredentials {
    async fn access_token(&self) -> Result<AccessToken> {
        self.core.ensure_fresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::test_support::{json_response, FakeTransport};

    #[tokio::test]
    async fn refresh_posts_refresh_token_grant() {
        let transport = FakeTransport::new(vec![Ok(json_response(
            200,
            serde_json::json!({"access_token": "T1", "expires_in": 3600}),
        ))]);
        let creds = UserCredentials::builder("A", "B", "R")
            .transport(transport.clone())
            .build();
        let headers = creds.get_request_metadata("https://x").await.unwrap();
        assert_eq!(headers[0], ("authorization".to_string(), vec!["Bearer T1".to_string()]));

        let requests = transport.requests();
        let body = String::from_utf8(requests[0].body.clone().unwrap().to_vec()).unwrap();
        assert!(body.contains("grant_type=refresh_token"));
        assert!(body.contains("refresh_token=R"));
    }

    #[tokio::test]
    async fn rotated_refresh_token_replaces_stored_one() {
        let transport = FakeTransport::new(vec![
            Ok(json_response(
                200,
                serde_json::json!({"access_token": "T1", "expires_in": 1, "refresh_token": "R2"}),
            )),
            Ok(json_response(200, serde_json::json!({"access_token": "T2", "expires_in": 3600}))),
        ]);
        let creds = UserCredentials::builder("A", "B", "R1")
            .transport(transport.clone())
            .build();
        creds.refresh().await.unwrap();
        creds.core.invalidate();
        creds.refresh().await.unwrap();

        let requests = transport.requests();
        let body = String::from_utf8(requests[1].body.clone().unwrap().to_vec()).unwrap();
        assert!(body.contains("refresh_token=R2"));
    }
}
