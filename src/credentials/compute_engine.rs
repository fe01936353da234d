//! `ComputeEngineCredentials`.
//!
//! Refreshes by GETting the GCE/GKE metadata server's token endpoint with
//! `Metadata-Flavor: Google`. Host is `metadata.google.internal` unless
//! overridden by `GCE_METADATA_HOST`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::clock::Clock;
use crate::credentials::id_token::IdTokenProvider;
use crate::credentials::oauth2::{OAuth2Core, TokenRefresher};
use crate::credentials::{oauth2_request_metadata, AccessTokenSource, Credentials, RequestMetadata};
use crate::env::{SharedEnv, GCE_METADATA_HOST, NO_GCE_CHECK};
use crate::error::{Error, Result, TokenResponseError};
use crate::http_client::{HttpRequest, SharedTransport};
use crate::token::{AccessToken, IdToken};
use crate::trust_boundary::TrustBoundaryCache;

#[derive(Debug, Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Builds the metadata server host, honoring `GCE_METADATA_HOST`.
pub fn metadata_host(env: &dyn crate::env::EnvProvider) -> String {
    env.var(GCE_METADATA_HOST)
        .unwrap_or_else(|| crate::consts::DEFAULT_METADATA_HOST.to_string())
}

/// Probes the metadata server, returning `true` iff this process is running
/// on GCE. Always `false` if `NO_GCE_CHECK` is
/// `"true"`.
pub async fn on_gce(transport: &SharedTransport, env: &SharedEnv) -> bool {
    if env.var(NO_GCE_CHECK).as_deref() == Some("true") {
        return false;
    }
    let url = format!("http://{}/computeMetadata/v1/", metadata_host(env.as_ref()));
    let request = HttpRequest::get(url)
        .header("Metadata-Flavor", "Google")
        .with_timeout(std::time::Duration::from_millis(500));
    matches!(transport.execute(request).await, Ok(response) if response.is_success())
}

#[derive(Debug)]
struct ComputeEngineRefresher {
    transport: SharedTransport,
    env: SharedEnv,
    scopes: Vec<String>,
}

#[async_trait]
impl TokenRefresher for ComputeEngineRefresher {
    async fn refresh_access_token(&self, clock: &dyn Clock) -> Result<AccessToken> {
        let url = format!(
            "http://{}{}",
            metadata_host(self.env.as_ref()),
            crate::consts::METADATA_TOKEN_PATH
        );
        let request = HttpRequest::get(url).header("Metadata-Flavor", "Google");
        let response = self.transport.execute(request).await.map_err(Error::Io)?;
        if response.status == 404 {
            return Err(Error::Config(crate::error::ConfigError::NoAdcFound));
        }
        if !response.is_success() {
            return Err(Error::TokenResponse(TokenResponseError::new(response.status, None, None)));
        }
        let parsed: MetadataTokenResponse = response.json()?;
        Ok(AccessToken::new(
            parsed.access_token,
            Some(clock.now() + chrono::Duration::seconds(parsed.expires_in)),
            self.scopes.clone(),
        ))
    }
}

/// Credentials backed by the ambient GCE/GKE/Cloud Run metadata server.
#[derive(Debug)]
pub struct ComputeEngineCredentials {
    core: Arc<OAuth2Core>,
    transport: SharedTransport,
    env: SharedEnv,
    quota_project_id: Option<String>,
    universe_domain: String,
    trust_boundary: Option<Arc<TrustBoundaryCache>>,
}

impl ComputeEngineCredentials {
    /// Builds credentials with the default transport/environment and no
    /// scopes (the metadata server grants whatever scopes the instance's
    /// service account was configured with).
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts a builder.
    pub fn builder() -> ComputeEngineCredentialsBuilder {
        ComputeEngineCredentialsBuilder {
            transport: None,
            env: None,
            scopes: Vec::new(),
            quota_project_id: None,
            universe_domain: crate::consts::DEFAULT_UNIVERSE_DOMAIN.to_string(),
        }
    }
}

impl Default for ComputeEngineCredentials {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a [`ComputeEngineCredentials`].
pub struct ComputeEngineCredentialsBuilder {
    transport: Option<SharedTransport>,
    env: Option<SharedEnv>,
    scopes: Vec<String>,
    quota_project_id: Option<String>,
    universe_domain: String,
}

impl ComputeEngineCredentialsBuilder {
    /// Sets the HTTP transport.
    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the environment provider.
    pub fn env(mut self, env: SharedEnv) -> Self {
        self.env = Some(env);
        self
    }

    /// Sets the requested scopes.
    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
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
    pub fn build(self) -> ComputeEngineCredentials {
        let transport = self.transport.unwrap_or_else(crate::http_client::default_transport);
        let env = self.env.unwrap_or_else(crate::env::system);
        let refresher = Arc::new(ComputeEngineRefresher {
            transport: transport.clone(),
            env: env.clone(),
            scopes: self.scopes,
        });
        let core = OAuth2Core::new(refresher, crate::clock::system());
        let trust_boundary = crate::credentials::wire_trust_boundary(
            &core,
            &env,
            transport.clone(),
            self.universe_domain.clone(),
            "computeEngine",
        );
        ComputeEngineCredentials {
            core,
            transport,
            env,
            quota_project_id: self.quota_project_id,
            universe_domain: self.universe_domain,
            trust_boundary,
        }
    }
}

#[async_trait]
impl Credentials for ComputeEngineCredentials {
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
impl AccessTokenSource for ComputeEngineCredentials {
    async fn access_token(&self) -> Result<AccessToken> {
        self.core.ensure_fresh().await
    }
}

#[async_trait]
impl IdTokenProvider for ComputeEngineCredentials {
    async fn id_token(&self, audience: &str, _include_email: bool) -> Result<IdToken> {
        let url = format!(
            "http://{}{}?audience={}&format=full",
            metadata_host(self.env.as_ref()),
            crate::consts::METADATA_IDENTITY_PATH,
            form_urlencoded::byte_serialize(audience.as_bytes()).collect::<String>(),
        );
        let request = HttpRequest::get(url).header("Metadata-Flavor", "Google");
        let response = self.transport.execute(request).await.map_err(Error::Io)?;
        if !response.is_success() {
            return Err(Error::TokenResponse(TokenResponseError::new(response.status, None, None)));
        }
        let value = response
            .text()
            .map_err(|e| Error::TokenResponse(TokenResponseError::new(response.status, None, Some(e.to_string()))))?;
        Ok(IdToken::new(value.trim().to_string(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::test_support::MapEnv;
    use crate::http_client::test_support::FakeTransport;
    use crate::http_client::HttpResponse;

    #[tokio::test]
    async fn refresh_parses_metadata_token_response() {
        let transport = FakeTransport::new(vec![Ok(HttpResponse {
            status: 200,
            headers: vec![],
            body: bytes::Bytes::from_static(br#"{"access_token":"gce-token","expires_in":3600,"token_type":"Bearer"}"#),
        })]);
        let creds = ComputeEngineCredentials::builder().transport(transport.clone()).build();
        let headers = creds.get_request_metadata("https://x").await.unwrap();
        assert_eq!(headers[0].1, vec!["Bearer gce-token".to_string()]);

        let requests = transport.requests();
        assert_eq!(requests[0].header_value("Metadata-Flavor"), Some("Google"));
    }

    #[tokio::test]
    async fn not_found_maps_to_no_adc_found() {
        let transport = FakeTransport::new(vec![Ok(HttpResponse {
            status: 404,
            headers: vec![],
            body: bytes::Bytes::new(),
        })]);
        let creds = ComputeEngineCredentials::builder().transport(transport).build();
        let err = creds.refresh().await.unwrap_err();
        assert!(matches!(err, Error::Config(crate::error::ConfigError::NoAdcFound)));
    }

    #[tokio::test]
    async fn on_gce_false_when_no_gce_check_set() {
        let transport = FakeTransport::new(vec![]);
        let env = MapEnv::new().with_var(NO_GCE_CHECK, "true");
        assert!(!on_gce(&transport, &(env as SharedEnv)).await);
    }
}
