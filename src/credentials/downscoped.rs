//! Server-side `DownscopedCredentials`.
//!
//! Exchanges a source credential's access token at STS for one restricted
//! by a [`CredentialAccessBoundary`], using `requested_token_type =
//! access_token` rather than the intermediary-token type client-side CAB
//! uses (see [`crate::cab`]).

use std::sync::Arc;

use async_trait::async_trait;

use crate::cab::boundary::CredentialAccessBoundary;
use crate::clock::Clock;
use crate::credentials::oauth2::{OAuth2Core, TokenRefresher};
use crate::credentials::{oauth2_request_metadata, AccessTokenSource, Credentials, RequestMetadata};
use crate::error::{ConfigError, Error, Result};
use crate::sts::{requested_token_type, SharedStsClient, StsRequestBuilder};
use crate::token::AccessToken;

#[derive(Debug)]
struct DownscopedRefresher {
    sts: SharedStsClient,
    source: Arc<dyn AccessTokenSource>,
    boundary: CredentialAccessBoundary,
}

#[async_trait]
impl TokenRefresher for DownscopedRefresher {
    async fn refresh_access_token(&self, _clock: &dyn Clock) -> Result<AccessToken> {
        let source_token = self.source.access_token().await?;
        let req = StsRequestBuilder::new()
            .subject_token(source_token.value(), "urn:ietf:params:oauth:token-type:access_token")
            .requested_token_type(requested_token_type::ACCESS_TOKEN)
            .options(crate::sts::downscope_options(&self.boundary));
        let response = self.sts.exchange(req).await?;
        // The downscoped token's expiration must not outlive the source's
        //: clamp if STS returned a longer-lived token (or
        // none at all) than the source credential carries.
        let expiration = match (response.access_token.expiration(), source_token.expiration()) {
            (Some(downscoped), Some(source)) => Some(downscoped.min(source)),
            (Some(downscoped), None) => Some(downscoped),
            (None, source_exp) => source_exp,
        };
        Ok(AccessToken::new(
            response.access_token.value().to_string(),
            expiration,
            response.access_token.scopes().to_vec(),
        ))
    }
}

/// Server-side downscoped (Credential Access Boundary) credentials.
#[derive(Debug)]
pub struct DownscopedCredentials {
    core: Arc<OAuth2Core>,
    quota_project_id: Option<String>,
    universe_domain: String,
}

impl DownscopedCredentials {
    /// Starts a builder deriving a downscoped token from `source`, bound by
    /// `boundary`.
    pub fn builder(source: Arc<dyn AccessTokenSource>, boundary: CredentialAccessBoundary) -> DownscopedCredentialsBuilder {
        DownscopedCredentialsBuilder {
            source,
            boundary,
            source_universe_domain: crate::consts::DEFAULT_UNIVERSE_DOMAIN.to_string(),
            universe_domain: None,
            quota_project_id: None,
            transport: None,
        }
    }
}

/// Builds a [`DownscopedCredentials`].
pub struct DownscopedCredentialsBuilder {
    source: Arc<dyn AccessTokenSource>,
    boundary: CredentialAccessBoundary,
    source_universe_domain: String,
    universe_domain: Option<String>,
    quota_project_id: Option<String>,
    transport: Option<crate::http_client::SharedTransport>,
}

impl DownscopedCredentialsBuilder {
    /// Records the wrapped source credential's universe domain.
    pub fn source_universe_domain(mut self, universe_domain: impl Into<String>) -> Self {
        self.source_universe_domain = universe_domain.into();
        self
    }

    /// Explicitly sets this credential's universe domain; must equal the
    /// source's.
    pub fn universe_domain(mut self, universe_domain: impl Into<String>) -> Self {
        self.universe_domain = Some(universe_domain.into());
        self
    }

    /// Sets the quota project ID.
    pub fn quota_project_id(mut self, quota_project_id: impl Into<String>) -> Self {
        let value = quota_project_id.into();
        self.quota_project_id = (!value.is_empty()).then_some(value);
        self
    }

    /// Sets the HTTP transport.
    pub fn transport(mut self, transport: crate::http_client::SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the credential.
    pub fn build(self) -> Result<DownscopedCredentials> {
        let universe_domain = match self.universe_domain {
            Some(explicit) if explicit != self.source_universe_domain => {
                return Err(Error::Config(ConfigError::UniverseDomainMismatch {
                    wrapper: explicit,
                    source: self.source_universe_domain,
                }));
            }
            Some(explicit) => explicit,
            None => self.source_universe_domain,
        };
        let transport = self.transport.unwrap_or_else(crate::http_client::default_transport);
        let sts = Arc::new(crate::sts::StsClient::new(transport, universe_domain.clone()));
        let refresher = Arc::new(DownscopedRefresher {
            sts,
            source: self.source,
            boundary: self.boundary,
        });
        let core = OAuth2Core::new(refresher, crate::clock::system());
        Ok(DownscopedCredentials {
            core,
            quota_project_id: self.quota_project_id,
            universe_domain,
        })
    }
}

#[async_trait]
impl Credentials for DownscopedCredentials {
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
impl AccessTokenSource for DownscopedCredentials {
    async fn access_token(&self) -> Result<AccessToken> {
        self.core.ensure_fresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cab::boundary::AccessBoundaryRule;
    use crate::http_client::test_support::{json_response, FakeTransport};
    use chrono::Utc;

    #[derive(Debug)]
    struct FixedSource(AccessToken);

    #[async_trait]
    impl AccessTokenSource for FixedSource {
        async fn access_token(&self) -> Result<AccessToken> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn refresh_exchanges_source_token_for_downscoped_one() {
        let transport = FakeTransport::new(vec![Ok(json_response(
            200,
            serde_json::json!({"access_token": "downscoped-token", "issued_token_type": "urn:ietf:params:oauth:token-type:access_token", "expires_in": 600}),
        ))]);
        let source = Arc::new(FixedSource(AccessToken::new(
            "source-token",
            Some(Utc::now() + chrono::Duration::seconds(3600)),
            vec![],
        )));
        let rule = AccessBoundaryRule::new(
            "//storage.googleapis.com/projects/_/buckets/bucket-123",
            vec!["inRole:roles/storage.objectViewer".into()],
        )
        .unwrap();
        let boundary = CredentialAccessBoundary::new(vec![rule]).unwrap();
        let creds = DownscopedCredentials::builder(source, boundary)
            .transport(transport.clone())
            .build()
            .unwrap();
        let headers = creds.get_request_metadata("https://x").await.unwrap();
        assert_eq!(headers[0].1, vec!["Bearer downscoped-token".to_string()]);

        let requests = transport.requests();
        let body = String::from_utf8(requests[0].body.clone().unwrap().to_vec()).unwrap();
        assert!(body.contains("accessBoundary"));
    }
}
