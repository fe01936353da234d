//! `ImpersonatedCredentials`.
//!
//! Wraps a source credential and mints access tokens, ID tokens, and
//! signed blobs on its behalf via the IAM Credentials API, authenticated
//! with the source's own bearer token.

use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::credentials::id_token::IdTokenProvider;
use crate::credentials::oauth2::{OAuth2Core, TokenRefresher};
use crate::credentials::{oauth2_request_metadata, AccessTokenSource, Credentials, RequestMetadata};
use crate::error::{ConfigError, Error, Result};
use crate::iam::{Delegates, IamClient};
use crate::token::{AccessToken, IdToken};

#[derive(Debug)]
struct ImpersonatedRefresher {
    iam: IamClient,
    source: Arc<dyn AccessTokenSource>,
    target_principal: String,
    scopes: Vec<String>,
    delegates: Delegates,
    lifetime_seconds: Option<i64>,
}

#[async_trait]
impl TokenRefresher for ImpersonatedRefresher {
    async fn refresh_access_token(&self, _clock: &dyn Clock) -> Result<AccessToken> {
        let source_token = self.source.access_token().await?;
        self.iam
            .generate_access_token(
                &self.target_principal,
                source_token.value(),
                &self.scopes,
                &self.delegates,
                self.lifetime_seconds,
            )
            .await
    }
}

/// Credentials that impersonate `target_principal`, deriving all of their
/// authority from a wrapped source credential.
#[derive(Debug)]
pub struct ImpersonatedCredentials {
    core: Arc<OAuth2Core>,
    iam: IamClient,
    source: Arc<dyn AccessTokenSource>,
    target_principal: String,
    delegates: Delegates,
    quota_project_id: Option<String>,
    universe_domain: String,
}

impl ImpersonatedCredentials {
    /// Starts a builder for credentials impersonating `target_principal`,
    /// deriving authority from `source`.
    pub fn builder(source: Arc<dyn AccessTokenSource>, target_principal: impl Into<String>) -> ImpersonatedCredentialsBuilder {
        ImpersonatedCredentialsBuilder {
            source,
            target_principal: target_principal.into(),
            scopes: Vec::new(),
            delegates: Delegates::none(),
            lifetime_seconds: None,
            quota_project_id: None,
            source_universe_domain: crate::consts::DEFAULT_UNIVERSE_DOMAIN.to_string(),
            universe_domain: None,
            transport: None,
        }
    }
}

/// Builds an [`ImpersonatedCredentials`].
pub struct ImpersonatedCredentialsBuilder {
    source: Arc<dyn AccessTokenSource>,
    target_principal: String,
    scopes: Vec<String>,
    delegates: Delegates,
    lifetime_seconds: Option<i64>,
    quota_project_id: Option<String>,
    source_universe_domain: String,
    universe_domain: Option<String>,
    transport: Option<crate::http_client::SharedTransport>,
}

impl ImpersonatedCredentialsBuilder {
    /// Sets the requested scopes for the impersonated token.
    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Sets an ordered delegate chain.
    pub fn delegates(mut self, delegates: Vec<String>) -> Self {
        self.delegates = Delegates::new(delegates);
        self
    }

    /// Sets the requested token lifetime. `0` means "server default
    /// (3600s)"; must otherwise satisfy `0 < lifetime <= 43200`.
    pub fn lifetime_seconds(mut self, lifetime_seconds: i64) -> Self {
        self.lifetime_seconds = Some(lifetime_seconds);
        self
    }

    /// Sets the quota project ID.
    pub fn quota_project_id(mut self, quota_project_id: impl Into<String>) -> Self {
        let value = quota_project_id.into();
        self.quota_project_id = (!value.is_empty()).then_some(value);
        self
    }

    /// Records the wrapped source credential's universe domain, used to
    /// enforce the universe-domain-match invariant at build time.
    pub fn source_universe_domain(mut self, universe_domain: impl Into<String>) -> Self {
        self.source_universe_domain = universe_domain.into();
        self
    }

    /// Explicitly sets this credential's universe domain. Must equal the
    /// source's universe domain or [`Self::build`] fails.
    pub fn universe_domain(mut self, universe_domain: impl Into<String>) -> Self {
        self.universe_domain = Some(universe_domain.into());
        self
    }

    /// Sets the HTTP transport used for IAM calls.
    pub fn transport(mut self, transport: crate::http_client::SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the credential, failing with [`ConfigError::UniverseDomainMismatch`]
    /// if an explicit universe domain was set that differs from the
    /// source's.
    pub fn build(self) -> Result<ImpersonatedCredentials> {
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
        let iam = IamClient::new(transport, universe_domain.clone());
        let refresher = Arc::new(ImpersonatedRefresher {
            iam: iam.clone(),
            source: self.source.clone(),
            target_principal: self.target_principal.clone(),
            scopes: self.scopes,
            delegates: self.delegates.clone(),
            lifetime_seconds: self.lifetime_seconds,
        });
        let core = OAuth2Core::new(refresher, crate::clock::system());
        Ok(ImpersonatedCredentials {
            core,
            iam,
            source: self.source,
            target_principal: self.target_principal,
            delegates: self.delegates,
            quota_project_id: self.quota_project_id,
            universe_domain,
        })
    }
}

#[async_trait]
impl Credentials for ImpersonatedCredentials {
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
impl AccessTokenSource for ImpersonatedCredentials {
    async fn access_token(&self) -> Result<AccessToken> {
        self.core.ensure_fresh().await
    }
}

#[async_trait]
impl IdTokenProvider for ImpersonatedCredentials {
    async fn id_token(&self, audience: &str, include_email: bool) -> Result<IdToken> {
        let source_token = self.source.access_token().await?;
        self.iam
            .generate_id_token(&self.target_principal, source_token.value(), audience, include_email, &self.delegates)
            .await
    }
}

impl ImpersonatedCredentials {
    /// Signs `payload` as `target_principal`, authenticated with the
    /// source credential's bearer token.
    pub async fn sign_blob(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let source_token = self.source.access_token().await?;
        self.iam
            .sign_blob(&self.target_principal, source_token.value(), payload, &self.delegates)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::test_support::{json_response, FakeTransport};

    #[derive(Debug)]
    struct FixedSource(AccessToken);

    #[async_trait]
    impl AccessTokenSource for FixedSource {
        async fn access_token(&self) -> Result<AccessToken> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn refresh_calls_generate_access_token_with_source_bearer() {
        let transport = FakeTransport::new(vec![Ok(json_response(
            200,
            serde_json::json!({"accessToken": "impersonated-token", "expireTime": "2099-01-01T00:00:00Z"}),
        ))]);
        let source = Arc::new(FixedSource(AccessToken::new("source-token", None, vec![])));
        let creds = ImpersonatedCredentials::builder(source, "target@project.iam.gserviceaccount.com")
            .transport(transport.clone())
            .build()
            .unwrap();
        let headers = creds.get_request_metadata("https://x").await.unwrap();
        assert_eq!(headers[0].1, vec!["Bearer impersonated-token".to_string()]);
        assert_eq!(transport.requests()[0].header_value("authorization"), Some("Bearer source-token"));
    }

    #[test]
    fn universe_domain_mismatch_fails_at_build_time() {
        let source = Arc::new(FixedSource(AccessToken::new("t", None, vec![])));
        let err = ImpersonatedCredentials::builder(source, "target")
            .source_universe_domain("source.domain.xyz")
            .universe_domain("other")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::UniverseDomainMismatch { .. })));
    }

    #[test]
    fn matching_universe_domain_succeeds() {
        let source = Arc::new(FixedSource(AccessToken::new("t", None, vec![])));
        let creds = ImpersonatedCredentials::builder(source, "target")
            .source_universe_domain("example.com")
            .universe_domain("example.com")
            .build()
            .unwrap();
        assert_eq!(creds.universe_domain(), "example.com");
    }
}
