//! `OAuth2CredentialsWithRefresh`: a generic OAuth2-backed
//! credential that composes [`OAuth2Core`] with a caller-supplied refresh
//! routine, for library consumers who need custom refresh logic without
//! writing a full concrete credential kind.

use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::{Clock, SharedClock};
use crate::credentials::oauth2::{OAuth2Core, TokenRefresher};
use crate::credentials::{oauth2_request_metadata, AccessTokenSource, Credentials, RequestMetadata};
use crate::error::Result;
use crate::token::AccessToken;

/// A caller-supplied refresh routine. Unlike [`TokenRefresher`] this trait
/// is not given the owning core's clock — callers that need deterministic
/// time should capture their own [`crate::clock::Clock`] instance.
#[async_trait]
pub trait RefreshHandler: Send + Sync + std::fmt::Debug {
    /// Produces a new access token.
    async fn refresh_access_token(&self) -> Result<AccessToken>;
}

#[derive(Debug)]
struct HandlerRefresher<H> {
    handler: H,
}

#[async_trait]
impl<H: RefreshHandler> TokenRefresher for HandlerRefresher<H> {
    async fn refresh_access_token(&self, _clock: &dyn Clock) -> Result<AccessToken> {
        self.handler.refresh_access_token().await
    }
}

/// An OAuth2-backed credential whose refresh logic is supplied by the
/// caller rather than built into this crate.
#[derive(Debug)]
pub struct OAuth2CredentialsWithRefresh {
    core: Arc<OAuth2Core>,
    quota_project_id: Option<String>,
    universe_domain: String,
}

impl OAuth2CredentialsWithRefresh {
    /// Starts a builder wrapping `handler`.
    pub fn builder<H: RefreshHandler + 'static>(handler: H) -> OAuth2CredentialsWithRefreshBuilder<H> {
        OAuth2CredentialsWithRefreshBuilder {
            handler,
            quota_project_id: None,
            universe_domain: crate::consts::DEFAULT_UNIVERSE_DOMAIN.to_string(),
            refresh_margin: None,
            expiration_margin: None,
            clock: None,
            initial_token: None,
        }
    }
}

/// Builds an [`OAuth2CredentialsWithRefresh`].
pub struct OAuth2CredentialsWithRefreshBuilder<H> {
    handler: H,
    quota_project_id: Option<String>,
    universe_domain: String,
    refresh_margin: Option<chrono::Duration>,
    expiration_margin: Option<chrono::Duration>,
    clock: Option<SharedClock>,
    initial_token: Option<AccessToken>,
}

impl<H: RefreshHandler + 'static> OAuth2CredentialsWithRefreshBuilder<H> {
    /// Sets the quota project ID.
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

    /// Overrides the refresh/expiration margins (default 225s/300s); must
    /// satisfy `refresh_margin > expiration_margin`.
    pub fn margins(mut self, refresh_margin: chrono::Duration, expiration_margin: chrono::Duration) -> Self {
        self.refresh_margin = Some(refresh_margin);
        self.expiration_margin = Some(expiration_margin);
        self
    }

    /// Overrides the clock used for staleness/expiration math.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Seeds the cache with an already-known token, so the first
    /// `get_request_metadata` call need not refresh.
    pub fn initial_token(mut self, token: AccessToken) -> Self {
        self.initial_token = Some(token);
        self
    }

    /// Builds the credential.
    pub fn build(self) -> Result<OAuth2CredentialsWithRefresh> {
        let clock = self.clock.unwrap_or_else(crate::clock::system);
        let refresher: Arc<dyn TokenRefresher> = Arc::new(HandlerRefresher { handler: self.handler });
        let core = match (self.refresh_margin, self.expiration_margin) {
            (Some(refresh), Some(expiration)) => OAuth2Core::with_margins(refresher, clock, refresh, expiration)?,
            _ => OAuth2Core::new(refresher, clock),
        };
        if let Some(token) = self.initial_token {
            core.seed(token);
        }
        Ok(OAuth2CredentialsWithRefresh {
            core,
            quota_project_id: self.quota_project_id,
            universe_domain: self.universe_domain,
        })
    }
}

#[async_trait]
impl Credentials for OAuth2CredentialsWithRefresh {
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
impl AccessTokenSource for OAuth2CredentialsWithRefresh {
    async fn access_token(&self) -> Result<AccessToken> {
        self.core.ensure_fresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RefreshHandler for CountingHandler {
        async fn refresh_access_token(&self) -> Result<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AccessToken::new(format!("token-{n}"), None, vec![]))
        }
    }

    #[tokio::test]
    async fn delegates_refresh_to_supplied_handler() {
        let creds = OAuth2CredentialsWithRefresh::builder(CountingHandler { calls: AtomicUsize::new(0) })
            .build()
            .unwrap();
        let headers = creds.get_request_metadata("https://x").await.unwrap();
        assert_eq!(headers[0].1, vec!["Bearer token-1".to_string()]);
    }

    #[tokio::test]
    async fn initial_token_avoids_first_refresh() {
        let creds = OAuth2CredentialsWithRefresh::builder(CountingHandler { calls: AtomicUsize::new(0) })
            .initial_token(AccessToken::new(
                "seeded",
                Some(chrono::Utc::now() + chrono::Duration::seconds(3600)),
                vec![],
            ))
            .build()
            .unwrap();
        let headers = creds.get_request_metadata("https://x").await.unwrap();
        assert_eq!(headers[0].1, vec!["Bearer seeded".to_string()]);
    }

    #[test]
    fn invalid_margins_reject_at_build_time() {
        let err = OAuth2CredentialsWithRefresh::builder(CountingHandler { calls: AtomicUsize::new(0) })
            .margins(chrono::Duration::seconds(10), chrono::Duration::seconds(20))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Config(crate::error::ConfigError::InvalidCacheMargins { .. })
        ));
    }
}
