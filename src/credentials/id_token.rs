//! `IdTokenCredentials`.
//!
//! Wraps an [`IdTokenProvider`] — a service-account, impersonated,
//! compute-engine, or external-account credential that knows how to mint an
//! ID token for a target audience — and caches the returned [`IdToken`].
//!
//! Unlike [`crate::credentials::oauth2::OAuth2Core`], this cache holds a
//! plain `tokio::sync::Mutex` across the refresh call rather than a
//! single-flight `Shared` future: every concrete provider it wraps is
//! itself already single-flighted for the access token it uses internally.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::credentials::{oauth2_request_metadata_for_id_token, Credentials, RequestMetadata};
use crate::error::Result;
use crate::token::IdToken;

/// Margin below an ID token's `exp` claim at which it is considered expired
/// and must be refreshed before use.
pub const EXPIRATION_MARGIN: chrono::Duration = chrono::Duration::seconds(300);

/// Implemented by every concrete credential kind capable of minting an ID
/// token for a target audience: service-account (self-signed
/// or via the token endpoint), impersonated (via IAM `generateIdToken`),
/// compute-engine (via the metadata `identity` path), and external-account.
#[async_trait]
pub trait IdTokenProvider: Send + Sync + std::fmt::Debug {
    /// Mints an ID token for `audience`. `include_email` requests that the
    /// token's claims include the caller's email address, where the
    /// underlying provider supports it.
    async fn id_token(&self, audience: &str, include_email: bool) -> Result<IdToken>;
}

/// Extracts the `exp` claim from a compact JWT without verifying its
/// signature. Used only to drive local cache expiration.
pub fn peek_expiration(jwt: &str) -> Option<DateTime<Utc>> {
    let claims_segment = jwt.split('.').nth(1)?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(claims_segment)
        .ok()?;
    #[derive(Deserialize)]
    struct Claims {
        exp: Option<i64>,
    }
    let claims: Claims = serde_json::from_slice(&decoded).ok()?;
    claims.exp.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
}

/// Credentials that present an OAuth2 ID token as a bearer token, refreshing
/// it from an [`IdTokenProvider`] as its `exp` claim approaches.
#[derive(Debug)]
pub struct IdTokenCredentials {
    provider: Arc<dyn IdTokenProvider>,
    audience: String,
    include_email: bool,
    quota_project_id: Option<String>,
    universe_domain: String,
    cached: AsyncMutex<Option<IdToken>>,
}

impl IdTokenCredentials {
    /// Builds ID-token credentials wrapping `provider` for `audience`.
    pub fn new(provider: Arc<dyn IdTokenProvider>, audience: impl Into<String>) -> Self {
        Self::builder(provider, audience).build()
    }

    /// Starts a builder.
    pub fn builder(provider: Arc<dyn IdTokenProvider>, audience: impl Into<String>) -> IdTokenCredentialsBuilder {
        IdTokenCredentialsBuilder {
            provider,
            audience: audience.into(),
            include_email: false,
            quota_project_id: None,
            universe_domain: crate::consts::DEFAULT_UNIVERSE_DOMAIN.to_string(),
        }
    }

    fn is_expired(token: &IdToken) -> bool {
        match token.expiration() {
            Some(exp) => Utc::now() >= exp - EXPIRATION_MARGIN,
            None => true,
        }
    }

    /// Returns the cached ID token, refreshing it first if absent or
    /// expired.
    pub async fn ensure_fresh(&self) -> Result<IdToken> {
        let mut guard = self.cached.lock().await;
        if let Some(token) = guard.as_ref() {
            if !Self::is_expired(token) {
                return Ok(token.clone());
            }
        }
        let raw = self.provider.id_token(&self.audience, self.include_email).await?;
        let expiration = raw.expiration().or_else(|| peek_expiration(raw.value()));
        let token = IdToken::new(raw.value(), expiration);
        *guard = Some(token.clone());
        Ok(token)
    }
}

/// Builds an [`IdTokenCredentials`].
pub struct IdTokenCredentialsBuilder {
    provider: Arc<dyn IdTokenProvider>,
    audience: String,
    include_email: bool,
    quota_project_id: Option<String>,
    universe_domain: String,
}

impl IdTokenCredentialsBuilder {
    /// Requests that the minted token's claims include the caller's email.
    pub fn include_email(mut self, include_email: bool) -> Self {
        self.include_email = include_email;
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
    pub fn build(self) -> IdTokenCredentials {
        IdTokenCredentials {
            provider: self.provider,
            audience: self.audience,
            include_email: self.include_email,
            quota_project_id: self.quota_project_id,
            universe_domain: self.universe_domain,
            cached: AsyncMutex::new(None),
        }
    }
}

#[async_trait]
impl Credentials for IdTokenCredentials {
    async fn get_request_metadata(&self, _uri: &str) -> Result<RequestMetadata> {
        let token = self.ensure_fresh().await?;
        Ok(oauth2_request_metadata_for_id_token(&token, self.quota_project_id.as_deref()))
    }

    async fn refresh(&self) -> Result<()> {
        *self.cached.lock().await = None;
        self.ensure_fresh().await.map(|_| ())
    }

    fn universe_domain(&self) -> String {
        self.universe_domain.clone()
    }

    fn quota_project_id(&self) -> Option<String> {
        self.quota_project_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FixedProvider(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl IdTokenProvider for FixedProvider {
        async fn id_token(&self, _audience: &str, _include_email: bool) -> Result<IdToken> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(IdToken::new("id-token-value", Some(Utc::now() + chrono::Duration::seconds(3600))))
        }
    }

    #[tokio::test]
    async fn caches_until_near_expiration() {
        let provider = Arc::new(FixedProvider(std::sync::atomic::AtomicUsize::new(0)));
        let creds = IdTokenCredentials::new(provider.clone(), "https://example.com");
        creds.ensure_fresh().await.unwrap();
        creds.ensure_fresh().await.unwrap();
        assert_eq!(provider.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn peek_expiration_reads_exp_claim() {
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{}");
        let claims = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(br#"{"exp":1700000000}"#);
        let jwt = format!("{header}.{claims}.sig");
        let exp = peek_expiration(&jwt).unwrap();
        assert_eq!(exp.timestamp(), 1700000000);
    }
}
