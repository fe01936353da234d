//! `ServiceAccountCredentials`.
//!
//! Two refresh strategies, chosen by configuration:
//!
//! - When scopes are present and `use_jwt_access_with_scope` is `false`
//!   (the default), [`crate::credentials::oauth2::OAuth2Core`] drives a
//!   normal token-endpoint exchange: a self-signed RS256 JWT assertion is
//!   posted to `token_uri` with `grant_type=urn:ietf:params:oauth:grant-type:jwt-bearer`.
//! - When `use_jwt_access_with_scope` is `true`, or no scopes were
//!   configured, `get_request_metadata` mints and caches a per-`(uri,
//!   scopes)` self-signed JWT locally, never calling the token endpoint at
//!   all ("JWT access").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::credentials::id_token::IdTokenProvider;
use crate::credentials::oauth2::{OAuth2Core, TokenRefresher};
use crate::credentials::{oauth2_request_metadata, standard_metadata, AccessTokenSource, Credentials, RequestMetadata};
use crate::error::{ConfigError, Error, Result, TokenResponseError};
use crate::http_client::{HttpRequest, SharedTransport};
use crate::token::{AccessToken, IdToken};
use crate::trust_boundary::TrustBoundaryCache;

const GRANT_TYPE_JWT_BEARER: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Lifetime of a minted JWT assertion or self-signed JWT-access token.
const JWT_LIFETIME: ChronoDuration = ChronoDuration::seconds(3600);

/// A `service_account` credentials JSON document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceAccountInfo {
    /// The GCP project this service account belongs to.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Key ID, embedded as the JWT `kid` header.
    pub private_key_id: String,
    /// PEM-encoded PKCS#8 RSA private key.
    pub private_key: String,
    /// The service account's email, used as both JWT `iss` and `sub`.
    pub client_email: String,
    /// OAuth2 client ID.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Token endpoint (default `https://oauth2.googleapis.com/token`).
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    /// Quota project to attach to outgoing requests.
    #[serde(default)]
    pub quota_project_id: Option<String>,
    /// Universe domain (default `googleapis.com`).
    #[serde(default)]
    pub universe_domain: Option<String>,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct IdTokenResponse {
    id_token: String,
}

fn parse_private_key(pem: &str) -> Result<EncodingKey> {
    EncodingKey::from_rsa_pem(pem.as_bytes())
        .map_err(|e| Error::Config(ConfigError::InvalidPrivateKey(e.to_string())))
}

fn sign_claims(key: &EncodingKey, key_id: &str, claims: &serde_json::Value) -> Result<String> {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(key_id.to_string());
    jsonwebtoken::encode(&header, claims, key).map_err(|e| Error::Config(ConfigError::InvalidPrivateKey(e.to_string())))
}

#[derive(Debug)]
struct ServiceAccountRefresher {
    transport: SharedTransport,
    token_uri: String,
    client_email: String,
    key: EncodingKey,
    key_id: String,
    scopes: Vec<String>,
}

impl ServiceAccountRefresher {
    fn assertion(&self, clock: &dyn Clock, aud: &str, extra: serde_json::Value) -> Result<String> {
        let now = clock.now();
        let mut claims = serde_json::json!({
            "iss": self.client_email,
            "aud": aud,
            "iat": now.timestamp(),
            "exp": (now + JWT_LIFETIME).timestamp(),
        });
        if let serde_json::Value::Object(extra_map) = extra {
            if let serde_json::Value::Object(map) = &mut claims {
                map.extend(extra_map);
            }
        }
        sign_claims(&self.key, &self.key_id, &claims)
    }
}

#[async_trait]
impl TokenRefresher for ServiceAccountRefresher {
    async fn refresh_access_token(&self, clock: &dyn Clock) -> Result<AccessToken> {
        let assertion = self.assertion(
            clock,
            &self.token_uri,
            serde_json::json!({ "scope": self.scopes.join(" ") }),
        )?;
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", GRANT_TYPE_JWT_BEARER)
            .append_pair("assertion", &assertion)
            .finish();
        let request = HttpRequest::post(&self.token_uri, body.into_bytes())
            .header("content-type", "application/x-www-form-urlencoded");
        let response = self.transport.execute(request).await.map_err(Error::Io)?;
        if !response.is_success() {
            return Err(Error::TokenResponse(TokenResponseError::new(response.status, None, None)));
        }
        let parsed: TokenResponse = response.json()?;
        let expiration = parsed
            .expires_in
            .map(|secs| clock.now() + ChronoDuration::seconds(secs))
            .or_else(|| Some(clock.now() + JWT_LIFETIME));
        Ok(AccessToken::new(parsed.access_token, expiration, self.scopes.clone()))
    }
}

/// Service-account credentials backed by a PEM private key.
#[derive(Debug)]
pub struct ServiceAccountCredentials {
    core: Option<Arc<OAuth2Core>>,
    refresher: Arc<ServiceAccountRefresher>,
    use_jwt_access_with_scope: bool,
    scopes: Vec<String>,
    quota_project_id: Option<String>,
    universe_domain: String,
    trust_boundary: Option<Arc<TrustBoundaryCache>>,
    jwt_cache: Mutex<HashMap<(String, Vec<String>), AccessToken>>,
}

impl ServiceAccountCredentials {
    /// Builds credentials from a parsed `service_account` JSON document.
    pub fn from_info(info: ServiceAccountInfo, transport: SharedTransport) -> Result<Self> {
        let mut builder = Self::builder(info.client_email, info.private_key_id, info.private_key)?
            .transport(transport)
            .token_uri(info.token_uri);
        if let Some(quota) = info.quota_project_id {
            builder = builder.quota_project_id(quota);
        }
        if let Some(universe) = info.universe_domain {
            builder = builder.universe_domain(universe);
        }
        Ok(builder.build())
    }

    /// Starts a builder. `private_key` must be a PEM-encoded PKCS#8 RSA key.
    pub fn builder(
        client_email: impl Into<String>,
        private_key_id: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Result<ServiceAccountCredentialsBuilder> {
        let private_key = private_key.into();
        let key = parse_private_key(&private_key)?;
        Ok(ServiceAccountCredentialsBuilder {
            client_email: client_email.into(),
            private_key_id: private_key_id.into(),
            key,
            token_uri: default_token_uri(),
            transport: None,
            scopes: Vec::new(),
            use_jwt_access_with_scope: false,
            quota_project_id: None,
            universe_domain: crate::consts::DEFAULT_UNIVERSE_DOMAIN.to_string(),
            env: crate::env::system(),
        })
    }

    fn uses_jwt_access(&self) -> bool {
        self.scopes.is_empty() || self.use_jwt_access_with_scope
    }

    fn cached_jwt_access_token(&self, uri: &str) -> Result<AccessToken> {
        let key = (uri.to_string(), self.scopes.clone());
        if let Some(token) = self.jwt_cache.lock().unwrap().get(&key) {
            if token.expiration().map(|exp| Utc::now() < exp - ChronoDuration::seconds(60)).unwrap_or(false) {
                return Ok(token.clone());
            }
        }
        let aud = uri.to_string();
        let claims = serde_json::json!({ "sub": self.refresher.client_email });
        let assertion = self.refresher.assertion(&crate::clock::SystemClock, &aud, claims)?;
        let expiration = Utc::now() + JWT_LIFETIME;
        let token = AccessToken::new(assertion, Some(expiration), self.scopes.clone());
        self.jwt_cache.lock().unwrap().insert(key, token.clone());
        Ok(token)
    }
}

/// Builds a [`ServiceAccountCredentials`].
pub struct ServiceAccountCredentialsBuilder {
    client_email: String,
    private_key_id: String,
    key: EncodingKey,
    token_uri: String,
    transport: Option<SharedTransport>,
    scopes: Vec<String>,
    use_jwt_access_with_scope: bool,
    quota_project_id: Option<String>,
    universe_domain: String,
    env: crate::env::SharedEnv,
}

impl ServiceAccountCredentialsBuilder {
    /// Overrides the token endpoint.
    pub fn token_uri(mut self, token_uri: impl Into<String>) -> Self {
        self.token_uri = token_uri.into();
        self
    }

    /// Sets the HTTP transport.
    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the requested scopes.
    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// When `true`, [`Credentials::get_request_metadata`] always mints a
    /// local self-signed JWT rather than calling the token endpoint, even
    /// when scopes are configured.
    pub fn use_jwt_access_with_scope(mut self, use_jwt_access_with_scope: bool) -> Self {
        self.use_jwt_access_with_scope = use_jwt_access_with_scope;
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
    pub fn build(self) -> ServiceAccountCredentials {
        let transport = self.transport.unwrap_or_else(crate::http_client::default_transport);
        let refresher = Arc::new(ServiceAccountRefresher {
            transport: transport.clone(),
            token_uri: self.token_uri,
            client_email: self.client_email,
            key: self.key,
            key_id: self.private_key_id,
            scopes: self.scopes.clone(),
        });
        let uses_jwt_access = self.scopes.is_empty() || self.use_jwt_access_with_scope;
        let core = (!uses_jwt_access).then(|| {
            let core = OAuth2Core::new(refresher.clone(), crate::clock::system());
            core
        });
        let trust_boundary = core.as_ref().and_then(|core| {
            crate::credentials::wire_trust_boundary(
                core,
                &self.env,
                transport,
                self.universe_domain.clone(),
                format!("serviceAccounts/{}", refresher.client_email),
            )
        });
        ServiceAccountCredentials {
            core,
            refresher,
            use_jwt_access_with_scope: self.use_jwt_access_with_scope,
            scopes: self.scopes,
            quota_project_id: self.quota_project_id,
            universe_domain: self.universe_domain,
            trust_boundary,
            jwt_cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Credentials for ServiceAccountCredentials {
    async fn get_request_metadata(&self, uri: &str) -> Result<RequestMetadata> {
        if self.uses_jwt_access() {
            let token = self.cached_jwt_access_token(uri)?;
            return Ok(standard_metadata(token.value(), self.quota_project_id.as_deref(), None));
        }
        let core = self.core.as_ref().expect("core is Some whenever uses_jwt_access() is false");
        oauth2_request_metadata(core, self.quota_project_id.as_deref(), self.trust_boundary.as_ref()).await
    }

    async fn refresh(&self) -> Result<()> {
        if let Some(core) = &self.core {
            core.refresh().await.map(|_| ())
        } else {
            self.jwt_cache.lock().unwrap().clear();
            Ok(())
        }
    }

    fn universe_domain(&self) -> String {
        self.universe_domain.clone()
    }

    fn quota_project_id(&self) -> Option<String> {
        self.quota_project_id.clone()
    }

    fn has_request_metadata_only(&self) -> bool {
        self.uses_jwt_access()
    }
}

#[async_trait]
impl AccessTokenSource for ServiceAccountCredentials {
    async fn access_token(&self) -> Result<AccessToken> {
        match &self.core {
            Some(core) => core.ensure_fresh().await,
            None => self.cached_jwt_access_token(&self.refresher.token_uri),
        }
    }
}

#[async_trait]
impl IdTokenProvider for ServiceAccountCredentials {
    async fn id_token(&self, audience: &str, _include_email: bool) -> Result<IdToken> {
        let assertion = self.refresher.assertion(
            &crate::clock::SystemClock,
            &self.refresher.token_uri,
            serde_json::json!({ "target_audience": audience }),
        )?;
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", GRANT_TYPE_JWT_BEARER)
            .append_pair("assertion", &assertion)
            .finish();
        let request = HttpRequest::post(&self.refresher.token_uri, body.into_bytes())
            .header("content-type", "application/x-www-form-urlencoded");
        let response = self.refresher.transport.execute(request).await.map_err(Error::Io)?;
        if !response.is_success() {
            return Err(Error::TokenResponse(TokenResponseError::new(response.status, None, None)));
        }
        let parsed: IdTokenResponse = response.json()?;
        Ok(IdToken::new(parsed.id_token, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::test_support::{json_response, FakeTransport};

    // RSA 2048 PKCS#8 test key (not used anywhere outside this test file).
    const TEST_KEY: &str = include_str!("../../tests/fixtures/test_service_account_key.pem");

    #[tokio::test]
    async fn refresh_posts_jwt_bearer_assertion_when_scoped() {
        let transport = FakeTransport::new(vec![Ok(json_response(
            200,
            serde_json::json!({"access_token": "SA1", "expires_in": 3600}),
        ))]);
        let creds = ServiceAccountCredentials::builder("sa@p.iam.gserviceaccount.com", "kid1", TEST_KEY)
            .unwrap()
            .transport(transport.clone())
            .scopes(vec!["https://www.googleapis.com/auth/cloud-platform".to_string()])
            .build();
        let headers = creds.get_request_metadata("https://x").await.unwrap();
        assert_eq!(headers[0].1, vec!["Bearer SA1".to_string()]);

        let requests = transport.requests();
        let body = String::from_utf8(requests[0].body.clone().unwrap().to_vec()).unwrap();
        assert!(body.contains(&format!("grant_type={}", GRANT_TYPE_JWT_BEARER.replace(':', "%3A"))));
    }

    #[tokio::test]
    async fn jwt_access_mode_never_calls_token_endpoint() {
        let transport = FakeTransport::new(vec![]);
        let creds = ServiceAccountCredentials::builder("sa@p.iam.gserviceaccount.com", "kid1", TEST_KEY)
            .unwrap()
            .transport(transport.clone())
            .build();
        assert!(creds.has_request_metadata_only());
        let headers = creds.get_request_metadata("https://pubsub.googleapis.com/").await.unwrap();
        assert!(headers[0].1[0].starts_with("Bearer "));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn jwt_access_cache_is_keyed_by_uri_and_scopes() {
        let transport = FakeTransport::new(vec![]);
        let creds = ServiceAccountCredentials::builder("sa@p.iam.gserviceaccount.com", "kid1", TEST_KEY)
            .unwrap()
            .transport(transport)
            .build();
        let a = creds.get_request_metadata("https://a.example/").await.unwrap();
        let b = creds.get_request_metadata("https://a.example/").await.unwrap();
        let c = creds.get_request_metadata("https://b.example/").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
