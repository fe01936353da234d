//! The polymorphic [`Credentials`] abstraction.
//!
//! `Credentials` is implemented as a trait with one `impl` per concrete kind.
//! Every concrete kind embeds an [`oauth2::OAuth2Core`] for cache semantics
//! (single-flight refresh, staleness, change listeners) and supplies a
//! [`oauth2::TokenRefresher`] that knows how to mint a fresh
//! [`crate::AccessToken`].

pub mod compute_engine;
pub mod downscoped;
pub mod external_account_authorized_user;
pub mod id_token;
pub mod impersonated;
pub mod oauth2;
pub mod service_account;
pub mod user;
pub mod with_refresh;

use std::sync::Arc;

use async_trait::async_trait;

use crate::consts::QUOTA_PROJECT_HEADER;
use crate::env::{is_trust_boundary_enabled, SharedEnv};
use crate::error::Result;
use crate::http_client::SharedTransport;
use crate::token::AccessToken;
use crate::trust_boundary::{TrustBoundary, TrustBoundaryCache};

use oauth2::{ChangeListener, OAuth2Core};

/// Request metadata: an ordered map from header name to an ordered list of
/// values, the `getRequestMetadata` return shape used across this crate.
pub type RequestMetadata = Vec<(String, Vec<String>)>;

/// The abstract credential interface.
///
/// Implementors must satisfy the quota-project invariant: if
/// [`Credentials::quota_project_id`] returns `Some`, the metadata returned
/// by [`Credentials::get_request_metadata`] contains exactly one
/// `x-goog-user-project` header equal to it.
#[async_trait]
pub trait Credentials: Send + Sync + std::fmt::Debug {
    /// Assembles request metadata for a call to `uri`, refreshing the
    /// underlying token per its fresh/stale/expired state. Never blocks
    /// when the cached token is merely STALE.
    async fn get_request_metadata(&self, uri: &str) -> Result<RequestMetadata>;

    /// Forces an unconditional token refresh (still single-flighted: joins
    /// an in-progress refresh rather than starting a second one).
    async fn refresh(&self) -> Result<()>;

    /// The universe domain this credential is scoped to. Defaults to
    /// `googleapis.com`.
    fn universe_domain(&self) -> String;

    /// The quota project ID attached to outgoing requests, if configured.
    fn quota_project_id(&self) -> Option<String> {
        None
    }

    /// `true` if this credential kind only ever returns static/empty
    /// request metadata and never performs a refresh (rare; used by test
    /// doubles and credential kinds operating purely from a local
    /// self-signed JWT).
    fn has_request_metadata_only(&self) -> bool {
        false
    }
}

/// A source of a raw, un-wrapped [`AccessToken`] rather than composed
/// request metadata: server-side downscoping and
/// client-side CAB both need the *source* credential's bearer token to use
/// as an STS `subject_token`, not a ready-to-send header map. Every
/// OAuth2-backed [`Credentials`] implementation in this crate also
/// implements this trait by delegating to its embedded
/// [`oauth2::OAuth2Core::ensure_fresh`].
#[async_trait]
pub trait AccessTokenSource: Send + Sync + std::fmt::Debug {
    /// Returns a fresh (possibly cached) access token.
    async fn access_token(&self) -> Result<AccessToken>;
}

/// Builds the standard header set common to every OAuth2-backed credential,
/// in a fixed composition order: `Authorization` first, then
/// `x-goog-user-project` if set, then `x-allowed-locations` if the trust
/// boundary is populated. Credential-specific extra headers are the
/// caller's responsibility to append after this.
pub(crate) fn standard_metadata(
    token_value: &str,
    quota_project_id: Option<&str>,
    trust_boundary: Option<&TrustBoundary>,
) -> RequestMetadata {
    let mut metadata = RequestMetadata::new();
    metadata.push((
        "authorization".to_string(),
        vec![format!("Bearer {token_value}")],
    ));
    if let Some(project) = quota_project_id {
        if !project.is_empty() {
            metadata.push((QUOTA_PROJECT_HEADER.to_string(), vec![project.to_string()]));
        }
    }
    if let Some(tb) = trust_boundary {
        if let Some(header) = tb.header_value() {
            metadata.push((crate::consts::TRUST_BOUNDARY_HEADER.to_string(), vec![header]));
        }
    }
    metadata
}

/// Assembles request metadata from a cached ID token (used by
/// [`id_token::IdTokenCredentials`]), which carries no trust boundary of its
/// own.
pub(crate) fn oauth2_request_metadata_for_id_token(
    token: &crate::token::IdToken,
    quota_project_id: Option<&str>,
) -> RequestMetadata {
    standard_metadata(token.value(), quota_project_id, None)
}

/// Ensures a fresh token via `core`, then assembles request metadata using
/// [`standard_metadata`]. Shared by every concrete credential kind that
/// embeds an [`OAuth2Core`].
pub(crate) async fn oauth2_request_metadata(
    core: &Arc<OAuth2Core>,
    quota_project_id: Option<&str>,
    trust_boundary: Option<&Arc<TrustBoundaryCache>>,
) -> Result<RequestMetadata> {
    let token = core.ensure_fresh().await?;
    let cached = trust_boundary.and_then(|tb| tb.get());
    Ok(standard_metadata(token.value(), quota_project_id, cached.as_ref()))
}

/// Builds a [`TrustBoundaryCache`] and wires it to refresh (fire-and-forget)
/// after every successful token refresh on `core`, iff the trust-boundary
/// experiment is enabled in `env`. Returns
/// `None` when the experiment is not opted into; callers then skip the
/// `x-allowed-locations` header entirely.
pub(crate) fn wire_trust_boundary(
    core: &Arc<OAuth2Core>,
    env: &SharedEnv,
    transport: SharedTransport,
    universe_domain: impl Into<String>,
    locator: impl Into<String>,
) -> Option<Arc<TrustBoundaryCache>> {
    if !is_trust_boundary_enabled(env.as_ref()) {
        return None;
    }
    let cache = TrustBoundaryCache::new(transport, universe_domain, locator);
    let listener_cache = cache.clone();
    let listener: ChangeListener = Arc::new(move |token: &AccessToken| {
        let cache = listener_cache.clone();
        let bearer = token.value().to_string();
        tokio::spawn(async move {
            cache.refresh(&bearer).await;
        });
    });
    core.add_change_listener(listener);
    Some(cache)
}
