//! Trust Boundary fetch-and-cache.
//!
//! Opt-in via `GOOGLE_AUTH_TRUST_BOUNDARY_ENABLE_EXPERIMENT`. After a
//! successful token refresh, if enabled, a credential GETs the allowed-
//! locations endpoint using the just-refreshed token and caches the result.
//! A no-op boundary (`encodedLocations == "0x0"`) still attaches an empty
//! header; a failed fetch with no cached value leaves the header unset.

use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::consts::trust_boundary_url;
use crate::error::Result;
use crate::http_client::{HttpRequest, SharedTransport};

const NO_OP_ENCODING: &str = "0x0";

/// The cached allow-list of locations attached to outgoing requests via the
/// `x-allowed-locations` header.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrustBoundary {
    #[serde(rename = "encodedLocations")]
    encoded_locations: String,
    #[serde(default)]
    locations: Vec<String>,
}

impl TrustBoundary {
    /// `true` iff this boundary is the explicit no-op sentinel.
    pub fn is_no_op(&self) -> bool {
        self.encoded_locations == NO_OP_ENCODING
    }

    /// The header value to attach, or `None` if the boundary should not be
    /// sent at all. A no-op boundary still attaches an empty string.
    pub fn header_value(&self) -> Option<String> {
        if self.is_no_op() {
            Some(String::new())
        } else {
            Some(self.encoded_locations.clone())
        }
    }

    /// The raw encoded-locations string, for diagnostics.
    pub fn encoded_locations(&self) -> &str {
        &self.encoded_locations
    }

    /// The decoded list of allowed locations.
    pub fn locations(&self) -> &[String] {
        &self.locations
    }
}

/// Fetches (or reuses a cached) [`TrustBoundary`] for a principal locator
/// (e.g. `projects/123/serviceAccounts/sa@project.iam.gserviceaccount.com`).
#[derive(Debug)]
pub struct TrustBoundaryClient {
    transport: SharedTransport,
    universe_domain: String,
}

impl TrustBoundaryClient {
    /// Builds a client for the given universe domain.
    pub fn new(transport: SharedTransport, universe_domain: impl Into<String>) -> Self {
        Self {
            transport,
            universe_domain: universe_domain.into(),
        }
    }

    /// Fetches the trust boundary for `locator`, authenticating with
    /// `bearer_token` (the just-refreshed access token). On failure, the
    /// caller is expected to retain any previously cached value rather than
    /// clearing it.
    pub async fn fetch(&self, locator: &str, bearer_token: &str) -> Result<TrustBoundary> {
        let url = trust_boundary_url(&self.universe_domain, locator);
        let request = HttpRequest::get(url).header("authorization", format!("Bearer {bearer_token}"));
        let response = self
            .transport
            .execute(request)
            .await
            .map_err(crate::error::Error::Io)?;
        if !response.is_success() {
            warn!(status = response.status, "trust boundary fetch failed");
            return Err(crate::error::Error::TokenResponse(
                crate::error::TokenResponseError::new(response.status, None, None),
            ));
        }
        Ok(response.json()?)
    }
}

/// Maintains a "retain last-known-good on failure" policy around a
/// [`TrustBoundaryClient`].
#[derive(Debug)]
pub struct TrustBoundaryCache {
    client: TrustBoundaryClient,
    locator: String,
    cached: std::sync::Mutex<Option<TrustBoundary>>,
}

impl TrustBoundaryCache {
    /// Builds a cache for the given principal locator.
    pub fn new(transport: SharedTransport, universe_domain: impl Into<String>, locator: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            client: TrustBoundaryClient::new(transport, universe_domain),
            locator: locator.into(),
            cached: std::sync::Mutex::new(None),
        })
    }

    /// Refreshes the boundary using `bearer_token`. On failure, retains
    /// (and returns) the previously cached value if one exists; returns
    /// `None` only if there is no cached value and the fetch failed.
    pub async fn refresh(&self, bearer_token: &str) -> Option<TrustBoundary> {
        match self.client.fetch(&self.locator, bearer_token).await {
            Ok(boundary) => {
                *self.cached.lock().unwrap() = Some(boundary.clone());
                Some(boundary)
            }
            Err(e) => {
                warn!(error = %e, "trust boundary refresh failed, retaining last-known value");
                self.cached.lock().unwrap().clone()
            }
        }
    }

    /// The cached value, with no I/O.
    pub fn get(&self) -> Option<TrustBoundary> {
        self.cached.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_op_boundary_still_attaches_empty_header() {
        let tb = TrustBoundary {
            encoded_locations: "0x0".into(),
            locations: vec![],
        };
        assert!(tb.is_no_op());
        assert_eq!(tb.header_value(), Some(String::new()));
    }

    #[test]
    fn populated_boundary_attaches_encoded_value() {
        let tb = TrustBoundary {
            encoded_locations: "0xABCD".into(),
            locations: vec!["us-central1".into()],
        };
        assert!(!tb.is_no_op());
        assert_eq!(tb.header_value(), Some("0xABCD".into()));
    }
}
