//! Well-known scopes and universe-domain-parameterized endpoint hosts.
//!
//! Gathered in one place since every concrete credential kind and the
//! STS/IAM clients need them.

/// The default universe domain, used when a credential does not specify one.
pub const DEFAULT_UNIVERSE_DOMAIN: &str = "googleapis.com";

/// Default OAuth2 scope requested for Application Default Credentials when
/// the caller did not specify one.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Scope granting access to the caller's basic profile/email, commonly
/// combined with [`CLOUD_PLATFORM_SCOPE`].
pub const USERINFO_EMAIL_SCOPE: &str = "https://www.googleapis.com/auth/userinfo.email";

/// The well-known GCE/GKE metadata server host, overridable via
/// `GCE_METADATA_HOST`.
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

/// Token endpoint path on the metadata server.
pub const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

/// ID token endpoint path on the metadata server.
pub const METADATA_IDENTITY_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/identity";

/// Returns the STS token-exchange endpoint for a given universe domain.
pub fn sts_token_url(universe_domain: &str) -> String {
    format!("https://sts.{universe_domain}/v1/token")
}

/// Returns the IAM credentials `generateAccessToken` endpoint for a service
/// account email/principal and universe domain.
pub fn iam_generate_access_token_url(universe_domain: &str, principal: &str) -> String {
    format!(
        "https://iamcredentials.{universe_domain}/v1/projects/-/serviceAccounts/{principal}:generateAccessToken"
    )
}

/// Returns the IAM credentials `generateIdToken` endpoint.
pub fn iam_generate_id_token_url(universe_domain: &str, principal: &str) -> String {
    format!("https://iamcredentials.{universe_domain}/v1/projects/-/serviceAccounts/{principal}:generateIdToken")
}

/// Returns the IAM credentials `signBlob` endpoint.
pub fn iam_sign_blob_url(universe_domain: &str, principal: &str) -> String {
    format!("https://iamcredentials.{universe_domain}/v1/projects/-/serviceAccounts/{principal}:signBlob")
}

/// Returns the trust-boundary allow-list lookup endpoint for a project
/// number / principal and universe domain.
pub fn trust_boundary_url(universe_domain: &str, locator: &str) -> String {
    format!("https://iamcredentials.{universe_domain}/v1/{locator}/allowedLocations")
}

/// Default header the IAM/STS clients attach identifying this library,
/// mirroring the `x-goog-api-client` convention used across Google Cloud
/// client libraries.
pub const API_CLIENT_HEADER: &str = "x-goog-api-client";

/// The quota-project header name.
pub const QUOTA_PROJECT_HEADER: &str = "x-goog-user-project";

/// The trust-boundary allow-list header name.
pub const TRUST_BOUNDARY_HEADER: &str = "x-allowed-locations";
