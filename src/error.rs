//! Error handling in [`google_cloud_auth`][crate].
//!
//! Builder-time misconfiguration is always [`Error::Config`], transport
//! failures are [`Error::Io`], non-2xx responses from STS/IAM/the token
//! endpoint are [`Error::TokenResponse`], and subject-token retrieval
//! failures (file/URL/AWS/executable/supplier) are [`Error::SubjectToken`].
//! Nothing here is retried automatically by the error type itself; retry
//! policy lives with the callers that know which requests are idempotent
//! (see [`crate::sts`]).
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top level error type for [`google_cloud_auth`][crate].
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed JSON, invalid lifetime, mismatched universe domain, or a
    /// missing required field. Always surfaced synchronously from a builder
    /// or constructor; never produced mid-refresh.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport failure: connection reset, timeout, DNS failure, or any
    /// other I/O-class error underneath the HTTP client.
    #[error("transport error: {0}")]
    Io(#[source] std::io::Error),

    /// A request built by this crate could not be sent over HTTP.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response from STS, the IAM credentials API, or a token
    /// endpoint.
    #[error(transparent)]
    TokenResponse(#[from] TokenResponseError),

    /// `signBlob` endpoint failure.
    #[error("signing error: {0}")]
    Signing(#[source] TokenResponseError),

    /// Subject-token retrieval failed (file missing, URL failure, executable
    /// failure, IMDS failure, or a user-supplied callable raised).
    #[error(transparent)]
    SubjectToken(#[from] SubjectTokenError),

    /// A Pluggable Auth executable exited 0 but reported `success: false`.
    #[error("executable auth failed: [{code}] {message}")]
    Executable {
        /// Machine-readable code from the executable's response.
        code: String,
        /// Human-readable message from the executable's response.
        message: String,
    },

    /// Error (de)serializing JSON.
    #[error("error (de)serializing JSON: {0}")]
    Serde(#[from] serde_json::Error),

    /// A refresh was in progress and the joining caller was cancelled
    /// (e.g. its surrounding task was aborted) before the refresh completed.
    #[error("refresh cancelled")]
    RefreshCancelled,

    /// Propagated to every joiner of a single-flight refresh that failed:
    /// the refresh error is shared (not cloned) across all callers awaiting
    /// the same in-flight task.
    #[error("{0}")]
    Shared(Arc<Error>),
}

impl Error {
    /// True if retrying the operation that produced this error might
    /// succeed: 500, 503, 408, 429 responses, plus any I/O-class error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::TokenResponse(e) => e.retryable,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            Error::Shared(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Errors raised synchronously while building or configuring a credential.
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[error("malformed credentials JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("unknown credentials type {0:?}")]
    UnknownCredentialType(String),

    #[error("missing required field {0:?}")]
    MissingField(&'static str),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error(
        "wrapping credential universe domain {wrapper:?} does not match source credential universe domain {source:?}"
    )]
    UniverseDomainMismatch { wrapper: String, source: String },

    #[error("impersonation lifetime must be in (0, 43200] seconds, got {0}")]
    InvalidImpersonationLifetime(i64),

    #[error(
        "client-side CAB refreshMargin ({refresh_margin_secs}s) must be >= minimumTokenLifetime ({min_lifetime_secs}s) + 60s"
    )]
    InvalidCabMargins {
        refresh_margin_secs: i64,
        min_lifetime_secs: i64,
    },

    #[error("refreshMargin ({refresh_margin_secs}s) must be greater than expirationMargin ({expiration_margin_secs}s)")]
    InvalidCacheMargins {
        refresh_margin_secs: i64,
        expiration_margin_secs: i64,
    },

    #[error("workforcePoolUserProject is only valid for workforce pool audiences, got {0:?}")]
    WorkforceUserProjectOnWorkloadAudience(String),

    #[error("a CredentialAccessBoundary must contain between 1 and 10 rules, got {0}")]
    InvalidAccessBoundaryRuleCount(usize),

    #[error("availabilityCondition expression must not be empty")]
    EmptyAvailabilityCondition,

    #[error("Pluggable Auth executables are disabled; set GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES=1 to enable")]
    ExecutablesDisabled,

    #[error("Pluggable Auth executable timeout must be between 5 and 120 seconds, got {0}")]
    InvalidExecutableTimeout(u64),

    #[error("failed to read credentials file {path:?}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no Application Default Credentials could be found; see https://cloud.google.com/docs/authentication/external/set-up-adc")]
    NoAdcFound,

    #[error("unable to determine AWS region for external account credential")]
    MissingAwsRegion,
}

/// A non-2xx response from STS, the IAM credentials API, or a token URL.
#[derive(Error, Debug, Clone)]
#[error("token endpoint returned HTTP {http_status}{}{}",
    error_code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default(),
    error_description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct TokenResponseError {
    /// The HTTP status code of the failing response.
    pub http_status: u16,
    /// The OAuth2 `error` field, if the body parsed as JSON.
    pub error_code: Option<String>,
    /// The OAuth2 `error_description` field, if present.
    pub error_description: Option<String>,
    /// True iff `http_status` is in `{500, 503, 408, 429}`.
    pub retryable: bool,
}

impl TokenResponseError {
    /// Builds a `TokenResponseError` from an HTTP status, computing
    /// `retryable` per §4.3.
    pub fn new(http_status: u16, error_code: Option<String>, error_description: Option<String>) -> Self {
        let retryable = matches!(http_status, 500 | 503 | 408 | 429);
        Self {
            http_status,
            error_code,
            error_description,
            retryable,
        }
    }
}

/// Failure to retrieve a third-party subject token from a configured source.
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum SubjectTokenError {
    #[error("subject token file {path:?} could not be read: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("subject token file {path:?} is not valid JSON: {source}")]
    FileMalformedJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("subject token field {field:?} missing from JSON source")]
    MissingJsonField { field: String },

    #[error("subject token URL request failed: {0}")]
    UrlRequest(#[source] TokenResponseError),

    #[error("AWS metadata/credential retrieval failed: {0}")]
    Aws(String),

    #[error("Pluggable Auth executable exited with status {status:?}")]
    ExecutableFailed { status: Option<i32> },

    #[error("Pluggable Auth executable response was not version 1 or was malformed: {0}")]
    ExecutableMalformedResponse(String),

    #[error("Pluggable Auth executable timed out")]
    ExecutableTimeout,

    #[error("user-supplied subject token callable failed: {0}")]
    Supplier(String),
}
