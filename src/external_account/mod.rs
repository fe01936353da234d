//! The External-Account Pipeline: workload and
//! workforce identity federation.
//!
//! Glues a [`crate::sources::SubjectTokenSource`] to [`crate::sts`] and,
//! optionally, [`crate::iam`] for a follow-on impersonation hop.
//! `ExternalAccountCredentials` is the concrete [`Credentials`] produced;
//! [`ExternalAccountInfo`] parses the `external_account` JSON document shape
//! and dispatches `credential_source` to the matching subject-token source.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::clock::Clock;
use crate::credentials::oauth2::{OAuth2Core, TokenRefresher};
use crate::credentials::{oauth2_request_metadata, AccessTokenSource, Credentials, RequestMetadata};
use crate::error::{ConfigError, Error, Result};
use crate::http_client::SharedTransport;
use crate::iam::{Delegates, IamClient};
use crate::sources::aws::{AwsCredentialSource, AwsSubjectTokenSource};
use crate::sources::executable::ExecutableSubjectTokenSource;
use crate::sources::file::FileSubjectTokenSource;
use crate::sources::url::UrlSubjectTokenSource;
use crate::sources::{CredentialFormat, ExternalAccountSupplierContext, SubjectTokenSource};
use crate::sts::{requested_token_type, SharedStsClient, StsClient, StsRequestBuilder};
use crate::token::AccessToken;

/// `true` iff `audience` matches the workforce-pool shape
/// `//iam.{host}/locations/{location}/workforcePools/{pool}/providers/{provider}`
///. Behind the `external-account` feature this uses
/// a real regex; without it, an equivalent structural check over `/`-split
/// segments, since `regex` is an optional dependency (see Cargo.toml) and
/// this crate must still compile — with identical external behavior —
/// without it.
#[cfg(feature = "external-account")]
pub(crate) fn is_workforce_pool_audience(audience: &str) -> bool {
    use std::sync::OnceLock;
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::Regex::new(r"^//iam\.[^/]+/locations/[^/]+/workforcePools/[^/]+/providers/[^/]+$")
            .expect("static workforce-pool pattern is valid")
    });
    re.is_match(audience)
}

#[cfg(not(feature = "external-account"))]
pub(crate) fn is_workforce_pool_audience(audience: &str) -> bool {
    let segments: Vec<&str> = audience.split('/').collect();
    segments.len() == 9
        && segments[0].is_empty()
        && segments[1].is_empty()
        && segments[2].len() > 4
        && segments[2].starts_with("iam.")
        && segments[3] == "locations"
        && !segments[4].is_empty()
        && segments[5] == "workforcePools"
        && !segments[6].is_empty()
        && segments[7] == "providers"
        && !segments[8].is_empty()
}

/// Extracts the target principal (service account email) embedded in a
/// `service_account_impersonation_url`, e.g.
/// `.../serviceAccounts/foo@bar.iam.gserviceaccount.com:generateAccessToken`
/// yields `foo@bar.iam.gserviceaccount.com`. Shared with [`crate::adc`]'s
/// `impersonated_service_account` dispatch, which embeds the same URL shape.
pub(crate) fn principal_from_impersonation_url(url: &str) -> Result<String> {
    let after_marker = url
        .split("/serviceAccounts/")
        .nth(1)
        .ok_or_else(|| Error::Config(ConfigError::MissingField("service_account_impersonation_url")))?;
    Ok(after_marker.split(':').next().unwrap_or(after_marker).to_string())
}

/// The `external_account` credentials JSON document.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalAccountInfo {
    /// The workload/workforce identity pool provider resource name.
    pub audience: String,
    /// The subject-token type the provider expects, e.g.
    /// `urn:ietf:params:oauth:token-type:jwt`.
    pub subject_token_type: String,
    /// The STS token endpoint. Retained for fidelity with the JSON format;
    /// this crate derives the STS URL from `universe_domain` like every
    /// other component (see [`crate::consts::sts_token_url`]) rather than
    /// posting to this field verbatim.
    pub token_url: String,
    /// Endpoint for validating the exchanged token, unused by this crate.
    #[serde(default)]
    pub token_info_url: Option<String>,
    /// If set, the exchanged token is further exchanged via IAM
    /// impersonation.
    #[serde(default)]
    pub service_account_impersonation_url: Option<String>,
    /// Impersonation lifetime override.
    #[serde(default)]
    pub service_account_impersonation: Option<ServiceAccountImpersonationConfig>,
    /// OAuth2 client ID for STS client-credential auth.
    #[serde(default)]
    pub client_id: Option<String>,
    /// OAuth2 client secret for STS client-credential auth.
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Source-specific configuration for obtaining the subject token.
    pub credential_source: CredentialSourceJson,
    /// Quota project to attach to outgoing requests.
    #[serde(default)]
    pub quota_project_id: Option<String>,
    /// Universe domain (default `googleapis.com`).
    #[serde(default)]
    pub universe_domain: Option<String>,
    /// Workforce-pool user project, valid only on workforce-pool audiences.
    #[serde(default)]
    pub workforce_pool_user_project: Option<String>,
}

/// `service_account_impersonation` sub-object.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountImpersonationConfig {
    /// Requested token lifetime in seconds.
    #[serde(default)]
    pub token_lifetime_seconds: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct FormatConfig {
    #[serde(rename = "type", default = "default_format_type")]
    kind: String,
    #[serde(default)]
    subject_token_field_name: Option<String>,
}

fn default_format_type() -> String {
    "text".to_string()
}

impl FormatConfig {
    fn into_credential_format(self) -> Result<CredentialFormat> {
        match self.kind.as_str() {
            "json" => Ok(CredentialFormat::Json {
                field_name: self
                    .subject_token_field_name
                    .ok_or(Error::Config(ConfigError::MissingField("subject_token_field_name")))?,
            }),
            _ => Ok(CredentialFormat::Text),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ExecutableConfigJson {
    command: String,
    #[serde(default)]
    timeout_millis: Option<u64>,
    #[serde(default)]
    output_file: Option<String>,
}

/// The union of `credential_source` shapes a `credential_source` JSON object
/// can take (the `certificate` shape is out of scope — mTLS subject tokens
/// are not implemented by this crate). Variant order matters for `untagged`
/// deserialization: AWS and executable sources are tried before the
/// generic URL shape so a JSON document carrying both `url` and
/// `environment_id` resolves to AWS, not plain URL-sourced.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CredentialSourceJson {
    /// AWS-sourced (SigV4).
    Aws {
        /// Always `"aws1"` for the current AWS credential source version.
        environment_id: String,
        /// IMDS endpoint returning the region.
        #[serde(default)]
        region_url: Option<String>,
        /// IMDS endpoint returning the role name.
        #[serde(default)]
        url: Option<String>,
        /// Regional STS `GetCallerIdentity` verification URL template.
        regional_cred_verification_url: String,
        /// IMDSv2 session-token endpoint.
        #[serde(default)]
        imdsv2_session_token_url: Option<String>,
    },
    /// Executable-sourced (Pluggable Auth).
    Executable {
        /// The nested `executable` configuration object.
        executable: ExecutableConfigJson,
    },
    /// File-sourced.
    File {
        /// Path to the subject-token file.
        file: String,
        /// How to parse the file contents.
        #[serde(default)]
        format: Option<FormatConfig>,
    },
    /// URL-sourced. Tried last since it is the most permissive shape (only
    /// `url` is required).
    Url {
        /// The subject-token URL.
        url: String,
        /// Extra headers to send with the GET request.
        #[serde(default)]
        headers: HashMap<String, String>,
        /// How to parse the response body.
        #[serde(default)]
        format: Option<FormatConfig>,
    },
}

fn build_subject_token_source(
    source: CredentialSourceJson,
    transport: SharedTransport,
    env: crate::env::SharedEnv,
) -> Result<Arc<dyn SubjectTokenSource>> {
    match source {
        CredentialSourceJson::File { file, format } => {
            let format = format.map(FormatConfig::into_credential_format).transpose()?.unwrap_or_default();
            Ok(Arc::new(FileSubjectTokenSource::new(file, format)))
        }
        CredentialSourceJson::Url { url, headers, format } => {
            let format = format.map(FormatConfig::into_credential_format).transpose()?.unwrap_or_default();
            let headers = headers.into_iter().collect();
            Ok(Arc::new(UrlSubjectTokenSource::new(transport, url, headers, format)))
        }
        CredentialSourceJson::Aws {
            region_url,
            url,
            regional_cred_verification_url,
            imdsv2_session_token_url,
            ..
        } => Ok(Arc::new(AwsSubjectTokenSource::new(
            transport,
            env,
            AwsCredentialSource {
                regional_cred_verification_url,
                region_url,
                url,
                imdsv2_session_token_url,
            },
        ))),
        CredentialSourceJson::Executable { executable } => {
            let timeout = executable
                .timeout_millis
                .map(std::time::Duration::from_millis)
                .unwrap_or(crate::sources::executable::DEFAULT_TIMEOUT);
            let source = ExecutableSubjectTokenSource::new(
                executable.command,
                timeout,
                executable.output_file.map(std::path::PathBuf::from),
                None,
                env,
            )?;
            Ok(Arc::new(source))
        }
    }
}

/// The immutable configuration behind an [`ExternalAccountRefresher`],
/// shared between a credential and any scoped clone of it produced by
/// [`ExternalAccountCredentials::with_scopes`].
#[derive(Debug)]
struct ExternalAccountConfig {
    sts: SharedStsClient,
    iam: Option<IamClient>,
    source: Arc<dyn SubjectTokenSource>,
    audience: String,
    subject_token_type: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    workforce_pool_user_project: Option<String>,
    service_account_impersonation_url: Option<String>,
    impersonation_lifetime_seconds: Option<i64>,
}

#[derive(Debug)]
struct ExternalAccountRefresher {
    config: Arc<ExternalAccountConfig>,
    scopes: Vec<String>,
}

#[async_trait]
impl TokenRefresher for ExternalAccountRefresher {
    async fn refresh_access_token(&self, _clock: &dyn Clock) -> Result<AccessToken> {
        let config = &self.config;
        let context = ExternalAccountSupplierContext {
            audience: config.audience.clone(),
            subject_token_type: config.subject_token_type.clone(),
        };
        let subject_token = config.source.subject_token(&context).await?;

        let mut request = StsRequestBuilder::new()
            .audience(&config.audience)
            .subject_token(subject_token, &config.subject_token_type)
            .requested_token_type(requested_token_type::ACCESS_TOKEN)
            .scopes(self.scopes.clone());
        match (&config.client_id, &config.client_secret) {
            (Some(id), Some(secret)) => {
                request = request.client_credentials(id.clone(), secret.clone());
            }
            _ => {
                if let Some(user_project) = config.workforce_pool_user_project.as_deref() {
                    if !user_project.is_empty() {
                        request = request.options(serde_json::json!({ "userProject": user_project }));
                    }
                }
            }
        }
        let response = config.sts.exchange(request).await?;

        match (&config.iam, &config.service_account_impersonation_url) {
            (Some(iam), Some(url)) => {
                let principal = principal_from_impersonation_url(url)?;
                iam.generate_access_token(
                    &principal,
                    response.access_token.value(),
                    &self.scopes,
                    &Delegates::none(),
                    config.impersonation_lifetime_seconds,
                )
                .await
            }
            _ => Ok(response.access_token),
        }
    }
}

/// Workload/workforce identity federation credentials.
#[derive(Debug)]
pub struct ExternalAccountCredentials {
    config: Arc<ExternalAccountConfig>,
    core: Arc<OAuth2Core>,
    scopes: Vec<String>,
    quota_project_id: Option<String>,
    universe_domain: String,
}

impl ExternalAccountCredentials {
    /// The scopes this credential requests during its STS exchange.
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Parses an `external_account` JSON document and builds credentials
    /// from it, dispatching `credential_source` to the matching C5
    /// implementation.
    pub fn from_info(info: ExternalAccountInfo, transport: SharedTransport, env: crate::env::SharedEnv) -> Result<Self> {
        let source = build_subject_token_source(info.credential_source, transport.clone(), env)?;
        let mut builder = Self::builder(info.audience, info.subject_token_type, source).transport(transport);
        if let (Some(id), Some(secret)) = (info.client_id, info.client_secret) {
            builder = builder.client_credentials(id, secret);
        }
        if let Some(user_project) = info.workforce_pool_user_project {
            builder = builder.workforce_pool_user_project(user_project);
        }
        if let Some(url) = info.service_account_impersonation_url {
            builder = builder.service_account_impersonation_url(url);
        }
        if let Some(lifetime) = info.service_account_impersonation.and_then(|c| c.token_lifetime_seconds) {
            builder = builder.impersonation_lifetime_seconds(lifetime);
        }
        if let Some(quota) = info.quota_project_id {
            builder = builder.quota_project_id(quota);
        }
        if let Some(universe) = info.universe_domain {
            builder = builder.universe_domain(universe);
        }
        builder.build()
    }

    /// Starts a builder for credentials obtaining subject tokens from
    /// `source`.
    pub fn builder(
        audience: impl Into<String>,
        subject_token_type: impl Into<String>,
        source: Arc<dyn SubjectTokenSource>,
    ) -> ExternalAccountCredentialsBuilder {
        ExternalAccountCredentialsBuilder {
            audience: audience.into(),
            subject_token_type: subject_token_type.into(),
            source,
            scopes: Vec::new(),
            client_id: None,
            client_secret: None,
            workforce_pool_user_project: None,
            service_account_impersonation_url: None,
            impersonation_lifetime_seconds: None,
            quota_project_id: None,
            universe_domain: crate::consts::DEFAULT_UNIVERSE_DOMAIN.to_string(),
            transport: None,
        }
    }

    /// Returns a clone obtaining tokens scoped to `scopes` instead, with a
    /// freshly invalidated cache. The underlying subject token source,
    /// STS/IAM clients, and impersonation configuration are shared with the
    /// original.
    pub fn with_scopes(&self, scopes: Vec<String>) -> Self {
        let refresher: Arc<dyn TokenRefresher> = Arc::new(ExternalAccountRefresher {
            config: self.config.clone(),
            scopes: scopes.clone(),
        });
        Self {
            config: self.config.clone(),
            core: OAuth2Core::new(refresher, crate::clock::system()),
            scopes,
            quota_project_id: self.quota_project_id.clone(),
            universe_domain: self.universe_domain.clone(),
        }
    }
}

/// Builds an [`ExternalAccountCredentials`].
pub struct ExternalAccountCredentialsBuilder {
    audience: String,
    subject_token_type: String,
    source: Arc<dyn SubjectTokenSource>,
    scopes: Vec<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    workforce_pool_user_project: Option<String>,
    service_account_impersonation_url: Option<String>,
    impersonation_lifetime_seconds: Option<i64>,
    quota_project_id: Option<String>,
    universe_domain: String,
    transport: Option<SharedTransport>,
}

impl ExternalAccountCredentialsBuilder {
    /// Sets the requested scopes, unioned and space-joined in the STS
    /// request.
    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Sets HTTP Basic client credentials for the STS exchange.
    pub fn client_credentials(mut self, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self.client_secret = Some(client_secret.into());
        self
    }

    /// Sets the workforce-pool user project. Only valid on workforce-pool
    /// audiences; enforced at
    /// [`Self::build`].
    pub fn workforce_pool_user_project(mut self, workforce_pool_user_project: impl Into<String>) -> Self {
        self.workforce_pool_user_project = Some(workforce_pool_user_project.into());
        self
    }

    /// Configures a follow-on IAM impersonation hop after the STS exchange.
    pub fn service_account_impersonation_url(mut self, url: impl Into<String>) -> Self {
        self.service_account_impersonation_url = Some(url.into());
        self
    }

    /// Overrides the impersonation lifetime (default 3600s, min 600, max
    /// 43200).
    pub fn impersonation_lifetime_seconds(mut self, lifetime_seconds: i64) -> Self {
        self.impersonation_lifetime_seconds = Some(lifetime_seconds);
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

    /// Sets the HTTP transport used for STS/IAM calls.
    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the credential, enforcing the workforce-pool user-project
    /// guard.
    pub fn build(self) -> Result<ExternalAccountCredentials> {
        if let Some(user_project) = &self.workforce_pool_user_project {
            if !user_project.is_empty() && !is_workforce_pool_audience(&self.audience) {
                return Err(Error::Config(ConfigError::WorkforceUserProjectOnWorkloadAudience(
                    self.audience.clone(),
                )));
            }
        }
        let transport = self.transport.unwrap_or_else(crate::http_client::default_transport);
        let sts = Arc::new(StsClient::new(transport.clone(), self.universe_domain.clone()));
        let iam = self
            .service_account_impersonation_url
            .is_some()
            .then(|| IamClient::new(transport, self.universe_domain.clone()));
        let config = Arc::new(ExternalAccountConfig {
            sts,
            iam,
            source: self.source,
            audience: self.audience,
            subject_token_type: self.subject_token_type,
            client_id: self.client_id,
            client_secret: self.client_secret,
            workforce_pool_user_project: self.workforce_pool_user_project,
            service_account_impersonation_url: self.service_account_impersonation_url,
            impersonation_lifetime_seconds: self.impersonation_lifetime_seconds,
        });
        let refresher: Arc<dyn TokenRefresher> = Arc::new(ExternalAccountRefresher {
            config: config.clone(),
            scopes: self.scopes.clone(),
        });
        let core = OAuth2Core::new(refresher, crate::clock::system());
        Ok(ExternalAccountCredentials {
            config,
            core,
            scopes: self.scopes,
            quota_project_id: self.quota_project_id,
            universe_domain: self.universe_domain,
        })
    }
}

#[async_trait]
impl Credentials for ExternalAccountCredentials {
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
impl AccessTokenSource for ExternalAccountCredentials {
    async fn access_token(&self) -> Result<AccessToken> {
        self.core.ensure_fresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::test_support::{json_response, FakeTransport};

    #[derive(Debug)]
    struct FixedSubjectToken(&'static str);

    #[async_trait]
    impl SubjectTokenSource for FixedSubjectToken {
        async fn subject_token(&self, _context: &ExternalAccountSupplierContext) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn refresh_exchanges_subject_token_via_sts() {
        let transport = FakeTransport::new(vec![Ok(json_response(
            200,
            serde_json::json!({"access_token": "sts-token", "issued_token_type": "urn:ietf:params:oauth:token-type:access_token", "expires_in": 3600}),
        ))]);
        let creds = ExternalAccountCredentials::builder(
            "//iam.googleapis.com/projects/p/locations/global/workloadIdentityPools/pool/providers/prov",
            "urn:ietf:params:oauth:token-type:jwt",
            Arc::new(FixedSubjectToken("subject-jwt")),
        )
        .transport(transport.clone())
        .build()
        .unwrap();
        let headers = creds.get_request_metadata("https://x").await.unwrap();
        assert_eq!(headers[0].1, vec!["Bearer sts-token".to_string()]);

        let requests = transport.requests();
        let body = String::from_utf8(requests[0].body.clone().unwrap().to_vec()).unwrap();
        assert!(body.contains("subject-jwt"));
    }

    #[tokio::test]
    async fn impersonation_hop_follows_sts_exchange() {
        let transport = FakeTransport::new(vec![
            Ok(json_response(200, serde_json::json!({"access_token": "sts-intermediate"}))),
            Ok(json_response(
                200,
                serde_json::json!({"accessToken": "impersonated-final", "expireTime": "2099-01-01T00:00:00Z"}),
            )),
        ]);
        let creds = ExternalAccountCredentials::builder(
            "//iam.googleapis.com/projects/p/locations/global/workloadIdentityPools/pool/providers/prov",
            "urn:ietf:params:oauth:token-type:jwt",
            Arc::new(FixedSubjectToken("oid")),
        )
        .service_account_impersonation_url(
            "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/sa@p.iam.gserviceaccount.com:generateAccessToken",
        )
        .transport(transport.clone())
        .build()
        .unwrap();
        let headers = creds.get_request_metadata("https://x").await.unwrap();
        assert_eq!(headers[0].1, vec!["Bearer impersonated-final".to_string()]);
        assert_eq!(transport.call_count(), 2);
        assert_eq!(transport.requests()[1].header_value("authorization"), Some("Bearer sts-intermediate"));
    }

    #[test]
    fn workforce_user_project_rejected_on_workload_audience() {
        let err = ExternalAccountCredentials::builder(
            "//iam.googleapis.com/projects/p/locations/global/workloadIdentityPools/pool/providers/prov",
            "urn:ietf:params:oauth:token-type:jwt",
            Arc::new(FixedSubjectToken("oid")),
        )
        .workforce_pool_user_project("my-project")
        .build()
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::WorkforceUserProjectOnWorkloadAudience(_))
        ));
    }

    #[test]
    fn workforce_user_project_accepted_on_workforce_audience() {
        let creds = ExternalAccountCredentials::builder(
            "//iam.googleapis.com/locations/global/workforcePools/pool/providers/prov",
            "urn:ietf:params:oauth:token-type:jwt",
            Arc::new(FixedSubjectToken("oid")),
        )
        .workforce_pool_user_project("my-project")
        .build();
        assert!(creds.is_ok());
    }

    #[test]
    fn is_workforce_pool_audience_matches_expected_shape() {
        assert!(is_workforce_pool_audience(
            "//iam.googleapis.com/locations/global/workforcePools/pool/providers/prov"
        ));
        assert!(!is_workforce_pool_audience(
            "//iam.googleapis.com/projects/p/locations/global/workloadIdentityPools/pool/providers/prov"
        ));
    }

    #[test]
    fn principal_from_impersonation_url_extracts_email() {
        let principal = principal_from_impersonation_url(
            "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/sa@p.iam.gserviceaccount.com:generateAccessToken",
        )
        .unwrap();
        assert_eq!(principal, "sa@p.iam.gserviceaccount.com");
    }
}
