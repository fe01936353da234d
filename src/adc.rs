//! Application Default Credentials discovery.
//!
//! [`default_credentials`] runs the ordered search (environment variable,
//! well-known gcloud config file, GCE metadata probe) and dispatches the
//! resulting JSON document to the matching concrete credential kind. Every
//! step is driven through the injectable [`crate::env::EnvProvider`] and
//! [`crate::http_client::HttpTransport`] seams so the whole resolver is
//! testable without touching the real filesystem, environment, or network.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::consts::CLOUD_PLATFORM_SCOPE;
use crate::credentials::compute_engine::{self, ComputeEngineCredentials};
use crate::credentials::external_account_authorized_user::{
    ExternalAccountAuthorizedUserCredentials, ExternalAccountAuthorizedUserInfo,
};
use crate::credentials::impersonated::ImpersonatedCredentials;
use crate::credentials::service_account::{ServiceAccountCredentials, ServiceAccountInfo};
use crate::credentials::user::{UserCredentials, UserCredentialsInfo};
use crate::credentials::{AccessTokenSource, Credentials};
use crate::env::{SharedEnv, CLOUDSDK_CONFIG, GOOGLE_APPLICATION_CREDENTIALS};
use crate::error::{ConfigError, Error, Result};
use crate::external_account::{principal_from_impersonation_url, ExternalAccountCredentials, ExternalAccountInfo};
use crate::http_client::{default_transport, SharedTransport};

const WELL_KNOWN_FILE_NAME: &str = "application_default_credentials.json";

/// Options controlling [`default_credentials`].
///
/// The zero value resolves the default transport, the real process
/// environment, and the default `cloud-platform` scope.
#[derive(Debug, Default, Clone)]
pub struct AdcOptions {
    /// Scopes requested for credential kinds that support scoping
    /// (`service_account`, `external_account`, ambient GCE). Defaults to
    /// [`CLOUD_PLATFORM_SCOPE`] when empty.
    pub scopes: Vec<String>,
    /// Overrides the quota project embedded in the discovered credentials
    /// file, if any.
    pub quota_project_id: Option<String>,
    /// Overrides the HTTP transport (default: [`default_transport`]).
    pub transport: Option<SharedTransport>,
    /// Overrides the environment provider (default: [`crate::env::system`]).
    pub env: Option<SharedEnv>,
}

fn effective_scopes(options: &AdcOptions) -> Vec<String> {
    if options.scopes.is_empty() {
        vec![CLOUD_PLATFORM_SCOPE.to_string()]
    } else {
        options.scopes.clone()
    }
}

/// Resolves Application Default Credentials:
///
/// 1. `GOOGLE_APPLICATION_CREDENTIALS` points at a JSON file.
/// 2. The well-known gcloud config file, under `$CLOUDSDK_CONFIG` or the
///    OS-specific gcloud config directory.
/// 3. The ambient GCE/GKE/Cloud Run metadata server.
///
/// Returns [`ConfigError::NoAdcFound`] if none of the three produce a
/// credential.
pub async fn default_credentials(options: &AdcOptions) -> Result<Arc<dyn Credentials>> {
    let transport = options.transport.clone().unwrap_or_else(default_transport);
    let env = options.env.clone().unwrap_or_else(crate::env::system);

    if let Some(path) = env.var(GOOGLE_APPLICATION_CREDENTIALS) {
        let path = PathBuf::from(path);
        tracing::debug!(path = %path.display(), "resolving ADC from GOOGLE_APPLICATION_CREDENTIALS");
        let bytes = read_credentials_file(&path).await?;
        return credentials_from_json(&bytes, transport, env, options);
    }

    if let Some(path) = well_known_file_path(env.as_ref()) {
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                tracing::debug!(path = %path.display(), "resolving ADC from well-known gcloud config file");
                return credentials_from_json(&bytes, transport, env, options);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no well-known ADC file present");
            }
            Err(source) => return Err(Error::Config(ConfigError::ReadFile { path, source })),
        }
    }

    if compute_engine::on_gce(&transport, &env).await {
        tracing::debug!("resolving ADC from the ambient GCE metadata server");
        let creds = ComputeEngineCredentials::builder()
            .transport(transport)
            .env(env)
            .scopes(effective_scopes(options))
            .quota_project_id(options.quota_project_id.clone().unwrap_or_default())
            .build();
        return Ok(Arc::new(creds));
    }

    Err(Error::Config(ConfigError::NoAdcFound))
}

async fn read_credentials_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|source| Error::Config(ConfigError::ReadFile { path: path.to_path_buf(), source }))
}

/// Builds the well-known gcloud ADC file path: `$CLOUDSDK_CONFIG` if set,
/// otherwise the OS-specific gcloud config directory under the user's home.
fn well_known_file_path(env: &dyn crate::env::EnvProvider) -> Option<PathBuf> {
    if let Some(dir) = env.var(CLOUDSDK_CONFIG) {
        return Some(PathBuf::from(dir).join(WELL_KNOWN_FILE_NAME));
    }
    gcloud_config_dir(env).map(|dir| dir.join(WELL_KNOWN_FILE_NAME))
}

#[cfg(windows)]
fn gcloud_config_dir(env: &dyn crate::env::EnvProvider) -> Option<PathBuf> {
    env.var("APPDATA").map(|appdata| PathBuf::from(appdata).join("gcloud"))
}

#[cfg(not(windows))]
fn gcloud_config_dir(env: &dyn crate::env::EnvProvider) -> Option<PathBuf> {
    env.home_dir().map(|home| home.join(".config").join("gcloud"))
}

/// An `impersonated_service_account` credentials JSON document. Only
/// `authorized_user` and `service_account` source credentials are
/// supported, matching what `gcloud auth application-default login
/// --impersonate-service-account` actually writes.
#[derive(Debug, Deserialize)]
struct ImpersonatedServiceAccountInfo {
    service_account_impersonation_url: String,
    #[serde(default)]
    delegates: Vec<String>,
    source_credentials: serde_json::Value,
    #[serde(default)]
    quota_project_id: Option<String>,
}

fn credentials_from_json(
    bytes: &[u8],
    transport: SharedTransport,
    env: SharedEnv,
    options: &AdcOptions,
) -> Result<Arc<dyn Credentials>> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(ConfigError::MalformedJson)?;
    let kind = value.get("type").and_then(serde_json::Value::as_str).unwrap_or_default().to_string();
    match kind.as_str() {
        "authorized_user" => {
            let info: UserCredentialsInfo = serde_json::from_value(value).map_err(ConfigError::MalformedJson)?;
            let quota = options.quota_project_id.clone().or_else(|| info.quota_project_id.clone()).unwrap_or_default();
            let creds = UserCredentials::builder(info.client_id, info.client_secret, info.refresh_token)
                .transport(transport)
                .quota_project_id(quota)
                .build();
            Ok(Arc::new(creds))
        }
        "service_account" => {
            let info: ServiceAccountInfo = serde_json::from_value(value).map_err(ConfigError::MalformedJson)?;
            let quota = options.quota_project_id.clone().or_else(|| info.quota_project_id.clone()).unwrap_or_default();
            let mut builder = ServiceAccountCredentials::builder(info.client_email, info.private_key_id, info.private_key)?
                .transport(transport)
                .token_uri(info.token_uri)
                .scopes(effective_scopes(options))
                .quota_project_id(quota);
            if let Some(universe) = info.universe_domain {
                builder = builder.universe_domain(universe);
            }
            Ok(Arc::new(builder.build()))
        }
        "external_account" => {
            let info: ExternalAccountInfo = serde_json::from_value(value).map_err(ConfigError::MalformedJson)?;
            let creds = ExternalAccountCredentials::from_info(info, transport, env)?;
            Ok(Arc::new(creds.with_scopes(effective_scopes(options))))
        }
        "external_account_authorized_user" => {
            let info: ExternalAccountAuthorizedUserInfo = serde_json::from_value(value).map_err(ConfigError::MalformedJson)?;
            Ok(Arc::new(ExternalAccountAuthorizedUserCredentials::from_info(info, transport)))
        }
        "impersonated_service_account" => {
            let info: ImpersonatedServiceAccountInfo = serde_json::from_value(value).map_err(ConfigError::MalformedJson)?;
            let target_principal = principal_from_impersonation_url(&info.service_account_impersonation_url)?;
            let source = access_token_source_from_json(info.source_credentials, transport.clone())?;
            let quota = options.quota_project_id.clone().or(info.quota_project_id).unwrap_or_default();
            let creds = ImpersonatedCredentials::builder(source, target_principal)
                .scopes(effective_scopes(options))
                .delegates(info.delegates)
                .quota_project_id(quota)
                .transport(transport)
                .build()?;
            Ok(Arc::new(creds))
        }
        other => Err(Error::Config(ConfigError::UnknownCredentialType(other.to_string()))),
    }
}

/// Builds the `Arc<dyn AccessTokenSource>` backing an
/// `impersonated_service_account`'s `source_credentials`. Limited to the
/// two kinds gcloud actually nests there.
fn access_token_source_from_json(value: serde_json::Value, transport: SharedTransport) -> Result<Arc<dyn AccessTokenSource>> {
    let kind = value.get("type").and_then(serde_json::Value::as_str).unwrap_or_default().to_string();
    match kind.as_str() {
        "authorized_user" => {
            let info: UserCredentialsInfo = serde_json::from_value(value).map_err(ConfigError::MalformedJson)?;
            Ok(Arc::new(UserCredentials::from_info(info, transport)))
        }
        "service_account" => {
            let info: ServiceAccountInfo = serde_json::from_value(value).map_err(ConfigError::MalformedJson)?;
            Ok(Arc::new(ServiceAccountCredentials::from_info(info, transport)?))
        }
        other => Err(Error::Config(ConfigError::UnknownCredentialType(other.to_string()))),
    }
}
