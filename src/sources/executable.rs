//! Executable-sourced (Pluggable Auth) subject tokens.
//!
//! Gated on `GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES=1`; runs a configured
//! absolute command with a fixed environment, optionally short-circuited by
//! a cached, unexpired response in an output file.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;

use crate::env::{SharedEnv, ALLOW_EXECUTABLES_VAR};
use crate::error::{ConfigError, Error, Result, SubjectTokenError};
use crate::sources::{ExternalAccountSupplierContext, SubjectTokenSource};

/// Default executable timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Minimum accepted executable timeout.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Maximum accepted executable timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct ExecutableResponse {
    version: u32,
    success: bool,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    saml_response: Option<String>,
    #[serde(default)]
    expiration_time: Option<i64>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Runs a Pluggable Auth executable to obtain a subject token.
#[derive(Debug)]
pub struct ExecutableSubjectTokenSource {
    command: String,
    timeout: Duration,
    output_file: Option<std::path::PathBuf>,
    impersonated_email: Option<String>,
    env: SharedEnv,
}

impl ExecutableSubjectTokenSource {
    /// Builds a source running `command`, enforcing the `5..=120` second
    /// timeout window.
    pub fn new(
        command: impl Into<String>,
        timeout: Duration,
        output_file: Option<std::path::PathBuf>,
        impersonated_email: Option<String>,
        env: SharedEnv,
    ) -> Result<Self> {
        if timeout < MIN_TIMEOUT || timeout > MAX_TIMEOUT {
            return Err(Error::Config(ConfigError::InvalidExecutableTimeout(timeout.as_secs())));
        }
        Ok(Self {
            command: command.into(),
            timeout,
            output_file,
            impersonated_email,
            env,
        })
    }

    async fn cached_response(&self) -> Option<ExecutableResponse> {
        let path = self.output_file.as_ref()?;
        let body = tokio::fs::read_to_string(path).await.ok()?;
        let response: ExecutableResponse = serde_json::from_str(&body).ok()?;
        if !response.success {
            return None;
        }
        if let Some(expiration) = response.expiration_time {
            let expiry = DateTime::<Utc>::from_timestamp(expiration, 0)?;
            if expiry <= Utc::now() {
                return None;
            }
        }
        Some(response)
    }

    async fn run(&self, context: &ExternalAccountSupplierContext) -> Result<ExecutableResponse> {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("GOOGLE_EXTERNAL_ACCOUNT_AUDIENCE", &context.audience)
            .env("GOOGLE_EXTERNAL_ACCOUNT_TOKEN_TYPE", &context.subject_token_type)
            .env("GOOGLE_EXTERNAL_ACCOUNT_INTERACTIVE", "0");
        if let Some(email) = &self.impersonated_email {
            command.env("GOOGLE_EXTERNAL_ACCOUNT_IMPERSONATED_EMAIL", email);
        }
        if let Some(output_file) = &self.output_file {
            command.env("GOOGLE_EXTERNAL_ACCOUNT_OUTPUT_FILE", output_file);
        }

        let child = command
            .spawn()
            .map_err(|_| Error::SubjectToken(SubjectTokenError::ExecutableFailed { status: None }))?;

        // `wait_with_output` drains stdout/stderr concurrently with waiting
        // for exit; waiting first and reading after deadlocks once the
        // child writes more than the pipe buffer holds.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|_| Error::SubjectToken(SubjectTokenError::ExecutableFailed { status: None }))?
            }
            Err(_) => return Err(Error::SubjectToken(SubjectTokenError::ExecutableTimeout)),
        };
        if !output.status.success() {
            return Err(Error::SubjectToken(SubjectTokenError::ExecutableFailed {
                status: output.status.code(),
            }));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(&stdout)
            .map_err(|e| Error::SubjectToken(SubjectTokenError::ExecutableMalformedResponse(e.to_string())))
    }
}

#[async_trait]
impl SubjectTokenSource for ExecutableSubjectTokenSource {
    async fn subject_token(&self, context: &ExternalAccountSupplierContext) -> Result<String> {
        if self.env.var(ALLOW_EXECUTABLES_VAR).as_deref() != Some("1") {
            return Err(Error::Config(ConfigError::ExecutablesDisabled));
        }

        let response = match self.cached_response().await {
            Some(cached) => cached,
            None => self.run(context).await?,
        };

        if response.version != 1 {
            return Err(Error::SubjectToken(SubjectTokenError::ExecutableMalformedResponse(
                format!("unsupported response version {}", response.version),
            )));
        }
        if !response.success {
            return Err(Error::Executable {
                code: response.code.unwrap_or_default(),
                message: response.message.unwrap_or_default(),
            });
        }
        match response.token_type.as_deref() {
            Some("saml2") => response.saml_response.ok_or_else(|| {
                Error::SubjectToken(SubjectTokenError::ExecutableMalformedResponse(
                    "success response missing saml_response".into(),
                ))
            }),
            _ => response.id_token.ok_or_else(|| {
                Error::SubjectToken(SubjectTokenError::ExecutableMalformedResponse(
                    "success response missing id_token".into(),
                ))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::test_support::MapEnv;

    fn enabled_env() -> SharedEnv {
        MapEnv::new().with_var(ALLOW_EXECUTABLES_VAR, "1")
    }

    #[tokio::test]
    async fn disabled_by_default() {
        let source = ExecutableSubjectTokenSource::new("echo hi", DEFAULT_TIMEOUT, None, None, MapEnv::new()).unwrap();
        let ctx = ExternalAccountSupplierContext {
            audience: "aud".into(),
            subject_token_type: "jwt".into(),
        };
        let err = source.subject_token(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ExecutablesDisabled)));
    }

    #[tokio::test]
    async fn runs_executable_and_parses_success_response() {
        let script = r#"echo '{"version":1,"success":true,"token_type":"jwt","id_token":"exec-token"}'"#;
        let source = ExecutableSubjectTokenSource::new(script, DEFAULT_TIMEOUT, None, None, enabled_env()).unwrap();
        let ctx = ExternalAccountSupplierContext {
            audience: "aud".into(),
            subject_token_type: "jwt".into(),
        };
        let token = source.subject_token(&ctx).await.unwrap();
        assert_eq!(token, "exec-token");
    }

    #[tokio::test]
    async fn failure_response_surfaces_executable_error() {
        let script = r#"echo '{"version":1,"success":false,"code":"1","message":"denied"}'"#;
        let source = ExecutableSubjectTokenSource::new(script, DEFAULT_TIMEOUT, None, None, enabled_env()).unwrap();
        let ctx = ExternalAccountSupplierContext {
            audience: "aud".into(),
            subject_token_type: "jwt".into(),
        };
        let err = source.subject_token(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Executable { ref code, .. } if code == "1"));
    }

    #[test]
    fn rejects_timeout_outside_window() {
        let err = ExecutableSubjectTokenSource::new("echo hi", Duration::from_secs(1), None, None, enabled_env())
            .unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::InvalidExecutableTimeout(1))));
    }
}
