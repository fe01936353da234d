//! Subject-token sources.
//!
//! A subject-token source produces `(subject_token_type, subject_token)`
//! given an [`ExternalAccountSupplierContext`]. Five variants, one module
//! each: [`file`], [`url`], [`aws`], [`executable`], [`supplier`].

pub mod aws;
pub mod executable;
pub mod file;
pub mod supplier;
pub mod url;

use async_trait::async_trait;

use crate::error::Result;

/// Context passed to every subject-token source, mirroring the external
/// account credential's own configuration.
#[derive(Debug, Clone)]
pub struct ExternalAccountSupplierContext {
    /// The external-account `audience`.
    pub audience: String,
    /// The subject token type the caller expects back (e.g.
    /// `urn:ietf:params:oauth:token-type:jwt`).
    pub subject_token_type: String,
}

/// How to extract the subject token from a file or URL response body
///.
#[derive(Debug, Clone)]
pub enum CredentialFormat {
    /// The entire body, trimmed, is the token.
    Text,
    /// The body is JSON; extract `field_name`.
    Json {
        /// The JSON field holding the subject token.
        field_name: String,
    },
}

impl Default for CredentialFormat {
    fn default() -> Self {
        Self::Text
    }
}

pub(crate) fn extract_token(format: &CredentialFormat, body: &str) -> Result<String> {
    match format {
        CredentialFormat::Text => Ok(body.trim().to_string()),
        CredentialFormat::Json { field_name } => {
            let value: serde_json::Value = serde_json::from_str(body)?;
            value
                .get(field_name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    crate::error::Error::SubjectToken(crate::error::SubjectTokenError::MissingJsonField {
                        field: field_name.clone(),
                    })
                })
        }
    }
}

/// Any producer of a subject token.
#[async_trait]
pub trait SubjectTokenSource: Send + Sync + std::fmt::Debug {
    /// Returns the subject token for `context`.
    async fn subject_token(&self, context: &ExternalAccountSupplierContext) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_format_trims_whitespace() {
        let token = extract_token(&CredentialFormat::Text, "  abc123\n").unwrap();
        assert_eq!(token, "abc123");
    }

    #[test]
    fn json_format_extracts_named_field() {
        let format = CredentialFormat::Json {
            field_name: "id_token".to_string(),
        };
        let token = extract_token(&format, r#"{"id_token": "xyz", "other": 1}"#).unwrap();
        assert_eq!(token, "xyz");
    }

    #[test]
    fn json_format_missing_field_errors() {
        let format = CredentialFormat::Json {
            field_name: "id_token".to_string(),
        };
        assert!(extract_token(&format, r#"{"other": 1}"#).is_err());
    }
}
