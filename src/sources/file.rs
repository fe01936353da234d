//! File-sourced subject tokens.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{Error, Result, SubjectTokenError};
use crate::sources::{extract_token, CredentialFormat, ExternalAccountSupplierContext, SubjectTokenSource};

/// Reads the subject token from a local file, either as plain text or a
/// named field of a JSON document.
#[derive(Debug, Clone)]
pub struct FileSubjectTokenSource {
    path: PathBuf,
    format: CredentialFormat,
}

impl FileSubjectTokenSource {
    /// Builds a source reading `path` with `format`.
    pub fn new(path: impl Into<PathBuf>, format: CredentialFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }
}

#[async_trait]
impl SubjectTokenSource for FileSubjectTokenSource {
    async fn subject_token(&self, _context: &ExternalAccountSupplierContext) -> Result<String> {
        let body = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::SubjectToken(SubjectTokenError::FileRead {
                path: self.path.clone(),
                source: e,
            }))?;
        extract_token(&self.format, &body).map_err(|e| match e {
            Error::SubjectToken(SubjectTokenError::MissingJsonField { field }) => {
                Error::SubjectToken(SubjectTokenError::MissingJsonField { field })
            }
            Error::Serde(source) => Error::SubjectToken(SubjectTokenError::FileMalformedJson {
                path: self.path.clone(),
                source,
            }),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn reads_plain_text_token() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "  raw-token-value\n").unwrap();
        let source = FileSubjectTokenSource::new(file.path(), CredentialFormat::Text);
        let ctx = ExternalAccountSupplierContext {
            audience: "aud".into(),
            subject_token_type: "urn:ietf:params:oauth:token-type:jwt".into(),
        };
        let token = source.subject_token(&ctx).await.unwrap();
        assert_eq!(token, "raw-token-value");
    }

    #[tokio::test]
    async fn reads_json_field() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"id_token": "abc"}}"#).unwrap();
        let source = FileSubjectTokenSource::new(
            file.path(),
            CredentialFormat::Json {
                field_name: "id_token".into(),
            },
        );
        let ctx = ExternalAccountSupplierContext {
            audience: "aud".into(),
            subject_token_type: "urn:ietf:params:oauth:token-type:jwt".into(),
        };
        let token = source.subject_token(&ctx).await.unwrap();
        assert_eq!(token, "abc");
    }

    #[tokio::test]
    async fn missing_file_surfaces_file_read_error() {
        let source = FileSubjectTokenSource::new("/nonexistent/path/does-not-exist", CredentialFormat::Text);
        let ctx = ExternalAccountSupplierContext {
            audience: "aud".into(),
            subject_token_type: "jwt".into(),
        };
        let err = source.subject_token(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::SubjectToken(SubjectTokenError::FileRead { .. })));
    }
}
