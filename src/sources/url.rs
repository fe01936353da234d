//! URL-sourced subject tokens: GET a configured URL with a
//! configured header map and a 30s timeout, same text/JSON parsing as
//! file-sourced tokens.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result, SubjectTokenError, TokenResponseError};
use crate::http_client::{HttpRequest, SharedTransport};
use crate::sources::{extract_token, CredentialFormat, ExternalAccountSupplierContext, SubjectTokenSource};

/// Default request timeout for URL-sourced subject tokens.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches the subject token from a GET response.
#[derive(Debug, Clone)]
pub struct UrlSubjectTokenSource {
    transport: SharedTransport,
    url: String,
    headers: Vec<(String, String)>,
    format: CredentialFormat,
}

impl UrlSubjectTokenSource {
    /// Builds a source GETting `url` with `headers` attached.
    pub fn new(
        transport: SharedTransport,
        url: impl Into<String>,
        headers: Vec<(String, String)>,
        format: CredentialFormat,
    ) -> Self {
        Self {
            transport,
            url: url.into(),
            headers,
            format,
        }
    }
}

#[async_trait]
impl SubjectTokenSource for UrlSubjectTokenSource {
    async fn subject_token(&self, _context: &ExternalAccountSupplierContext) -> Result<String> {
        let mut request = HttpRequest::get(&self.url);
        for (name, value) in &self.headers {
            request = request.header(name.clone(), value.clone());
        }
        let response = self.transport.execute(request).await.map_err(Error::Io)?;
        if !response.is_success() {
            return Err(Error::SubjectToken(SubjectTokenError::UrlRequest(
                TokenResponseError::new(response.status, None, None),
            )));
        }
        let body = response.text().map_err(|e| {
            Error::SubjectToken(SubjectTokenError::UrlRequest(TokenResponseError::new(
                response.status,
                None,
                Some(format!("invalid utf-8 body: {e}")),
            )))
        })?;
        extract_token(&self.format, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::test_support::FakeTransport;
    use crate::http_client::HttpResponse;

    #[tokio::test]
    async fn parses_json_response_field() {
        let transport = FakeTransport::new(vec![Ok(HttpResponse {
            status: 200,
            headers: vec![],
            body: bytes::Bytes::from_static(br#"{"access_token":"tok-1"}"#),
        })]);
        let source = UrlSubjectTokenSource::new(
            transport,
            "https://metadata.example/token",
            vec![("Metadata".into(), "true".into())],
            CredentialFormat::Json {
                field_name: "access_token".into(),
            },
        );
        let ctx = ExternalAccountSupplierContext {
            audience: "aud".into(),
            subject_token_type: "jwt".into(),
        };
        let token = source.subject_token(&ctx).await.unwrap();
        assert_eq!(token, "tok-1");
    }

    #[tokio::test]
    async fn non_success_status_is_url_request_error() {
        let transport = FakeTransport::new(vec![Ok(HttpResponse {
            status: 503,
            headers: vec![],
            body: bytes::Bytes::new(),
        })]);
        let source = UrlSubjectTokenSource::new(transport, "https://metadata.example/token", vec![], CredentialFormat::Text);
        let ctx = ExternalAccountSupplierContext {
            audience: "aud".into(),
            subject_token_type: "jwt".into(),
        };
        let err = source.subject_token(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::SubjectToken(SubjectTokenError::UrlRequest(_))));
    }
}
