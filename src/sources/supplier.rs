//! Supplier-sourced subject tokens: a user-provided callable,
//! invoked with the context; any error it raises is surfaced unchanged.

use async_trait::async_trait;

use crate::error::{Error, Result, SubjectTokenError};
use crate::sources::{ExternalAccountSupplierContext, SubjectTokenSource};

/// A user-supplied subject-token callable.
#[async_trait]
pub trait SubjectTokenSupplier: Send + Sync + std::fmt::Debug {
    /// Produces the subject token for `context`.
    async fn subject_token(&self, context: &ExternalAccountSupplierContext) -> Result<String>;
}

/// Adapts a [`SubjectTokenSupplier`] into a [`SubjectTokenSource`], wrapping
/// any error it raises as [`SubjectTokenError::Supplier`] unless it already
/// carries a more specific kind.
#[derive(Debug)]
pub struct SupplierSubjectTokenSource<S: SubjectTokenSupplier> {
    supplier: S,
}

impl<S: SubjectTokenSupplier> SupplierSubjectTokenSource<S> {
    /// Wraps `supplier`.
    pub fn new(supplier: S) -> Self {
        Self { supplier }
    }
}

#[async_trait]
impl<S: SubjectTokenSupplier> SubjectTokenSource for SupplierSubjectTokenSource<S> {
    async fn subject_token(&self, context: &ExternalAccountSupplierContext) -> Result<String> {
        self.supplier.subject_token(context).await.map_err(|e| match e {
            already_typed @ Error::SubjectToken(_) => already_typed,
            other => Error::SubjectToken(SubjectTokenError::Supplier(other.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FixedSupplier(&'static str);

    #[async_trait]
    impl SubjectTokenSupplier for FixedSupplier {
        async fn subject_token(&self, _context: &ExternalAccountSupplierContext) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[derive(Debug)]
    struct FailingSupplier;

    #[async_trait]
    impl SubjectTokenSupplier for FailingSupplier {
        async fn subject_token(&self, _context: &ExternalAccountSupplierContext) -> Result<String> {
            Err(Error::Io(std::io::Error::other("supplier exploded")))
        }
    }

    fn ctx() -> ExternalAccountSupplierContext {
        ExternalAccountSupplierContext {
            audience: "aud".into(),
            subject_token_type: "jwt".into(),
        }
    }

    #[tokio::test]
    async fn returns_supplier_value() {
        let source = SupplierSubjectTokenSource::new(FixedSupplier("supplied-token"));
        assert_eq!(source.subject_token(&ctx()).await.unwrap(), "supplied-token");
    }

    #[tokio::test]
    async fn wraps_supplier_failure() {
        let source = SupplierSubjectTokenSource::new(FailingSupplier);
        let err = source.subject_token(&ctx()).await.unwrap_err();
        assert!(matches!(err, Error::SubjectToken(SubjectTokenError::Supplier(_))));
    }
}
