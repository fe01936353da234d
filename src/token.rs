//! The [`AccessToken`] and [`IdToken`] value types.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};

/// An OAuth2 bearer token, immutable once constructed.
///
/// Two tokens are equal iff their value, expiration, and scopes are all
/// equal. `expiration` of `None` means "never expires from the cache's
/// perspective".
#[derive(Clone)]
pub struct AccessToken {
    value: SecretString,
    expiration: Option<DateTime<Utc>>,
    scopes: Vec<String>,
}

impl AccessToken {
    /// Builds a new access token. `scopes` is stored in the order given.
    pub fn new(value: impl Into<String>, expiration: Option<DateTime<Utc>>, scopes: Vec<String>) -> Self {
        Self {
            value: SecretString::from(value.into()),
            expiration,
            scopes,
        }
    }

    /// The raw token string.
    pub fn value(&self) -> &str {
        self.value.expose_secret()
    }

    /// The token's expiration time, if any.
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    /// The scopes this token was granted, in their original order.
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[redacted]")
            .field("expiration", &self.expiration)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl PartialEq for AccessToken {
    fn eq(&self, other: &Self) -> bool {
        self.value.expose_secret() == other.value.expose_secret()
            && self.expiration == other.expiration
            && self.scopes == other.scopes
    }
}

impl Eq for AccessToken {}

/// A signed ID token (JWT), as returned by [`crate::iam`]'s `generateIdToken`
/// or the GCE metadata server's `identity` path.
#[derive(Clone)]
pub struct IdToken {
    value: SecretString,
    expiration: Option<DateTime<Utc>>,
}

impl IdToken {
    /// Builds a new ID token.
    pub fn new(value: impl Into<String>, expiration: Option<DateTime<Utc>>) -> Self {
        Self {
            value: SecretString::from(value.into()),
            expiration,
        }
    }

    /// The compact JWT string.
    pub fn value(&self) -> &str {
        self.value.expose_secret()
    }

    /// The token's expiration time, if parseable from its `exp` claim.
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }
}

impl std::fmt::Debug for IdToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdToken")
            .field("value", &"[redacted]")
            .field("expiration", &self.expiration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_requires_all_fields_equal() {
        let a = AccessToken::new("t", None, vec!["s1".into()]);
        let b = AccessToken::new("t", None, vec!["s1".into()]);
        let c = AccessToken::new("t", None, vec!["s2".into()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn debug_redacts_value() {
        let t = AccessToken::new("super-secret", None, vec![]);
        assert!(!format!("{t:?}").contains("super-secret"));
    }
}
