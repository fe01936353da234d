//! [`CredentialAccessBoundary`] and [`AccessBoundaryRule`],
//! shared by server-side downscoping ([`crate::credentials::downscoped`])
//! and client-side CAB ([`crate::cab`]).

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error, Result};

/// An optional CEL availability condition on an [`AccessBoundaryRule`].
///
/// Real CEL parsing is out of scope; this type performs only structural
/// validation and carries the raw expression forward as its own
/// "compiled AST" payload, treating CEL compilation as an opaque step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityCondition {
    /// The raw CEL expression, never parsed by this crate.
    pub expression: String,
    /// Optional human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Optional human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AvailabilityCondition {
    /// Builds a condition, rejecting an empty expression at construction
    /// time: `expression` is required whenever a condition is present at
    /// all.
    pub fn new(expression: impl Into<String>) -> Result<Self> {
        let expression = expression.into();
        if expression.is_empty() {
            return Err(Error::Config(ConfigError::EmptyAvailabilityCondition));
        }
        Ok(Self {
            expression,
            title: None,
            description: None,
        })
    }

    /// Attaches a title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Attaches a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The "compiled" representation sent over the wire: today this is
    /// just the validated expression plus metadata, since CEL parsing is
    /// explicitly out of scope. Named distinctly from the constructor to
    /// make the opaque-compile-step boundary visible at call sites.
    pub fn compile(&self) -> CompiledCondition {
        CompiledCondition {
            expression: self.expression.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
        }
    }
}

/// The "compiled" form of an [`AvailabilityCondition`] embedded into a
/// serialized [`CredentialAccessBoundary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledCondition {
    /// The raw expression (the "AST" in this opaque implementation).
    pub expression: String,
    /// Optional human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Optional human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One rule in a [`CredentialAccessBoundary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessBoundaryRule {
    available_resource: String,
    available_permissions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    availability_condition: Option<AvailabilityCondition>,
}

impl AccessBoundaryRule {
    /// Builds a rule. `available_permissions` must be non-empty.
    pub fn new(available_resource: impl Into<String>, available_permissions: Vec<String>) -> Result<Self> {
        if available_permissions.is_empty() {
            return Err(Error::Config(ConfigError::MissingField("availablePermissions")));
        }
        Ok(Self {
            available_resource: available_resource.into(),
            available_permissions,
            availability_condition: None,
        })
    }

    /// Attaches an availability condition.
    pub fn with_availability_condition(mut self, condition: AvailabilityCondition) -> Self {
        self.availability_condition = Some(condition);
        self
    }

    /// The resource this rule grants access to.
    pub fn available_resource(&self) -> &str {
        &self.available_resource
    }

    /// The permissions granted on [`Self::available_resource`].
    pub fn available_permissions(&self) -> &[String] {
        &self.available_permissions
    }
}

/// An ordered list of 1..10 [`AccessBoundaryRule`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialAccessBoundary {
    #[serde(rename = "accessBoundaryRules")]
    rules: Vec<AccessBoundaryRule>,
}

impl CredentialAccessBoundary {
    /// Builds a boundary, enforcing the 1..=10 rule-count invariant.
    pub fn new(rules: Vec<AccessBoundaryRule>) -> Result<Self> {
        if rules.is_empty() || rules.len() > 10 {
            return Err(Error::Config(ConfigError::InvalidAccessBoundaryRuleCount(rules.len())));
        }
        Ok(Self { rules })
    }

    /// The rules, in their original order.
    pub fn rules(&self) -> &[AccessBoundaryRule] {
        &self.rules
    }

    /// Serializes to the wire shape expected in an STS `options.accessBoundary`
    /// payload or as the plaintext input to client-side AEAD
    /// encryption.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("CredentialAccessBoundary always serializes")
    }

    /// Serializes the boundary (with conditions compiled) to bytes, the
    /// plaintext input to client-side CAB's AEAD encryption step.
    pub fn to_bytes(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct WireRule<'a> {
            #[serde(rename = "availableResource")]
            available_resource: &'a str,
            #[serde(rename = "availablePermissions")]
            available_permissions: &'a [String],
            #[serde(skip_serializing_if = "Option::is_none")]
            #[serde(rename = "availabilityCondition")]
            availability_condition: Option<CompiledCondition>,
        }
        let wire: Vec<WireRule> = self
            .rules
            .iter()
            .map(|r| WireRule {
                available_resource: &r.available_resource,
                available_permissions: &r.available_permissions,
                availability_condition: r.availability_condition.as_ref().map(|c| c.compile()),
            })
            .collect();
        serde_json::to_vec(&wire).expect("wire rules always serialize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_rule_lists() {
        assert!(CredentialAccessBoundary::new(vec![]).is_err());
        let rule = AccessBoundaryRule::new("//storage.googleapis.com/projects/_/buckets/b", vec!["role".into()]).unwrap();
        let rules = std::iter::repeat(rule).take(11).collect();
        assert!(CredentialAccessBoundary::new(rules).is_err());
    }

    #[test]
    fn rejects_empty_permissions() {
        assert!(AccessBoundaryRule::new("resource", vec![]).is_err());
    }

    #[test]
    fn rejects_empty_condition_expression() {
        assert!(AvailabilityCondition::new("").is_err());
    }
}
