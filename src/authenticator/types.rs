//! Authenticator records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Plugin kind of an authenticator. Only SAML is handled by this crate; other
/// kinds are stored and served as opaque records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AuthenticatorKind {
    Saml,
    Other(String),
}

impl AuthenticatorKind {
    pub fn as_str(&self) -> &str {
        match self {
            AuthenticatorKind::Saml => "SAML",
            AuthenticatorKind::Other(kind) => kind,
        }
    }

    pub fn is_saml(&self) -> bool {
        matches!(self, AuthenticatorKind::Saml)
    }

    /// Plugin module name, used to build slugs.
    pub fn module(&self) -> String {
        self.as_str().to_lowercase()
    }
}

impl From<String> for AuthenticatorKind {
    fn from(kind: String) -> Self {
        if kind.eq_ignore_ascii_case("saml") {
            AuthenticatorKind::Saml
        } else {
            AuthenticatorKind::Other(kind)
        }
    }
}

impl From<AuthenticatorKind> for String {
    fn from(kind: AuthenticatorKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for AuthenticatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored authenticator instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatorRecord {
    pub id: u64,
    pub name: String,
    pub slug: String,
    pub kind: AuthenticatorKind,
    pub enabled: bool,
    /// Internal (nested) configuration for SAML; opaque for other kinds.
    pub configuration: Map<String, Value>,
}

/// Administrative input for creating an authenticator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthenticatorDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AuthenticatorKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Flat administrative settings.
    #[serde(default)]
    pub configuration: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

/// Lowercase, runs of non-alphanumerics collapsed to `-`, no leading or trailing `-`.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;

    for c in text.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug
}

/// Slug for a new authenticator of `kind` named `name`.
pub fn authenticator_slug(kind: &AuthenticatorKind, name: &str) -> String {
    slugify(&format!("{}__{}", kind.module(), name))
}
