//! Error taxonomy for the SAML service provider.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Field-keyed aggregate raised when an administrative write is rejected.
///
/// Keys are the flat setting names an administrator submits (e.g. `SP_PRIVATE_KEY`,
/// `IDP_ATTR_USERNAME`), so the errors can be rendered next to the offending fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
pub struct ConfigValidationError {
    pub errors: BTreeMap<String, String>,
}

impl ConfigValidationError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error against a field. The first message for a field wins.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.entry(field.into()).or_insert_with(|| message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.errors.get(field).map(String::as_str)
    }

    /// Convert the collected errors into a result, failing when any were recorded.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration rejected:")?;
        for (field, message) in &self.errors {
            write!(f, " {}: {};", field, message)?;
        }
        Ok(())
    }
}

/// The SP certificate and private key could not be loaded or do not match.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CertKeyMismatchError(pub String);

/// Why an IdP response was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssertionErrorKind {
    /// Payload could not be decoded or parsed as a SAML Response.
    Malformed,
    /// The IdP reported a non-success status.
    Rejected,
    SignatureInvalid,
    AudienceMismatch,
    IssuerMismatch,
    /// Outside the NotBefore / NotOnOrAfter window.
    Expired,
    MissingRequiredAttribute,
}

impl AssertionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssertionErrorKind::Malformed => "malformed_response",
            AssertionErrorKind::Rejected => "rejected_by_idp",
            AssertionErrorKind::SignatureInvalid => "signature_invalid",
            AssertionErrorKind::AudienceMismatch => "audience_mismatch",
            AssertionErrorKind::IssuerMismatch => "issuer_mismatch",
            AssertionErrorKind::Expired => "expired",
            AssertionErrorKind::MissingRequiredAttribute => "missing_required_attribute",
        }
    }
}

impl fmt::Display for AssertionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed login completion.
///
/// `Display` only names the kind; `detail` may quote assertion contents and is
/// meant for logs, never for the end user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("SAML authentication failed ({kind})")]
pub struct AssertionError {
    pub kind: AssertionErrorKind,
    pub detail: String,
}

impl AssertionError {
    pub fn new(kind: AssertionErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// SP metadata could not be generated. The message is shown to the caller as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct MetadataError(pub String);

/// Failures inside the cryptographic backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid certificate: {0}")]
    Certificate(String),

    #[error("invalid private key: {0}")]
    PrivateKey(String),

    #[error("certificate and private key do not match")]
    KeyMismatch,

    #[error("malformed XML signature: {0}")]
    MalformedSignature(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("digest mismatch for element {0}")]
    DigestMismatch(String),

    #[error("signature verification failed for element {0}")]
    BadSignature(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Errors raised while issuing an AuthnRequest.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("IdP {0} is not configured")]
    UnknownIdp(String),

    #[error("callback URL is not configured")]
    MissingCallbackUrl,

    #[error("failed to encode AuthnRequest: {0}")]
    Encoding(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_collects_fields() {
        let mut errors = ConfigValidationError::new();
        assert!(errors.clone().into_result().is_ok());

        errors.add("SP_PRIVATE_KEY", "mismatch");
        errors.add("SP_PRIVATE_KEY", "ignored");
        errors.add("IDP_ATTR_USERNAME", "missing");

        assert_eq!(errors.len(), 2);
        assert_eq!(errors.get("SP_PRIVATE_KEY"), Some("mismatch"));
        let rendered = errors.to_string();
        assert!(rendered.contains("IDP_ATTR_USERNAME: missing"));
        assert!(errors.into_result().is_err());
    }

    #[test]
    fn test_assertion_error_hides_detail() {
        let err = AssertionError::new(
            AssertionErrorKind::AudienceMismatch,
            "audience was https://other.example.com",
        );
        let shown = err.to_string();
        assert!(shown.contains("audience_mismatch"));
        assert!(!shown.contains("other.example.com"));
    }
}
