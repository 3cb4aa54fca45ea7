//! Cross-field validation of a candidate configuration.
//!
//! The candidate is the internal (nested) JSON form produced by
//! [`normalize::to_internal`](super::normalize::to_internal). Every problem is
//! collected and reported at once, keyed by the flat setting name.

use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use super::certs::{parse_certificate, validate_cert_with_key};
use super::config::{
    AttributeMapping, AuthenticatorConfiguration, ENCRYPTED_SENTINEL, SP_ENTITY_ID_MAX_LEN,
};
use super::crypto::SamlCrypto;
use super::error::ConfigValidationError;
use super::normalize::{external_name, ENABLED_IDPS};

pub const REQUIRED: &str = "This field is required.";
pub const INVALID_URL: &str = "Enter a valid URL.";
pub const NOT_A_STRING: &str = "Not a valid string.";
pub const NOT_A_DICT: &str = "Expected a dictionary of items.";
pub const USERNAME_OR_PERMANENT_ID: &str =
    "Either IDP_ATTR_USERNAME or IDP_ATTR_USER_PERMANENT_ID needs to be set";

const REQUIRED_IDP_FIELDS: [&str; 6] = [
    "url",
    "x509cert",
    "entity_id",
    "attr_email",
    "attr_first_name",
    "attr_last_name",
];

const OPTIONAL_IDP_FIELDS: [&str; 3] = ["attr_username", "attr_user_permanent_id", "attr_groups"];

const OBJECT_FIELDS: [&str; 5] = [
    "ORG_INFO",
    "TECHNICAL_CONTACT",
    "SUPPORT_CONTACT",
    "SP_EXTRA",
    "SECURITY_CONFIG",
];

/// Non-blank string value of `key`.
fn text<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// The private key a write will end up with.
///
/// An omitted, blank or sentinel value means "unchanged" and resolves to the
/// stored key.
pub fn resolve_private_key(
    submitted: Option<&Value>,
    existing: Option<&AuthenticatorConfiguration>,
) -> Option<String> {
    match submitted.and_then(Value::as_str) {
        Some(key) if !key.trim().is_empty() && key != ENCRYPTED_SENTINEL => Some(key.to_string()),
        _ => existing
            .map(|config| config.sp_private_key.clone())
            .filter(|key| !key.trim().is_empty()),
    }
}

/// The certificate a write will end up with; falls back to the stored one.
pub fn resolve_public_cert(
    submitted: Option<&Value>,
    existing: Option<&AuthenticatorConfiguration>,
) -> Option<String> {
    match submitted.and_then(Value::as_str) {
        Some(cert) if !cert.trim().is_empty() => Some(cert.to_string()),
        _ => existing
            .map(|config| config.sp_public_cert.clone())
            .filter(|cert| !cert.trim().is_empty()),
    }
}

/// Certificates in the candidate past their validity, as (field, subject).
///
/// Expiry does not reject a write: IdPs keep signing with expired certificates
/// and the signature check does not look at validity dates.
pub fn expired_certificates(
    candidate: &Map<String, Value>,
    existing: Option<&AuthenticatorConfiguration>,
    unix_time: i64,
) -> Vec<(&'static str, String)> {
    let sp = resolve_public_cert(candidate.get("SP_PUBLIC_CERT"), existing).map(|c| ("SP_PUBLIC_CERT", c));
    let idps = candidate
        .get(ENABLED_IDPS)
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|registry| registry.values())
        .filter_map(|idp| text(idp.as_object()?, "x509cert"))
        .map(|cert| ("IDP_X509_CERT", cert.to_string()));

    sp.into_iter()
        .chain(idps)
        .filter_map(|(field, cert)| {
            let info = parse_certificate(&cert).ok()?;
            info.is_expired_at(unix_time).then_some((field, info.subject_dn))
        })
        .collect()
}

fn is_http_url(value: &str) -> bool {
    match Url::parse(value) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host().is_some(),
        Err(_) => false,
    }
}

/// Validates candidate configurations using a crypto backend for the key checks.
pub struct ConfigValidator<'a> {
    crypto: &'a dyn SamlCrypto,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(crypto: &'a dyn SamlCrypto) -> Self {
        Self { crypto }
    }

    /// Check `candidate` against the stored configuration (if any). Never mutates
    /// the candidate.
    pub fn validate(
        &self,
        candidate: &Map<String, Value>,
        existing: Option<&AuthenticatorConfiguration>,
    ) -> Result<(), ConfigValidationError> {
        let mut errors = ConfigValidationError::new();

        self.check_sp_entity_id(candidate, &mut errors);
        self.check_key_pair(candidate, existing, &mut errors);
        self.check_idps(candidate, &mut errors);
        self.check_callback_url(candidate, &mut errors);
        self.check_objects(candidate, &mut errors);
        self.check_extra_data(candidate, &mut errors);

        if !errors.is_empty() {
            debug!(fields = ?errors.errors.keys().collect::<Vec<_>>(), "Configuration rejected");
        }
        for (field, subject) in expired_certificates(candidate, existing, chrono::Utc::now().timestamp()) {
            warn!(field, subject = %subject, "Certificate has expired");
        }
        errors.into_result()
    }

    fn check_sp_entity_id(&self, candidate: &Map<String, Value>, errors: &mut ConfigValidationError) {
        match candidate.get("SP_ENTITY_ID") {
            None => {}
            Some(Value::String(id)) if id.trim().is_empty() => errors.add("SP_ENTITY_ID", REQUIRED),
            Some(Value::String(id)) if id.chars().count() > SP_ENTITY_ID_MAX_LEN => errors.add(
                "SP_ENTITY_ID",
                format!(
                    "Ensure this field has no more than {} characters.",
                    SP_ENTITY_ID_MAX_LEN
                ),
            ),
            Some(Value::String(_)) => {}
            Some(_) => errors.add("SP_ENTITY_ID", NOT_A_STRING),
        }
    }

    fn check_key_pair(
        &self,
        candidate: &Map<String, Value>,
        existing: Option<&AuthenticatorConfiguration>,
        errors: &mut ConfigValidationError,
    ) {
        let cert = resolve_public_cert(candidate.get("SP_PUBLIC_CERT"), existing);
        let key = resolve_private_key(candidate.get("SP_PRIVATE_KEY"), existing);

        if cert.is_none() {
            errors.add("SP_PUBLIC_CERT", REQUIRED);
        }
        if let Err(e) = validate_cert_with_key(self.crypto, cert.as_deref(), key.as_deref()) {
            errors.add("SP_PRIVATE_KEY", e.0);
        }
    }

    fn check_idps(&self, candidate: &Map<String, Value>, errors: &mut ConfigValidationError) {
        let empty = Map::new();
        let registry = match candidate.get(ENABLED_IDPS) {
            Some(Value::Object(registry)) => registry,
            None => &empty,
            Some(_) => {
                errors.add(ENABLED_IDPS, NOT_A_DICT);
                return;
            }
        };

        if registry.is_empty() {
            self.check_idp(&empty, errors);
        }
        for (label, entry) in registry {
            match entry {
                Value::Object(idp) => self.check_idp(idp, errors),
                _ => errors.add(ENABLED_IDPS, format!("Entry {} must be a dictionary.", label)),
            }
        }
    }

    fn check_idp(&self, idp: &Map<String, Value>, errors: &mut ConfigValidationError) {
        let field_name = |field: &str| external_name(field).unwrap_or(ENABLED_IDPS);

        for field in REQUIRED_IDP_FIELDS {
            match idp.get(field) {
                Some(Value::String(s)) if !s.trim().is_empty() => {}
                Some(Value::String(_)) | Some(Value::Null) | None => {
                    errors.add(field_name(field), REQUIRED)
                }
                Some(_) => errors.add(field_name(field), NOT_A_STRING),
            }
        }
        for field in OPTIONAL_IDP_FIELDS {
            if let Some(value) = idp.get(field) {
                if !value.is_string() && !value.is_null() {
                    errors.add(field_name(field), NOT_A_STRING);
                }
            }
        }

        if text(idp, "attr_username").is_none() && text(idp, "attr_user_permanent_id").is_none() {
            errors.add("IDP_ATTR_USERNAME", USERNAME_OR_PERMANENT_ID);
        }

        if let Some(url) = text(idp, "url") {
            if !is_http_url(url) {
                errors.add("IDP_URL", INVALID_URL);
            }
        }

        if let Some(cert) = text(idp, "x509cert") {
            if let Err(e) = parse_certificate(cert) {
                errors.add("IDP_X509_CERT", format!("Unable to load IDP_X509_CERT: {}", e));
            }
        }
    }

    fn check_callback_url(&self, candidate: &Map<String, Value>, errors: &mut ConfigValidationError) {
        match candidate.get("CALLBACK_URL") {
            None | Some(Value::Null) => {}
            Some(Value::String(url)) if is_http_url(url) => {}
            Some(_) => errors.add("CALLBACK_URL", INVALID_URL),
        }
    }

    fn check_objects(&self, candidate: &Map<String, Value>, errors: &mut ConfigValidationError) {
        for field in OBJECT_FIELDS {
            if let Some(value) = candidate.get(field) {
                if !value.is_object() {
                    errors.add(field, NOT_A_DICT);
                }
            }
        }
    }

    fn check_extra_data(&self, candidate: &Map<String, Value>, errors: &mut ConfigValidationError) {
        match candidate.get("EXTRA_DATA") {
            None | Some(Value::Null) => {}
            Some(Value::Array(rules)) => {
                for (idx, rule) in rules.iter().enumerate() {
                    if let Err(e) = AttributeMapping::try_from(rule.clone()) {
                        errors.add("EXTRA_DATA", format!("Invalid rule at position {}: {}", idx, e));
                    }
                }
            }
            Some(_) => errors.add("EXTRA_DATA", "Expected a list of items."),
        }
    }
}
