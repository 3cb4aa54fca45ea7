//! SAML Service Provider configuration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Label of the single IdP slot populated by the flat administrative settings.
pub const DEFAULT_IDP_LABEL: &str = "IdP";

/// Value the secret store hands back in place of an unchanged encrypted field.
pub const ENCRYPTED_SENTINEL: &str = "$encrypted$";

/// Allowed clock drift when checking assertion validity windows.
pub const DEFAULT_CLOCK_DRIFT_SECS: i64 = 300;

pub const SP_ENTITY_ID_MAX_LEN: usize = 512;

pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";

/// Key of an entry in the IdP registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdpLabel(String);

impl IdpLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for IdpLabel {
    fn default() -> Self {
        Self(DEFAULT_IDP_LABEL.to_string())
    }
}

impl fmt::Display for IdpLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdpLabel {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

/// One registered Identity Provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdpDescriptor {
    /// Login redirect target (IdP SSO endpoint).
    pub url: String,

    /// IdP signing certificate, PEM or bare base64.
    #[serde(rename = "x509cert")]
    pub x509_cert: String,

    pub entity_id: String,

    /// Assertion attribute carrying the email address.
    pub attr_email: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr_username: Option<String>,

    /// Stable user key; overrides `attr_username` when both are set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr_user_permanent_id: Option<String>,

    pub attr_first_name: String,

    pub attr_last_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr_groups: Option<String>,
}

impl IdpDescriptor {
    /// Attribute that identifies the user, preferring the permanent id.
    pub fn user_key_attribute(&self) -> Option<&str> {
        non_empty(self.attr_user_permanent_id.as_deref())
            .or_else(|| non_empty(self.attr_username.as_deref()))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// IdP registry keyed by label. Only `"IdP"` is populated today.
pub type IdpRegistry = BTreeMap<IdpLabel, IdpDescriptor>;

/// One `EXTRA_DATA` rule: copy an assertion attribute into the identity's extra data.
///
/// Accepts the administrative shapes `"attr"`, `["attr", "alias"]` and
/// `["attr", "alias", discard_if_empty]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct AttributeMapping {
    pub attribute: String,
    pub alias: String,
    pub discard_if_empty: bool,
}

impl AttributeMapping {
    pub fn new(attribute: impl Into<String>) -> Self {
        let attribute = attribute.into();
        Self {
            alias: attribute.clone(),
            attribute,
            discard_if_empty: false,
        }
    }
}

impl TryFrom<Value> for AttributeMapping {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(attribute) => Ok(Self::new(attribute)),
            Value::Array(items) => {
                let text = |idx: usize| -> Result<String, String> {
                    items
                        .get(idx)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| format!("entry {} must be a string", idx))
                };
                match items.len() {
                    1 => Ok(Self::new(text(0)?)),
                    2 => Ok(Self {
                        attribute: text(0)?,
                        alias: text(1)?,
                        discard_if_empty: false,
                    }),
                    3 => Ok(Self {
                        attribute: text(0)?,
                        alias: text(1)?,
                        discard_if_empty: items[2]
                            .as_bool()
                            .ok_or_else(|| "entry 2 must be a boolean".to_string())?,
                    }),
                    n => Err(format!("expected 1 to 3 entries, got {}", n)),
                }
            }
            other => Err(format!("expected a string or a list, got {}", other)),
        }
    }
}

impl From<AttributeMapping> for Value {
    fn from(mapping: AttributeMapping) -> Self {
        if mapping.attribute == mapping.alias && !mapping.discard_if_empty {
            Value::String(mapping.attribute)
        } else {
            Value::Array(vec![
                Value::String(mapping.attribute),
                Value::String(mapping.alias),
                Value::Bool(mapping.discard_if_empty),
            ])
        }
    }
}

/// Persisted per-authenticator configuration, internal (nested) form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AuthenticatorConfiguration {
    /// Audience identifier of this SP.
    #[serde(default = "default_sp_entity_id")]
    pub sp_entity_id: String,

    pub sp_public_cert: String,

    /// Plaintext PEM; encrypted at rest by the secret store.
    pub sp_private_key: String,

    #[serde(default = "default_org_info")]
    pub org_info: Map<String, Value>,

    #[serde(default = "default_contact")]
    pub technical_contact: Map<String, Value>,

    #[serde(default = "default_contact")]
    pub support_contact: Map<String, Value>,

    /// Opaque SP options; only `NameIDFormat` is interpreted.
    #[serde(default = "default_sp_extra")]
    pub sp_extra: Map<String, Value>,

    /// Opaque security options, see [`SecurityOptions`].
    #[serde(default)]
    pub security_config: Map<String, Value>,

    #[serde(default)]
    pub extra_data: Vec<AttributeMapping>,

    /// Assertion Consumer Service URL, derived once from the authenticator slug.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,

    #[serde(default)]
    pub enabled_idps: IdpRegistry,
}

pub fn default_sp_entity_id() -> String {
    "aap_gateway".to_string()
}

pub fn default_org_info() -> Map<String, Value> {
    let mut org = Map::new();
    org.insert(
        "en-US".to_string(),
        serde_json::json!({"url": "", "name": "", "displayname": ""}),
    );
    org
}

pub fn default_contact() -> Map<String, Value> {
    let mut contact = Map::new();
    contact.insert("givenName".to_string(), Value::String(String::new()));
    contact.insert("emailAddress".to_string(), Value::String(String::new()));
    contact
}

pub fn default_sp_extra() -> Map<String, Value> {
    let mut extra = Map::new();
    extra.insert("requestedAuthnContext".to_string(), Value::Bool(false));
    extra
}

impl AuthenticatorConfiguration {
    /// Parse the internal (nested) JSON form.
    pub fn from_internal(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Render the internal (nested) JSON form.
    pub fn to_internal(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn idp(&self, label: &IdpLabel) -> Option<&IdpDescriptor> {
        self.enabled_idps.get(label)
    }

    pub fn security(&self) -> SecurityOptions {
        SecurityOptions::from_map(&self.security_config)
    }

    /// NameID format requested in AuthnRequests and advertised in metadata.
    pub fn name_id_format(&self) -> Option<&str> {
        self.sp_extra
            .get("NameIDFormat")
            .and_then(Value::as_str)
            .filter(|f| !f.is_empty())
    }
}

/// The subset of `SECURITY_CONFIG` this SP acts on. Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityOptions {
    pub authn_requests_signed: bool,
    pub want_messages_signed: bool,
    pub want_assertions_signed: bool,
    pub want_name_id: bool,
    pub reject_deprecated_algorithm: bool,
    pub signature_algorithm: String,
    /// Requested authentication context classes; empty means none requested.
    pub requested_authn_context: Vec<String>,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            authn_requests_signed: false,
            want_messages_signed: false,
            want_assertions_signed: false,
            want_name_id: true,
            reject_deprecated_algorithm: false,
            signature_algorithm: RSA_SHA256.to_string(),
            requested_authn_context: Vec::new(),
        }
    }
}

impl SecurityOptions {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| map.get(key).and_then(Value::as_bool).unwrap_or(default);

        let requested_authn_context = match map.get("requestedAuthnContext") {
            Some(Value::Bool(true)) => vec![
                "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport".to_string(),
            ],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        Self {
            authn_requests_signed: flag("authnRequestsSigned", defaults.authn_requests_signed),
            want_messages_signed: flag("wantMessagesSigned", defaults.want_messages_signed),
            want_assertions_signed: flag("wantAssertionsSigned", defaults.want_assertions_signed),
            want_name_id: flag("wantNameId", defaults.want_name_id),
            reject_deprecated_algorithm: flag(
                "rejectDeprecatedAlgorithm",
                defaults.reject_deprecated_algorithm,
            ),
            signature_algorithm: map
                .get("signatureAlgorithm")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(defaults.signature_algorithm),
            requested_authn_context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_applied() {
        let config = AuthenticatorConfiguration::from_internal(json!({
            "SP_PUBLIC_CERT": "cert",
            "SP_PRIVATE_KEY": "key",
        }))
        .unwrap();

        assert_eq!(config.sp_entity_id, "aap_gateway");
        assert!(config.org_info.contains_key("en-US"));
        assert_eq!(config.technical_contact.get("givenName"), Some(&json!("")));
        assert_eq!(config.sp_extra.get("requestedAuthnContext"), Some(&json!(false)));
        assert!(config.security_config.is_empty());
        assert!(config.enabled_idps.is_empty());
        assert!(config.callback_url.is_none());
    }

    #[test]
    fn test_user_key_prefers_permanent_id() {
        let mut idp = IdpDescriptor {
            attr_username: Some("uid".to_string()),
            ..Default::default()
        };
        assert_eq!(idp.user_key_attribute(), Some("uid"));

        idp.attr_user_permanent_id = Some("employeeNumber".to_string());
        assert_eq!(idp.user_key_attribute(), Some("employeeNumber"));

        idp.attr_user_permanent_id = Some("  ".to_string());
        idp.attr_username = None;
        assert_eq!(idp.user_key_attribute(), None);
    }

    #[test]
    fn test_attribute_mapping_shapes() {
        let rules: Vec<AttributeMapping> =
            serde_json::from_value(json!(["mail", ["dept", "department"], ["title", "job", true]]))
                .unwrap();

        assert_eq!(rules[0], AttributeMapping::new("mail"));
        assert_eq!(rules[1].alias, "department");
        assert!(!rules[1].discard_if_empty);
        assert!(rules[2].discard_if_empty);

        let bad: Result<Vec<AttributeMapping>, _> = serde_json::from_value(json!([42]));
        assert!(bad.is_err());

        assert_eq!(serde_json::to_value(&rules[0]).unwrap(), json!("mail"));
    }

    #[test]
    fn test_security_options() {
        let mut map = Map::new();
        assert_eq!(SecurityOptions::from_map(&map), SecurityOptions::default());

        map.insert("authnRequestsSigned".to_string(), json!(true));
        map.insert("wantAssertionsSigned".to_string(), json!(true));
        map.insert("requestedAuthnContext".to_string(), json!(true));
        map.insert("somethingElse".to_string(), json!("ignored"));
        let options = SecurityOptions::from_map(&map);
        assert!(options.authn_requests_signed);
        assert!(options.want_assertions_signed);
        assert!(!options.want_messages_signed);
        assert_eq!(options.requested_authn_context.len(), 1);
    }

    #[test]
    fn test_internal_round_trip() {
        let mut config = AuthenticatorConfiguration::from_internal(json!({
            "SP_PUBLIC_CERT": "cert",
            "SP_PRIVATE_KEY": "key",
            "CALLBACK_URL": "https://gw.example.com/complete/saml",
            "ENABLED_IDPS": {
                "IdP": {
                    "url": "https://idp.example.com/sso",
                    "x509cert": "idp-cert",
                    "entity_id": "https://idp.example.com",
                    "attr_email": "mail",
                    "attr_username": "uid",
                    "attr_first_name": "givenName",
                    "attr_last_name": "sn"
                }
            }
        }))
        .unwrap();
        config.extra_data.push(AttributeMapping::new("dept"));

        let internal = config.to_internal();
        let idp = &internal["ENABLED_IDPS"]["IdP"];
        assert_eq!(idp["x509cert"], json!("idp-cert"));
        assert!(idp.get("attr_groups").is_none());

        let back = AuthenticatorConfiguration::from_internal(Value::Object(internal)).unwrap();
        assert_eq!(back, config);
        assert_eq!(
            back.idp(&IdpLabel::default()).map(|i| i.attr_email.as_str()),
            Some("mail")
        );
    }
}
