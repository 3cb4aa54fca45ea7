//! Conversion between flat administrative settings and the nested IdP registry.
//!
//! Administrators submit one IdP as flat `IDP_*` keys; the stored configuration keeps
//! every IdP under `ENABLED_IDPS.<label>`. Both directions are pure functions driven
//! by [`IDP_FIELD_MAP`].

use serde_json::{Map, Value};

use super::config::IdpLabel;

/// Key holding the nested IdP registry in the internal form.
pub const ENABLED_IDPS: &str = "ENABLED_IDPS";

/// (flat setting name, field inside the IdP entry).
pub const IDP_FIELD_MAP: [(&str, &str); 9] = [
    ("IDP_URL", "url"),
    ("IDP_X509_CERT", "x509cert"),
    ("IDP_ENTITY_ID", "entity_id"),
    ("IDP_ATTR_EMAIL", "attr_email"),
    ("IDP_GROUPS", "attr_groups"),
    ("IDP_ATTR_USERNAME", "attr_username"),
    ("IDP_ATTR_LAST_NAME", "attr_last_name"),
    ("IDP_ATTR_FIRST_NAME", "attr_first_name"),
    ("IDP_ATTR_USER_PERMANENT_ID", "attr_user_permanent_id"),
];

/// Flat setting name for an IdP entry field.
pub fn external_name(internal: &str) -> Option<&'static str> {
    IDP_FIELD_MAP
        .iter()
        .find(|(_, field)| *field == internal)
        .map(|(name, _)| *name)
}

/// Move the flat `IDP_*` settings into the default IdP entry.
pub fn to_internal(flat: &Map<String, Value>) -> Map<String, Value> {
    to_internal_for(flat, &IdpLabel::default())
}

/// Move the flat `IDP_*` settings into the entry for `label`.
///
/// Unmapped keys pass through. Entries for other labels already present under
/// `ENABLED_IDPS` are kept; the entry for `label` is rebuilt from the flat keys.
pub fn to_internal_for(flat: &Map<String, Value>, label: &IdpLabel) -> Map<String, Value> {
    let mut internal = flat.clone();
    let mut idp = Map::new();

    for (name, field) in IDP_FIELD_MAP {
        if let Some(value) = internal.remove(name) {
            idp.insert(field.to_string(), value);
        }
    }

    let mut registry = match internal.remove(ENABLED_IDPS) {
        Some(Value::Object(existing)) => existing,
        _ => Map::new(),
    };
    registry.insert(label.as_str().to_string(), Value::Object(idp));
    internal.insert(ENABLED_IDPS.to_string(), Value::Object(registry));

    internal
}

/// Surface the default IdP entry as flat `IDP_*` settings.
pub fn to_external(nested: &Map<String, Value>) -> Map<String, Value> {
    to_external_for(nested, &IdpLabel::default())
}

/// Surface the entry for `label` as flat `IDP_*` settings and drop `ENABLED_IDPS`.
pub fn to_external_for(nested: &Map<String, Value>, label: &IdpLabel) -> Map<String, Value> {
    let mut external = nested.clone();

    if let Some(registry) = external.remove(ENABLED_IDPS) {
        if let Some(Value::Object(idp)) = registry.get(label.as_str()) {
            for (name, field) in IDP_FIELD_MAP {
                if let Some(value) = idp.get(field) {
                    external.insert(name.to_string(), value.clone());
                }
            }
        }
    }

    external
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_flat() -> Map<String, Value> {
        let value = json!({
            "SP_ENTITY_ID": "gateway",
            "IDP_URL": "https://idp.example.com/sso",
            "IDP_X509_CERT": "MIIC...",
            "IDP_ENTITY_ID": "https://idp.example.com",
            "IDP_ATTR_EMAIL": "mail",
            "IDP_GROUPS": "memberOf",
            "IDP_ATTR_USERNAME": "uid",
            "IDP_ATTR_LAST_NAME": "sn",
            "IDP_ATTR_FIRST_NAME": "givenName",
            "IDP_ATTR_USER_PERMANENT_ID": "employeeNumber",
        });
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_to_internal_moves_mapped_keys() {
        let flat = full_flat();
        let internal = to_internal(&flat);

        for (name, _) in IDP_FIELD_MAP {
            assert!(!internal.contains_key(name), "{} left behind", name);
        }
        assert_eq!(internal["SP_ENTITY_ID"], json!("gateway"));
        assert_eq!(internal[ENABLED_IDPS]["IdP"]["attr_user_permanent_id"], json!("employeeNumber"));
        assert_eq!(internal[ENABLED_IDPS]["IdP"]["x509cert"], json!("MIIC..."));
        // input untouched
        assert!(flat.contains_key("IDP_URL"));
    }

    #[test]
    fn test_round_trip_reproduces_flat_keys() {
        let flat = full_flat();
        let back = to_external(&to_internal(&flat));

        for (name, _) in IDP_FIELD_MAP {
            assert_eq!(back.get(name), flat.get(name), "{} differs", name);
        }
        assert!(!back.contains_key(ENABLED_IDPS));
        assert_eq!(back, flat);
    }

    #[test]
    fn test_username_only_example() {
        let mut flat = Map::new();
        flat.insert("IDP_ATTR_USERNAME".to_string(), json!("uid"));
        flat.insert("IDP_ATTR_EMAIL".to_string(), json!("mail"));

        let internal = to_internal(&flat);
        let idp = &internal[ENABLED_IDPS]["IdP"];
        assert_eq!(idp["attr_username"], json!("uid"));
        assert!(idp.get("attr_user_permanent_id").is_none());
    }

    #[test]
    fn test_empty_input_still_has_registry_entry() {
        let internal = to_internal(&Map::new());
        assert_eq!(internal[ENABLED_IDPS], json!({"IdP": {}}));
    }

    #[test]
    fn test_other_labels_are_preserved() {
        let mut flat = full_flat();
        flat.insert(
            ENABLED_IDPS.to_string(),
            json!({"Partner": {"url": "https://partner.example.com"}, "IdP": {"url": "stale"}}),
        );

        let internal = to_internal(&flat);
        assert_eq!(
            internal[ENABLED_IDPS]["Partner"]["url"],
            json!("https://partner.example.com")
        );
        assert_eq!(internal[ENABLED_IDPS]["IdP"]["url"], json!("https://idp.example.com/sso"));

        let partner = to_external_for(&internal, &IdpLabel::new("Partner"));
        assert_eq!(partner["IDP_URL"], json!("https://partner.example.com"));
        assert!(!partner.contains_key("IDP_ATTR_EMAIL"));
    }

    #[test]
    fn test_to_external_without_registry_is_identity() {
        let mut nested = Map::new();
        nested.insert("SP_ENTITY_ID".to_string(), json!("gateway"));
        assert_eq!(to_external(&nested), nested);
    }

    #[test]
    fn test_external_name_lookup() {
        assert_eq!(external_name("attr_username"), Some("IDP_ATTR_USERNAME"));
        assert_eq!(external_name("x509cert"), Some("IDP_X509_CERT"));
        assert_eq!(external_name("nope"), None);
    }
}
