//! SP metadata document.

use base64::{engine::general_purpose::STANDARD, Engine};
use quick_xml::escape::escape;
use serde_json::{Map, Value};

use super::config::AuthenticatorConfiguration;

pub const HTTP_POST_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";
pub const NAMEID_UNSPECIFIED: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";

/// Organization block for one language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Organization {
    pub lang: String,
    pub name: String,
    pub display_name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactPerson {
    /// `technical` or `support`.
    pub contact_type: &'static str,
    pub given_name: String,
    pub email: String,
}

/// Everything needed to describe this SP to an IdP.
#[derive(Debug, Clone)]
pub struct SpMetadata<'a> {
    pub entity_id: &'a str,
    pub acs_url: &'a str,
    /// SP certificate, published for both signing and encryption.
    pub certificate: &'a str,
    pub authn_requests_signed: bool,
    pub want_assertions_signed: bool,
    pub name_id_format: &'a str,
    pub organizations: Vec<Organization>,
    pub contacts: Vec<ContactPerson>,
}

impl<'a> SpMetadata<'a> {
    /// Returns `None` when no callback URL has been derived yet.
    pub fn from_config(config: &'a AuthenticatorConfiguration) -> Option<Self> {
        let acs_url = config.callback_url.as_deref()?;
        let security = config.security();

        let contacts = [
            ("technical", &config.technical_contact),
            ("support", &config.support_contact),
        ]
        .into_iter()
        .filter_map(|(kind, map)| contact_from_map(kind, map))
        .collect();

        Some(Self {
            entity_id: &config.sp_entity_id,
            acs_url,
            certificate: &config.sp_public_cert,
            authn_requests_signed: security.authn_requests_signed,
            want_assertions_signed: security.want_assertions_signed,
            name_id_format: config.name_id_format().unwrap_or(NAMEID_UNSPECIFIED),
            organizations: organizations_from_map(&config.org_info),
            contacts,
        })
    }
}

fn text_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// One entry per language with a non-empty name.
fn organizations_from_map(org_info: &Map<String, Value>) -> Vec<Organization> {
    org_info
        .iter()
        .filter_map(|(lang, value)| {
            let entry = value.as_object()?;
            let name = text_field(entry, "name");
            if name.is_empty() {
                return None;
            }
            let display_name = match text_field(entry, "displayname") {
                d if d.is_empty() => name.clone(),
                d => d,
            };
            Some(Organization {
                lang: lang.clone(),
                name,
                display_name,
                url: text_field(entry, "url"),
            })
        })
        .collect()
}

fn contact_from_map(contact_type: &'static str, map: &Map<String, Value>) -> Option<ContactPerson> {
    let given_name = text_field(map, "givenName");
    let email = text_field(map, "emailAddress");
    if given_name.is_empty() && email.is_empty() {
        return None;
    }
    Some(ContactPerson {
        contact_type,
        given_name,
        email,
    })
}

fn key_descriptor(key_use: &str, certificate: &str) -> String {
    format!(
        "    <md:KeyDescriptor use=\"{}\">\n      <ds:KeyInfo>\n        <ds:X509Data>\n          <ds:X509Certificate>{}</ds:X509Certificate>\n        </ds:X509Data>\n      </ds:KeyInfo>\n    </md:KeyDescriptor>\n",
        key_use, certificate
    )
}

/// Render the `EntityDescriptor`. `certificate_der` is the SP certificate.
pub fn render_sp_metadata(sp: &SpMetadata<'_>, certificate_der: &[u8]) -> String {
    let certificate = STANDARD.encode(certificate_der);
    let mut xml = String::with_capacity(2048 + certificate.len() * 2);

    xml.push_str("<?xml version=\"1.0\"?>\n");
    xml.push_str(&format!(
        "<md:EntityDescriptor xmlns:md=\"urn:oasis:names:tc:SAML:2.0:metadata\" xmlns:ds=\"http://www.w3.org/2000/09/xmldsig#\" entityID=\"{}\">\n",
        escape(sp.entity_id)
    ));
    xml.push_str(&format!(
        "  <md:SPSSODescriptor AuthnRequestsSigned=\"{}\" WantAssertionsSigned=\"{}\" protocolSupportEnumeration=\"urn:oasis:names:tc:SAML:2.0:protocol\">\n",
        sp.authn_requests_signed, sp.want_assertions_signed
    ));
    xml.push_str(&key_descriptor("signing", &certificate));
    xml.push_str(&key_descriptor("encryption", &certificate));
    xml.push_str(&format!(
        "    <md:NameIDFormat>{}</md:NameIDFormat>\n",
        escape(sp.name_id_format)
    ));
    xml.push_str(&format!(
        "    <md:AssertionConsumerService Binding=\"{}\" Location=\"{}\" index=\"1\"/>\n",
        HTTP_POST_BINDING,
        escape(sp.acs_url)
    ));
    xml.push_str("  </md:SPSSODescriptor>\n");

    if !sp.organizations.is_empty() {
        xml.push_str("  <md:Organization>\n");
        for org in &sp.organizations {
            xml.push_str(&format!(
                "    <md:OrganizationName xml:lang=\"{}\">{}</md:OrganizationName>\n",
                escape(&org.lang),
                escape(&org.name)
            ));
        }
        for org in &sp.organizations {
            xml.push_str(&format!(
                "    <md:OrganizationDisplayName xml:lang=\"{}\">{}</md:OrganizationDisplayName>\n",
                escape(&org.lang),
                escape(&org.display_name)
            ));
        }
        for org in &sp.organizations {
            xml.push_str(&format!(
                "    <md:OrganizationURL xml:lang=\"{}\">{}</md:OrganizationURL>\n",
                escape(&org.lang),
                escape(&org.url)
            ));
        }
        xml.push_str("  </md:Organization>\n");
    }

    for contact in &sp.contacts {
        xml.push_str(&format!(
            "  <md:ContactPerson contactType=\"{}\">\n",
            contact.contact_type
        ));
        if !contact.given_name.is_empty() {
            xml.push_str(&format!(
                "    <md:GivenName>{}</md:GivenName>\n",
                escape(&contact.given_name)
            ));
        }
        if !contact.email.is_empty() {
            xml.push_str(&format!(
                "    <md:EmailAddress>{}</md:EmailAddress>\n",
                escape(&contact.email)
            ));
        }
        xml.push_str("  </md:ContactPerson>\n");
    }

    xml.push_str("</md:EntityDescriptor>\n");
    xml
}
