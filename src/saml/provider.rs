//! SAML Service Provider protocol engine.
//!
//! Handles the SP-initiated SSO flow: AuthnRequest issuing (HTTP-Redirect binding),
//! Response consumption (HTTP-POST binding) and SP metadata.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use quick_xml::escape::escape;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use super::config::{AuthenticatorConfiguration, IdpDescriptor, IdpLabel, DEFAULT_CLOCK_DRIFT_SECS};
use super::crypto::{SamlCrypto, SignedElement};
use super::error::{AssertionError, AssertionErrorKind, CryptoError, MetadataError, RequestError};
use super::metadata::SpMetadata;
use super::xmldsig::{self, HashAlgorithm};
use super::xmlenc::EncryptedAssertion;

const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
const BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

/// `{base}/login/{slug}?idp={label}`
pub fn build_login_url(base: &str, slug: &str, idp: &IdpLabel) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&format!("{}/login/{}", base.trim_end_matches('/'), slug))?;
    url.query_pairs_mut().append_pair("idp", idp.as_str());
    Ok(url)
}

/// `{base}/complete/{slug}`, the Assertion Consumer Service URL.
pub fn build_callback_url(base: &str, slug: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!("{}/complete/{}", base.trim_end_matches('/'), slug))
}

/// Where to send the browser, and the request ID to expect back in `InResponseTo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthnRequestRedirect {
    pub redirect_url: String,
    pub request_id: String,
}

/// User identity extracted from a validated assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedIdentity {
    /// Stable user key: the permanent id attribute when configured, else the username.
    pub user_key: String,
    pub username: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub groups: Vec<String>,
    pub name_id: Option<String>,
    pub session_index: Option<String>,
    pub idp: IdpLabel,
    /// Values copied by `EXTRA_DATA` rules, keyed by alias.
    pub extra: BTreeMap<String, Vec<String>>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

/// Stateless SAML engine; all key material comes from the configuration passed in.
#[derive(Clone)]
pub struct SamlEngine {
    crypto: Arc<dyn SamlCrypto>,
    clock_drift: Duration,
}

impl SamlEngine {
    pub fn new(crypto: Arc<dyn SamlCrypto>) -> Self {
        Self {
            crypto,
            clock_drift: Duration::seconds(DEFAULT_CLOCK_DRIFT_SECS),
        }
    }

    pub fn crypto(&self) -> &dyn SamlCrypto {
        self.crypto.as_ref()
    }

    /// Create an AuthnRequest and return the redirect URL to the IdP.
    pub fn issue_authn_request(
        &self,
        config: &AuthenticatorConfiguration,
        idp_label: &IdpLabel,
        relay_state: Option<&str>,
    ) -> Result<AuthnRequestRedirect, RequestError> {
        let idp = config
            .idp(idp_label)
            .ok_or_else(|| RequestError::UnknownIdp(idp_label.to_string()))?;
        let acs_url = config
            .callback_url
            .as_deref()
            .ok_or(RequestError::MissingCallbackUrl)?;
        let security = config.security();

        let request_id = format!("_id{}", uuid::Uuid::new_v4());
        let issue_instant = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let name_id_policy = config
            .name_id_format()
            .map(|format| {
                format!(
                    r#"<samlp:NameIDPolicy Format="{}" AllowCreate="true"/>"#,
                    escape(format)
                )
            })
            .unwrap_or_default();

        let requested_context = if security.requested_authn_context.is_empty() {
            String::new()
        } else {
            let classes: String = security
                .requested_authn_context
                .iter()
                .map(|class| format!("<saml:AuthnContextClassRef>{}</saml:AuthnContextClassRef>", escape(class)))
                .collect();
            format!(
                r#"<samlp:RequestedAuthnContext Comparison="exact">{}</samlp:RequestedAuthnContext>"#,
                classes
            )
        };

        let authn_request = format!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{}" Version="2.0" IssueInstant="{}" Destination="{}" ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" AssertionConsumerServiceURL="{}"><saml:Issuer>{}</saml:Issuer>{}{}</samlp:AuthnRequest>"#,
            request_id,
            issue_instant,
            escape(&idp.url),
            escape(acs_url),
            escape(&config.sp_entity_id),
            name_id_policy,
            requested_context,
        );

        let encoded =
            deflate_and_encode(&authn_request).map_err(|e| RequestError::Encoding(e.to_string()))?;

        let mut query = format!("SAMLRequest={}", urlencoding::encode(&encoded));
        if let Some(state) = relay_state {
            query.push_str(&format!("&RelayState={}", urlencoding::encode(state)));
        }

        if security.authn_requests_signed {
            let algorithm = HashAlgorithm::from_signature_method(&security.signature_algorithm)
                .ok_or_else(|| {
                    CryptoError::UnsupportedAlgorithm(security.signature_algorithm.clone())
                })?;
            query.push_str(&format!(
                "&SigAlg={}",
                urlencoding::encode(&security.signature_algorithm)
            ));
            let signature = self
                .crypto
                .sign(query.as_bytes(), &config.sp_private_key, algorithm)?;
            query.push_str(&format!(
                "&Signature={}",
                urlencoding::encode(&BASE64.encode(signature))
            ));
        }

        let separator = if idp.url.contains('?') { '&' } else { '?' };
        let redirect_url = format!("{}{}{}", idp.url, separator, query);

        debug!(
            idp = %idp_label,
            request_id = %request_id,
            signed = security.authn_requests_signed,
            "Created SAML AuthnRequest redirect"
        );
        Ok(AuthnRequestRedirect {
            redirect_url,
            request_id,
        })
    }

    /// Validate a base64 `SAMLResponse` POSTed by the IdP.
    ///
    /// `expected_request_ids` lists outstanding AuthnRequest IDs; when empty,
    /// unsolicited (IdP-initiated) responses are accepted.
    pub fn consume_response(
        &self,
        config: &AuthenticatorConfiguration,
        idp_label: &IdpLabel,
        raw_payload: &str,
        expected_request_ids: &[String],
    ) -> Result<NormalizedIdentity, AssertionError> {
        self.consume_response_at(config, idp_label, raw_payload, expected_request_ids, Utc::now())
    }

    pub fn consume_response_at(
        &self,
        config: &AuthenticatorConfiguration,
        idp_label: &IdpLabel,
        raw_payload: &str,
        expected_request_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<NormalizedIdentity, AssertionError> {
        use AssertionErrorKind::*;

        let idp = config.idp(idp_label).ok_or_else(|| {
            AssertionError::new(Malformed, format!("IdP {} is not configured", idp_label))
        })?;

        let compact: String = raw_payload.chars().filter(|c| !c.is_whitespace()).collect();
        let response_xml = BASE64
            .decode(compact.as_bytes())
            .map_err(|e| AssertionError::new(Malformed, format!("invalid base64: {}", e)))?;
        let received = String::from_utf8(response_xml)
            .map_err(|_| AssertionError::new(Malformed, "SAML response is not valid UTF-8"))?;

        debug!(idp = %idp_label, "Processing SAML response");

        let outer = xmldsig::scan(&received).map_err(|e| AssertionError::new(Malformed, e.to_string()))?;
        let decrypted = if outer.encrypted_assertions.is_empty() {
            None
        } else {
            Some(self.decrypt_assertion(config, &received)?)
        };
        let document = match decrypted {
            Some((ref spliced, _)) => spliced.as_str(),
            None => received.as_str(),
        };

        let scan = xmldsig::scan(document).map_err(|e| AssertionError::new(Malformed, e.to_string()))?;
        let response: samael::schema::Response = document
            .parse()
            .map_err(|e| AssertionError::new(Malformed, format!("failed to parse SAML response: {:?}", e)))?;

        if let Some(ref status) = response.status {
            let status_value = status.status_code.value.as_deref();
            if status_value != Some(STATUS_SUCCESS) {
                let message = status
                    .status_message
                    .as_ref()
                    .and_then(|m| m.value.clone())
                    .unwrap_or_else(|| status_value.unwrap_or("unknown status").to_string());
                return Err(AssertionError::new(Rejected, message));
            }
        }

        // Exactly one assertion, a child of the Response, so the one we read is
        // the one that was signed.
        let scanned = match scan.assertions.as_slice() {
            [only] if scan.encrypted_assertions.is_empty() => only,
            found => {
                return Err(AssertionError::new(
                    Malformed,
                    format!("expected one assertion, found {}", found.len()),
                ))
            }
        };
        let assertion = response
            .assertion
            .as_ref()
            .ok_or_else(|| AssertionError::new(Malformed, "SAML response contains no assertion"))?;
        if scanned.depth != 1 || scanned.id.as_deref() != Some(assertion.id.as_str()) {
            return Err(AssertionError::new(Malformed, "assertion is not a child of the Response"));
        }

        let signed = match decrypted {
            // The Response signature covers the EncryptedAssertion; an assertion
            // signature sits inside the plaintext.
            Some((_, ref plaintext)) => {
                let mut signed = self.verify_signature(&received, &idp.x509_cert)?;
                let inner = self.verify_signature(plaintext, &idp.x509_cert)?;
                signed.extend(inner.into_iter().map(|element| SignedElement {
                    depth: element.depth + 1,
                    ..element
                }));
                signed
            }
            None => self.verify_signature(document, &idp.x509_cert)?,
        };
        self.check_signed_elements(config, &signed, &response.id, &assertion.id)?;

        let expected_issuer = idp.entity_id.as_str();
        if let Some(issuer) = response.issuer.as_ref().and_then(|i| i.value.as_deref()) {
            if issuer != expected_issuer {
                return Err(AssertionError::new(
                    IssuerMismatch,
                    format!("response issuer {}", issuer),
                ));
            }
        }
        let assertion_issuer = assertion.issuer.value.as_deref().unwrap_or_default();
        if assertion_issuer != expected_issuer {
            return Err(AssertionError::new(
                IssuerMismatch,
                format!("assertion issuer {}", assertion_issuer),
            ));
        }

        if let (Some(destination), Some(acs_url)) =
            (response.destination.as_deref(), config.callback_url.as_deref())
        {
            if destination != acs_url {
                return Err(AssertionError::new(
                    AudienceMismatch,
                    format!("destination {}", destination),
                ));
            }
        }

        if let Some(ref conditions) = assertion.conditions {
            if let Some(ref restrictions) = conditions.audience_restrictions {
                for restriction in restrictions {
                    if !restriction.audience.iter().any(|a| a == &config.sp_entity_id) {
                        return Err(AssertionError::new(
                            AudienceMismatch,
                            format!("audience {:?}", restriction.audience),
                        ));
                    }
                }
            }

            if let Some(not_before) = conditions.not_before {
                if now < not_before - self.clock_drift {
                    return Err(AssertionError::new(
                        Expired,
                        format!("not valid before {}", not_before),
                    ));
                }
            }
            if let Some(not_on_or_after) = conditions.not_on_or_after {
                if now >= not_on_or_after + self.clock_drift {
                    return Err(AssertionError::new(
                        Expired,
                        format!("expired at {}", not_on_or_after),
                    ));
                }
            }
        }

        self.check_subject_confirmation(config, assertion, response.in_response_to.as_deref(), now)?;

        if !expected_request_ids.is_empty() {
            match response.in_response_to.as_deref() {
                Some(id) if expected_request_ids.iter().any(|e| e == id) => {}
                other => {
                    return Err(AssertionError::new(
                        Rejected,
                        format!("unexpected InResponseTo {:?}", other),
                    ))
                }
            }
        }

        let name_id = assertion
            .subject
            .as_ref()
            .and_then(|s| s.name_id.as_ref())
            .map(|n| n.value.clone());
        if name_id.is_none() && config.security().want_name_id {
            return Err(AssertionError::new(
                MissingRequiredAttribute,
                "assertion has no NameID",
            ));
        }

        let session_index = assertion
            .authn_statements
            .as_ref()
            .and_then(|stmts| stmts.first())
            .and_then(|s| s.session_index.clone());

        let mut attributes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if let Some(ref attr_statements) = assertion.attribute_statements {
            for attr_statement in attr_statements {
                for attr in &attr_statement.attributes {
                    if let Some(ref name) = attr.name {
                        let values = attr.values.iter().filter_map(|v| v.value.clone());
                        attributes.entry(name.clone()).or_default().extend(values);
                    }
                }
            }
        }

        let identity = extract_identity(config, idp, idp_label, attributes, name_id, session_index)?;

        info!(
            user_key = %identity.user_key,
            idp = %idp_label,
            attributes = identity.attributes.len(),
            encrypted = decrypted.is_some(),
            "SAML assertion validated"
        );
        Ok(identity)
    }

    fn verify_signature(&self, xml: &str, cert: &str) -> Result<Vec<SignedElement>, AssertionError> {
        self.crypto
            .verify_signature(xml, cert)
            .map_err(|e| AssertionError::new(AssertionErrorKind::SignatureInvalid, e.to_string()))
    }

    /// Decrypt the `EncryptedAssertion` with the SP key.
    ///
    /// Returns the document with the assertion in place and the plaintext as
    /// the IdP serialized it.
    fn decrypt_assertion(
        &self,
        config: &AuthenticatorConfiguration,
        xml: &str,
    ) -> Result<(String, String), AssertionError> {
        let malformed = |e: CryptoError| AssertionError::new(AssertionErrorKind::Malformed, e.to_string());

        let encrypted = EncryptedAssertion::locate(xml)
            .map_err(malformed)?
            .ok_or_else(|| AssertionError::new(AssertionErrorKind::Malformed, "no EncryptedAssertion"))?;
        let plaintext = self
            .crypto
            .decrypt(&encrypted.data, &config.sp_private_key)
            .map_err(malformed)?;
        let plaintext = String::from_utf8(plaintext).map_err(|_| {
            AssertionError::new(AssertionErrorKind::Malformed, "decrypted assertion is not valid UTF-8")
        })?;

        debug!(cipher = encrypted.data.cipher.uri(), "Decrypted EncryptedAssertion");
        Ok((encrypted.splice(xml, &plaintext), plaintext))
    }

    fn check_signed_elements(
        &self,
        config: &AuthenticatorConfiguration,
        signed: &[SignedElement],
        response_id: &str,
        assertion_id: &str,
    ) -> Result<(), AssertionError> {
        use AssertionErrorKind::SignatureInvalid;
        let security = config.security();

        let mut response_signed = false;
        let mut assertion_signed = false;
        for element in signed {
            // Only the root Response and its direct Assertion child count; a
            // copy with the same ID anywhere else is a wrapping attempt.
            match (element.name.as_str(), element.depth) {
                ("Response", 0) if element.id == response_id => response_signed = true,
                ("Assertion", 1) if element.id == assertion_id => assertion_signed = true,
                _ => {
                    return Err(AssertionError::new(
                        SignatureInvalid,
                        format!(
                            "signature on unexpected element {} {} at depth {}",
                            element.name, element.id, element.depth
                        ),
                    ))
                }
            }
            if security.reject_deprecated_algorithm
                && (element.signature_method.is_deprecated() || element.digest_method.is_deprecated())
            {
                return Err(AssertionError::new(
                    SignatureInvalid,
                    format!("deprecated algorithm on {}", element.name),
                ));
            }
        }

        if !response_signed && !assertion_signed {
            return Err(AssertionError::new(SignatureInvalid, "response is not signed"));
        }
        if security.want_messages_signed && !response_signed {
            return Err(AssertionError::new(SignatureInvalid, "Response element is not signed"));
        }
        if security.want_assertions_signed && !assertion_signed {
            return Err(AssertionError::new(SignatureInvalid, "Assertion element is not signed"));
        }
        Ok(())
    }

    /// At least one bearer `SubjectConfirmation` must still be usable, addressed
    /// to this ACS and, when it names one, answer the same request as the Response.
    fn check_subject_confirmation(
        &self,
        config: &AuthenticatorConfiguration,
        assertion: &samael::schema::Assertion,
        in_response_to: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), AssertionError> {
        use AssertionErrorKind::*;

        let confirmations = assertion
            .subject
            .as_ref()
            .and_then(|s| s.subject_confirmations.as_deref())
            .unwrap_or_default();

        let mut failure = AssertionError::new(Expired, "no bearer SubjectConfirmation");
        for confirmation in confirmations
            .iter()
            .filter(|c| c.method.as_deref() == Some(BEARER))
        {
            let Some(data) = confirmation.subject_confirmation_data.as_ref() else {
                failure = AssertionError::new(Expired, "SubjectConfirmationData missing");
                continue;
            };

            if let (Some(expected), Some(confirmed)) = (in_response_to, data.in_response_to.as_deref()) {
                if expected != confirmed {
                    failure = AssertionError::new(
                        Rejected,
                        format!("SubjectConfirmationData InResponseTo {}", confirmed),
                    );
                    continue;
                }
            }

            match (data.recipient.as_deref(), config.callback_url.as_deref()) {
                (None, _) => {
                    failure = AssertionError::new(AudienceMismatch, "SubjectConfirmationData has no Recipient");
                    continue;
                }
                (Some(recipient), Some(acs_url)) if recipient != acs_url => {
                    failure = AssertionError::new(AudienceMismatch, format!("recipient {}", recipient));
                    continue;
                }
                _ => {}
            }

            if let Some(not_before) = data.not_before {
                if now < not_before - self.clock_drift {
                    failure = AssertionError::new(
                        Expired,
                        format!("subject not confirmable before {}", not_before),
                    );
                    continue;
                }
            }
            match data.not_on_or_after {
                Some(not_on_or_after) if now < not_on_or_after + self.clock_drift => return Ok(()),
                Some(not_on_or_after) => {
                    failure = AssertionError::new(
                        Expired,
                        format!("subject confirmation expired at {}", not_on_or_after),
                    );
                }
                None => {
                    failure = AssertionError::new(Expired, "SubjectConfirmationData has no NotOnOrAfter");
                }
            }
        }

        Err(failure)
    }

    /// SP metadata for the configuration. Errors carry a message fit for display.
    pub fn generate_metadata_document(
        &self,
        config: &AuthenticatorConfiguration,
    ) -> Result<String, MetadataError> {
        let sp = SpMetadata::from_config(config)
            .ok_or_else(|| MetadataError("CALLBACK_URL is not configured".to_string()))?;
        self.crypto
            .build_metadata(&sp)
            .map_err(|e| MetadataError(format!("Invalid SP metadata: {}", e)))
    }
}

fn first_value(attributes: &BTreeMap<String, Vec<String>>, name: &str) -> Option<String> {
    attributes
        .get(name)
        .and_then(|values| values.iter().find(|v| !v.is_empty()))
        .cloned()
}

fn extract_identity(
    config: &AuthenticatorConfiguration,
    idp: &IdpDescriptor,
    idp_label: &IdpLabel,
    attributes: BTreeMap<String, Vec<String>>,
    name_id: Option<String>,
    session_index: Option<String>,
) -> Result<NormalizedIdentity, AssertionError> {
    let user_key = match idp.user_key_attribute() {
        Some(attr) => first_value(&attributes, attr).ok_or_else(|| {
            AssertionError::new(
                AssertionErrorKind::MissingRequiredAttribute,
                format!("attribute {} missing", attr),
            )
        })?,
        None => name_id.clone().ok_or_else(|| {
            AssertionError::new(
                AssertionErrorKind::MissingRequiredAttribute,
                "no user key attribute configured and no NameID",
            )
        })?,
    };

    let username = idp
        .attr_username
        .as_deref()
        .and_then(|attr| first_value(&attributes, attr))
        .unwrap_or_else(|| user_key.clone());

    let groups = idp
        .attr_groups
        .as_deref()
        .and_then(|attr| attributes.get(attr))
        .map(|values| values.iter().filter(|v| !v.is_empty()).cloned().collect())
        .unwrap_or_default();

    let mut extra = BTreeMap::new();
    for rule in &config.extra_data {
        let values = attributes.get(&rule.attribute).cloned().unwrap_or_default();
        if rule.discard_if_empty && values.iter().all(|v| v.is_empty()) {
            continue;
        }
        extra.insert(rule.alias.clone(), values);
    }

    Ok(NormalizedIdentity {
        user_key,
        username,
        email: first_value(&attributes, &idp.attr_email),
        first_name: first_value(&attributes, &idp.attr_first_name),
        last_name: first_value(&attributes, &idp.attr_last_name),
        groups,
        name_id,
        session_index,
        idp: idp_label.clone(),
        extra,
        attributes,
    })
}

/// Deflate and base64 encode for SAML redirect binding.
fn deflate_and_encode(xml: &str) -> std::io::Result<String> {
    use std::io::Write;

    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(xml.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}
