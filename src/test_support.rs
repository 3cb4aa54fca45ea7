//! Fixtures shared by the unit tests: throwaway RSA keys, a minimal enveloped
//! signer, an assertion encrypter and a configurable IdP Response.

use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::encrypt::Encrypter;
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::PKey;
use openssl::rand::rand_bytes;
use openssl::rsa::{Padding, Rsa};
use openssl::sign::Signer;
use openssl::symm::{encrypt, encrypt_aead, Cipher};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use serde_json::{json, Map, Value};

use crate::saml::config::{AuthenticatorConfiguration, IdpDescriptor, IdpLabel};
use crate::saml::xmldsig::{self, C14nMethod, HashAlgorithm, ENVELOPED_SIGNATURE, EXC_C14N};
use crate::saml::xmlenc::{BlockCipher, RSA_OAEP, RSA_OAEP_MGF1P, XMLENC_NS};

pub const SP_ENTITY_ID: &str = "https://gateway.example.com/sp";
pub const CALLBACK_URL: &str = "https://gateway.example.com/complete/saml-corporate-idp";
pub const IDP_ENTITY_ID: &str = "https://idp.example.com/metadata";
pub const IDP_SSO_URL: &str = "https://idp.example.com/sso";

const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
const SIGNATURE_PLACEHOLDER: &str = "UExBQ0VIT0xERVI=";

/// Self-signed certificate and PKCS#8 private key, both PEM.
pub fn generate_keypair(common_name: &str) -> (String, String) {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    let cert = String::from_utf8(builder.build().to_pem().unwrap()).unwrap();
    let key = String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    (cert, key)
}

/// Bare base64 body of a PEM document.
pub fn strip_pem_armour(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("")
}

pub struct TestKeys {
    pub sp_cert: String,
    pub sp_key: String,
    pub idp_cert: String,
    pub idp_key: String,
}

/// Generated once per test binary; RSA generation is slow.
pub fn keys() -> &'static TestKeys {
    static KEYS: OnceLock<TestKeys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let (sp_cert, sp_key) = generate_keypair("gateway.example.com");
        let (idp_cert, idp_key) = generate_keypair("idp.example.com");
        TestKeys {
            sp_cert,
            sp_key,
            idp_cert,
            idp_key,
        }
    })
}

pub fn idp_descriptor() -> IdpDescriptor {
    IdpDescriptor {
        url: IDP_SSO_URL.to_string(),
        x509_cert: strip_pem_armour(&keys().idp_cert),
        entity_id: IDP_ENTITY_ID.to_string(),
        attr_email: "mail".to_string(),
        attr_username: Some("uid".to_string()),
        attr_user_permanent_id: None,
        attr_first_name: "givenName".to_string(),
        attr_last_name: "sn".to_string(),
        attr_groups: Some("memberOf".to_string()),
    }
}

/// A complete, valid stored configuration.
pub fn sp_configuration() -> AuthenticatorConfiguration {
    let mut config = AuthenticatorConfiguration::from_internal(json!({
        "SP_ENTITY_ID": SP_ENTITY_ID,
        "SP_PUBLIC_CERT": keys().sp_cert,
        "SP_PRIVATE_KEY": keys().sp_key,
        "CALLBACK_URL": CALLBACK_URL,
    }))
    .unwrap();
    config
        .enabled_idps
        .insert(IdpLabel::default(), idp_descriptor());
    config
}

/// The administrative (flat) form of [`sp_configuration`], without `CALLBACK_URL`.
pub fn flat_settings() -> Map<String, Value> {
    match json!({
        "SP_ENTITY_ID": SP_ENTITY_ID,
        "SP_PUBLIC_CERT": keys().sp_cert,
        "SP_PRIVATE_KEY": keys().sp_key,
        "IDP_URL": IDP_SSO_URL,
        "IDP_X509_CERT": strip_pem_armour(&keys().idp_cert),
        "IDP_ENTITY_ID": IDP_ENTITY_ID,
        "IDP_ATTR_EMAIL": "mail",
        "IDP_ATTR_USERNAME": "uid",
        "IDP_ATTR_FIRST_NAME": "givenName",
        "IDP_ATTR_LAST_NAME": "sn",
        "IDP_GROUPS": "memberOf",
    }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

/// Builder for an IdP Response with a single Assertion.
#[derive(Debug, Clone)]
pub struct ResponseFixture {
    pub response_id: String,
    pub assertion_id: String,
    pub in_response_to: Option<String>,
    pub destination: String,
    pub issuer: String,
    pub audience: String,
    pub status: String,
    pub name_id: Option<String>,
    pub session_index: String,
    pub issue_instant: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub not_on_or_after: DateTime<Utc>,
    /// Emit the `Conditions` element.
    pub conditions: bool,
    pub recipient: String,
    pub subject_not_on_or_after: DateTime<Utc>,
    pub attributes: Vec<(String, Vec<String>)>,
}

impl Default for ResponseFixture {
    fn default() -> Self {
        let now = Utc::now();
        let attr = |name: &str, values: &[&str]| {
            (
                name.to_string(),
                values.iter().map(|v| v.to_string()).collect(),
            )
        };

        Self {
            response_id: format!("_resp{}", uuid::Uuid::new_v4().simple()),
            assertion_id: format!("_assert{}", uuid::Uuid::new_v4().simple()),
            in_response_to: None,
            destination: CALLBACK_URL.to_string(),
            issuer: IDP_ENTITY_ID.to_string(),
            audience: SP_ENTITY_ID.to_string(),
            status: STATUS_SUCCESS.to_string(),
            name_id: Some("jdoe".to_string()),
            session_index: "_session42".to_string(),
            issue_instant: now,
            not_before: now - Duration::seconds(60),
            not_on_or_after: now + Duration::seconds(300),
            conditions: true,
            recipient: CALLBACK_URL.to_string(),
            subject_not_on_or_after: now + Duration::seconds(300),
            attributes: vec![
                attr("uid", &["jdoe"]),
                attr("mail", &["jdoe@example.com"]),
                attr("givenName", &["John"]),
                attr("sn", &["Doe"]),
                attr("memberOf", &["admins", "users"]),
                attr("employeeNumber", &["E1001"]),
            ],
        }
    }
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

impl ResponseFixture {
    pub fn to_xml(&self) -> String {
        let in_response_to = self
            .in_response_to
            .as_ref()
            .map(|id| format!(" InResponseTo=\"{}\"", id))
            .unwrap_or_default();

        let name_id = self
            .name_id
            .as_ref()
            .map(|v| {
                format!(
                    "<saml:NameID Format=\"urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified\">{}</saml:NameID>",
                    v
                )
            })
            .unwrap_or_default();

        let attributes: String = self
            .attributes
            .iter()
            .map(|(name, values)| {
                let values: String = values
                    .iter()
                    .map(|v| format!("<saml:AttributeValue xsi:type=\"xs:string\">{}</saml:AttributeValue>", v))
                    .collect();
                format!(
                    "<saml:Attribute Name=\"{}\" NameFormat=\"urn:oasis:names:tc:SAML:2.0:attrname-format:basic\">{}</saml:Attribute>",
                    name, values
                )
            })
            .collect();

        let conditions = if self.conditions {
            format!(
                concat!(
                    "<saml:Conditions NotBefore=\"{}\" NotOnOrAfter=\"{}\">",
                    "<saml:AudienceRestriction><saml:Audience>{}</saml:Audience></saml:AudienceRestriction>",
                    "</saml:Conditions>"
                ),
                timestamp(&self.not_before),
                timestamp(&self.not_on_or_after),
                self.audience
            )
        } else {
            String::new()
        };

        format!(
            concat!(
                "<samlp:Response xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\" xmlns:saml=\"urn:oasis:names:tc:SAML:2.0:assertion\" ID=\"{rid}\" Version=\"2.0\" IssueInstant=\"{now}\" Destination=\"{dest}\"{irt}>",
                "<saml:Issuer>{issuer}</saml:Issuer>",
                "<samlp:Status><samlp:StatusCode Value=\"{status}\"/></samlp:Status>",
                "<saml:Assertion xmlns:saml=\"urn:oasis:names:tc:SAML:2.0:assertion\" xmlns:xs=\"http://www.w3.org/2001/XMLSchema\" xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" ID=\"{aid}\" Version=\"2.0\" IssueInstant=\"{now}\">",
                "<saml:Issuer>{issuer}</saml:Issuer>",
                "<saml:Subject>{name_id}<saml:SubjectConfirmation Method=\"urn:oasis:names:tc:SAML:2.0:cm:bearer\">",
                "<saml:SubjectConfirmationData NotOnOrAfter=\"{sc_nooa}\" Recipient=\"{recipient}\"{irt}/>",
                "</saml:SubjectConfirmation></saml:Subject>",
                "{conditions}",
                "<saml:AuthnStatement AuthnInstant=\"{now}\" SessionIndex=\"{sidx}\"><saml:AuthnContext>",
                "<saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef>",
                "</saml:AuthnContext></saml:AuthnStatement>",
                "<saml:AttributeStatement>{attrs}</saml:AttributeStatement>",
                "</saml:Assertion></samlp:Response>"
            ),
            rid = self.response_id,
            aid = self.assertion_id,
            now = timestamp(&self.issue_instant),
            dest = self.destination,
            irt = in_response_to,
            issuer = self.issuer,
            status = self.status,
            name_id = name_id,
            sc_nooa = timestamp(&self.subject_not_on_or_after),
            recipient = self.recipient,
            conditions = conditions,
            sidx = self.session_index,
            attrs = attributes,
        )
    }

    /// Signed with the shared IdP key: Assertion, then Response.
    pub fn signed_xml(&self) -> String {
        let keys = keys();
        let xml = sign_element(&self.to_xml(), &self.assertion_id, &keys.idp_key, &keys.idp_cert);
        sign_element(&xml, &self.response_id, &keys.idp_key, &keys.idp_cert)
    }

    pub fn signed_payload(&self) -> String {
        STANDARD.encode(self.signed_xml())
    }
}

/// Insert an RSA-SHA256 enveloped signature into the element with `ID="{id}"`,
/// directly after its `saml:Issuer`.
pub fn sign_element(xml: &str, id: &str, key_pem: &str, cert_pem: &str) -> String {
    let canonical = xmldsig::canonical_element_by_id(xml, id, &C14nMethod::exclusive()).unwrap();
    let digest = STANDARD.encode(hash(MessageDigest::sha256(), &canonical).unwrap());

    let signature = format!(
        concat!(
            "<ds:Signature xmlns:ds=\"http://www.w3.org/2000/09/xmldsig#\">",
            "<ds:SignedInfo>",
            "<ds:CanonicalizationMethod Algorithm=\"{c14n}\"/>",
            "<ds:SignatureMethod Algorithm=\"{sig_alg}\"/>",
            "<ds:Reference URI=\"#{id}\">",
            "<ds:Transforms><ds:Transform Algorithm=\"{env}\"/><ds:Transform Algorithm=\"{c14n}\"/></ds:Transforms>",
            "<ds:DigestMethod Algorithm=\"{digest_alg}\"/>",
            "<ds:DigestValue>{digest}</ds:DigestValue>",
            "</ds:Reference>",
            "</ds:SignedInfo>",
            "<ds:SignatureValue>{placeholder}</ds:SignatureValue>",
            "<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>",
            "</ds:Signature>"
        ),
        c14n = EXC_C14N,
        env = ENVELOPED_SIGNATURE,
        sig_alg = HashAlgorithm::Sha256.signature_method_uri(),
        digest_alg = HashAlgorithm::Sha256.digest_method_uri(),
        id = id,
        digest = digest,
        placeholder = SIGNATURE_PLACEHOLDER,
        cert = strip_pem_armour(cert_pem),
    );

    let element_start = xml.find(&format!("ID=\"{}\"", id)).unwrap();
    let issuer_close = "</saml:Issuer>";
    let insert_at = element_start + xml[element_start..].find(issuer_close).unwrap() + issuer_close.len();

    let mut document = xml.to_string();
    document.insert_str(insert_at, &signature);

    let scan = xmldsig::scan(&document).unwrap();
    let signed_info = scan
        .signatures
        .iter()
        .find(|s| s.element_id == id)
        .map(|s| s.canonical_signed_info.clone())
        .unwrap();

    let key = PKey::private_key_from_pem(key_pem.as_bytes()).unwrap();
    let mut signer = Signer::new(MessageDigest::sha256(), &key).unwrap();
    signer.update(&signed_info).unwrap();
    let value = STANDARD.encode(signer.sign_to_vec().unwrap());

    document.replacen(SIGNATURE_PLACEHOLDER, &value, 1)
}

/// Replace the Assertion carrying `ID="{id}"` with an `EncryptedAssertion` for
/// the holder of `cert_pem`.
///
/// The content key is wrapped with RSA-OAEP: `rsa-oaep-mgf1p` for SHA-1, the
/// XML Encryption 1.1 form with a matching MGF1 digest otherwise.
pub fn encrypt_assertion(
    xml: &str,
    id: &str,
    cert_pem: &str,
    cipher: BlockCipher,
    oaep_digest: HashAlgorithm,
) -> String {
    let plaintext = xmldsig::standalone_element(xml, id).unwrap();

    let mut key = vec![0; cipher.key_len()];
    rand_bytes(&mut key).unwrap();
    let cipher_value = if cipher.is_gcm() {
        let mut iv = [0; 12];
        rand_bytes(&mut iv).unwrap();
        let mut tag = [0; 16];
        let ciphertext = encrypt_aead(
            openssl_cipher(cipher),
            &key,
            Some(&iv),
            &[],
            plaintext.as_bytes(),
            &mut tag,
        )
        .unwrap();
        [&iv[..], &ciphertext, &tag[..]].concat()
    } else {
        let mut iv = [0; 16];
        rand_bytes(&mut iv).unwrap();
        // PKCS#7 padding is one of the paddings XML Encryption accepts.
        let ciphertext = encrypt(openssl_cipher(cipher), &key, Some(&iv), plaintext.as_bytes()).unwrap();
        [&iv[..], &ciphertext].concat()
    };

    let public_key = X509::from_pem(cert_pem.as_bytes()).unwrap().public_key().unwrap();
    let mut encrypter = Encrypter::new(&public_key).unwrap();
    encrypter.set_rsa_padding(Padding::PKCS1_OAEP).unwrap();
    let key_method = match oaep_digest {
        HashAlgorithm::Sha1 => format!("<xenc:EncryptionMethod Algorithm=\"{}\"/>", RSA_OAEP_MGF1P),
        digest => {
            let (md, bits) = match digest {
                HashAlgorithm::Sha256 => (MessageDigest::sha256(), 256),
                HashAlgorithm::Sha384 => (MessageDigest::sha384(), 384),
                _ => (MessageDigest::sha512(), 512),
            };
            encrypter.set_rsa_oaep_md(md).unwrap();
            encrypter.set_rsa_mgf1_md(md).unwrap();
            format!(
                concat!(
                    "<xenc:EncryptionMethod Algorithm=\"{}\">",
                    "<ds:DigestMethod Algorithm=\"{}\"/>",
                    "<xenc11:MGF xmlns:xenc11=\"http://www.w3.org/2009/xmlenc11#\" Algorithm=\"http://www.w3.org/2009/xmlenc11#mgf1sha{}\"/>",
                    "</xenc:EncryptionMethod>"
                ),
                RSA_OAEP,
                digest.digest_method_uri(),
                bits
            )
        }
    };
    let mut wrapped = vec![0; encrypter.encrypt_len(&key).unwrap()];
    let len = encrypter.encrypt(&key, &mut wrapped).unwrap();
    wrapped.truncate(len);

    let encrypted = format!(
        concat!(
            "<saml:EncryptedAssertion>",
            "<xenc:EncryptedData xmlns:xenc=\"{ns}\" Type=\"{ns}Element\">",
            "<xenc:EncryptionMethod Algorithm=\"{data_alg}\"/>",
            "<ds:KeyInfo xmlns:ds=\"http://www.w3.org/2000/09/xmldsig#\">",
            "<xenc:EncryptedKey>{key_method}",
            "<xenc:CipherData><xenc:CipherValue>{wrapped}</xenc:CipherValue></xenc:CipherData>",
            "</xenc:EncryptedKey></ds:KeyInfo>",
            "<xenc:CipherData><xenc:CipherValue>{content}</xenc:CipherValue></xenc:CipherData>",
            "</xenc:EncryptedData></saml:EncryptedAssertion>"
        ),
        ns = XMLENC_NS,
        data_alg = cipher.uri(),
        key_method = key_method,
        wrapped = STANDARD.encode(&wrapped),
        content = STANDARD.encode(&cipher_value),
    );

    let start = xml.find("<saml:Assertion").unwrap();
    let close = "</saml:Assertion>";
    let end = xml.find(close).unwrap() + close.len();
    format!("{}{}{}", &xml[..start], encrypted, &xml[end..])
}

fn openssl_cipher(cipher: BlockCipher) -> Cipher {
    match cipher {
        BlockCipher::Aes128Cbc => Cipher::aes_128_cbc(),
        BlockCipher::Aes192Cbc => Cipher::aes_192_cbc(),
        BlockCipher::Aes256Cbc => Cipher::aes_256_cbc(),
        BlockCipher::Aes128Gcm => Cipher::aes_128_gcm(),
        BlockCipher::Aes192Gcm => Cipher::aes_192_gcm(),
        BlockCipher::Aes256Gcm => Cipher::aes_256_gcm(),
    }
}
