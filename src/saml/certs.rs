//! Certificate decoding and SP certificate/key pair validation.

use base64::{engine::general_purpose::STANDARD, Engine};
use x509_parser::prelude::*;

use super::crypto::SamlCrypto;
use super::error::{CertKeyMismatchError, CryptoError};

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Parsed certificate information.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub subject_dn: String,
    /// Not valid before (Unix timestamp).
    pub not_before: i64,
    /// Not valid after (Unix timestamp).
    pub not_after: i64,
}

impl CertificateInfo {
    pub fn is_expired_at(&self, unix_time: i64) -> bool {
        unix_time > self.not_after
    }
}

/// Decode a certificate given as PEM or as bare base64 DER.
///
/// IdP certificates are commonly pasted without PEM armour, and proxies may
/// URL-encode them, so all three shapes are accepted.
pub fn decode_certificate(data: &str) -> Result<Vec<u8>, CryptoError> {
    let data = data.trim();
    if data.is_empty() {
        return Err(CryptoError::Certificate("certificate is empty".to_string()));
    }

    let decoded = if data.contains('%') {
        urlencoding::decode(data)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| data.to_string())
    } else {
        data.to_string()
    };

    let body = if decoded.contains(PEM_BEGIN) {
        let start = decoded
            .find(PEM_BEGIN)
            .ok_or_else(|| CryptoError::Certificate("missing BEGIN marker".to_string()))?;
        let end = decoded
            .find(PEM_END)
            .ok_or_else(|| CryptoError::Certificate("missing END marker".to_string()))?;
        if end < start {
            return Err(CryptoError::Certificate("END marker before BEGIN marker".to_string()));
        }
        &decoded[start + PEM_BEGIN.len()..end]
    } else {
        decoded.as_str()
    };

    let base64_content: String = body.chars().filter(|c| !c.is_whitespace()).collect();

    STANDARD
        .decode(base64_content.as_bytes())
        .map_err(|e| CryptoError::Certificate(format!("invalid base64 content: {}", e)))
}

/// Decode and parse an X.509 certificate.
pub fn parse_certificate(data: &str) -> Result<CertificateInfo, CryptoError> {
    let der = decode_certificate(data)?;
    let (_, cert) = X509Certificate::from_der(&der).map_err(|e| {
        CryptoError::Certificate(format!("failed to parse X.509 certificate: {:?}", e))
    })?;

    Ok(CertificateInfo {
        subject_dn: cert.subject().to_string(),
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
    })
}

/// Check that the SP certificate and private key load and belong together.
///
/// Both values are required; callers resolve the "unchanged" sentinel to the
/// stored key before calling.
pub fn validate_cert_with_key(
    crypto: &dyn SamlCrypto,
    public_cert: Option<&str>,
    private_key: Option<&str>,
) -> Result<(), CertKeyMismatchError> {
    let cert = public_cert.map(str::trim).filter(|c| !c.is_empty());
    let key = private_key.map(str::trim).filter(|k| !k.is_empty());

    let (cert, key) = match (cert, key) {
        (Some(cert), Some(key)) => (cert, key),
        (None, _) => {
            return Err(CertKeyMismatchError(
                "Unable to validate SP_PRIVATE_KEY: SP_PUBLIC_CERT is missing".to_string(),
            ))
        }
        (_, None) => {
            return Err(CertKeyMismatchError(
                "Unable to validate SP_PRIVATE_KEY: private key is missing".to_string(),
            ))
        }
    };

    crypto.verify_key_pair(cert, key).map_err(|e| match e {
        CryptoError::Certificate(msg) => {
            CertKeyMismatchError(format!("Unable to load SP_PUBLIC_CERT: {}", msg))
        }
        CryptoError::PrivateKey(msg) => {
            CertKeyMismatchError(format!("Unable to load SP_PRIVATE_KEY: {}", msg))
        }
        CryptoError::KeyMismatch => CertKeyMismatchError(
            "The certificate and private key do not match".to_string(),
        ),
        other => CertKeyMismatchError(other.to_string()),
    })
}
