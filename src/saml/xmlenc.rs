//! XML Encryption of assertions.
//!
//! An IdP that honours the SP's encryption key replaces the Assertion with an
//! `EncryptedAssertion`: the assertion is encrypted with a fresh AES key, and
//! that key is wrapped with the SP's RSA public key (`EncryptedKey`). This module
//! reads those parameters out of the document and puts the decrypted assertion
//! back in its place. The decryption itself belongs to [`SamlCrypto`].
//!
//! [`SamlCrypto`]: super::crypto::SamlCrypto

use super::error::CryptoError;
use super::xmldsig::{decode_base64, HashAlgorithm, XmlTree};

pub const XMLENC_NS: &str = "http://www.w3.org/2001/04/xmlenc#";
pub const RSA_OAEP_MGF1P: &str = "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p";
pub const RSA_OAEP: &str = "http://www.w3.org/2009/xmlenc11#rsa-oaep";
pub const RSA_1_5: &str = "http://www.w3.org/2001/04/xmlenc#rsa-1_5";

/// Content encryption algorithm of an `EncryptedData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCipher {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
}

impl BlockCipher {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            "http://www.w3.org/2001/04/xmlenc#aes128-cbc" => Some(Self::Aes128Cbc),
            "http://www.w3.org/2001/04/xmlenc#aes192-cbc" => Some(Self::Aes192Cbc),
            "http://www.w3.org/2001/04/xmlenc#aes256-cbc" => Some(Self::Aes256Cbc),
            "http://www.w3.org/2009/xmlenc11#aes128-gcm" => Some(Self::Aes128Gcm),
            "http://www.w3.org/2009/xmlenc11#aes192-gcm" => Some(Self::Aes192Gcm),
            "http://www.w3.org/2009/xmlenc11#aes256-gcm" => Some(Self::Aes256Gcm),
            _ => None,
        }
    }

    pub fn uri(&self) -> &'static str {
        match self {
            Self::Aes128Cbc => "http://www.w3.org/2001/04/xmlenc#aes128-cbc",
            Self::Aes192Cbc => "http://www.w3.org/2001/04/xmlenc#aes192-cbc",
            Self::Aes256Cbc => "http://www.w3.org/2001/04/xmlenc#aes256-cbc",
            Self::Aes128Gcm => "http://www.w3.org/2009/xmlenc11#aes128-gcm",
            Self::Aes192Gcm => "http://www.w3.org/2009/xmlenc11#aes192-gcm",
            Self::Aes256Gcm => "http://www.w3.org/2009/xmlenc11#aes256-gcm",
        }
    }

    /// Length in bytes of the content encryption key.
    pub fn key_len(&self) -> usize {
        match self {
            Self::Aes128Cbc | Self::Aes128Gcm => 16,
            Self::Aes192Cbc | Self::Aes192Gcm => 24,
            Self::Aes256Cbc | Self::Aes256Gcm => 32,
        }
    }

    pub fn is_gcm(&self) -> bool {
        matches!(self, Self::Aes128Gcm | Self::Aes192Gcm | Self::Aes256Gcm)
    }
}

/// How the content encryption key is wrapped. PKCS#1 v1.5 is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTransport {
    RsaOaep {
        digest: HashAlgorithm,
        mgf1: HashAlgorithm,
    },
}

/// Everything needed to decrypt one `EncryptedData`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    pub cipher: BlockCipher,
    pub key_transport: KeyTransport,
    pub encrypted_key: Vec<u8>,
    /// IV, ciphertext and (GCM) tag, as carried in `CipherValue`.
    pub cipher_value: Vec<u8>,
}

/// The document's `EncryptedAssertion` and its byte span.
#[derive(Debug, Clone)]
pub struct EncryptedAssertion {
    pub data: EncryptedData,
    start: usize,
    end: usize,
}

impl EncryptedAssertion {
    /// Find the single `EncryptedAssertion` directly under the document root.
    ///
    /// Returns `None` for a document without one.
    pub fn locate(xml: &str) -> Result<Option<Self>, CryptoError> {
        let tree = XmlTree::parse(xml)?;
        let found: Vec<usize> = (0..tree.nodes.len())
            .filter(|&i| tree.nodes[i].local_name == "EncryptedAssertion")
            .collect();
        let idx = match found.as_slice() {
            [] => return Ok(None),
            [only] => *only,
            _ => return Err(decryption("more than one EncryptedAssertion")),
        };
        if tree.depth(idx) != 1 {
            return Err(decryption("EncryptedAssertion is not a child of the Response"));
        }

        let encrypted_data = tree
            .first_child(idx, "EncryptedData")
            .ok_or_else(|| decryption("missing EncryptedData"))?;
        let cipher = algorithm(&tree, encrypted_data)?;
        let cipher = BlockCipher::from_uri(cipher)
            .ok_or_else(|| CryptoError::UnsupportedAlgorithm(cipher.to_string()))?;

        // Either inside EncryptedData/KeyInfo or a sibling of EncryptedData.
        let encrypted_key = tree
            .first_descendant(idx, "EncryptedKey")
            .ok_or_else(|| decryption("missing EncryptedKey"))?;
        let key_transport = key_transport(&tree, encrypted_key)?;

        Ok(Some(Self {
            data: EncryptedData {
                cipher,
                key_transport,
                encrypted_key: cipher_value(&tree, encrypted_key)?,
                cipher_value: cipher_value(&tree, encrypted_data)?,
            },
            start: tree.nodes[idx].start,
            end: tree.nodes[idx].end,
        }))
    }

    /// `xml` with the `EncryptedAssertion` replaced by the decrypted assertion.
    pub fn splice(&self, xml: &str, plaintext: &str) -> String {
        let mut document = String::with_capacity(xml.len() + plaintext.len());
        document.push_str(&xml[..self.start]);
        document.push_str(strip_xml_declaration(plaintext));
        document.push_str(&xml[self.end..]);
        document
    }
}

/// The decrypted assertion may be serialized as a document of its own.
pub fn strip_xml_declaration(plaintext: &str) -> &str {
    let trimmed = plaintext.trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return trimmed[end + 2..].trim_start();
        }
    }
    trimmed
}

fn decryption(msg: impl Into<String>) -> CryptoError {
    CryptoError::Decryption(msg.into())
}

fn algorithm<'t>(tree: &'t XmlTree<'_>, idx: usize) -> Result<&'t str, CryptoError> {
    tree.first_child(idx, "EncryptionMethod")
        .and_then(|i| tree.attribute(i, "Algorithm"))
        .ok_or_else(|| decryption(format!("{} has no EncryptionMethod", tree.nodes[idx].local_name)))
}

fn cipher_value(tree: &XmlTree<'_>, idx: usize) -> Result<Vec<u8>, CryptoError> {
    let value = tree
        .first_child(idx, "CipherData")
        .and_then(|i| tree.first_child(i, "CipherValue"))
        .ok_or_else(|| decryption(format!("{} has no CipherValue", tree.nodes[idx].local_name)))?;
    decode_base64(&tree.nodes[value].text)
}

fn key_transport(tree: &XmlTree<'_>, encrypted_key: usize) -> Result<KeyTransport, CryptoError> {
    let uri = algorithm(tree, encrypted_key)?;
    let method = tree
        .first_child(encrypted_key, "EncryptionMethod")
        .ok_or_else(|| decryption("EncryptedKey has no EncryptionMethod"))?;

    let digest = match tree
        .first_child(method, "DigestMethod")
        .and_then(|i| tree.attribute(i, "Algorithm"))
    {
        Some(digest) => HashAlgorithm::from_digest_method(digest)
            .ok_or_else(|| CryptoError::UnsupportedAlgorithm(digest.to_string()))?,
        None => HashAlgorithm::Sha1,
    };

    match uri {
        RSA_OAEP_MGF1P => Ok(KeyTransport::RsaOaep {
            digest,
            mgf1: HashAlgorithm::Sha1,
        }),
        RSA_OAEP => {
            let mgf1 = match tree
                .first_child(method, "MGF")
                .and_then(|i| tree.attribute(i, "Algorithm"))
            {
                Some(mgf) => mgf1_digest(mgf)
                    .ok_or_else(|| CryptoError::UnsupportedAlgorithm(mgf.to_string()))?,
                None => HashAlgorithm::Sha1,
            };
            Ok(KeyTransport::RsaOaep { digest, mgf1 })
        }
        RSA_1_5 => Err(CryptoError::UnsupportedAlgorithm(
            "RSA PKCS#1 v1.5 key transport".to_string(),
        )),
        other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
    }
}

fn mgf1_digest(uri: &str) -> Option<HashAlgorithm> {
    match uri {
        "http://www.w3.org/2009/xmlenc11#mgf1sha1" => Some(HashAlgorithm::Sha1),
        "http://www.w3.org/2009/xmlenc11#mgf1sha256" => Some(HashAlgorithm::Sha256),
        "http://www.w3.org/2009/xmlenc11#mgf1sha384" => Some(HashAlgorithm::Sha384),
        "http://www.w3.org/2009/xmlenc11#mgf1sha512" => Some(HashAlgorithm::Sha512),
        _ => None,
    }
}
