//! Cryptographic capability used by configuration validation and the protocol engine.
//!
//! Everything that touches keys, certificates or signatures goes through
//! [`SamlCrypto`], so the backing library can be replaced without changing the
//! configuration or protocol code.

use openssl::encrypt::Decrypter;
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Padding;
use openssl::sign::{Signer, Verifier};
use openssl::symm::{decrypt_aead, Cipher, Crypter, Mode};
use openssl::x509::X509;
use tracing::debug;

use super::certs::decode_certificate;
use super::error::CryptoError;
use super::metadata::{render_sp_metadata, SpMetadata};
use super::xmldsig::{self, HashAlgorithm};
use super::xmlenc::{BlockCipher, EncryptedData, KeyTransport};

const AES_BLOCK: usize = 16;
const GCM_IV: usize = 12;
const GCM_TAG: usize = 16;

/// An element whose enveloped signature verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedElement {
    /// Local name, e.g. `Response` or `Assertion`.
    pub name: String,
    pub id: String,
    /// Ancestors of the element in the verified document.
    pub depth: usize,
    pub signature_method: HashAlgorithm,
    pub digest_method: HashAlgorithm,
}

pub trait SamlCrypto: Send + Sync {
    /// Succeeds when the private key belongs to the certificate.
    fn verify_key_pair(&self, cert: &str, private_key: &str) -> Result<(), CryptoError>;

    /// Verify every enveloped signature in `xml` against `cert`.
    ///
    /// Returns the signed elements; an unsigned document yields an empty list.
    /// Any signature that is present but does not verify is an error.
    fn verify_signature(&self, xml: &str, cert: &str) -> Result<Vec<SignedElement>, CryptoError>;

    /// Sign raw bytes (HTTP-Redirect binding) with an RSA private key.
    fn sign(
        &self,
        data: &[u8],
        private_key: &str,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Render SP metadata, embedding the SP certificate for signing and encryption.
    fn build_metadata(&self, sp: &SpMetadata<'_>) -> Result<String, CryptoError>;

    /// Unwrap the content key with the SP private key and decrypt the content.
    fn decrypt(&self, data: &EncryptedData, private_key: &str) -> Result<Vec<u8>, CryptoError>;
}

/// [`SamlCrypto`] on top of OpenSSL.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpensslBackend;

impl OpensslBackend {
    fn load_certificate(cert: &str) -> Result<X509, CryptoError> {
        let der = decode_certificate(cert)?;
        X509::from_der(&der).map_err(|e| CryptoError::Certificate(e.to_string()))
    }

    fn load_public_key(cert: &X509) -> Result<PKey<Public>, CryptoError> {
        cert.public_key()
            .map_err(|e| CryptoError::Certificate(format!("unusable public key: {}", e)))
    }

    fn load_private_key(private_key: &str) -> Result<PKey<Private>, CryptoError> {
        PKey::private_key_from_pem(private_key.trim().as_bytes())
            .map_err(|e| CryptoError::PrivateKey(e.to_string()))
    }
}

fn decryption(e: impl std::fmt::Display) -> CryptoError {
    CryptoError::Decryption(e.to_string())
}

fn symmetric_cipher(cipher: BlockCipher) -> Cipher {
    match cipher {
        BlockCipher::Aes128Cbc => Cipher::aes_128_cbc(),
        BlockCipher::Aes192Cbc => Cipher::aes_192_cbc(),
        BlockCipher::Aes256Cbc => Cipher::aes_256_cbc(),
        BlockCipher::Aes128Gcm => Cipher::aes_128_gcm(),
        BlockCipher::Aes192Gcm => Cipher::aes_192_gcm(),
        BlockCipher::Aes256Gcm => Cipher::aes_256_gcm(),
    }
}

/// `IV || ciphertext || tag`
fn decrypt_gcm(cipher: BlockCipher, key: &[u8], value: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if value.len() < GCM_IV + GCM_TAG {
        return Err(decryption("ciphertext too short"));
    }
    let (iv, rest) = value.split_at(GCM_IV);
    let (data, tag) = rest.split_at(rest.len() - GCM_TAG);
    decrypt_aead(symmetric_cipher(cipher), key, Some(iv), &[], data, tag).map_err(decryption)
}

/// `IV || ciphertext`. XML Encryption padding only defines the final byte (the
/// pad length), so OpenSSL's PKCS#7 check is turned off.
fn decrypt_cbc(cipher: BlockCipher, key: &[u8], value: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if value.len() < 2 * AES_BLOCK || value.len() % AES_BLOCK != 0 {
        return Err(decryption("ciphertext is not a whole number of blocks"));
    }
    let (iv, data) = value.split_at(AES_BLOCK);
    let mut crypter =
        Crypter::new(symmetric_cipher(cipher), Mode::Decrypt, key, Some(iv)).map_err(decryption)?;
    crypter.pad(false);

    let mut plaintext = vec![0; data.len() + AES_BLOCK];
    let mut len = crypter.update(data, &mut plaintext).map_err(decryption)?;
    len += crypter.finalize(&mut plaintext[len..]).map_err(decryption)?;
    plaintext.truncate(len);

    let pad = plaintext.last().copied().map(usize::from).unwrap_or(0);
    if pad == 0 || pad > AES_BLOCK || pad > plaintext.len() {
        return Err(decryption("invalid padding"));
    }
    plaintext.truncate(plaintext.len() - pad);
    Ok(plaintext)
}

fn message_digest(algorithm: HashAlgorithm) -> MessageDigest {
    match algorithm {
        HashAlgorithm::Sha1 => MessageDigest::sha1(),
        HashAlgorithm::Sha256 => MessageDigest::sha256(),
        HashAlgorithm::Sha384 => MessageDigest::sha384(),
        HashAlgorithm::Sha512 => MessageDigest::sha512(),
    }
}

impl SamlCrypto for OpensslBackend {
    fn verify_key_pair(&self, cert: &str, private_key: &str) -> Result<(), CryptoError> {
        let cert = Self::load_certificate(cert)?;
        let public_key = Self::load_public_key(&cert)?;
        let private_key = Self::load_private_key(private_key)?;

        if public_key.public_eq(&private_key) {
            Ok(())
        } else {
            Err(CryptoError::KeyMismatch)
        }
    }

    fn verify_signature(&self, xml: &str, cert: &str) -> Result<Vec<SignedElement>, CryptoError> {
        let cert = Self::load_certificate(cert)?;
        let public_key = Self::load_public_key(&cert)?;
        let scan = xmldsig::scan(xml)?;

        let mut verified = Vec::with_capacity(scan.signatures.len());
        for sig in &scan.signatures {
            // The reference must cover the element enveloping the signature.
            if sig.reference_uri != format!("#{}", sig.element_id) {
                return Err(CryptoError::MalformedSignature(format!(
                    "reference {} does not point at enclosing {} element",
                    sig.reference_uri, sig.element_name
                )));
            }

            let digest = hash(message_digest(sig.digest_method), &sig.canonical_element)
                .map_err(|e| CryptoError::MalformedSignature(format!("digest failed: {}", e)))?;
            if &*digest != sig.digest_value.as_slice() {
                return Err(CryptoError::DigestMismatch(sig.element_id.clone()));
            }

            let mut verifier = Verifier::new(message_digest(sig.signature_method), &public_key)
                .map_err(|e| CryptoError::BadSignature(format!("{}: {}", sig.element_id, e)))?;
            verifier
                .update(&sig.canonical_signed_info)
                .map_err(|e| CryptoError::BadSignature(format!("{}: {}", sig.element_id, e)))?;
            if !verifier.verify(&sig.signature_value).unwrap_or(false) {
                return Err(CryptoError::BadSignature(sig.element_id.clone()));
            }

            debug!(element = %sig.element_name, id = %sig.element_id, "XML signature verified");
            verified.push(SignedElement {
                name: sig.element_name.clone(),
                id: sig.element_id.clone(),
                depth: sig.depth,
                signature_method: sig.signature_method,
                digest_method: sig.digest_method,
            });
        }

        Ok(verified)
    }

    fn sign(
        &self,
        data: &[u8],
        private_key: &str,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<u8>, CryptoError> {
        let key = Self::load_private_key(private_key)?;
        let mut signer = Signer::new(message_digest(algorithm), &key)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        signer
            .update(data)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        signer
            .sign_to_vec()
            .map_err(|e| CryptoError::Signing(e.to_string()))
    }

    fn build_metadata(&self, sp: &SpMetadata<'_>) -> Result<String, CryptoError> {
        let cert = Self::load_certificate(sp.certificate)?;
        let der = cert
            .to_der()
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        Ok(render_sp_metadata(sp, &der))
    }

    fn decrypt(&self, data: &EncryptedData, private_key: &str) -> Result<Vec<u8>, CryptoError> {
        let key = Self::load_private_key(private_key)?;
        let KeyTransport::RsaOaep { digest, mgf1 } = data.key_transport;

        let mut decrypter = Decrypter::new(&key).map_err(decryption)?;
        decrypter
            .set_rsa_padding(Padding::PKCS1_OAEP)
            .map_err(decryption)?;
        decrypter
            .set_rsa_oaep_md(message_digest(digest))
            .map_err(decryption)?;
        decrypter
            .set_rsa_mgf1_md(message_digest(mgf1))
            .map_err(decryption)?;

        let mut content_key = vec![0; decrypter.decrypt_len(&data.encrypted_key).map_err(decryption)?];
        let len = decrypter
            .decrypt(&data.encrypted_key, &mut content_key)
            .map_err(|_| decryption("content key does not unwrap with the SP private key"))?;
        content_key.truncate(len);
        if content_key.len() != data.cipher.key_len() {
            return Err(decryption(format!(
                "content key is {} bytes, {} expects {}",
                content_key.len(),
                data.cipher.uri(),
                data.cipher.key_len()
            )));
        }

        let plaintext = if data.cipher.is_gcm() {
            decrypt_gcm(data.cipher, &content_key, &data.cipher_value)?
        } else {
            decrypt_cbc(data.cipher, &content_key, &data.cipher_value)?
        };
        debug!(cipher = data.cipher.uri(), bytes = plaintext.len(), "Decrypted EncryptedData");
        Ok(plaintext)
    }
}
