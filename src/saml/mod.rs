//! SAML 2.0 Service Provider.
//!
//! Configuration normalization and validation, XML signature and encryption
//! handling, and the protocol engine for SP-initiated SSO.

pub mod certs;
pub mod config;
pub mod crypto;
pub mod error;
pub mod metadata;
pub mod normalize;
pub mod provider;
pub mod validation;
pub mod xmldsig;
pub mod xmlenc;

pub use certs::validate_cert_with_key;
pub use config::{AuthenticatorConfiguration, IdpDescriptor, IdpLabel, IdpRegistry};
pub use crypto::{OpensslBackend, SamlCrypto};
pub use error::{AssertionError, AssertionErrorKind, CertKeyMismatchError, ConfigValidationError, MetadataError};
pub use provider::{AuthnRequestRedirect, NormalizedIdentity, SamlEngine};
pub use validation::ConfigValidator;
