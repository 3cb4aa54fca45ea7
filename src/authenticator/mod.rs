//! Authenticator records and the administrative/login service around them.

pub mod service;
pub mod store;
pub mod types;

pub use service::{AuthenticatorLinks, AuthenticatorService, ServiceError};
pub use store::{AuthenticatorStore, InMemoryAuthenticatorStore};
pub use types::{
    authenticator_slug, slugify, AuthenticatorDefinition, AuthenticatorKind, AuthenticatorRecord,
};
