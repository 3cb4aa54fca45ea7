//! SAML 2.0 Service Provider authenticator.
//!
//! Validates and stores SP configurations, issues AuthnRequests, consumes IdP
//! Responses into normalized identities and serves SP metadata.

pub mod authenticator;
pub mod http;
pub mod saml;

#[cfg(test)]
pub(crate) mod test_support;
