//! Administrative and login operations over stored authenticators.

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::store::AuthenticatorStore;
use super::types::{authenticator_slug, AuthenticatorDefinition, AuthenticatorRecord};
use crate::saml::config::{AuthenticatorConfiguration, IdpLabel, ENCRYPTED_SENTINEL};
use crate::saml::error::{AssertionError, ConfigValidationError, MetadataError, RequestError};
use crate::saml::normalize::{self, ENABLED_IDPS};
use crate::saml::provider::{
    build_callback_url, build_login_url, AuthnRequestRedirect, NormalizedIdentity, SamlEngine,
};
use crate::saml::validation::{resolve_private_key, resolve_public_cert, ConfigValidator};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("authenticator not found")]
    NotFound,

    #[error("authenticator {0} is disabled")]
    Disabled(u64),

    #[error("authenticator {0} is not a SAML authenticator")]
    NotSaml(u64),

    #[error(transparent)]
    Validation(#[from] ConfigValidationError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Assertion(#[from] AssertionError),

    #[error("cannot build URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("stored configuration is unreadable: {0}")]
    Configuration(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Where a SAML authenticator is reached from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticatorLinks {
    /// Starts a login with the default IdP.
    pub login_url: String,
    pub metadata: String,
}

pub struct AuthenticatorService {
    store: Arc<dyn AuthenticatorStore>,
    engine: SamlEngine,
    /// Public base URL of the gateway, used to derive callback URLs.
    base_url: String,
}

impl AuthenticatorService {
    pub fn new(store: Arc<dyn AuthenticatorStore>, engine: SamlEngine, base_url: impl Into<String>) -> Self {
        Self {
            store,
            engine,
            base_url: base_url.into(),
        }
    }

    pub fn engine(&self) -> &SamlEngine {
        &self.engine
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get(&self, id: u64) -> Result<Option<AuthenticatorRecord>, ServiceError> {
        if id == 0 {
            return Ok(None);
        }
        Ok(self.store.get(id).await?)
    }

    /// Create an authenticator from flat administrative settings.
    pub async fn create(&self, definition: AuthenticatorDefinition) -> Result<AuthenticatorRecord, ServiceError> {
        let slug = authenticator_slug(&definition.kind, &definition.name);
        let configuration = if definition.kind.is_saml() {
            self.prepare_saml(&slug, &definition.configuration, None)?
        } else {
            definition.configuration
        };

        let record = AuthenticatorRecord {
            id: self.store.allocate_id().await?,
            name: definition.name,
            slug,
            kind: definition.kind,
            enabled: definition.enabled,
            configuration,
        };
        self.store.put(record.clone()).await?;

        info!(id = record.id, slug = %record.slug, kind = %record.kind, "Authenticator created");
        Ok(record)
    }

    /// Replace the configuration of an existing authenticator.
    ///
    /// A rejected update leaves the stored record untouched.
    pub async fn update(&self, id: u64, flat: &Map<String, Value>) -> Result<AuthenticatorRecord, ServiceError> {
        let mut record = self.get(id).await?.ok_or(ServiceError::NotFound)?;

        record.configuration = if record.kind.is_saml() {
            let existing = AuthenticatorConfiguration::from_internal(Value::Object(record.configuration.clone()))?;
            self.prepare_saml(&record.slug, flat, Some(&existing))?
        } else {
            flat.clone()
        };
        self.store.put(record.clone()).await?;

        info!(id = record.id, slug = %record.slug, "Authenticator updated");
        Ok(record)
    }

    /// Flat administrative view; the private key is masked.
    pub async fn settings(&self, id: u64) -> Result<Map<String, Value>, ServiceError> {
        let record = self.get(id).await?.ok_or(ServiceError::NotFound)?;
        if !record.kind.is_saml() {
            return Ok(record.configuration);
        }

        let mut flat = normalize::to_external(&record.configuration);
        if flat.contains_key("SP_PRIVATE_KEY") {
            flat.insert("SP_PRIVATE_KEY".to_string(), Value::String(ENCRYPTED_SENTINEL.to_string()));
        }
        Ok(flat)
    }

    pub async fn links(&self, id: u64) -> Result<AuthenticatorLinks, ServiceError> {
        let record = self.get(id).await?.ok_or(ServiceError::NotFound)?;
        if !record.kind.is_saml() {
            return Err(ServiceError::NotSaml(record.id));
        }
        Ok(AuthenticatorLinks {
            login_url: build_login_url(&self.base_url, &record.slug, &IdpLabel::default())?.into(),
            metadata: format!("/authenticators/{}/metadata/", record.id),
        })
    }

    /// Normalize, derive the callback URL, validate and resolve secrets.
    fn prepare_saml(
        &self,
        slug: &str,
        flat: &Map<String, Value>,
        existing: Option<&AuthenticatorConfiguration>,
    ) -> Result<Map<String, Value>, ServiceError> {
        let mut flat = flat.clone();

        // Labels other than the flat-managed one survive an update.
        if let (false, Some(existing)) = (flat.contains_key(ENABLED_IDPS), existing) {
            let registry = serde_json::to_value(&existing.enabled_idps)?;
            flat.insert(ENABLED_IDPS.to_string(), registry);
        }

        let mut internal = normalize::to_internal(&flat);

        if matches!(internal.get("CALLBACK_URL"), None | Some(Value::Null)) {
            let callback = match existing.and_then(|c| c.callback_url.clone()) {
                Some(url) => url,
                None => build_callback_url(&self.base_url, slug)
                    .map(String::from)
                    .map_err(|e| {
                        let mut errors = ConfigValidationError::new();
                        errors.add("CALLBACK_URL", format!("Unable to derive callback URL: {}", e));
                        errors
                    })?,
            };
            internal.insert("CALLBACK_URL".to_string(), Value::String(callback));
        }

        ConfigValidator::new(self.engine.crypto()).validate(&internal, existing)?;

        if let Some(key) = resolve_private_key(internal.get("SP_PRIVATE_KEY"), existing) {
            internal.insert("SP_PRIVATE_KEY".to_string(), Value::String(key));
        }
        if let Some(cert) = resolve_public_cert(internal.get("SP_PUBLIC_CERT"), existing) {
            internal.insert("SP_PUBLIC_CERT".to_string(), Value::String(cert));
        }

        let typed = AuthenticatorConfiguration::from_internal(Value::Object(internal))?;
        debug!(slug = %slug, idps = typed.enabled_idps.len(), "SAML configuration accepted");
        Ok(typed.to_internal())
    }

    async fn saml_by_slug(&self, slug: &str) -> Result<(AuthenticatorRecord, AuthenticatorConfiguration), ServiceError> {
        let record = self.store.get_by_slug(slug).await?.ok_or(ServiceError::NotFound)?;
        if !record.kind.is_saml() {
            return Err(ServiceError::NotSaml(record.id));
        }
        if !record.enabled {
            return Err(ServiceError::Disabled(record.id));
        }
        let config = AuthenticatorConfiguration::from_internal(Value::Object(record.configuration.clone()))?;
        Ok((record, config))
    }

    /// Start a login: AuthnRequest redirect for the IdP `idp`. The label travels as RelayState.
    pub async fn login_redirect(&self, slug: &str, idp: &IdpLabel) -> Result<AuthnRequestRedirect, ServiceError> {
        let (record, config) = self.saml_by_slug(slug).await?;
        let redirect = self.engine.issue_authn_request(&config, idp, Some(idp.as_str()))?;
        debug!(id = record.id, idp = %idp, "Redirecting to IdP");
        Ok(redirect)
    }

    /// Finish a login from the ACS POST.
    pub async fn complete_login(
        &self,
        slug: &str,
        saml_response: &str,
        relay_state: Option<&str>,
    ) -> Result<NormalizedIdentity, ServiceError> {
        let (record, config) = self.saml_by_slug(slug).await?;
        let idp = relay_state
            .filter(|s| !s.is_empty())
            .map(IdpLabel::from)
            .unwrap_or_default();

        self.engine
            .consume_response(&config, &idp, saml_response, &[])
            .map_err(|e| {
                warn!(
                    authenticator_id = record.id,
                    kind = %e.kind,
                    detail = %e.detail,
                    "SAML login failed"
                );
                ServiceError::Assertion(e)
            })
    }

    /// Metadata for a SAML record.
    pub fn metadata(&self, record: &AuthenticatorRecord) -> Result<String, MetadataError> {
        let config = AuthenticatorConfiguration::from_internal(Value::Object(record.configuration.clone()))
            .map_err(|e| MetadataError(format!("Invalid SP configuration: {}", e)))?;
        self.engine.generate_metadata_document(&config)
    }
}
