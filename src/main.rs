//! SAML SP Authenticator
//!
//! Standalone server exposing SAML Service Provider login, the Assertion Consumer
//! Service and SP metadata for the authenticators defined in a JSON file.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use saml_sp_authenticator::authenticator::{
    AuthenticatorDefinition, AuthenticatorService, InMemoryAuthenticatorStore, ServiceError,
};
use saml_sp_authenticator::http::{router, AppState};
use saml_sp_authenticator::saml::{OpensslBackend, SamlEngine};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "saml-sp-authenticator")]
#[command(about = "SAML 2.0 Service Provider authenticator")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080", env = "SAML_LISTEN")]
    listen: SocketAddr,

    /// JSON file with a list of authenticator definitions
    #[arg(long, env = "SAML_AUTHENTICATORS")]
    authenticators: Option<PathBuf>,

    /// Public base URL of the gateway, used to derive callback URLs
    #[arg(long, default_value = "http://localhost:8080", env = "SAML_BASE_URL")]
    base_url: String,

    /// Enable verbose logging
    #[arg(short, long, env = "SAML_VERBOSE")]
    verbose: bool,
}

fn read_definitions(path: &Path) -> Result<Vec<AuthenticatorDefinition>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read authenticators file: {:?}", path))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse authenticators file: {:?}", path))
}

async fn load_authenticators(service: &AuthenticatorService, path: &Path) -> Result<usize> {
    let mut loaded = 0;
    for definition in read_definitions(path)? {
        let name = definition.name.clone();
        match service.create(definition).await {
            Ok(record) => {
                info!(id = record.id, slug = %record.slug, "Loaded authenticator");
                loaded += 1;
            }
            Err(ServiceError::Validation(errors)) => {
                warn!(name = %name, errors = ?errors.errors, "Skipping invalid authenticator");
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to load authenticator {}", name)),
        }
    }
    Ok(loaded)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    info!("Starting SAML SP authenticator");

    let store = Arc::new(InMemoryAuthenticatorStore::new());
    let engine = SamlEngine::new(Arc::new(OpensslBackend));
    let service = Arc::new(AuthenticatorService::new(store, engine, args.base_url.clone()));

    if let Some(ref path) = args.authenticators {
        let loaded = load_authenticators(&service, path).await?;
        info!(loaded, path = ?path, "Authenticators loaded");
    } else {
        warn!("No authenticators file given, serving an empty registry");
    }

    let app = router(AppState { service });
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;

    info!(listen = %args.listen, base_url = %args.base_url, "Serving");
    axum::serve(listener, app.into_make_service())
        .await
        .context("Server error")?;

    Ok(())
}
