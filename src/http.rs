//! HTTP surface: SP metadata and links, login initiation and the Assertion
//! Consumer Service.

use axum::extract::{Form, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error};

use crate::authenticator::{AuthenticatorService, ServiceError};
use crate::saml::config::IdpLabel;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AuthenticatorService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/authenticators/:id/metadata/", get(metadata))
        .route("/authenticators/:id/links/", get(links))
        .route("/login/:slug", get(login))
        .route("/complete/:slug", post(complete))
        .with_state(state)
}

fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

/// Map a service failure onto a status code. Assertion failures get a generic body.
fn error_response(err: ServiceError) -> Response {
    match err {
        ServiceError::NotFound | ServiceError::NotSaml(_) | ServiceError::Disabled(_) => not_found(),
        ServiceError::Assertion(_) => (StatusCode::UNAUTHORIZED, "Authentication failed").into_response(),
        ServiceError::Request(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        ServiceError::Validation(e) => (StatusCode::BAD_REQUEST, Json(e.errors)).into_response(),
        other => {
            error!(error = %other, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Positive integer path ids; anything else is treated as unknown.
fn parse_id(id: &str) -> Option<u64> {
    match id.parse::<i64>() {
        Ok(id) if id > 0 => Some(id as u64),
        _ => None,
    }
}

/// `GET /authenticators/{id}/metadata/`
async fn metadata(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(id) = parse_id(&id) else {
        return not_found();
    };

    let record = match state.service.get(id).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(),
        Err(e) => return error_response(e),
    };

    if !record.kind.is_saml() {
        debug!(id, kind = %record.kind, "Metadata requested for non-SAML authenticator");
        return not_found();
    }

    match state.service.metadata(&record) {
        Ok(xml) => ([(header::CONTENT_TYPE, "text/xml")], xml).into_response(),
        Err(e) => ([(header::CONTENT_TYPE, "text/plain")], e.to_string()).into_response(),
    }
}

/// `GET /authenticators/{id}/links/`
async fn links(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(id) = parse_id(&id) else {
        return not_found();
    };
    match state.service.links(id).await {
        Ok(links) => Json(links).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct LoginParams {
    idp: Option<String>,
}

/// `GET /login/{slug}?idp=IdP`
async fn login(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(params): Query<LoginParams>,
) -> Response {
    let idp = params
        .idp
        .filter(|s| !s.is_empty())
        .map(IdpLabel::new)
        .unwrap_or_default();

    match state.service.login_redirect(&slug, &idp).await {
        Ok(redirect) => (StatusCode::FOUND, [(header::LOCATION, redirect.redirect_url)]).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct AcsForm {
    #[serde(rename = "SAMLResponse")]
    saml_response: String,
    #[serde(rename = "RelayState")]
    relay_state: Option<String>,
}

/// `POST /complete/{slug}`
async fn complete(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Form(form): Form<AcsForm>,
) -> Response {
    match state
        .service
        .complete_login(&slug, &form.saml_response, form.relay_state.as_deref())
        .await
    {
        Ok(identity) => Json(identity).into_response(),
        Err(e) => error_response(e),
    }
}
