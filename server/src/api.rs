//! Health and configuration endpoints, plus router assembly.

use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::oauth::providers;
use crate::{attestation, device, mtls, oauth, AppState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "apuntador-server",
        version: state.config.project_version.clone(),
        timestamp: Utc::now(),
    })
}

/// Enabled cloud providers, guarded by the `X-API-Key` header.
pub async fn get_providers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            warn!("Configuration request missing X-API-Key header");
            Error::ApiKeyMissing
        })?;
    if api_key != state.config.secret_key {
        warn!("Configuration request with invalid API key");
        return Err(Error::ApiKeyInvalid);
    }

    let providers: serde_json::Map<String, serde_json::Value> =
        providers::provider_status(&state.config)
            .into_iter()
            .map(|(name, enabled)| {
                (
                    name.to_string(),
                    serde_json::json!({ "enabled": enabled, "requires_mtls": true }),
                )
            })
            .collect();

    Ok(Json(serde_json::json!({
        "providers": providers,
        "version": state.config.project_version,
        "cache_ttl": 3600,
    })))
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins()
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let methods: Vec<Method> = config
        .cors_allowed_methods()
        .iter()
        .filter_map(|method| method.parse().ok())
        .collect();
    let headers: Vec<HeaderName> = config
        .cors_allowed_headers()
        .iter()
        .filter_map(|header| header.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
}

/// Builds the full application router. The mTLS middleware wraps every
/// route; its own exempt-path table decides which requests pass without
/// a client certificate.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/health/public", get(health))
        // OAuth broker (browser-based, no mTLS)
        .route("/oauth/authorize/:provider", post(oauth::endpoints::authorize))
        .route("/oauth/callback/:provider", get(oauth::endpoints::callback))
        .route("/oauth/token/:provider", post(oauth::endpoints::token))
        .route("/oauth/refresh/:provider", post(oauth::endpoints::refresh))
        .route("/oauth/revoke/:provider", post(oauth::endpoints::revoke))
        // Device lifecycle
        .route("/device/enroll", post(device::endpoints::enroll))
        .route("/device/renew", post(device::endpoints::renew))
        .route("/device/revoke", post(device::endpoints::revoke))
        .route("/device/status/:device_id", get(device::endpoints::status))
        .route("/device/ca-certificate", get(device::endpoints::ca_certificate))
        .route(
            "/device/ca-certificate-pin",
            get(device::endpoints::ca_certificate_pin),
        )
        // Attestation (pre-enrollment, no cert yet)
        .route(
            "/device/attest/android",
            post(attestation::endpoints::verify_android),
        )
        .route("/device/attest/ios", post(attestation::endpoints::verify_ios))
        .route(
            "/device/attest/desktop",
            post(attestation::endpoints::verify_desktop),
        )
        .route(
            "/device/attest/clear-cache",
            post(attestation::endpoints::clear_cache),
        )
        // Client configuration
        .route("/config/providers", get(get_providers))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            mtls::mtls_validation,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
