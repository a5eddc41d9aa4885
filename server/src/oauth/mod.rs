//! OAuth 2.0 broker for cloud storage providers.
//!
//! The broker is stateless: all cross-hop state (PKCE verifier, provider,
//! client redirect URI) rides in the signed state token, and tokens are
//! passed through to the client without being persisted.

pub mod providers;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::config::AppConfig;
use crate::error::{Error, Result, ValidationDetail};
use crate::models::TokenSet;
use crate::security::{
    self, code_challenge, SignedStatePayload, StateCodec, DEFAULT_STATE_MAX_AGE,
};
use providers::{ProviderConfig, RevocationStyle};

/// App-scheme fallback used when a callback arrives with an unusable state.
const CALLBACK_FALLBACK: &str = "apuntador://oauth-callback";
const UPSTREAM_TIMEOUT_SECS: u64 = 10;

pub struct OAuthService {
    config: Arc<AppConfig>,
    codec: StateCodec,
    http: reqwest::Client,
}

impl OAuthService {
    pub fn new(config: Arc<AppConfig>) -> Self {
        let codec = StateCodec::new(&config.secret_key);
        Self {
            config,
            codec,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    fn resolve(&self, provider: &str) -> Result<ProviderConfig> {
        providers::provider_for(provider, &self.config)
    }

    /// Builds the provider authorization URL with PKCE and a signed state
    /// carrying the verifier for the later exchange.
    pub fn authorize(
        &self,
        provider: &str,
        code_verifier: &str,
        redirect_uri: &str,
        client_state: Option<String>,
    ) -> Result<(String, String)> {
        let provider = self.resolve(provider)?;
        self.authorize_with(&provider, code_verifier, redirect_uri, client_state)
    }

    pub fn authorize_with(
        &self,
        provider: &ProviderConfig,
        code_verifier: &str,
        redirect_uri: &str,
        client_state: Option<String>,
    ) -> Result<(String, String)> {
        info!("Starting OAuth authorization flow for provider: {}", provider.name);

        let challenge = code_challenge(code_verifier);
        let state = client_state.unwrap_or_else(security::generate_state);
        let signed_state = self.codec.sign(&SignedStatePayload {
            state,
            code_verifier: code_verifier.to_string(),
            provider: provider.name.to_string(),
            redirect_uri: redirect_uri.to_string(),
        })?;

        let mut url = Url::parse(&provider.auth_url)
            .map_err(|e| Error::Internal(format!("authorization URL: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &provider.client_id);
            query.append_pair("response_type", "code");
            query.append_pair("redirect_uri", redirect_uri);
            query.append_pair("scope", &provider.scope_string());
            query.append_pair("code_challenge", &challenge);
            query.append_pair("code_challenge_method", "S256");
            query.append_pair("state", &signed_state);
            for (key, value) in provider.extra_authorize_params {
                query.append_pair(key, value);
            }
        }

        info!("Authorization URL generated for {}", provider.name);
        Ok((url.into(), signed_state))
    }

    /// Computes the redirect target for the provider callback. The broker
    /// does not exchange the code; it hands it back to the originating
    /// client together with the still-valid signed state.
    pub fn callback_redirect(&self, provider: &str, code: &str, signed_state: &str) -> String {
        let Some(payload) = self
            .codec
            .verify::<SignedStatePayload>(signed_state, DEFAULT_STATE_MAX_AGE)
        else {
            warn!("Invalid state received in OAuth callback for {provider}");
            return format!("{CALLBACK_FALLBACK}?error=invalid_state&provider={provider}");
        };

        if payload.provider != provider {
            warn!(
                "Provider mismatch in OAuth callback: expected {provider}, got {}",
                payload.provider
            );
            return format!(
                "{}?error=provider_mismatch&provider={provider}",
                payload.redirect_uri
            );
        }

        info!("State verified, redirecting to {}", payload.redirect_uri);
        format!(
            "{}?code={}&state={}&provider={}",
            payload.redirect_uri,
            urlencoding::encode(code),
            urlencoding::encode(signed_state),
            provider
        )
    }

    pub async fn exchange(
        &self,
        provider: &str,
        code: &str,
        code_verifier: &str,
        signed_state: Option<&str>,
    ) -> Result<TokenSet> {
        let provider = self.resolve(provider)?;
        self.exchange_with(&provider, code, code_verifier, signed_state)
            .await
    }

    /// Exchanges an authorization code for tokens. When a signed state is
    /// supplied it binds the exchange to the original authorize step:
    /// the embedded verifier must match and the redirect URI is taken
    /// from it.
    pub async fn exchange_with(
        &self,
        provider: &ProviderConfig,
        code: &str,
        code_verifier: &str,
        signed_state: Option<&str>,
    ) -> Result<TokenSet> {
        info!("Exchanging authorization code with provider: {}", provider.name);

        let mut redirect_uri = provider.redirect_uri.clone();
        if let Some(token) = signed_state {
            let payload = self
                .codec
                .verify::<SignedStatePayload>(token, DEFAULT_STATE_MAX_AGE)
                .ok_or(Error::StateInvalid)?;
            if payload.code_verifier != code_verifier {
                warn!("Code verifier mismatch in token exchange");
                return Err(Error::CodeVerifierMismatch);
            }
            redirect_uri = payload.redirect_uri;
        }

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("code_verifier", code_verifier.to_string()),
            ("client_id", provider.client_id.clone()),
            ("redirect_uri", redirect_uri),
        ];
        // PKCE-only providers send the secret only when one is configured.
        if provider.requires_client_secret || !provider.client_secret.is_empty() {
            form.push(("client_secret", provider.client_secret.clone()));
        }

        self.token_request(provider, &form).await
    }

    pub async fn refresh(&self, provider: &str, refresh_token: &str) -> Result<TokenSet> {
        let provider = self.resolve(provider)?;
        self.refresh_with(&provider, refresh_token).await
    }

    pub async fn refresh_with(
        &self,
        provider: &ProviderConfig,
        refresh_token: &str,
    ) -> Result<TokenSet> {
        info!("Refreshing access token with provider: {}", provider.name);
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", provider.client_id.clone()),
        ];
        if provider.requires_client_secret || !provider.client_secret.is_empty() {
            form.push(("client_secret", provider.client_secret.clone()));
        }
        self.token_request(provider, &form).await
    }

    pub async fn revoke(&self, provider: &str, token: &str) -> Result<bool> {
        let provider = self.resolve(provider)?;
        self.revoke_with(&provider, token).await
    }

    pub async fn revoke_with(&self, provider: &ProviderConfig, token: &str) -> Result<bool> {
        let Some(revoke_url) = &provider.revoke_url else {
            warn!("{} has no revocation endpoint", provider.name);
            return Ok(false);
        };
        let request = match provider.revocation_style {
            RevocationStyle::QueryParam => self.http.post(revoke_url).query(&[("token", token)]),
            RevocationStyle::Bearer => self.http.post(revoke_url).bearer_auth(token),
        };
        let response = request
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("{}: {e}", provider.name)))?;
        let success = response.status().is_success();
        info!(
            "Token revocation {} with {}",
            if success { "successful" } else { "failed" },
            provider.name
        );
        Ok(success)
    }

    async fn token_request(
        &self,
        provider: &ProviderConfig,
        form: &[(&str, String)],
    ) -> Result<TokenSet> {
        let response = self
            .http
            .post(&provider.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("{}: {e}", provider.name)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("{} token endpoint returned {status}: {body}", provider.name);
            return Err(Error::ProviderRejected {
                status: status.as_u16(),
                body,
            });
        }

        response.json::<TokenSet>().await.map_err(|e| {
            Error::UpstreamUnavailable(format!(
                "invalid token response from {}: {e}",
                provider.name
            ))
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct OAuthAuthorizeRequest {
    pub code_verifier: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OAuthAuthorizeResponse {
    pub authorization_url: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct OAuthTokenRequest {
    pub code: String,
    pub code_verifier: String,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OAuthRefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct OAuthRevokeRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct OAuthRevokeResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

fn validate_code_verifier(code_verifier: &str) -> Result<()> {
    if (43..=128).contains(&code_verifier.len()) {
        return Ok(());
    }
    Err(Error::ValidationFailed(vec![ValidationDetail {
        kind: "value_error".to_string(),
        loc: vec!["body".to_string(), "code_verifier".to_string()],
        msg: "code_verifier must be 43-128 characters".to_string(),
        input: serde_json::json!(code_verifier.len()),
        ctx: None,
    }]))
}

/// HTTP handlers for the OAuth endpoints.
pub mod endpoints {
    use axum::{
        extract::{Path, Query, State},
        http::{header, StatusCode},
        response::{IntoResponse, Response},
        Json,
    };

    use super::*;
    use crate::AppState;

    pub async fn authorize(
        State(state): State<AppState>,
        Path(provider): Path<String>,
        Json(request): Json<OAuthAuthorizeRequest>,
    ) -> Result<Json<OAuthAuthorizeResponse>> {
        validate_code_verifier(&request.code_verifier)?;
        let (authorization_url, signed_state) = state.oauth.authorize(
            &provider,
            &request.code_verifier,
            &request.redirect_uri,
            request.state,
        )?;
        Ok(Json(OAuthAuthorizeResponse {
            authorization_url,
            state: signed_state,
        }))
    }

    pub async fn callback(
        State(state): State<AppState>,
        Path(provider): Path<String>,
        Query(params): Query<CallbackParams>,
    ) -> Response {
        let location = state
            .oauth
            .callback_redirect(&provider, &params.code, &params.state);
        (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
    }

    pub async fn token(
        State(state): State<AppState>,
        Path(provider): Path<String>,
        Json(request): Json<OAuthTokenRequest>,
    ) -> Result<Json<TokenSet>> {
        let tokens = state
            .oauth
            .exchange(
                &provider,
                &request.code,
                &request.code_verifier,
                request.state.as_deref(),
            )
            .await?;
        Ok(Json(tokens))
    }

    pub async fn refresh(
        State(state): State<AppState>,
        Path(provider): Path<String>,
        Json(request): Json<OAuthRefreshRequest>,
    ) -> Result<Json<TokenSet>> {
        let tokens = state.oauth.refresh(&provider, &request.refresh_token).await?;
        Ok(Json(tokens))
    }

    pub async fn revoke(
        State(state): State<AppState>,
        Path(provider): Path<String>,
        Json(request): Json<OAuthRevokeRequest>,
    ) -> Result<Json<OAuthRevokeResponse>> {
        let success = state.oauth.revoke(&provider, &request.token).await?;
        Ok(Json(OAuthRevokeResponse {
            success,
            message: if success {
                "Token revoked successfully".to_string()
            } else {
                "Failed to revoke token".to_string()
            },
        }))
    }
}
