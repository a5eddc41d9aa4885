//! OAuth provider registry.
//!
//! Providers form a closed set; each entry carries its endpoints,
//! requested scopes and credentials. PKCE-only providers omit the client
//! secret at the token endpoint.

use crate::config::AppConfig;
use crate::error::{Error, Result};

pub const GOOGLEDRIVE: &str = "googledrive";
pub const DROPBOX: &str = "dropbox";
pub const ONEDRIVE: &str = "onedrive";

pub const PROVIDER_NAMES: &[&str] = &[GOOGLEDRIVE, DROPBOX, ONEDRIVE];

/// How a provider expects token revocation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationStyle {
    /// Token passed as a query parameter (Google).
    QueryParam,
    /// Token sent as the bearer credential (Dropbox).
    Bearer,
}

/// Static description plus deployment credentials for one provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: &'static str,
    pub auth_url: String,
    pub token_url: String,
    /// None when the provider has no revocation endpoint.
    pub revoke_url: Option<String>,
    pub scopes: &'static [&'static str],
    /// Provider-specific additions to the authorize URL.
    pub extra_authorize_params: &'static [(&'static str, &'static str)],
    /// Whether the token endpoint wants the client secret.
    pub requires_client_secret: bool,
    pub revocation_style: RevocationStyle,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl ProviderConfig {
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    pub fn enabled(&self) -> bool {
        !self.client_id.is_empty()
    }
}

/// Resolves a provider by name against the configured credentials.
pub fn provider_for(name: &str, config: &AppConfig) -> Result<ProviderConfig> {
    match name {
        GOOGLEDRIVE => Ok(ProviderConfig {
            name: GOOGLEDRIVE,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            revoke_url: Some("https://oauth2.googleapis.com/revoke".to_string()),
            scopes: &["https://www.googleapis.com/auth/drive"],
            // Offline access and a forced consent screen so a refresh
            // token is issued.
            extra_authorize_params: &[("access_type", "offline"), ("prompt", "consent")],
            requires_client_secret: true,
            revocation_style: RevocationStyle::QueryParam,
            client_id: config.google_client_id.clone(),
            client_secret: config.google_client_secret.clone(),
            redirect_uri: config.google_redirect_uri.clone(),
        }),
        DROPBOX => Ok(ProviderConfig {
            name: DROPBOX,
            auth_url: "https://www.dropbox.com/oauth2/authorize".to_string(),
            token_url: "https://api.dropboxapi.com/oauth2/token".to_string(),
            revoke_url: Some("https://api.dropboxapi.com/2/auth/token/revoke".to_string()),
            scopes: &["files.content.read", "files.content.write"],
            extra_authorize_params: &[("token_access_type", "offline")],
            requires_client_secret: false,
            revocation_style: RevocationStyle::Bearer,
            client_id: config.dropbox_client_id.clone(),
            client_secret: config.dropbox_client_secret.clone(),
            redirect_uri: config.dropbox_redirect_uri.clone(),
        }),
        ONEDRIVE => Ok(ProviderConfig {
            name: ONEDRIVE,
            auth_url: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize"
                .to_string(),
            token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string(),
            // The Microsoft identity platform has no token revocation
            // endpoint; revoke() reports false for this provider.
            revoke_url: None,
            scopes: &["Files.ReadWrite", "offline_access"],
            extra_authorize_params: &[],
            requires_client_secret: false,
            revocation_style: RevocationStyle::Bearer,
            client_id: config.onedrive_client_id.clone(),
            client_secret: config.onedrive_client_secret.clone(),
            redirect_uri: config.onedrive_redirect_uri.clone(),
        }),
        other => Err(Error::UnsupportedProvider(other.to_string())),
    }
}

/// All providers with their enabled flag, for the config endpoint.
pub fn provider_status(config: &AppConfig) -> Vec<(&'static str, bool)> {
    PROVIDER_NAMES
        .iter()
        .filter_map(|name| provider_for(name, config).ok())
        .map(|provider| (provider.name, provider.enabled()))
        .collect()
}
