use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Immutable application configuration, loaded once at startup from the
/// environment. Empty OAuth credentials mean the provider is disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub project_version: String,
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub enable_docs: bool,
    pub secret_key: String,
    pub log_level: String,
    pub log_format: String,
    pub allowed_origins: String,
    pub cors_allowed_methods: String,
    pub cors_allowed_headers: String,

    pub infrastructure_provider: String,
    pub infrastructure_base_dir: String,
    pub cloud_region: String,
    pub cloud_table_name: String,
    pub cloud_bucket_name: String,
    pub cloud_secrets_prefix: String,
    pub auto_create_resources: bool,

    pub google_client_id: String,
    pub google_client_secret: String,
    pub google_redirect_uri: String,
    pub dropbox_client_id: String,
    pub dropbox_client_secret: String,
    pub dropbox_redirect_uri: String,
    pub onedrive_client_id: String,
    pub onedrive_client_secret: String,
    pub onedrive_redirect_uri: String,

    pub apple_team_id: String,
    pub apple_key_id: String,
    pub apple_private_key: String,
    pub google_api_key: String,
    pub attestation_cache_ttl_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            project_version: env!("CARGO_PKG_VERSION").to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            debug: false,
            enable_docs: false,
            secret_key: "dev-secret-key-change-in-production-min-32-chars".to_string(),
            log_level: "info".to_string(),
            log_format: "full".to_string(),
            allowed_origins:
                "http://localhost:3000,http://localhost:5173,capacitor://localhost,tauri://localhost"
                    .to_string(),
            cors_allowed_methods: "GET,POST,OPTIONS".to_string(),
            cors_allowed_headers: "Content-Type,Authorization,X-Client-Cert,X-Device-ID"
                .to_string(),
            infrastructure_provider: "local".to_string(),
            infrastructure_base_dir: "./.credentials".to_string(),
            cloud_region: "eu-west-1".to_string(),
            cloud_table_name: "apuntador-certificates".to_string(),
            cloud_bucket_name: "apuntador-cert-storage".to_string(),
            cloud_secrets_prefix: "apuntador".to_string(),
            auto_create_resources: false,
            google_client_id: String::new(),
            google_client_secret: String::new(),
            google_redirect_uri: "https://apuntador.ngrok.app/oauth/callback/googledrive"
                .to_string(),
            dropbox_client_id: String::new(),
            dropbox_client_secret: String::new(),
            dropbox_redirect_uri: "https://apuntador.ngrok.app/oauth/callback/dropbox".to_string(),
            onedrive_client_id: String::new(),
            onedrive_client_secret: String::new(),
            onedrive_redirect_uri: "https://apuntador.ngrok.app/oauth/callback/onedrive"
                .to_string(),
            apple_team_id: String::new(),
            apple_key_id: String::new(),
            apple_private_key: String::new(),
            google_api_key: String::new(),
            attestation_cache_ttl_seconds: 3600,
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn var_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let defaults = Self::default();
        let config = AppConfig {
            project_version: var_or("PROJECT_VERSION", &defaults.project_version),
            host: var_or("HOST", &defaults.host),
            port: var_or("PORT", "8000").parse().unwrap_or(defaults.port),
            debug: var_bool("DEBUG", defaults.debug),
            enable_docs: var_bool("ENABLE_DOCS", defaults.enable_docs),
            secret_key: var_or("SECRET_KEY", &defaults.secret_key),
            log_level: var_or("LOG_LEVEL", &defaults.log_level),
            log_format: var_or("LOG_FORMAT", &defaults.log_format),
            allowed_origins: var_or("ALLOWED_ORIGINS", &defaults.allowed_origins),
            cors_allowed_methods: var_or("CORS_ALLOWED_METHODS", &defaults.cors_allowed_methods),
            cors_allowed_headers: var_or("CORS_ALLOWED_HEADERS", &defaults.cors_allowed_headers),
            infrastructure_provider: var_or(
                "INFRASTRUCTURE_PROVIDER",
                &defaults.infrastructure_provider,
            ),
            infrastructure_base_dir: var_or(
                "INFRASTRUCTURE_BASE_DIR",
                &defaults.infrastructure_base_dir,
            ),
            cloud_region: var_or("CLOUD_REGION", &defaults.cloud_region),
            cloud_table_name: var_or("CLOUD_TABLE_NAME", &defaults.cloud_table_name),
            cloud_bucket_name: var_or("CLOUD_BUCKET_NAME", &defaults.cloud_bucket_name),
            cloud_secrets_prefix: var_or("CLOUD_SECRETS_PREFIX", &defaults.cloud_secrets_prefix),
            auto_create_resources: var_bool("AUTO_CREATE_RESOURCES", defaults.auto_create_resources),
            google_client_id: var_or("GOOGLE_CLIENT_ID", ""),
            google_client_secret: var_or("GOOGLE_CLIENT_SECRET", ""),
            google_redirect_uri: var_or("GOOGLE_REDIRECT_URI", &defaults.google_redirect_uri),
            dropbox_client_id: var_or("DROPBOX_CLIENT_ID", ""),
            dropbox_client_secret: var_or("DROPBOX_CLIENT_SECRET", ""),
            dropbox_redirect_uri: var_or("DROPBOX_REDIRECT_URI", &defaults.dropbox_redirect_uri),
            onedrive_client_id: var_or("ONEDRIVE_CLIENT_ID", ""),
            onedrive_client_secret: var_or("ONEDRIVE_CLIENT_SECRET", ""),
            onedrive_redirect_uri: var_or(
                "ONEDRIVE_REDIRECT_URI",
                &defaults.onedrive_redirect_uri,
            ),
            apple_team_id: var_or("APPLE_TEAM_ID", ""),
            apple_key_id: var_or("APPLE_KEY_ID", ""),
            apple_private_key: var_or("APPLE_PRIVATE_KEY", ""),
            google_api_key: var_or("GOOGLE_API_KEY", ""),
            attestation_cache_ttl_seconds: var_or("ATTESTATION_CACHE_TTL_SECONDS", "3600")
                .parse()
                .unwrap_or(defaults.attestation_cache_ttl_seconds),
        };

        // The signed-state codec keys off this value.
        if config.secret_key.len() < 32 {
            bail!("SECRET_KEY must be at least 32 bytes");
        }

        Ok(config)
    }

    pub fn allowed_origins(&self) -> Vec<String> {
        split_csv(&self.allowed_origins)
    }

    pub fn cors_allowed_methods(&self) -> Vec<String> {
        split_csv(&self.cors_allowed_methods)
    }

    pub fn cors_allowed_headers(&self) -> Vec<String> {
        split_csv(&self.cors_allowed_headers)
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}
