pub mod aws;
pub mod local;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::models::Certificate;

/// SecretStore key holding the CA private key PEM.
pub const CA_PRIVATE_KEY: &str = "ca-private-key";
/// SecretStore key holding the CA certificate PEM.
pub const CA_CERTIFICATE: &str = "ca-certificate";

/// Certificate registry. Shared between the CA (writes) and the mTLS
/// gateway (reads); implementations must be safe for concurrent access.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
#[allow(clippy::needless_lifetimes)]
pub trait CertificateStore: Send + Sync {
    /// Upsert by (device_id, serial). Last write wins per pair.
    async fn save(&self, certificate: &Certificate) -> Result<()>;

    /// Most-recently-issued record for the device, if any.
    async fn get_latest(&self, device_id: &str) -> Result<Option<Certificate>>;

    /// Indexed lookup by serial; hot path for the mTLS gateway.
    async fn get_by_serial(&self, serial: &str) -> Result<Option<Certificate>>;

    /// The single authoritative whitelist predicate: a record exists for
    /// the serial, is not revoked, and the current time is inside its
    /// validity window.
    async fn is_whitelisted(&self, serial: &str) -> Result<bool>;

    /// Marks the latest certificate for the device revoked. Returns false
    /// when the device has no certificate.
    async fn revoke(&self, device_id: &str, reason: Option<&str>) -> Result<bool>;

    /// All non-revoked records expiring within `days` days.
    async fn list_expiring(&self, days: i64) -> Result<Vec<Certificate>>;

    async fn list_all(&self) -> Result<Vec<Certificate>>;
}

/// Key/value secret storage. The CA key material lives here.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<String>>;

    /// Fetches the CA private key, failing with a distinct provisioning
    /// error when absent so callers can surface a setup problem.
    async fn ca_private_key(&self) -> Result<String> {
        self.get(CA_PRIVATE_KEY).await?.ok_or_else(|| {
            Error::SecretNotProvisioned(format!(
                "{CA_PRIVATE_KEY} is missing; run CA provisioning first"
            ))
        })
    }

    async fn ca_certificate(&self) -> Result<String> {
        self.get(CA_CERTIFICATE).await?.ok_or_else(|| {
            Error::SecretNotProvisioned(format!(
                "{CA_CERTIFICATE} is missing; run CA provisioning first"
            ))
        })
    }
}

/// Binary object storage with time-limited public URLs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, key: &str, content: &[u8], content_type: &str) -> Result<String>;
    async fn download(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn presigned_url(&self, key: &str, ttl_seconds: u64) -> Result<Option<String>>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Infrastructure implementation families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfrastructureProvider {
    Local,
    Cloud,
}

impl FromStr for InfrastructureProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(InfrastructureProvider::Local),
            "cloud" => Ok(InfrastructureProvider::Cloud),
            other => Err(Error::ProvisioningFailed(format!(
                "Unsupported infrastructure provider: {other}"
            ))),
        }
    }
}

/// Selects and holds the repository implementations for the configured
/// provider family.
#[derive(Clone)]
pub struct InfrastructureFactory {
    certificates: Arc<dyn CertificateStore>,
    secrets: Arc<dyn SecretStore>,
    blobs: Arc<dyn BlobStore>,
}

impl InfrastructureFactory {
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        match config.infrastructure_provider.parse()? {
            InfrastructureProvider::Local => Self::local(&config.infrastructure_base_dir),
            InfrastructureProvider::Cloud => Self::cloud(config).await,
        }
    }

    pub fn local(base_dir: &str) -> Result<Self> {
        info!("Initializing local infrastructure at {base_dir}");
        Ok(Self {
            certificates: Arc::new(local::LocalCertificateStore::new(base_dir)?),
            secrets: Arc::new(local::LocalSecretStore::new(base_dir)?),
            blobs: Arc::new(local::LocalBlobStore::new(base_dir)?),
        })
    }

    pub async fn cloud(config: &AppConfig) -> Result<Self> {
        info!(
            "Initializing cloud infrastructure in {} (table={}, bucket={})",
            config.cloud_region, config.cloud_table_name, config.cloud_bucket_name
        );
        let sdk_config = aws::load_sdk_config(&config.cloud_region).await;
        let certificates = aws::DynamoCertificateStore::new(
            &sdk_config,
            &config.cloud_table_name,
            config.auto_create_resources,
        )
        .await?;
        let secrets =
            aws::SecretsManagerStore::new(&sdk_config, &config.cloud_secrets_prefix);
        let blobs = aws::S3BlobStore::new(
            &sdk_config,
            &config.cloud_bucket_name,
            &config.cloud_region,
            config.auto_create_resources,
        )
        .await?;
        Ok(Self {
            certificates: Arc::new(certificates),
            secrets: Arc::new(secrets),
            blobs: Arc::new(blobs),
        })
    }

    /// Builds a factory from already-constructed stores (tests).
    pub fn from_parts(
        certificates: Arc<dyn CertificateStore>,
        secrets: Arc<dyn SecretStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            certificates,
            secrets,
            blobs,
        }
    }

    pub fn certificate_store(&self) -> Arc<dyn CertificateStore> {
        Arc::clone(&self.certificates)
    }

    pub fn secret_store(&self) -> Arc<dyn SecretStore> {
        Arc::clone(&self.secrets)
    }

    pub fn blob_store(&self) -> Arc<dyn BlobStore> {
        Arc::clone(&self.blobs)
    }
}
