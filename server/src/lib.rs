//! Apuntador device control plane: private CA for device certificates,
//! mTLS validation gateway, OAuth broker for cloud storage providers and
//! device attestation.

pub mod api;
pub mod attestation;
pub mod ca;
pub mod config;
pub mod device;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod mtls;
pub mod oauth;
pub mod security;

use std::sync::Arc;

use crate::attestation::DeviceAttestationService;
use crate::ca::CertificateAuthority;
use crate::config::AppConfig;
use crate::infrastructure::InfrastructureFactory;
use crate::oauth::OAuthService;

/// Shared application state for the server.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub factory: InfrastructureFactory,
    pub ca: Arc<CertificateAuthority>,
    pub attestation: Arc<DeviceAttestationService>,
    pub oauth: Arc<OAuthService>,
}

impl AppState {
    pub async fn from_config(config: AppConfig) -> crate::error::Result<Self> {
        let factory = InfrastructureFactory::from_config(&config).await?;
        Ok(Self::from_parts(Arc::new(config), factory))
    }

    /// Assembles the services over an existing factory (tests build one
    /// over a temp directory).
    pub fn from_parts(config: Arc<AppConfig>, factory: InfrastructureFactory) -> Self {
        let ca = Arc::new(CertificateAuthority::new(
            factory.secret_store(),
            factory.certificate_store(),
        ));
        let attestation = Arc::new(DeviceAttestationService::new(&config, factory.blob_store()));
        let oauth = Arc::new(OAuthService::new(Arc::clone(&config)));
        Self {
            config,
            factory,
            ca,
            attestation,
            oauth,
        }
    }
}
