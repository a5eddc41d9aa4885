//! Device certificate enrollment and lifecycle.
//!
//! Wraps the Certificate Authority with the enrollment policy: optional
//! attestation gating, renewal with serial matching and old-certificate
//! revocation, explicit revocation and status checks.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::attestation::DeviceAttestationService;
use crate::ca::CertificateAuthority;
use crate::error::{Error, Result};
use crate::infrastructure::CertificateStore;
use crate::models::{
    CertificateStatusResponse, EnrollmentRequest, EnrollmentResponse, Platform, RenewalRequest,
    RevocationRequest, RevocationResponse,
};

pub struct DeviceService {
    ca: Arc<CertificateAuthority>,
    certificates: Arc<dyn CertificateStore>,
    attestation: Arc<DeviceAttestationService>,
}

impl DeviceService {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        certificates: Arc<dyn CertificateStore>,
        attestation: Arc<DeviceAttestationService>,
    ) -> Self {
        Self {
            ca,
            certificates,
            attestation,
        }
    }

    /// Enrolls a device: optional attestation gate, then CSR signing.
    /// When attestation evidence is attached it must verify as VALID
    /// before the CA touches the CSR.
    pub async fn enroll(&self, request: &EnrollmentRequest) -> Result<EnrollmentResponse> {
        let platform = Platform::from_str(&request.platform)?;
        info!("Enrolling device {} ({platform})", request.device_id);

        if let Some(evidence) = &request.attestation {
            self.attestation
                .verify_evidence(&request.device_id, platform, evidence)
                .await?;
        }

        let certificate = self
            .ca
            .sign_csr(&request.csr, &request.device_id, platform, None)
            .await?;
        let ca_certificate = self.ca.ca_certificate_pem().await?;

        info!(
            "Device {} enrolled successfully: serial={}",
            request.device_id, certificate.serial
        );
        Ok(EnrollmentResponse {
            certificate: certificate.certificate_pem,
            serial: certificate.serial,
            issued_at: certificate.issued_at,
            expires_at: certificate.expires_at,
            ca_certificate,
        })
    }

    /// Renews a certificate: the caller must present the serial of the
    /// current certificate; the platform is carried forward from it. The
    /// new certificate is persisted before the old record is marked
    /// revoked, so a brief window where both validate is possible.
    pub async fn renew(&self, request: &RenewalRequest) -> Result<EnrollmentResponse> {
        info!("Renewing certificate for device {}", request.device_id);

        let old = self
            .certificates
            .get_latest(&request.device_id)
            .await?
            .ok_or_else(|| {
                warn!("No certificate found for device {}", request.device_id);
                Error::NotFound(format!("Certificate for device {}", request.device_id))
            })?;

        if !old.serial.eq_ignore_ascii_case(&request.old_serial) {
            warn!(
                "Serial mismatch for {}: expected={}, got={}",
                request.device_id, old.serial, request.old_serial
            );
            return Err(Error::SerialMismatch);
        }

        let new_certificate = self
            .ca
            .sign_csr(&request.csr, &request.device_id, old.platform, None)
            .await?;

        // Revocation of the superseded record is best-effort; the new
        // certificate already supersedes it in the whitelist.
        self.ca.mark_superseded(&old).await;

        let ca_certificate = self.ca.ca_certificate_pem().await?;

        info!(
            "Certificate renewed for {}: old_serial={}, new_serial={}",
            request.device_id, old.serial, new_certificate.serial
        );
        Ok(EnrollmentResponse {
            certificate: new_certificate.certificate_pem,
            serial: new_certificate.serial,
            issued_at: new_certificate.issued_at,
            expires_at: new_certificate.expires_at,
            ca_certificate,
        })
    }

    pub async fn revoke(&self, request: &RevocationRequest) -> Result<RevocationResponse> {
        warn!(
            "Revoking certificate for device {}: reason={}",
            request.device_id,
            request.reason.as_deref().unwrap_or("not specified")
        );
        let success = self
            .ca
            .revoke(&request.device_id, request.reason.as_deref())
            .await?;
        let message = if success {
            format!("Certificate revoked for device {}", request.device_id)
        } else {
            format!("No certificate found for device {}", request.device_id)
        };
        Ok(RevocationResponse {
            success,
            device_id: request.device_id.clone(),
            message,
        })
    }

    pub async fn status(&self, device_id: &str) -> Result<CertificateStatusResponse> {
        let certificate = self
            .certificates
            .get_latest(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Certificate for device {device_id}")))?;

        let days_until_expiry = (certificate.expires_at - Utc::now()).num_days();
        Ok(CertificateStatusResponse {
            device_id: certificate.device_id,
            serial: certificate.serial,
            platform: certificate.platform,
            issued_at: certificate.issued_at,
            expires_at: certificate.expires_at,
            revoked: certificate.revoked,
            days_until_expiry,
        })
    }

    pub async fn ca_certificate(&self) -> Result<serde_json::Value> {
        let pem = self.ca.ca_certificate_pem().await?;
        Ok(serde_json::json!({
            "certificate": pem,
            "format": "PEM",
            "usage": "Add to client truststore for mTLS verification",
        }))
    }

    /// SHA-256 pin of the CA public key, for certificate pinning in
    /// mobile clients.
    pub async fn ca_certificate_pin(&self) -> Result<serde_json::Value> {
        let (sha256_base64, sha256_hex) = self.ca.spki_pin().await?;
        let pem = self.ca.ca_certificate_pem().await?;
        Ok(serde_json::json!({
            "sha256_base64": sha256_base64,
            "sha256_hex": sha256_hex,
            "certificate_pem": pem,
        }))
    }
}

/// HTTP handlers for the device endpoints.
pub mod endpoints {
    use axum::{
        extract::{Path, State},
        http::StatusCode,
        Extension, Json,
    };
    use tracing::debug;

    use super::*;
    use crate::models::DeviceIdentity;
    use crate::AppState;

    fn service(state: &AppState) -> DeviceService {
        DeviceService::new(
            Arc::clone(&state.ca),
            state.factory.certificate_store(),
            Arc::clone(&state.attestation),
        )
    }

    pub async fn enroll(
        State(state): State<AppState>,
        Json(request): Json<EnrollmentRequest>,
    ) -> Result<(StatusCode, Json<EnrollmentResponse>)> {
        let response = service(&state).enroll(&request).await?;
        Ok((StatusCode::CREATED, Json(response)))
    }

    pub async fn renew(
        State(state): State<AppState>,
        Extension(identity): Extension<DeviceIdentity>,
        Json(request): Json<RenewalRequest>,
    ) -> Result<Json<EnrollmentResponse>> {
        debug!(
            "Renewal requested by authenticated device {}",
            identity.device_id
        );
        let response = service(&state).renew(&request).await?;
        Ok(Json(response))
    }

    pub async fn revoke(
        State(state): State<AppState>,
        Extension(identity): Extension<DeviceIdentity>,
        Json(request): Json<RevocationRequest>,
    ) -> Result<Json<RevocationResponse>> {
        debug!(
            "Revocation requested by authenticated device {}",
            identity.device_id
        );
        let response = service(&state).revoke(&request).await?;
        Ok(Json(response))
    }

    pub async fn status(
        State(state): State<AppState>,
        Path(device_id): Path<String>,
    ) -> Result<Json<CertificateStatusResponse>> {
        let response = service(&state).status(&device_id).await?;
        Ok(Json(response))
    }

    pub async fn ca_certificate(
        State(state): State<AppState>,
    ) -> Result<Json<serde_json::Value>> {
        Ok(Json(service(&state).ca_certificate().await?))
    }

    pub async fn ca_certificate_pin(
        State(state): State<AppState>,
    ) -> Result<Json<serde_json::Value>> {
        Ok(Json(service(&state).ca_certificate_pin().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::infrastructure::local::{
        LocalBlobStore, LocalCertificateStore, LocalSecretStore,
    };
    use rcgen::{CertificateParams, DnType, KeyPair};
    use tempfile::tempdir;

    fn generate_csr() -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "device");
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    async fn test_service(dir: &std::path::Path) -> (DeviceService, Arc<LocalCertificateStore>) {
        let base = dir.to_str().unwrap();
        let secrets = Arc::new(LocalSecretStore::new(base).unwrap());
        let certificates = Arc::new(LocalCertificateStore::new(base).unwrap());
        let blobs = Arc::new(LocalBlobStore::new(base).unwrap());
        let ca = Arc::new(CertificateAuthority::new(
            secrets,
            Arc::clone(&certificates) as Arc<dyn CertificateStore>,
        ));
        ca.ensure_provisioned(true).await.unwrap();
        let attestation = Arc::new(DeviceAttestationService::new(
            &AppConfig::default(),
            blobs,
        ));
        (
            DeviceService::new(
                ca,
                Arc::clone(&certificates) as Arc<dyn CertificateStore>,
                attestation,
            ),
            certificates,
        )
    }

    #[tokio::test]
    async fn enroll_whitelists_the_new_serial() {
        let dir = tempdir().unwrap();
        let (service, store) = test_service(dir.path()).await;

        let response = service
            .enroll(&EnrollmentRequest {
                csr: generate_csr(),
                device_id: "android-test-001".into(),
                platform: "android".into(),
                attestation: None,
            })
            .await
            .unwrap();

        assert_eq!(response.serial.len(), 32);
        assert!(response.ca_certificate.contains("BEGIN CERTIFICATE"));
        assert_eq!((response.expires_at - response.issued_at).num_days(), 30);
        assert!(store.is_whitelisted(&response.serial).await.unwrap());
    }

    #[tokio::test]
    async fn renew_revokes_old_and_whitelists_new() {
        let dir = tempdir().unwrap();
        let (service, store) = test_service(dir.path()).await;

        let enrolled = service
            .enroll(&EnrollmentRequest {
                csr: generate_csr(),
                device_id: "android-test-001".into(),
                platform: "android".into(),
                attestation: None,
            })
            .await
            .unwrap();

        let renewed = service
            .renew(&RenewalRequest {
                csr: generate_csr(),
                device_id: "android-test-001".into(),
                // Serial comparison is case-insensitive.
                old_serial: enrolled.serial.to_lowercase(),
            })
            .await
            .unwrap();

        assert_ne!(renewed.serial, enrolled.serial);
        assert!(store.is_whitelisted(&renewed.serial).await.unwrap());
        assert!(!store.is_whitelisted(&enrolled.serial).await.unwrap());
        // Platform is carried forward from the old certificate.
        let latest = store.get_latest("android-test-001").await.unwrap().unwrap();
        assert_eq!(latest.platform, Platform::Android);
    }

    #[tokio::test]
    async fn renew_rejects_unknown_device_and_wrong_serial() {
        let dir = tempdir().unwrap();
        let (service, _) = test_service(dir.path()).await;

        assert!(matches!(
            service
                .renew(&RenewalRequest {
                    csr: generate_csr(),
                    device_id: "never-enrolled".into(),
                    old_serial: "0".repeat(32),
                })
                .await,
            Err(Error::NotFound(_))
        ));

        service
            .enroll(&EnrollmentRequest {
                csr: generate_csr(),
                device_id: "android-test-002".into(),
                platform: "android".into(),
                attestation: None,
            })
            .await
            .unwrap();
        assert!(matches!(
            service
                .renew(&RenewalRequest {
                    csr: generate_csr(),
                    device_id: "android-test-002".into(),
                    old_serial: "F".repeat(32),
                })
                .await,
            Err(Error::SerialMismatch)
        ));
    }

    #[tokio::test]
    async fn revoke_and_status_round_trip() {
        let dir = tempdir().unwrap();
        let (service, _) = test_service(dir.path()).await;

        let missing = service
            .revoke(&RevocationRequest {
                device_id: "never-enrolled".into(),
                reason: None,
            })
            .await
            .unwrap();
        assert!(!missing.success);

        let enrolled = service
            .enroll(&EnrollmentRequest {
                csr: generate_csr(),
                device_id: "desktop-device-1".into(),
                platform: "desktop".into(),
                attestation: None,
            })
            .await
            .unwrap();

        let status = service.status("desktop-device-1").await.unwrap();
        assert_eq!(status.serial, enrolled.serial);
        assert!(!status.revoked);
        assert!(status.days_until_expiry <= 7);

        let revoked = service
            .revoke(&RevocationRequest {
                device_id: "desktop-device-1".into(),
                reason: Some("device lost".into()),
            })
            .await
            .unwrap();
        assert!(revoked.success);

        let status = service.status("desktop-device-1").await.unwrap();
        assert!(status.revoked);

        assert!(matches!(
            service.status("never-enrolled").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn enrollment_gate_blocks_invalid_attestation() {
        let dir = tempdir().unwrap();
        let (service, store) = test_service(dir.path()).await;

        // Desktop evidence with a malformed fingerprint fails the gate
        // before any certificate is signed.
        let result = service
            .enroll(&EnrollmentRequest {
                csr: generate_csr(),
                device_id: "desktop-device-2".into(),
                platform: "desktop".into(),
                attestation: Some(crate::models::AttestationEvidence {
                    jws_token: None,
                    nonce: None,
                    device_token: None,
                    fingerprint: Some("nope".into()),
                }),
            })
            .await;
        assert!(matches!(result, Err(Error::AttestationInvalid(_))));
        assert!(store.get_latest("desktop-device-2").await.unwrap().is_none());

        // Valid desktop evidence enrolls.
        let enrolled = service
            .enroll(&EnrollmentRequest {
                csr: generate_csr(),
                device_id: "desktop-device-3".into(),
                platform: "desktop".into(),
                attestation: Some(crate::models::AttestationEvidence {
                    jws_token: None,
                    nonce: None,
                    device_token: None,
                    fingerprint: Some("c".repeat(64)),
                }),
            })
            .await
            .unwrap();
        assert!(store.is_whitelisted(&enrolled.serial).await.unwrap());
    }

    #[tokio::test]
    async fn ca_certificate_pin_shape() {
        let dir = tempdir().unwrap();
        let (service, _) = test_service(dir.path()).await;
        let pin = service.ca_certificate_pin().await.unwrap();
        assert_eq!(pin["sha256_hex"].as_str().unwrap().len(), 64);
        assert!(pin["certificate_pem"]
            .as_str()
            .unwrap()
            .contains("BEGIN CERTIFICATE"));
    }
}
