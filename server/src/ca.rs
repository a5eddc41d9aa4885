//! Certificate Authority for signing device certificates.
//!
//! Loads the CA key pair from the secret store on first use, signs CSRs
//! from enrolled devices and tracks issued certificates in the registry.
//! Device certificates are short-lived (1-30 days depending on platform);
//! the synchronous whitelist check in the mTLS gateway stands in for CRL
//! distribution.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use sha2::{Digest, Sha256};
use ::time::OffsetDateTime;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};
use x509_parser::prelude::*;

use crate::error::{Error, Result};
use crate::infrastructure::{CertificateStore, SecretStore, CA_CERTIFICATE, CA_PRIVATE_KEY};
use crate::models::{validate_device_id, Certificate, Platform};

const CSR_PEM_HEADER: &str = "-----BEGIN CERTIFICATE REQUEST-----";
const CSR_PEM_FOOTER: &str = "-----END CERTIFICATE REQUEST-----";
const CA_SUBJECT_CN: &str = "Apuntador Root CA";
const CA_SUBJECT_O: &str = "Apuntador";
const LEAF_SUBJECT_O: &str = "Apuntador Devices";
const CA_VALIDITY_DAYS: i64 = 3650;

#[derive(Clone)]
struct CaCredentials {
    private_key_pem: String,
    certificate_pem: String,
}

pub struct CertificateAuthority {
    secrets: Arc<dyn SecretStore>,
    certificates: Arc<dyn CertificateStore>,
    // Write-once credential cache; readers proceed lock-free after
    // publication.
    credentials: OnceCell<CaCredentials>,
}

impl CertificateAuthority {
    pub fn new(secrets: Arc<dyn SecretStore>, certificates: Arc<dyn CertificateStore>) -> Self {
        info!("Initialized CertificateAuthority");
        Self {
            secrets,
            certificates,
            credentials: OnceCell::new(),
        }
    }

    async fn credentials(&self) -> Result<&CaCredentials> {
        self.credentials
            .get_or_try_init(|| async {
                let private_key_pem = self.secrets.ca_private_key().await?;
                let certificate_pem = self.secrets.ca_certificate().await?;
                info!("Loaded CA private key and certificate");
                Ok(CaCredentials {
                    private_key_pem,
                    certificate_pem,
                })
            })
            .await
            .map_err(|e: Error| match e {
                Error::SecretNotProvisioned(msg) => Error::CaNotProvisioned(msg),
                other => other,
            })
    }

    /// Generates and stores a self-signed CA when none exists yet.
    pub async fn ensure_provisioned(&self, auto_create: bool) -> Result<()> {
        let has_key = self.secrets.get(CA_PRIVATE_KEY).await?.is_some();
        let has_cert = self.secrets.get(CA_CERTIFICATE).await?.is_some();
        if has_key && has_cert {
            return Ok(());
        }
        if !auto_create {
            warn!("CA key material is not provisioned; signing will fail until it is");
            return Ok(());
        }

        info!("Provisioning self-signed CA certificate");
        let key_pair =
            KeyPair::generate().map_err(|e| Error::Internal(format!("CA key generation: {e}")))?;
        let mut params = CertificateParams::new(Vec::new())
            .map_err(|e| Error::Internal(format!("CA params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_SUBJECT_CN);
        dn.push(DnType::OrganizationName, CA_SUBJECT_O);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = Utc::now();
        params.not_before = to_offset(now)?;
        params.not_after = to_offset(now + Duration::days(CA_VALIDITY_DAYS))?;

        let certificate = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Internal(format!("CA self-sign: {e}")))?;

        self.secrets
            .put(CA_PRIVATE_KEY, &key_pair.serialize_pem())
            .await?;
        self.secrets.put(CA_CERTIFICATE, &certificate.pem()).await?;
        Ok(())
    }

    /// Cryptographically random 128-bit serial as 32 uppercase hex chars.
    /// The top bit is cleared so the DER integer needs no padding byte and
    /// the registry representation matches the certificate exactly.
    fn mint_serial() -> ([u8; 16], String) {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[0] &= 0x7F;
        let hex = hex::encode_upper(bytes);
        (bytes, hex)
    }

    /// Signs a CSR from an enrolled device and persists the registry
    /// record. The CSR's subject is ignored; the CA sets its own.
    pub async fn sign_csr(
        &self,
        csr_pem: &str,
        device_id: &str,
        platform: Platform,
        validity_days: Option<i64>,
    ) -> Result<Certificate> {
        validate_device_id(device_id)?;

        let trimmed = csr_pem.trim();
        if trimmed.len() < 100
            || !trimmed.starts_with(CSR_PEM_HEADER)
            || !trimmed.ends_with(CSR_PEM_FOOTER)
        {
            return Err(Error::InvalidCsr(
                "CSR must be a PEM-encoded PKCS#10 request".to_string(),
            ));
        }

        // Parsing also verifies the CSR self-signature, proving the
        // requester holds the private key.
        let csr = CertificateSigningRequestParams::from_pem(trimmed)
            .map_err(|e| Error::InvalidCsr(format!("{e}")))?;

        let (serial_bytes, serial) = Self::mint_serial();
        let validity_days = validity_days.unwrap_or_else(|| platform.validity_days());
        let not_before = Utc::now();
        let not_after = not_before + Duration::days(validity_days);

        info!("Signing certificate for device {device_id}, serial {serial}");

        let mut params = CertificateParams::new(Vec::new())
            .map_err(|e| Error::Internal(format!("certificate params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, device_id);
        dn.push(DnType::OrganizationName, LEAF_SUBJECT_O);
        params.distinguished_name = dn;
        params.serial_number = Some(SerialNumber::from(serial_bytes.to_vec()));
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.use_authority_key_identifier_extension = true;

        let creds = self.credentials().await?;
        let ca_key = KeyPair::from_pem(&creds.private_key_pem)
            .map_err(|e| Error::CaNotProvisioned(format!("CA private key unusable: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&creds.certificate_pem, ca_key)
            .map_err(|e| Error::CaNotProvisioned(format!("CA certificate unusable: {e}")))?;

        let signed = params
            .signed_by(&csr.public_key, &issuer)
            .map_err(|e| Error::Internal(format!("certificate signing: {e}")))?;

        let record = Certificate {
            device_id: device_id.to_string(),
            serial: serial.clone(),
            platform,
            issued_at: not_before,
            expires_at: not_after,
            certificate_pem: signed.pem(),
            revoked: false,
            revoked_at: None,
            revocation_reason: None,
        };

        // Persisting the record adds the serial to the whitelist.
        self.certificates.save(&record).await?;

        info!(
            "Certificate signed for {device_id}: serial={serial}, expires={}",
            not_after.to_rfc3339()
        );
        Ok(record)
    }

    /// True iff the certificate was issued by this CA, its signature
    /// checks out against the CA public key, and it is currently valid.
    pub async fn verify(&self, cert_pem: &str) -> Result<bool> {
        let creds = self.credentials().await?;
        let ca_der = match parse_pem(&creds.certificate_pem) {
            Ok(der) => der,
            Err(e) => return Err(Error::CaNotProvisioned(format!("CA certificate: {e}"))),
        };
        let (_, ca) = match X509Certificate::from_der(&ca_der) {
            Ok(parsed) => parsed,
            Err(e) => return Err(Error::CaNotProvisioned(format!("CA certificate: {e}"))),
        };

        let Ok(leaf_der) = parse_pem(cert_pem) else {
            return Ok(false);
        };
        let Ok((_, leaf)) = X509Certificate::from_der(&leaf_der) else {
            return Ok(false);
        };

        if leaf.issuer().as_raw() != ca.subject().as_raw() {
            warn!("Certificate issuer does not match CA");
            return Ok(false);
        }

        let now = Utc::now().timestamp();
        if now < leaf.validity().not_before.timestamp() {
            warn!("Certificate is not yet valid");
            return Ok(false);
        }
        if now > leaf.validity().not_after.timestamp() {
            warn!("Certificate has expired");
            return Ok(false);
        }

        if let Err(e) = leaf.verify_signature(Some(ca.public_key())) {
            warn!("Certificate signature verification failed: {e}");
            return Ok(false);
        }

        Ok(true)
    }

    pub async fn revoke(&self, device_id: &str, reason: Option<&str>) -> Result<bool> {
        let revoked = self.certificates.revoke(device_id, reason).await?;
        if revoked {
            warn!("Certificate revoked for device {device_id}");
        } else {
            warn!("No certificate found for device {device_id}");
        }
        Ok(revoked)
    }

    pub async fn list_expiring(&self, days: i64) -> Result<Vec<Certificate>> {
        self.certificates.list_expiring(days).await
    }

    /// CA certificate for client truststores.
    pub async fn ca_certificate_pem(&self) -> Result<String> {
        Ok(self.credentials().await?.certificate_pem.clone())
    }

    /// SHA-256 of the CA SubjectPublicKeyInfo, for certificate pinning.
    /// Returns (base64, hex).
    pub async fn spki_pin(&self) -> Result<(String, String)> {
        let creds = self.credentials().await?;
        let der = parse_pem(&creds.certificate_pem)
            .map_err(|e| Error::CaNotProvisioned(format!("CA certificate: {e}")))?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| Error::CaNotProvisioned(format!("CA certificate: {e}")))?;
        let digest = Sha256::digest(cert.public_key().raw);
        Ok((BASE64.encode(digest), hex::encode(digest)))
    }

    /// Marks a superseded certificate record revoked after renewal. A
    /// failure here is logged, not surfaced; the new certificate already
    /// supersedes the old in every whitelist check.
    pub async fn mark_superseded(&self, old: &Certificate) {
        let mut revoked = old.clone();
        revoked.revoked = true;
        revoked.revoked_at = Some(Utc::now());
        revoked.revocation_reason = Some("Superseded by renewal".to_string());
        if let Err(e) = self.certificates.save(&revoked).await {
            error!(
                "Failed to revoke superseded certificate {} for {}: {e}",
                old.serial, old.device_id
            );
        }
    }
}

fn to_offset(value: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(value.timestamp())
        .map_err(|e| Error::Internal(format!("timestamp conversion: {e}")))
}

fn parse_pem(pem_text: &str) -> std::result::Result<Vec<u8>, String> {
    let parsed = ::pem::parse(pem_text).map_err(|e| e.to_string())?;
    Ok(parsed.into_contents())
}
