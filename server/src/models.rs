use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Device platform, determines certificate validity period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
    Desktop,
    Web,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Desktop => "desktop",
            Platform::Web => "web",
        }
    }

    /// Default certificate validity in days. Web certs are session-scoped.
    pub fn validity_days(&self) -> i64 {
        match self {
            Platform::Android | Platform::Ios => 30,
            Platform::Desktop => 7,
            Platform::Web => 1,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            "desktop" => Ok(Platform::Desktop),
            "web" => Ok(Platform::Web),
            other => Err(Error::MalformedRequest(format!(
                "Unknown platform: {other}"
            ))),
        }
    }
}

/// Registry record for an issued certificate, one per (device_id, serial).
/// The PEM is immutable after write; revocation flips the flags only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub device_id: String,
    pub serial: String,
    pub platform: Platform,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub certificate_pem: String,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revocation_reason: Option<String>,
}

impl Certificate {
    /// True when `now` falls inside the validity window and the record
    /// has not been revoked.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now >= self.issued_at && now <= self.expires_at
    }
}

/// Request-scoped identity attached by the mTLS gateway on success.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub serial: String,
    pub platform: Platform,
}

/// Validates a device identifier: 5-128 chars from `[A-Za-z0-9_-]`.
pub fn validate_device_id(device_id: &str) -> crate::error::Result<()> {
    let ok_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if device_id.len() < 5 || device_id.len() > 128 || !ok_chars {
        return Err(Error::MalformedRequest(format!(
            "Invalid device_id: {device_id}"
        )));
    }
    Ok(())
}

/// Token response passed through from OAuth providers. Tokens are never
/// persisted server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_expires_in() -> u64 {
    3600
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Attestation verification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttestationStatus {
    Valid,
    Invalid,
    Failed,
    Unsupported,
}

/// Uniform attestation result returned by all three platform paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationResult {
    pub status: AttestationStatus,
    pub device_id: String,
    pub platform: Platform,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafetyNetAttestationRequest {
    pub device_id: String,
    pub jws_token: String,
    pub nonce: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCheckAttestationRequest {
    pub device_id: String,
    pub device_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DesktopAttestationRequest {
    pub device_id: String,
    pub fingerprint: String,
}

/// Platform-specific attestation evidence optionally attached to an
/// enrollment request. The relevant fields depend on the platform.
#[derive(Debug, Clone, Deserialize)]
pub struct AttestationEvidence {
    #[serde(default)]
    pub jws_token: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub device_token: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollmentRequest {
    pub csr: String,
    pub device_id: String,
    pub platform: String,
    #[serde(default)]
    pub attestation: Option<AttestationEvidence>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentResponse {
    pub certificate: String,
    pub serial: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ca_certificate: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenewalRequest {
    pub csr: String,
    pub device_id: String,
    pub old_serial: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevocationRequest {
    pub device_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationResponse {
    pub success: bool,
    pub device_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateStatusResponse {
    pub device_id: String,
    pub serial: String,
    pub platform: Platform,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub days_until_expiry: i64,
}
