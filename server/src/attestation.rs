//! Device attestation across platforms.
//!
//! - Android: SafetyNet JWS. The x5c chain is verified (hostname, validity,
//!   pairwise signatures) and the token signature is checked against the
//!   leaf key before the verdict is read from the payload.
//! - iOS: DeviceCheck. A short-lived ES256 JWT authenticates the service
//!   against Apple's validate_device_token endpoint.
//! - Desktop: no hardware root; a SHA-256 fingerprint plus a persisted
//!   rate limit (5 attempts per device per hour).
//!
//! Non-failed results are cached per (device_id, platform) for the
//! configured TTL.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use ring::signature::UnparsedPublicKey;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::infrastructure::BlobStore;
use crate::models::{
    AttestationEvidence, AttestationResult, AttestationStatus, DesktopAttestationRequest,
    DeviceCheckAttestationRequest, Platform, SafetyNetAttestationRequest,
};

const DEVICECHECK_URL: &str = "https://api.devicecheck.apple.com/v1/validate_device_token";
const SAFETYNET_HOSTNAME: &str = "attest.android.com";
const DESKTOP_RATE_LIMIT: u32 = 5;
const DESKTOP_RATE_WINDOW_SECS: i64 = 3600;
const UPSTREAM_TIMEOUT_SECS: u64 = 10;

#[derive(Clone)]
struct CacheEntry {
    result: AttestationResult,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct RateWindow {
    window_start: i64,
    count: u32,
}

#[derive(Deserialize)]
struct JwsHeader {
    alg: String,
    #[serde(default)]
    x5c: Vec<String>,
}

#[derive(Serialize)]
struct AppleClaims {
    iss: String,
    iat: i64,
}

pub struct DeviceAttestationService {
    apple_team_id: Option<String>,
    apple_key_id: Option<String>,
    apple_private_key: Option<String>,
    devicecheck_url: String,
    cache_ttl_seconds: i64,
    cache: RwLock<HashMap<(String, Platform), CacheEntry>>,
    blobs: Arc<dyn BlobStore>,
    http: reqwest::Client,
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl DeviceAttestationService {
    pub fn new(config: &AppConfig, blobs: Arc<dyn BlobStore>) -> Self {
        info!(
            "Initialized DeviceAttestationService with cache TTL: {}s",
            config.attestation_cache_ttl_seconds
        );
        Self {
            apple_team_id: optional(&config.apple_team_id),
            apple_key_id: optional(&config.apple_key_id),
            apple_private_key: optional(&config.apple_private_key),
            devicecheck_url: DEVICECHECK_URL.to_string(),
            cache_ttl_seconds: config.attestation_cache_ttl_seconds as i64,
            cache: RwLock::new(HashMap::new()),
            blobs,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    // ===========================
    // Cache management
    // ===========================

    async fn cached(&self, device_id: &str, platform: Platform) -> Option<AttestationResult> {
        let key = (device_id.to_string(), platform);
        {
            let cache = self.cache.read().await;
            match cache.get(&key) {
                Some(entry) if entry.expires_at > Utc::now() => {
                    debug!("Using cached attestation for device {device_id}");
                    return Some(entry.result.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Expired entries are evicted lazily on lookup.
        self.cache.write().await.remove(&key);
        None
    }

    async fn cache_result(&self, result: &AttestationResult) {
        let expires_at = Utc::now() + Duration::seconds(self.cache_ttl_seconds);
        let key = (result.device_id.clone(), result.platform);
        self.cache.write().await.insert(
            key,
            CacheEntry {
                result: result.clone(),
                expires_at,
            },
        );
        debug!(
            "Cached attestation for {}:{} until {expires_at}",
            result.device_id, result.platform
        );
    }

    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        let count = cache.len();
        cache.clear();
        info!("Cleared {count} attestation cache entries");
    }

    fn result(
        &self,
        request_device: &str,
        platform: Platform,
        status: AttestationStatus,
        details: HashMap<String, serde_json::Value>,
        error_message: Option<String>,
    ) -> AttestationResult {
        AttestationResult {
            status,
            device_id: request_device.to_string(),
            platform,
            timestamp: Utc::now(),
            details,
            error_message,
        }
    }

    // ===========================
    // Android SafetyNet
    // ===========================

    pub async fn verify_safetynet(
        &self,
        request: &SafetyNetAttestationRequest,
    ) -> AttestationResult {
        info!(
            "Verifying SafetyNet attestation for device: {}",
            request.device_id
        );
        if let Some(cached) = self.cached(&request.device_id, Platform::Android).await {
            return cached;
        }

        let (result, cacheable) = match self.check_safetynet(request) {
            Ok(outcome) => outcome,
            Err(reason) => {
                warn!(
                    "SafetyNet verification failed for {}: {reason}",
                    request.device_id
                );
                (
                    self.result(
                        &request.device_id,
                        Platform::Android,
                        AttestationStatus::Failed,
                        HashMap::new(),
                        Some(reason),
                    ),
                    false,
                )
            }
        };

        if cacheable && result.status != AttestationStatus::Failed {
            self.cache_result(&result).await;
        }
        result
    }

    fn check_safetynet(
        &self,
        request: &SafetyNetAttestationRequest,
    ) -> std::result::Result<(AttestationResult, bool), String> {
        let parts: Vec<&str> = request.jws_token.split('.').collect();
        if parts.len() != 3 {
            return Err("Invalid JWS token format".to_string());
        }

        let payload_json = decode_b64url(parts[1])?;
        let payload: serde_json::Value =
            serde_json::from_slice(&payload_json).map_err(|e| format!("payload JSON: {e}"))?;

        // The nonce binds the attestation to our challenge; a mismatch is
        // a verdict, not a transport failure, and is never cached.
        if payload.get("nonce").and_then(|v| v.as_str()) != Some(request.nonce.as_str()) {
            warn!("Nonce mismatch for device {}", request.device_id);
            return Ok((
                self.result(
                    &request.device_id,
                    Platform::Android,
                    AttestationStatus::Invalid,
                    HashMap::new(),
                    Some("Nonce mismatch".to_string()),
                ),
                false,
            ));
        }

        self.verify_jws_signature(parts[0], parts[1], parts[2])?;

        let cts_profile_match = payload
            .get("ctsProfileMatch")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let basic_integrity = payload
            .get("basicIntegrity")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        info!(
            "SafetyNet results for {}: CTS={cts_profile_match}, BasicIntegrity={basic_integrity}",
            request.device_id
        );

        let status = if cts_profile_match && basic_integrity {
            AttestationStatus::Valid
        } else {
            AttestationStatus::Invalid
        };
        let advice = if status == AttestationStatus::Invalid {
            payload.get("advice").and_then(|v| v.as_str())
        } else {
            None
        };

        let mut details = HashMap::from([
            ("cts_profile_match".to_string(), cts_profile_match.into()),
            ("basic_integrity".to_string(), basic_integrity.into()),
        ]);
        if let Some(advice) = advice {
            details.insert("advice".to_string(), advice.into());
        }

        Ok((
            self.result(&request.device_id, Platform::Android, status, details, None),
            true,
        ))
    }

    /// Verifies the x5c certificate chain and the JWS signature against
    /// the leaf key.
    fn verify_jws_signature(
        &self,
        header_b64: &str,
        payload_b64: &str,
        signature_b64: &str,
    ) -> std::result::Result<(), String> {
        let header_json = decode_b64url(header_b64)?;
        let header: JwsHeader =
            serde_json::from_slice(&header_json).map_err(|e| format!("JWS header: {e}"))?;
        if header.x5c.is_empty() {
            return Err("JWS header carries no certificate chain".to_string());
        }

        let chain_der: Vec<Vec<u8>> = header
            .x5c
            .iter()
            .map(|b64| BASE64.decode(b64).map_err(|e| format!("x5c decode: {e}")))
            .collect::<std::result::Result<_, _>>()?;
        let chain: Vec<X509Certificate> = chain_der
            .iter()
            .map(|der| {
                X509Certificate::from_der(der)
                    .map(|(_, cert)| cert)
                    .map_err(|e| format!("x5c certificate parse: {e}"))
            })
            .collect::<std::result::Result<_, _>>()?;

        let leaf = &chain[0];
        let leaf_subject = leaf.subject().to_string();
        if !leaf_subject.contains(SAFETYNET_HOSTNAME) {
            return Err(format!(
                "attestation certificate issued to {leaf_subject}, expected {SAFETYNET_HOSTNAME}"
            ));
        }
        let now = Utc::now().timestamp();
        if now < leaf.validity().not_before.timestamp()
            || now > leaf.validity().not_after.timestamp()
        {
            return Err("attestation certificate is outside its validity window".to_string());
        }
        for pair in chain.windows(2) {
            pair[0]
                .verify_signature(Some(pair[1].public_key()))
                .map_err(|_| "certificate chain verification failed".to_string())?;
        }

        let verification = match header.alg.as_str() {
            "RS256" => &ring::signature::RSA_PKCS1_2048_8192_SHA256
                as &dyn ring::signature::VerificationAlgorithm,
            "ES256" => &ring::signature::ECDSA_P256_SHA256_FIXED,
            other => return Err(format!("unsupported JWS algorithm: {other}")),
        };
        let signature =
            decode_b64url(signature_b64).map_err(|e| format!("JWS signature: {e}"))?;
        let signing_input = format!("{header_b64}.{payload_b64}");
        let key = UnparsedPublicKey::new(
            verification,
            leaf.public_key().subject_public_key.data.as_ref(),
        );
        key.verify(signing_input.as_bytes(), &signature)
            .map_err(|_| "JWS signature verification failed".to_string())
    }

    // ===========================
    // iOS DeviceCheck
    // ===========================

    pub async fn verify_devicecheck(
        &self,
        request: &DeviceCheckAttestationRequest,
    ) -> AttestationResult {
        info!(
            "Verifying DeviceCheck attestation for device: {}",
            request.device_id
        );
        if let Some(cached) = self.cached(&request.device_id, Platform::Ios).await {
            return cached;
        }

        let (Some(team_id), Some(key_id), Some(private_key)) = (
            self.apple_team_id.clone(),
            self.apple_key_id.clone(),
            self.apple_private_key.clone(),
        ) else {
            warn!("Apple DeviceCheck credentials not configured");
            return self.result(
                &request.device_id,
                Platform::Ios,
                AttestationStatus::Unsupported,
                HashMap::new(),
                Some("DeviceCheck not configured".to_string()),
            );
        };

        let token = match self.apple_jwt(&team_id, &key_id, &private_key) {
            Ok(token) => token,
            Err(e) => {
                return self.result(
                    &request.device_id,
                    Platform::Ios,
                    AttestationStatus::Failed,
                    HashMap::new(),
                    Some(format!("Apple JWT: {e}")),
                )
            }
        };

        let body = serde_json::json!({
            "device_token": request.device_token,
            "transaction_id": uuid::Uuid::new_v4().to_string(),
            "timestamp": Utc::now().timestamp_millis(),
        });

        let response = self
            .http
            .post(&self.devicecheck_url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await;

        let result = match response {
            Ok(response) if response.status().is_success() => self.result(
                &request.device_id,
                Platform::Ios,
                AttestationStatus::Valid,
                HashMap::from([("integrity_verified".to_string(), true.into())]),
                None,
            ),
            Ok(response) if response.status().is_client_error() => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(
                    "DeviceCheck rejected token for {}: {status} {body}",
                    request.device_id
                );
                self.result(
                    &request.device_id,
                    Platform::Ios,
                    AttestationStatus::Invalid,
                    HashMap::from([("integrity_verified".to_string(), false.into())]),
                    Some(format!("Apple rejected device token ({status})")),
                )
            }
            Ok(response) => self.result(
                &request.device_id,
                Platform::Ios,
                AttestationStatus::Failed,
                HashMap::new(),
                Some(format!("Apple returned {}", response.status())),
            ),
            Err(e) => self.result(
                &request.device_id,
                Platform::Ios,
                AttestationStatus::Failed,
                HashMap::new(),
                Some(format!("DeviceCheck request failed: {e}")),
            ),
        };

        if result.status != AttestationStatus::Failed {
            self.cache_result(&result).await;
        }
        result
    }

    fn apple_jwt(&self, team_id: &str, key_id: &str, private_key: &str) -> Result<String> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(key_id.to_string());
        let claims = AppleClaims {
            iss: team_id.to_string(),
            iat: Utc::now().timestamp(),
        };
        let key = EncodingKey::from_ec_pem(private_key.as_bytes())
            .map_err(|e| Error::Internal(format!("Apple private key: {e}")))?;
        jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| Error::Internal(format!("Apple JWT encoding: {e}")))
    }

    // ===========================
    // Desktop fingerprinting
    // ===========================

    pub async fn verify_desktop(&self, request: &DesktopAttestationRequest) -> AttestationResult {
        info!(
            "Verifying desktop fingerprint for device: {}",
            request.device_id
        );
        if let Some(cached) = self.cached(&request.device_id, Platform::Desktop).await {
            return cached;
        }

        let fingerprint_valid = request.fingerprint.len() == 64
            && request.fingerprint.chars().all(|c| c.is_ascii_hexdigit());
        if !fingerprint_valid {
            return self.result(
                &request.device_id,
                Platform::Desktop,
                AttestationStatus::Invalid,
                HashMap::new(),
                Some("Invalid fingerprint format".to_string()),
            );
        }

        let rate_limit_ok = match self.consume_rate_limit(&request.device_id).await {
            Ok(ok) => ok,
            Err(e) => {
                return self.result(
                    &request.device_id,
                    Platform::Desktop,
                    AttestationStatus::Failed,
                    HashMap::new(),
                    Some(format!("rate limit check failed: {e}")),
                )
            }
        };

        let status = if rate_limit_ok {
            AttestationStatus::Valid
        } else {
            AttestationStatus::Invalid
        };
        let result = self.result(
            &request.device_id,
            Platform::Desktop,
            status,
            HashMap::from([
                ("fingerprint_valid".to_string(), true.into()),
                ("rate_limit_ok".to_string(), rate_limit_ok.into()),
            ]),
            (!rate_limit_ok).then(|| "Rate limit exceeded".to_string()),
        );
        self.cache_result(&result).await;
        result
    }

    /// Counts an attempt against the hourly window. Counters live in the
    /// blob store so restarts do not reset them.
    async fn consume_rate_limit(&self, device_id: &str) -> Result<bool> {
        let key = format!("attestation/rate/{device_id}.json");
        let now = Utc::now().timestamp();

        let mut window = match self.blobs.download(&key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or(RateWindow {
                window_start: now,
                count: 0,
            }),
            None => RateWindow {
                window_start: now,
                count: 0,
            },
        };
        if now - window.window_start >= DESKTOP_RATE_WINDOW_SECS {
            window = RateWindow {
                window_start: now,
                count: 0,
            };
        }
        window.count += 1;

        let body = serde_json::to_vec(&window)
            .map_err(|e| Error::Internal(format!("rate window serialization: {e}")))?;
        self.blobs.upload(&key, &body, "application/json").await?;

        Ok(window.count <= DESKTOP_RATE_LIMIT)
    }

    // ===========================
    // Enrollment gate
    // ===========================

    /// Verifies enrollment-time attestation evidence for the platform.
    /// Only a VALID verdict lets enrollment proceed.
    pub async fn verify_evidence(
        &self,
        device_id: &str,
        platform: Platform,
        evidence: &AttestationEvidence,
    ) -> Result<()> {
        let result = match platform {
            Platform::Android => {
                let (Some(jws_token), Some(nonce)) = (&evidence.jws_token, &evidence.nonce) else {
                    return Err(Error::AttestationFailed(
                        "android enrollment requires jws_token and nonce".to_string(),
                    ));
                };
                self.verify_safetynet(&SafetyNetAttestationRequest {
                    device_id: device_id.to_string(),
                    jws_token: jws_token.clone(),
                    nonce: nonce.clone(),
                })
                .await
            }
            Platform::Ios => {
                let Some(device_token) = &evidence.device_token else {
                    return Err(Error::AttestationFailed(
                        "ios enrollment requires device_token".to_string(),
                    ));
                };
                self.verify_devicecheck(&DeviceCheckAttestationRequest {
                    device_id: device_id.to_string(),
                    device_token: device_token.clone(),
                })
                .await
            }
            Platform::Desktop | Platform::Web => {
                let Some(fingerprint) = &evidence.fingerprint else {
                    return Err(Error::AttestationFailed(
                        "desktop enrollment requires a fingerprint".to_string(),
                    ));
                };
                self.verify_desktop(&DesktopAttestationRequest {
                    device_id: device_id.to_string(),
                    fingerprint: fingerprint.clone(),
                })
                .await
            }
        };

        match result.status {
            AttestationStatus::Valid => Ok(()),
            AttestationStatus::Invalid => {
                if result
                    .details
                    .get("rate_limit_ok")
                    .and_then(|v| v.as_bool())
                    == Some(false)
                {
                    return Err(Error::AttestationRateLimited);
                }
                Err(Error::AttestationInvalid(
                    result
                        .error_message
                        .unwrap_or_else(|| "device integrity check failed".to_string()),
                ))
            }
            AttestationStatus::Failed => Err(Error::AttestationFailed(
                result
                    .error_message
                    .unwrap_or_else(|| "attestation could not be verified".to_string()),
            )),
            AttestationStatus::Unsupported => Err(Error::AttestationUnsupported(
                result
                    .error_message
                    .unwrap_or_else(|| "attestation not configured".to_string()),
            )),
        }
    }
}

fn decode_b64url(segment: &str) -> std::result::Result<Vec<u8>, String> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| format!("base64url decode: {e}"))
}

/// HTTP handlers for the attestation endpoints.
pub mod endpoints {
    use axum::{extract::State, http::StatusCode, Json};

    use super::*;
    use crate::AppState;

    pub async fn verify_android(
        State(state): State<AppState>,
        Json(request): Json<SafetyNetAttestationRequest>,
    ) -> Json<AttestationResult> {
        Json(state.attestation.verify_safetynet(&request).await)
    }

    pub async fn verify_ios(
        State(state): State<AppState>,
        Json(request): Json<DeviceCheckAttestationRequest>,
    ) -> Json<AttestationResult> {
        Json(state.attestation.verify_devicecheck(&request).await)
    }

    pub async fn verify_desktop(
        State(state): State<AppState>,
        Json(request): Json<DesktopAttestationRequest>,
    ) -> Json<AttestationResult> {
        Json(state.attestation.verify_desktop(&request).await)
    }

    pub async fn clear_cache(State(state): State<AppState>) -> StatusCode {
        state.attestation.clear_cache().await;
        StatusCode::NO_CONTENT
    }
}
