use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use rand::RngCore;
use ring::hmac;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Default validity window for signed state tokens (seconds).
pub const DEFAULT_STATE_MAX_AGE: i64 = 600;

/// Payload carried across the OAuth round-trip inside a signed state token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedStatePayload {
    pub state: String,
    pub code_verifier: String,
    pub provider: String,
    pub redirect_uri: String,
}

/// Timestamped HMAC-SHA256 serializer for opaque round-trip tokens.
///
/// Token layout: `base64url(payload) . unix_ts . base64url(mac)` where the
/// MAC covers the first two segments. Replay inside the window is allowed;
/// rotation of the secret invalidates in-flight tokens.
pub struct StateCodec {
    key: hmac::Key,
}

impl StateCodec {
    pub fn new(secret: &str) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
        }
    }

    pub fn sign<T: Serialize>(&self, payload: &T) -> Result<String> {
        let json = serde_json::to_vec(payload)
            .map_err(|e| Error::Internal(format!("state serialization failed: {e}")))?;
        let body = format!("{}.{}", URL_SAFE_NO_PAD.encode(json), Utc::now().timestamp());
        let tag = hmac::sign(&self.key, body.as_bytes());
        Ok(format!("{body}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref())))
    }

    /// Returns the payload iff the MAC checks out and the token is no older
    /// than `max_age` seconds. Tampered or expired tokens yield `None`.
    pub fn verify<T: DeserializeOwned>(&self, token: &str, max_age: i64) -> Option<T> {
        let (body, tag_b64) = token.rsplit_once('.')?;
        let tag = URL_SAFE_NO_PAD.decode(tag_b64).ok()?;
        hmac::verify(&self.key, body.as_bytes(), &tag).ok()?;

        let (payload_b64, ts) = body.rsplit_once('.')?;
        let issued_at: i64 = ts.parse().ok()?;
        let age = Utc::now().timestamp() - issued_at;
        if age > max_age {
            return None;
        }

        let json = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        serde_json::from_slice(&json).ok()
    }
}

/// Generates a random state parameter with 256 bits of entropy.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generates a random PKCE code verifier of the requested length (43-128).
pub fn generate_code_verifier(length: usize) -> Result<String> {
    if !(43..=128).contains(&length) {
        return Err(Error::MalformedRequest(
            "code verifier length must be between 43 and 128".to_string(),
        ));
    }
    let mut bytes = [0u8; 96];
    rand::thread_rng().fill_bytes(&mut bytes);
    let encoded = URL_SAFE_NO_PAD.encode(bytes);
    Ok(encoded[..length].to_string())
}

/// Derives the S256 code challenge from a verifier.
pub fn code_challenge(code_verifier: &str) -> String {
    let digest = Sha256::digest(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Checks that a verifier corresponds to a previously issued challenge.
pub fn verify_code_challenge(code_verifier: &str, challenge: &str) -> bool {
    code_challenge(code_verifier) == challenge
}
