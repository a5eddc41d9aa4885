use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Domain error taxonomy. Every public operation returns `Result<T>`;
/// the HTTP boundary renders these as RFC 7807 Problem Details.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Request validation failed")]
    ValidationFailed(Vec<ValidationDetail>),

    #[error("Invalid CSR: {0}")]
    InvalidCsr(String),

    #[error("Client certificate required for this endpoint")]
    CertMissing,

    #[error("Certificate could not be validated: {0}")]
    CertMalformed(String),

    #[error("Certificate serial {0} not whitelisted")]
    CertNotWhitelisted(String),

    #[error("Certificate serial {0} not found in registry")]
    CertUnknown(String),

    #[error("Certificate has expired")]
    CertExpired,

    #[error("Certificate not yet valid")]
    CertNotYetValid,

    #[error("Certificate has been revoked")]
    CertRevoked,

    #[error("Missing X-API-Key header")]
    ApiKeyMissing,

    #[error("Invalid API key")]
    ApiKeyInvalid,

    #[error("Invalid or expired state")]
    StateInvalid,

    #[error("Provider mismatch: expected {expected}, got {got}")]
    ProviderMismatch { expected: String, got: String },

    #[error("Code verifier mismatch")]
    CodeVerifierMismatch,

    #[error("Unsupported OAuth provider: {0}")]
    UnsupportedProvider(String),

    #[error("Provider rejected the request ({status}): {body}")]
    ProviderRejected { status: u16, body: String },

    #[error("Upstream provider unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Attestation failed: {0}")]
    AttestationFailed(String),

    #[error("Attestation invalid: {0}")]
    AttestationInvalid(String),

    #[error("Attestation not supported: {0}")]
    AttestationUnsupported(String),

    #[error("Attestation rate limit exceeded")]
    AttestationRateLimited,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Old serial number does not match")]
    SerialMismatch,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("CA not provisioned: {0}")]
    CaNotProvisioned(String),

    #[error("Secret not provisioned: {0}")]
    SecretNotProvisioned(String),

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("Provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-field validation failure, carried in 422 responses.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub loc: Vec<String>,
    pub msg: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctx: Option<serde_json::Value>,
}

/// RFC 7807 Problem Details body.
#[derive(Debug, Serialize)]
pub struct ProblemDetail {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ValidationDetail>>,
}

/// Maps an HTTP status to the RFC section URL used in the `type` field.
fn rfc_section_url(status: u16) -> String {
    let base = "https://datatracker.ietf.org/doc/html/rfc7231#section-";
    match status {
        400 => format!("{base}6.5.1"),
        401 => "https://datatracker.ietf.org/doc/html/rfc7235#section-3.1".to_string(),
        403 => format!("{base}6.5.3"),
        404 => format!("{base}6.5.4"),
        405 => format!("{base}6.5.5"),
        409 => format!("{base}6.5.8"),
        422 => "https://datatracker.ietf.org/doc/html/rfc4918#section-11.2".to_string(),
        429 => "https://datatracker.ietf.org/doc/html/rfc6585#section-4".to_string(),
        502 => format!("{base}6.6.3"),
        503 => format!("{base}6.6.4"),
        _ => format!("{base}6.6.1"),
    }
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::MalformedRequest(_) | Error::InvalidCsr(_) => StatusCode::BAD_REQUEST,
            Error::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::CertMissing | Error::ApiKeyMissing | Error::ApiKeyInvalid => {
                StatusCode::UNAUTHORIZED
            }
            Error::CertMalformed(_)
            | Error::CertNotWhitelisted(_)
            | Error::CertUnknown(_)
            | Error::CertExpired
            | Error::CertNotYetValid
            | Error::CertRevoked
            | Error::AttestationInvalid(_) => StatusCode::FORBIDDEN,
            Error::StateInvalid
            | Error::ProviderMismatch { .. }
            | Error::CodeVerifierMismatch
            | Error::UnsupportedProvider(_)
            | Error::AttestationFailed(_) => StatusCode::BAD_REQUEST,
            Error::ProviderRejected { .. } => StatusCode::BAD_GATEWAY,
            Error::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::AttestationUnsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Error::AttestationRateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::SerialMismatch | Error::Conflict(_) => StatusCode::CONFLICT,
            Error::CaNotProvisioned(_)
            | Error::SecretNotProvisioned(_)
            | Error::PersistenceFailed(_)
            | Error::ProvisioningFailed(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable taxonomy tag, used as the problem `title`.
    pub fn title(&self) -> &'static str {
        match self {
            Error::MalformedRequest(_) => "MALFORMED_REQUEST",
            Error::ValidationFailed(_) => "VALIDATION_FAILED",
            Error::InvalidCsr(_) => "INVALID_CSR",
            Error::CertMissing => "CERT_MISSING",
            Error::CertMalformed(_) => "CERT_MALFORMED",
            Error::CertNotWhitelisted(_) => "CERT_NOT_WHITELISTED",
            Error::CertUnknown(_) => "CERT_UNKNOWN",
            Error::CertExpired => "CERT_EXPIRED",
            Error::CertNotYetValid => "CERT_NOT_YET_VALID",
            Error::CertRevoked => "CERT_REVOKED",
            Error::ApiKeyMissing => "API_KEY_MISSING",
            Error::ApiKeyInvalid => "API_KEY_INVALID",
            Error::StateInvalid => "STATE_INVALID",
            Error::ProviderMismatch { .. } => "PROVIDER_MISMATCH",
            Error::CodeVerifierMismatch => "CODE_VERIFIER_MISMATCH",
            Error::UnsupportedProvider(_) => "UNSUPPORTED_PROVIDER",
            Error::ProviderRejected { .. } => "PROVIDER_REJECTED",
            Error::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            Error::AttestationFailed(_) => "ATTESTATION_FAILED",
            Error::AttestationInvalid(_) => "ATTESTATION_INVALID",
            Error::AttestationUnsupported(_) => "ATTESTATION_UNSUPPORTED",
            Error::AttestationRateLimited => "ATTESTATION_RATE_LIMITED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::SerialMismatch => "SERIAL_MISMATCH",
            Error::Conflict(_) => "CONFLICT",
            Error::CaNotProvisioned(_) => "CA_NOT_PROVISIONED",
            Error::SecretNotProvisioned(_) => "SECRET_NOT_PROVISIONED",
            Error::PersistenceFailed(_) => "PERSISTENCE_FAILED",
            Error::ProvisioningFailed(_) => "PROVISIONING_FAILED",
            Error::Internal(_) => "INTERNAL",
        }
    }

    pub fn to_problem(&self, instance: Option<&str>) -> ProblemDetail {
        let status = self.status().as_u16();
        // Internal details never leak to clients; the original is logged.
        let detail = if matches!(self, Error::Internal(_)) {
            error!("internal error: {self}");
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };
        let errors = match self {
            Error::ValidationFailed(details) => Some(details.clone()),
            _ => None,
        };
        ProblemDetail {
            kind: Some(rfc_section_url(status)),
            title: self.title().to_string(),
            status,
            detail: Some(detail),
            instance: instance.map(str::to_string),
            errors,
        }
    }

    pub fn into_problem_response(self, instance: Option<&str>) -> Response {
        let problem = self.to_problem(instance);
        problem_response(self.status(), &problem)
    }
}

pub fn problem_response(status: StatusCode, problem: &ProblemDetail) -> Response {
    let body = serde_json::to_string(problem).unwrap_or_else(|_| "{}".to_string());
    (
        status,
        [(header::CONTENT_TYPE, "application/problem+json")],
        body,
    )
        .into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        self.into_problem_response(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_statuses() {
        assert_eq!(Error::CertMissing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::CertExpired.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::SerialMismatch.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::InvalidCsr("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::UpstreamUnavailable("timeout".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn internal_detail_is_collapsed() {
        let problem = Error::Internal("secret stack trace".into()).to_problem(Some("/x"));
        assert_eq!(problem.title, "INTERNAL");
        assert_eq!(problem.detail.as_deref(), Some("An internal error occurred"));
        assert_eq!(problem.instance.as_deref(), Some("/x"));
    }

    #[test]
    fn validation_errors_are_carried() {
        let err = Error::ValidationFailed(vec![ValidationDetail {
            kind: "value_error".into(),
            loc: vec!["body".into(), "code_verifier".into()],
            msg: "Field required".into(),
            input: serde_json::Value::Null,
            ctx: None,
        }]);
        let problem = err.to_problem(None);
        assert_eq!(problem.status, 422);
        assert_eq!(problem.errors.as_ref().map(Vec::len), Some(1));
    }
}
