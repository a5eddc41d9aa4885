//! mTLS client-certificate validation middleware.
//!
//! The service sits behind a TLS-terminating proxy that forwards the peer
//! certificate in a header. Web/OAuth endpoints are exempt; everything
//! else requires a whitelisted, unexpired, unrevoked device certificate
//! signed by our CA. On success a [`DeviceIdentity`] is attached to the
//! request for downstream handlers.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::error::{Error, Result};
use crate::AppState;

const EXEMPT_EXACT: &[&str] = &[
    "/",
    "/health",
    "/health/public",
    "/docs",
    "/redoc",
    "/openapi.json",
    "/device/enroll",
    "/device/ca-certificate",
    "/device/ca-certificate-pin",
];

const EXEMPT_PREFIXES: &[&str] = &["/oauth/", "/config/", "/device/attest/"];

fn is_exempt_path(path: &str) -> bool {
    EXEMPT_EXACT.contains(&path) || EXEMPT_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// Extracts a PEM client certificate from the supported proxy headers.
///
/// - `X-Client-Cert` / `X-SSL-Client-Cert`: URL-encoded PEM (`%0A` is a
///   newline); bare base64 bodies get PEM markers added.
/// - `X-Forwarded-Client-Cert`: Envoy-style `k=v` list carrying
///   `Cert="<base64-DER>"`.
fn extract_certificate(headers: &HeaderMap) -> Option<String> {
    for header in ["x-client-cert", "x-ssl-client-cert"] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            let cert_pem = value.replace("%0A", "\n").replace("%20", " ");
            let cert_pem = if cert_pem.starts_with("-----BEGIN CERTIFICATE-----") {
                cert_pem
            } else {
                format!("-----BEGIN CERTIFICATE-----\n{cert_pem}\n-----END CERTIFICATE-----")
            };
            debug!("Extracted client certificate from {header}");
            return Some(cert_pem);
        }
    }

    let xfcc = headers
        .get("x-forwarded-client-cert")
        .and_then(|v| v.to_str().ok())?;
    let start = xfcc.find("Cert=\"")? + "Cert=\"".len();
    let end = xfcc[start..].find('"')? + start;
    match BASE64.decode(&xfcc[start..end]) {
        Ok(der) => {
            let block = ::pem::Pem::new("CERTIFICATE", der);
            Some(::pem::encode(&block))
        }
        Err(e) => {
            warn!("Failed to decode Envoy client certificate: {e}");
            None
        }
    }
}

struct ParsedClientCert {
    serial: String,
    not_before: i64,
    not_after: i64,
}

fn parse_client_cert(cert_pem: &str) -> Result<ParsedClientCert> {
    let block =
        ::pem::parse(cert_pem).map_err(|e| Error::CertMalformed(format!("PEM decode: {e}")))?;
    let (_, cert) = X509Certificate::from_der(block.contents())
        .map_err(|e| Error::CertMalformed(format!("X.509 parse: {e}")))?;
    Ok(ParsedClientCert {
        // Registry representation: 128-bit serial as 32 uppercase hex.
        serial: format!("{:032X}", cert.tbs_certificate.serial),
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
    })
}

fn verify_issuer_signature(cert_pem: &str, ca_pem: &str) -> Result<()> {
    let ca_block =
        ::pem::parse(ca_pem).map_err(|e| Error::Internal(format!("CA PEM decode: {e}")))?;
    let (_, ca) = X509Certificate::from_der(ca_block.contents())
        .map_err(|e| Error::Internal(format!("CA parse: {e}")))?;

    let block =
        ::pem::parse(cert_pem).map_err(|e| Error::CertMalformed(format!("PEM decode: {e}")))?;
    let (_, cert) = X509Certificate::from_der(block.contents())
        .map_err(|e| Error::CertMalformed(format!("X.509 parse: {e}")))?;

    if cert.issuer().as_raw() != ca.subject().as_raw() {
        return Err(Error::CertMalformed(
            "certificate issuer does not match CA".to_string(),
        ));
    }
    cert.verify_signature(Some(ca.public_key()))
        .map_err(|_| Error::CertMalformed("certificate signature is invalid".to_string()))
}

pub async fn mtls_validation(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if is_exempt_path(&path) {
        return next.run(request).await;
    }

    let Some(cert_pem) = extract_certificate(request.headers()) else {
        warn!(
            "mTLS validation failed: no client certificate provided for {} {path}",
            request.method()
        );
        return Error::CertMissing.into_problem_response(Some(&path));
    };

    match validate_certificate(&state, &cert_pem).await {
        Ok(identity) => {
            info!(
                "mTLS validation successful: device={}, serial={}",
                identity.device_id, identity.serial
            );
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(err) => {
            warn!(
                "mTLS validation failed: {err} for {} {path}",
                request.method()
            );
            err.into_problem_response(Some(&path))
        }
    }
}

async fn validate_certificate(
    state: &AppState,
    cert_pem: &str,
) -> Result<crate::models::DeviceIdentity> {
    let parsed = parse_client_cert(cert_pem)?;
    let store = state.factory.certificate_store();

    let record = match store.get_by_serial(&parsed.serial).await? {
        Some(record) => Some(record),
        None => {
            // Indexed lookup can miss on stores without a serial index;
            // fall back to an enumeration scan.
            store
                .list_all()
                .await?
                .into_iter()
                .find(|cert| cert.serial.eq_ignore_ascii_case(&parsed.serial))
        }
    };
    let Some(record) = record else {
        // A whitelisted serial with no retrievable record is a registry
        // inconsistency, not an unknown certificate.
        if store.is_whitelisted(&parsed.serial).await? {
            return Err(Error::CertUnknown(parsed.serial));
        }
        return Err(Error::CertNotWhitelisted(parsed.serial));
    };

    let now = Utc::now().timestamp();
    if now < parsed.not_before {
        return Err(Error::CertNotYetValid);
    }
    if now > parsed.not_after {
        return Err(Error::CertExpired);
    }
    if record.revoked {
        return Err(Error::CertRevoked);
    }

    // The whitelist predicate is the final authority; it also covers
    // registry-side expiry and supersession.
    if !store.is_whitelisted(&parsed.serial).await? {
        return Err(Error::CertNotWhitelisted(parsed.serial));
    }

    // Whitelisting alone is not sufficient; the certificate must chain to
    // our CA.
    let ca_pem = state.ca.ca_certificate_pem().await?;
    verify_issuer_signature(cert_pem, &ca_pem)?;

    Ok(crate::models::DeviceIdentity {
        device_id: record.device_id,
        serial: parsed.serial,
        platform: record.platform,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn exempt_path_table() {
        assert!(is_exempt_path("/"));
        assert!(is_exempt_path("/health"));
        assert!(is_exempt_path("/health/public"));
        assert!(is_exempt_path("/device/enroll"));
        assert!(is_exempt_path("/device/ca-certificate"));
        assert!(is_exempt_path("/device/ca-certificate-pin"));
        assert!(is_exempt_path("/oauth/authorize/googledrive"));
        assert!(is_exempt_path("/config/providers"));
        assert!(is_exempt_path("/device/attest/android"));

        assert!(!is_exempt_path("/device/renew"));
        assert!(!is_exempt_path("/device/revoke"));
        assert!(!is_exempt_path("/device/status/some-device"));
    }

    #[test]
    fn extracts_url_encoded_pem_and_adds_markers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-client-cert",
            HeaderValue::from_static("MIIBbase64body%0Amore"),
        );
        let pem_text = extract_certificate(&headers).unwrap();
        assert!(pem_text.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(pem_text.contains("MIIBbase64body\nmore"));
        assert!(pem_text.ends_with("-----END CERTIFICATE-----"));
    }

    #[test]
    fn keeps_existing_pem_markers() {
        let raw = "-----BEGIN CERTIFICATE-----%0AMIIB%0A-----END CERTIFICATE-----";
        let mut headers = HeaderMap::new();
        headers.insert("x-ssl-client-cert", HeaderValue::from_str(raw).unwrap());
        let pem_text = extract_certificate(&headers).unwrap();
        assert_eq!(
            pem_text,
            "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----"
        );
    }

    #[test]
    fn extracts_envoy_xfcc_cert() {
        let der = b"not-actually-der-but-good-enough".to_vec();
        let b64 = BASE64.encode(&der);
        let header = format!("By=spiffe://x;Hash=abc;Cert=\"{b64}\";Chain=\"zzz\"");
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-client-cert",
            HeaderValue::from_str(&header).unwrap(),
        );
        let pem_text = extract_certificate(&headers).unwrap();
        let decoded = ::pem::parse(&pem_text).unwrap();
        assert_eq!(decoded.tag(), "CERTIFICATE");
        assert_eq!(decoded.contents(), der.as_slice());
    }

    #[test]
    fn missing_headers_yield_none() {
        assert!(extract_certificate(&HeaderMap::new()).is_none());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            parse_client_cert("not a certificate"),
            Err(Error::CertMalformed(_))
        ));
    }
}
