//! End-to-end enrollment, renewal and mTLS gateway tests over the full
//! router with a local-filesystem infrastructure factory.

use std::sync::Arc;

use apuntador_server::config::AppConfig;
use apuntador_server::infrastructure::{CertificateStore, InfrastructureFactory, SecretStore};
use apuntador_server::models::{Certificate, Platform};
use apuntador_server::{api, AppState};
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use rand::RngCore;
use rcgen::{CertificateParams, DnType, Issuer, KeyPair, SerialNumber};
use tempfile::TempDir;
use time::OffsetDateTime;
use tower::ServiceExt;

async fn test_state(dir: &TempDir) -> AppState {
    let base = dir.path().to_str().unwrap().to_string();
    let config = AppConfig {
        infrastructure_base_dir: base.clone(),
        google_client_id: "google-client".into(),
        google_client_secret: "google-secret".into(),
        ..AppConfig::default()
    };
    let factory = InfrastructureFactory::local(&base).unwrap();
    let state = AppState::from_parts(Arc::new(config), factory);
    state.ca.ensure_provisioned(true).await.unwrap();
    state
}

fn generate_csr(common_name: &str) -> String {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::new()).unwrap();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.serialize_request(&key).unwrap().pem().unwrap()
}

fn cert_header_value(pem: &str) -> String {
    pem.replace('\n', "%0A")
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn enroll(router: &Router, device_id: &str, platform: &str) -> serde_json::Value {
    let (status, body) = send(
        router.clone(),
        post_json(
            "/device/enroll",
            serde_json::json!({
                "csr": generate_csr(device_id),
                "device_id": device_id,
                "platform": platform,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "enroll failed: {body}");
    body
}

/// Issues a CA-signed certificate with an arbitrary validity window and
/// registers it, bypassing the enrollment path.
async fn issue_with_window(
    state: &AppState,
    device_id: &str,
    not_before_days: i64,
    not_after_days: i64,
) -> (String, String) {
    let secrets = state.factory.secret_store();
    let ca_key_pem = secrets.get("ca-private-key").await.unwrap().unwrap();
    let ca_cert_pem = secrets.get("ca-certificate").await.unwrap().unwrap();
    let ca_key = KeyPair::from_pem(&ca_key_pem).unwrap();
    let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, ca_key).unwrap();

    let mut serial_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut serial_bytes);
    serial_bytes[0] &= 0x7F;
    let serial = hex::encode_upper(serial_bytes);

    let device_key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::new()).unwrap();
    params
        .distinguished_name
        .push(DnType::CommonName, device_id);
    params.serial_number = Some(SerialNumber::from(serial_bytes.to_vec()));
    params.not_before = OffsetDateTime::now_utc() + time::Duration::days(not_before_days);
    params.not_after = OffsetDateTime::now_utc() + time::Duration::days(not_after_days);
    let cert = params.signed_by(&device_key, &issuer).unwrap();

    let record = Certificate {
        device_id: device_id.to_string(),
        serial: serial.clone(),
        platform: Platform::Android,
        issued_at: Utc::now() + Duration::days(not_before_days),
        expires_at: Utc::now() + Duration::days(not_after_days),
        certificate_pem: cert.pem(),
        revoked: false,
        revoked_at: None,
        revocation_reason: None,
    };
    state
        .factory
        .certificate_store()
        .save(&record)
        .await
        .unwrap();
    (cert.pem(), serial)
}

#[tokio::test]
async fn health_endpoints_are_public() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let router = api::build_router(state);

    for path in ["/", "/health", "/health/public"] {
        let (status, body) = send(
            router.clone(),
            Request::builder().uri(path).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}

#[tokio::test]
async fn enroll_android_issues_thirty_day_certificate() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let router = api::build_router(state.clone());

    let body = enroll(&router, "android-test-001", "android").await;

    let serial = body["serial"].as_str().unwrap();
    assert_eq!(serial.len(), 32);
    assert!(serial
        .chars()
        .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
    assert!(body["ca_certificate"]
        .as_str()
        .unwrap()
        .contains("BEGIN CERTIFICATE"));
    assert!(body["certificate"]
        .as_str()
        .unwrap()
        .contains("BEGIN CERTIFICATE"));

    let issued_at: chrono::DateTime<Utc> =
        body["issued_at"].as_str().unwrap().parse().unwrap();
    let expires_at: chrono::DateTime<Utc> =
        body["expires_at"].as_str().unwrap().parse().unwrap();
    assert_eq!((expires_at - issued_at).num_days(), 30);

    assert!(state
        .factory
        .certificate_store()
        .is_whitelisted(serial)
        .await
        .unwrap());
}

#[tokio::test]
async fn gate_rejects_missing_certificate() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let router = api::build_router(state);

    let (status, body) = send(
        router,
        Request::builder()
            .uri("/device/status/any-device")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["title"], "CERT_MISSING");
    assert_eq!(body["status"], 401);
    assert_eq!(body["instance"], "/device/status/any-device");
}

#[tokio::test]
async fn gate_accepts_enrolled_certificate() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let router = api::build_router(state);

    let enrolled = enroll(&router, "android-testdevice123", "android").await;
    let cert_pem = enrolled["certificate"].as_str().unwrap();

    let (status, body) = send(
        router.clone(),
        Request::builder()
            .uri("/device/status/android-testdevice123")
            .header("x-client-cert", cert_header_value(cert_pem))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "status failed: {body}");
    assert_eq!(body["device_id"], "android-testdevice123");
    assert_eq!(body["serial"], enrolled["serial"]);
    assert_eq!(body["revoked"], false);
}

#[tokio::test]
async fn gate_rejects_expired_certificate() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let router = api::build_router(state.clone());

    // A still-valid certificate for the same CN passes...
    let enrolled = enroll(&router, "android-testdevice123", "android").await;
    let valid_pem = enrolled["certificate"].as_str().unwrap();
    let (status, _) = send(
        router.clone(),
        Request::builder()
            .uri("/device/status/android-testdevice123")
            .header("x-client-cert", cert_header_value(valid_pem))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // ...while one that expired a month ago is rejected.
    let (expired_pem, _) = issue_with_window(&state, "android-testdevice456", -60, -30).await;
    let (status, body) = send(
        router,
        Request::builder()
            .uri("/device/status/android-testdevice456")
            .header("x-client-cert", cert_header_value(&expired_pem))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["title"], "CERT_EXPIRED");
}

#[tokio::test]
async fn gate_rejects_unknown_and_revoked_certificates() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let router = api::build_router(state.clone());

    let enrolled = enroll(&router, "android-testdevice123", "android").await;
    let cert_pem = enrolled["certificate"].as_str().unwrap().to_string();

    state
        .ca
        .revoke("android-testdevice123", Some("stolen"))
        .await
        .unwrap();
    let (status, body) = send(
        router.clone(),
        Request::builder()
            .uri("/device/status/android-testdevice123")
            .header("x-client-cert", cert_header_value(&cert_pem))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["title"], "CERT_REVOKED");

    let (status, body) = send(
        router,
        Request::builder()
            .uri("/device/status/whoever")
            .header("x-client-cert", "garbage-not-base64-pem")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["title"], "CERT_MALFORMED");
}

#[tokio::test]
async fn gate_rejects_certificate_from_foreign_ca() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let router = api::build_router(state.clone());

    // A certificate signed by a different CA whose serial somehow made it
    // into the registry must still be rejected.
    let foreign_dir = TempDir::new().unwrap();
    let foreign_state = test_state(&foreign_dir).await;
    let (foreign_pem, foreign_serial) =
        issue_with_window(&foreign_state, "android-intruder-1", -1, 29).await;

    let record = Certificate {
        device_id: "android-intruder-1".to_string(),
        serial: foreign_serial,
        platform: Platform::Android,
        issued_at: Utc::now() - Duration::days(1),
        expires_at: Utc::now() + Duration::days(29),
        certificate_pem: foreign_pem.clone(),
        revoked: false,
        revoked_at: None,
        revocation_reason: None,
    };
    state
        .factory
        .certificate_store()
        .save(&record)
        .await
        .unwrap();

    let (status, body) = send(
        router,
        Request::builder()
            .uri("/device/status/android-intruder-1")
            .header("x-client-cert", cert_header_value(&foreign_pem))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["title"], "CERT_MALFORMED");
}

#[tokio::test]
async fn renew_revokes_old_certificate() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let router = api::build_router(state.clone());

    let enrolled = enroll(&router, "android-test-002", "android").await;
    let old_serial = enrolled["serial"].as_str().unwrap().to_string();
    let old_pem = enrolled["certificate"].as_str().unwrap().to_string();

    let mut request = post_json(
        "/device/renew",
        serde_json::json!({
            "csr": generate_csr("android-test-002"),
            "device_id": "android-test-002",
            "old_serial": old_serial,
        }),
    );
    request
        .headers_mut()
        .insert("x-client-cert", cert_header_value(&old_pem).parse().unwrap());

    let (status, body) = send(router.clone(), request).await;
    assert_eq!(status, StatusCode::OK, "renew failed: {body}");
    let new_serial = body["serial"].as_str().unwrap();
    assert_ne!(new_serial, old_serial);

    let store = state.factory.certificate_store();
    assert!(store.is_whitelisted(new_serial).await.unwrap());
    assert!(!store.is_whitelisted(&old_serial).await.unwrap());
}

#[tokio::test]
async fn renew_with_wrong_serial_conflicts() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let router = api::build_router(state);

    let enrolled = enroll(&router, "android-test-003", "android").await;
    let old_pem = enrolled["certificate"].as_str().unwrap().to_string();

    let mut request = post_json(
        "/device/renew",
        serde_json::json!({
            "csr": generate_csr("android-test-003"),
            "device_id": "android-test-003",
            "old_serial": "0".repeat(32),
        }),
    );
    request
        .headers_mut()
        .insert("x-client-cert", cert_header_value(&old_pem).parse().unwrap());

    let (status, body) = send(router, request).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["title"], "SERIAL_MISMATCH");
}

#[tokio::test]
async fn enroll_rejects_invalid_csr() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let router = api::build_router(state);

    let (status, body) = send(
        router,
        post_json(
            "/device/enroll",
            serde_json::json!({
                "csr": "not a csr",
                "device_id": "android-test-004",
                "platform": "android",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["title"], "INVALID_CSR");
}

#[tokio::test]
async fn attestation_endpoints_are_exempt_from_mtls() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let router = api::build_router(state);

    let (status, body) = send(
        router.clone(),
        post_json(
            "/device/attest/desktop",
            serde_json::json!({
                "device_id": "desktop-device-1",
                "fingerprint": "a".repeat(64),
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "valid");

    let (status, _) = send(
        router,
        Request::builder()
            .method("POST")
            .uri("/device/attest/clear-cache")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn ca_certificate_and_pin_are_public() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let router = api::build_router(state);

    let (status, body) = send(
        router.clone(),
        Request::builder()
            .uri("/device/ca-certificate")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["format"], "PEM");
    assert!(body["certificate"]
        .as_str()
        .unwrap()
        .contains("BEGIN CERTIFICATE"));

    let (status, body) = send(
        router,
        Request::builder()
            .uri("/device/ca-certificate-pin")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sha256_hex"].as_str().unwrap().len(), 64);
    assert!(!body["sha256_base64"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn provider_config_requires_api_key() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let secret_key = state.config.secret_key.clone();
    let router = api::build_router(state);

    let (status, body) = send(
        router.clone(),
        Request::builder()
            .uri("/config/providers")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["title"], "API_KEY_MISSING");

    let (status, body) = send(
        router.clone(),
        Request::builder()
            .uri("/config/providers")
            .header("x-api-key", "wrong")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["title"], "API_KEY_INVALID");

    let (status, body) = send(
        router,
        Request::builder()
            .uri("/config/providers")
            .header("x-api-key", secret_key)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["providers"]["googledrive"]["enabled"], true);
    assert_eq!(body["providers"]["dropbox"]["enabled"], false);
    assert_eq!(body["cache_ttl"], 3600);
}
