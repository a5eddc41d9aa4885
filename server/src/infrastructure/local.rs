//! File-backed repositories for local development.
//!
//! Layout under the base directory:
//!   certificates/{device_id}.json   latest certificate record per device
//!   serials/{serial}.json           pointer file: {"device_id": ...}
//!   {secret-key}.pem|.txt           one file per secret, mode 0600
//!   storage/{key}                   blob objects, file:// presigned URLs
//!
//! Writes go through a write-then-rename so readers never observe a torn
//! record. Secrets are stored unencrypted: development only.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::infrastructure::{BlobStore, CertificateStore, SecretStore};
use crate::models::Certificate;

fn io_err(context: &str, err: std::io::Error) -> Error {
    Error::PersistenceFailed(format!("{context}: {err}"))
}

/// Writes `content` to `path` atomically via a temporary sibling file.
async fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)
        .await
        .map_err(|e| io_err("write temp file", e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| io_err("rename temp file", e))
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await {
        warn!("Could not set permissions on {}: {e}", path.display());
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path, _mode: u32) {}

#[derive(Serialize, Deserialize)]
struct SerialPointer {
    device_id: String,
}

/// File-based certificate registry. A device file always holds the most
/// recently issued record; serial pointer files index every serial the
/// device has ever been issued.
pub struct LocalCertificateStore {
    certs_dir: PathBuf,
    serials_dir: PathBuf,
}

impl LocalCertificateStore {
    pub fn new(base_dir: &str) -> Result<Self> {
        let base = PathBuf::from(base_dir);
        let certs_dir = base.join("certificates");
        let serials_dir = base.join("serials");
        std::fs::create_dir_all(&certs_dir).map_err(|e| io_err("create certificates dir", e))?;
        std::fs::create_dir_all(&serials_dir).map_err(|e| io_err("create serials dir", e))?;
        info!("Initialized LocalCertificateStore at {}", base.display());
        Ok(Self {
            certs_dir,
            serials_dir,
        })
    }

    fn cert_path(&self, device_id: &str) -> PathBuf {
        self.certs_dir.join(format!("{device_id}.json"))
    }

    fn serial_path(&self, serial: &str) -> PathBuf {
        self.serials_dir.join(format!("{}.json", serial.to_uppercase()))
    }

    async fn read_device_record(&self, device_id: &str) -> Result<Option<Certificate>> {
        let path = self.cert_path(device_id);
        match fs::read(&path).await {
            Ok(bytes) => {
                let cert = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::PersistenceFailed(format!("corrupt record: {e}")))?;
                Ok(Some(cert))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("read certificate", e)),
        }
    }
}

#[async_trait]
impl CertificateStore for LocalCertificateStore {
    async fn save(&self, certificate: &Certificate) -> Result<()> {
        // The serial pointer is written unconditionally; the device file
        // only moves forward in time. An upsert of a superseded record
        // (renewal marking the old serial revoked) must not clobber the
        // newer certificate.
        let pointer = serde_json::to_vec(&SerialPointer {
            device_id: certificate.device_id.clone(),
        })
        .map_err(|e| Error::PersistenceFailed(e.to_string()))?;
        atomic_write(&self.serial_path(&certificate.serial), &pointer).await?;

        if let Some(current) = self.read_device_record(&certificate.device_id).await? {
            let same_serial = current.serial.eq_ignore_ascii_case(&certificate.serial);
            if !same_serial && current.issued_at > certificate.issued_at {
                return Ok(());
            }
        }

        let body = serde_json::to_vec_pretty(certificate)
            .map_err(|e| Error::PersistenceFailed(e.to_string()))?;
        atomic_write(&self.cert_path(&certificate.device_id), &body).await?;

        info!(
            "Saved certificate for device {}, serial {}",
            certificate.device_id, certificate.serial
        );
        Ok(())
    }

    async fn get_latest(&self, device_id: &str) -> Result<Option<Certificate>> {
        self.read_device_record(device_id).await
    }

    async fn get_by_serial(&self, serial: &str) -> Result<Option<Certificate>> {
        let pointer_path = self.serial_path(serial);
        let bytes = match fs::read(&pointer_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err("read serial pointer", e)),
        };
        let pointer: SerialPointer = serde_json::from_slice(&bytes)
            .map_err(|e| Error::PersistenceFailed(format!("corrupt serial pointer: {e}")))?;

        // A pointer whose device record has moved on belongs to a
        // superseded certificate.
        match self.read_device_record(&pointer.device_id).await? {
            Some(cert) if cert.serial.eq_ignore_ascii_case(serial) => Ok(Some(cert)),
            _ => Ok(None),
        }
    }

    async fn is_whitelisted(&self, serial: &str) -> Result<bool> {
        match self.get_by_serial(serial).await? {
            Some(cert) => {
                let valid = cert.is_valid_at(Utc::now());
                if !valid {
                    warn!("Certificate {serial} is revoked, superseded or expired");
                }
                Ok(valid)
            }
            None => Ok(false),
        }
    }

    async fn revoke(&self, device_id: &str, reason: Option<&str>) -> Result<bool> {
        let Some(mut cert) = self.read_device_record(device_id).await? else {
            return Ok(false);
        };
        cert.revoked = true;
        cert.revoked_at = Some(Utc::now());
        cert.revocation_reason = Some(reason.unwrap_or("Manual revocation").to_string());

        let body = serde_json::to_vec_pretty(&cert)
            .map_err(|e| Error::PersistenceFailed(e.to_string()))?;
        atomic_write(&self.cert_path(device_id), &body).await?;

        info!("Revoked certificate for device {device_id}");
        Ok(true)
    }

    async fn list_expiring(&self, days: i64) -> Result<Vec<Certificate>> {
        let threshold = Utc::now() + Duration::days(days);
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|cert| !cert.revoked && cert.expires_at <= threshold)
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Certificate>> {
        let mut certificates = Vec::new();
        let mut entries = fs::read_dir(&self.certs_dir)
            .await
            .map_err(|e| io_err("read certificates dir", e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_err("read dir entry", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await.map_err(|e| io_err("read record", e))?;
            match serde_json::from_slice(&bytes) {
                Ok(cert) => certificates.push(cert),
                Err(e) => warn!("Skipping corrupt record {}: {e}", path.display()),
            }
        }
        Ok(certificates)
    }
}

/// File-based secret storage. Files are stored unencrypted with
/// owner-only permissions; development only.
pub struct LocalSecretStore {
    secrets_dir: PathBuf,
}

impl LocalSecretStore {
    pub fn new(base_dir: &str) -> Result<Self> {
        let secrets_dir = PathBuf::from(base_dir);
        std::fs::create_dir_all(&secrets_dir).map_err(|e| io_err("create secrets dir", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(
                &secrets_dir,
                std::fs::Permissions::from_mode(0o700),
            ) {
                warn!("Could not set secrets dir permissions: {e}");
            }
        }
        warn!("LocalSecretStore stores secrets UNENCRYPTED - for development only");
        Ok(Self { secrets_dir })
    }

    fn secret_path(&self, key: &str) -> PathBuf {
        // Key material keeps the .pem extension, everything else is .txt.
        let extension = if key.ends_with("key") || key.ends_with("certificate") {
            "pem"
        } else {
            "txt"
        };
        self.secrets_dir.join(format!("{key}.{extension}"))
    }
}

#[async_trait]
impl SecretStore for LocalSecretStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.secret_path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("read secret", e)),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let path = self.secret_path(key);
        atomic_write(&path, value.as_bytes()).await?;
        restrict_permissions(&path, 0o600).await;
        info!("Stored secret: {key}");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.secret_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("delete secret", e)),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.secrets_dir)
            .await
            .map_err(|e| io_err("read secrets dir", e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_err("read dir entry", e))?
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match path.extension().and_then(|e| e.to_str()) {
                Some("pem") | Some("txt") => {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        keys.push(stem.to_string());
                    }
                }
                _ => {}
            }
        }
        Ok(keys)
    }
}

/// File-based blob storage with file:// presigned URLs (development only).
pub struct LocalBlobStore {
    storage_dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_dir: &str) -> Result<Self> {
        let storage_dir = PathBuf::from(base_dir).join("storage");
        std::fs::create_dir_all(&storage_dir).map_err(|e| io_err("create storage dir", e))?;
        Ok(Self { storage_dir })
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, key: &str, content: &[u8], _content_type: &str) -> Result<String> {
        let path = self.file_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err("create blob parent dirs", e))?;
        }
        atomic_write(&path, content).await?;
        info!("Uploaded blob: {key} ({} bytes)", content.len());
        Ok(path.to_string_lossy().into_owned())
    }

    async fn download(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.file_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("read blob", e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.file_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err("delete blob", e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.file_path(key).exists())
    }

    async fn presigned_url(&self, key: &str, _ttl_seconds: u64) -> Result<Option<String>> {
        let path = self.file_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let absolute = path
            .canonicalize()
            .map_err(|e| io_err("canonicalize blob path", e))?;
        Ok(Some(format!(
            "file://{}",
            urlencoding::encode(&absolute.to_string_lossy()).replace("%2F", "/")
        )))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.storage_dir.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| io_err("read storage dir", e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_err("read dir entry", e))?
            {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.storage_dir) {
                    let key = relative.to_string_lossy().into_owned();
                    if key.starts_with(prefix) && !key.ends_with(".tmp") {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;
    use tempfile::tempdir;

    fn sample_cert(device_id: &str, serial: &str, issued_offset_days: i64) -> Certificate {
        let now = Utc::now();
        Certificate {
            device_id: device_id.to_string(),
            serial: serial.to_string(),
            platform: Platform::Android,
            issued_at: now + Duration::days(issued_offset_days),
            expires_at: now + Duration::days(issued_offset_days + 30),
            certificate_pem: "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n"
                .to_string(),
            revoked: false,
            revoked_at: None,
            revocation_reason: None,
        }
    }

    #[tokio::test]
    async fn save_and_lookup_round_trip() {
        let dir = tempdir().unwrap();
        let store = LocalCertificateStore::new(dir.path().to_str().unwrap()).unwrap();
        let cert = sample_cert("device-aa", &"A".repeat(32), -1);

        store.save(&cert).await.unwrap();
        let latest = store.get_latest("device-aa").await.unwrap().unwrap();
        assert_eq!(latest.serial, cert.serial);

        let by_serial = store.get_by_serial(&cert.serial).await.unwrap().unwrap();
        assert_eq!(by_serial.device_id, "device-aa");
        assert!(store.is_whitelisted(&cert.serial).await.unwrap());
    }

    #[tokio::test]
    async fn whitelist_truth_table() {
        let dir = tempdir().unwrap();
        let store = LocalCertificateStore::new(dir.path().to_str().unwrap()).unwrap();

        // Absent serial.
        assert!(!store.is_whitelisted(&"0".repeat(32)).await.unwrap());

        // Expired certificate.
        let mut expired = sample_cert("device-bb", &"B".repeat(32), -60);
        expired.expires_at = Utc::now() - Duration::days(30);
        store.save(&expired).await.unwrap();
        assert!(!store.is_whitelisted(&expired.serial).await.unwrap());

        // Valid certificate.
        let valid = sample_cert("device-cc", &"C".repeat(32), -1);
        store.save(&valid).await.unwrap();
        assert!(store.is_whitelisted(&valid.serial).await.unwrap());

        // Revoked certificate.
        assert!(store.revoke("device-cc", Some("stolen")).await.unwrap());
        assert!(!store.is_whitelisted(&valid.serial).await.unwrap());
        let revoked = store.get_latest("device-cc").await.unwrap().unwrap();
        assert!(revoked.revoked_at.is_some());
        assert_eq!(revoked.revocation_reason.as_deref(), Some("stolen"));
    }

    #[tokio::test]
    async fn superseded_serial_is_not_whitelisted() {
        let dir = tempdir().unwrap();
        let store = LocalCertificateStore::new(dir.path().to_str().unwrap()).unwrap();

        let old = sample_cert("device-dd", &"D".repeat(32), -2);
        let new = sample_cert("device-dd", &"E".repeat(32), -1);
        store.save(&old).await.unwrap();
        store.save(&new).await.unwrap();

        assert!(!store.is_whitelisted(&old.serial).await.unwrap());
        assert!(store.is_whitelisted(&new.serial).await.unwrap());

        // Upserting the superseded record (revocation bookkeeping) must
        // not clobber the newer certificate.
        let mut old_revoked = old.clone();
        old_revoked.revoked = true;
        store.save(&old_revoked).await.unwrap();
        let latest = store.get_latest("device-dd").await.unwrap().unwrap();
        assert_eq!(latest.serial, new.serial);
        assert!(store.is_whitelisted(&new.serial).await.unwrap());
    }

    #[tokio::test]
    async fn revoke_missing_device_returns_false() {
        let dir = tempdir().unwrap();
        let store = LocalCertificateStore::new(dir.path().to_str().unwrap()).unwrap();
        assert!(!store.revoke("device-zz", None).await.unwrap());
    }

    #[tokio::test]
    async fn expiring_window_filters_revoked_and_far() {
        let dir = tempdir().unwrap();
        let store = LocalCertificateStore::new(dir.path().to_str().unwrap()).unwrap();

        let mut soon = sample_cert("device-ee", &"F".repeat(32), -28);
        soon.expires_at = Utc::now() + Duration::days(2);
        store.save(&soon).await.unwrap();

        let far = sample_cert("device-ff", &"1".repeat(32), 0);
        store.save(&far).await.unwrap();

        let expiring = store.list_expiring(5).await.unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].device_id, "device-ee");

        store.revoke("device-ee", None).await.unwrap();
        assert!(store.list_expiring(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn secret_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = LocalSecretStore::new(dir.path().to_str().unwrap()).unwrap();

        assert!(store.get("missing").await.unwrap().is_none());
        assert!(matches!(
            store.ca_private_key().await,
            Err(Error::SecretNotProvisioned(_))
        ));

        store.put(super::super::CA_PRIVATE_KEY, "PRIVATE").await.unwrap();
        store.put("api-token", "sekrit").await.unwrap();
        assert_eq!(store.ca_private_key().await.unwrap(), "PRIVATE");
        assert_eq!(store.get("api-token").await.unwrap().unwrap(), "sekrit");

        // Key material lands in .pem, other secrets in .txt.
        assert!(dir.path().join("ca-private-key.pem").exists());
        assert!(dir.path().join("api-token.txt").exists());

        let mut keys = store.list().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["api-token", "ca-private-key"]);

        store.delete("api-token").await.unwrap();
        assert!(store.get("api-token").await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn secret_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let store = LocalSecretStore::new(dir.path().to_str().unwrap()).unwrap();
        store.put("ca-private-key", "PRIVATE").await.unwrap();
        let mode = std::fs::metadata(dir.path().join("ca-private-key.pem"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn blob_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().to_str().unwrap()).unwrap();

        store
            .upload("attestation/rate/device-aa.json", b"{}", "application/json")
            .await
            .unwrap();
        assert!(store.exists("attestation/rate/device-aa.json").await.unwrap());
        assert_eq!(
            store
                .download("attestation/rate/device-aa.json")
                .await
                .unwrap()
                .unwrap(),
            b"{}"
        );

        let url = store
            .presigned_url("attestation/rate/device-aa.json", 60)
            .await
            .unwrap()
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(store.presigned_url("missing", 60).await.unwrap().is_none());

        let keys = store.list("attestation/").await.unwrap();
        assert_eq!(keys, vec!["attestation/rate/device-aa.json"]);

        assert!(store.delete("attestation/rate/device-aa.json").await.unwrap());
        assert!(!store.delete("attestation/rate/device-aa.json").await.unwrap());
    }
}
