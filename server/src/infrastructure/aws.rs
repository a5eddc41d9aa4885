//! Cloud repositories backed by DynamoDB, Secrets Manager and S3.
//!
//! The certificate table is keyed by (device_id, serial) with a
//! SerialIndex GSI for whitelist lookups and an ExpirationIndex GSI for
//! expiry sweeps. GSI reads are confirmed with a strongly consistent
//! base-table read so revocations become visible within the bound the
//! gateway depends on.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, GlobalSecondaryIndex, KeySchemaElement,
    KeyType, Projection, ProjectionType, ScalarAttributeType,
};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, BucketVersioningStatus, CreateBucketConfiguration,
    ServerSideEncryption, ServerSideEncryptionByDefault, ServerSideEncryptionConfiguration,
    ServerSideEncryptionRule, VersioningConfiguration,
};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::infrastructure::{BlobStore, CertificateStore, SecretStore};
use crate::models::{Certificate, Platform};

const SERIAL_INDEX: &str = "SerialIndex";
const EXPIRATION_INDEX: &str = "ExpirationIndex";

pub async fn load_sdk_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await
}

fn persistence_err(context: &str, err: impl std::fmt::Display) -> Error {
    Error::PersistenceFailed(format!("{context}: {err}"))
}

/// DynamoDB-backed certificate registry.
pub struct DynamoCertificateStore {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoCertificateStore {
    pub async fn new(config: &SdkConfig, table_name: &str, auto_create: bool) -> Result<Self> {
        let store = Self {
            client: aws_sdk_dynamodb::Client::new(config),
            table_name: table_name.to_string(),
        };
        if auto_create {
            store.ensure_table_exists().await?;
        }
        info!("Initialized DynamoCertificateStore with table={table_name}");
        Ok(store)
    }

    async fn ensure_table_exists(&self) -> Result<()> {
        match self
            .client
            .describe_table()
            .table_name(&self.table_name)
            .send()
            .await
        {
            Ok(_) => {
                debug!("Table {} already exists", self.table_name);
                return Ok(());
            }
            Err(err) => {
                if !err.into_service_error().is_resource_not_found_exception() {
                    return Err(Error::ProvisioningFailed(format!(
                        "describe table {} failed",
                        self.table_name
                    )));
                }
            }
        }

        info!("Creating DynamoDB table: {}", self.table_name);
        let attr = |name: &str| {
            AttributeDefinition::builder()
                .attribute_name(name)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(|e| Error::ProvisioningFailed(e.to_string()))
        };
        let key = |name: &str, key_type: KeyType| {
            KeySchemaElement::builder()
                .attribute_name(name)
                .key_type(key_type)
                .build()
                .map_err(|e| Error::ProvisioningFailed(e.to_string()))
        };
        let all = Projection::builder()
            .projection_type(ProjectionType::All)
            .build();

        let serial_index = GlobalSecondaryIndex::builder()
            .index_name(SERIAL_INDEX)
            .key_schema(key("serial", KeyType::Hash)?)
            .projection(all.clone())
            .build()
            .map_err(|e| Error::ProvisioningFailed(e.to_string()))?;
        let expiration_index = GlobalSecondaryIndex::builder()
            .index_name(EXPIRATION_INDEX)
            .key_schema(key("device_id", KeyType::Hash)?)
            .key_schema(key("expires_at", KeyType::Range)?)
            .projection(all)
            .build()
            .map_err(|e| Error::ProvisioningFailed(e.to_string()))?;

        self.client
            .create_table()
            .table_name(&self.table_name)
            .attribute_definitions(attr("device_id")?)
            .attribute_definitions(attr("serial")?)
            .attribute_definitions(attr("expires_at")?)
            .key_schema(key("device_id", KeyType::Hash)?)
            .key_schema(key("serial", KeyType::Range)?)
            .global_secondary_indexes(serial_index)
            .global_secondary_indexes(expiration_index)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
            .map_err(|e| {
                Error::ProvisioningFailed(format!(
                    "create table {} failed: {e}",
                    self.table_name
                ))
            })?;
        Ok(())
    }

    fn to_item(certificate: &Certificate) -> HashMap<String, AttributeValue> {
        let mut item = HashMap::from([
            (
                "device_id".to_string(),
                AttributeValue::S(certificate.device_id.clone()),
            ),
            (
                "serial".to_string(),
                AttributeValue::S(certificate.serial.clone()),
            ),
            (
                "platform".to_string(),
                AttributeValue::S(certificate.platform.to_string()),
            ),
            (
                "issued_at".to_string(),
                AttributeValue::S(certificate.issued_at.to_rfc3339()),
            ),
            (
                "expires_at".to_string(),
                AttributeValue::S(certificate.expires_at.to_rfc3339()),
            ),
            (
                "certificate_pem".to_string(),
                AttributeValue::S(certificate.certificate_pem.clone()),
            ),
            (
                "revoked".to_string(),
                AttributeValue::Bool(certificate.revoked),
            ),
        ]);
        if let Some(revoked_at) = certificate.revoked_at {
            item.insert(
                "revoked_at".to_string(),
                AttributeValue::S(revoked_at.to_rfc3339()),
            );
        }
        if let Some(reason) = &certificate.revocation_reason {
            item.insert(
                "revocation_reason".to_string(),
                AttributeValue::S(reason.clone()),
            );
        }
        item
    }

    fn from_item(item: &HashMap<String, AttributeValue>) -> Result<Certificate> {
        let text = |name: &str| -> Result<String> {
            item.get(name)
                .and_then(|v| v.as_s().ok())
                .cloned()
                .ok_or_else(|| persistence_err("decode item", format!("missing field {name}")))
        };
        let timestamp = |name: &str| -> Result<DateTime<Utc>> {
            DateTime::parse_from_rfc3339(&text(name)?)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| persistence_err("decode timestamp", e))
        };
        let platform: Platform = text("platform")?.parse()?;
        Ok(Certificate {
            device_id: text("device_id")?,
            serial: text("serial")?,
            platform,
            issued_at: timestamp("issued_at")?,
            expires_at: timestamp("expires_at")?,
            certificate_pem: text("certificate_pem")?,
            revoked: item
                .get("revoked")
                .and_then(|v| v.as_bool().ok())
                .copied()
                .unwrap_or(false),
            revoked_at: timestamp("revoked_at").ok(),
            revocation_reason: text("revocation_reason").ok(),
        })
    }

    /// Strongly consistent read of a single record.
    async fn get_item(&self, device_id: &str, serial: &str) -> Result<Option<Certificate>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("device_id", AttributeValue::S(device_id.to_string()))
            .key("serial", AttributeValue::S(serial.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| persistence_err("get item", e))?;
        output.item().map(Self::from_item).transpose()
    }

    async fn scan_all(&self) -> Result<Vec<Certificate>> {
        let mut certificates = Vec::new();
        let mut start_key = None;
        loop {
            let output = self
                .client
                .scan()
                .table_name(&self.table_name)
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|e| persistence_err("scan table", e))?;
            for item in output.items() {
                certificates.push(Self::from_item(item)?);
            }
            start_key = output.last_evaluated_key().cloned();
            if start_key.is_none() {
                break;
            }
        }
        Ok(certificates)
    }
}

#[async_trait]
impl CertificateStore for DynamoCertificateStore {
    async fn save(&self, certificate: &Certificate) -> Result<()> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(Self::to_item(certificate)))
            .send()
            .await
            .map_err(|e| persistence_err("save certificate", e))?;
        debug!(
            "Saved certificate: device={}, serial={}",
            certificate.device_id, certificate.serial
        );
        Ok(())
    }

    async fn get_latest(&self, device_id: &str) -> Result<Option<Certificate>> {
        // Serials are random, so the sort key is no issuance order; the
        // issue timestamp is the ground truth.
        let output = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression("device_id = :device_id")
            .expression_attribute_values(":device_id", AttributeValue::S(device_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| persistence_err("query device", e))?;

        let mut latest: Option<Certificate> = None;
        for item in output.items() {
            let cert = Self::from_item(item)?;
            if latest
                .as_ref()
                .map(|current| cert.issued_at > current.issued_at)
                .unwrap_or(true)
            {
                latest = Some(cert);
            }
        }
        Ok(latest)
    }

    async fn get_by_serial(&self, serial: &str) -> Result<Option<Certificate>> {
        let output = self
            .client
            .query()
            .table_name(&self.table_name)
            .index_name(SERIAL_INDEX)
            .key_condition_expression("serial = :serial")
            .expression_attribute_values(":serial", AttributeValue::S(serial.to_uppercase()))
            .limit(1)
            .send()
            .await
            .map_err(|e| persistence_err("query serial index", e))?;

        let Some(item) = output.items().first() else {
            return Ok(None);
        };
        let indexed = Self::from_item(item)?;
        // Confirm through the base table; the GSI read may lag a
        // just-applied revocation.
        self.get_item(&indexed.device_id, &indexed.serial).await
    }

    async fn is_whitelisted(&self, serial: &str) -> Result<bool> {
        Ok(self
            .get_by_serial(serial)
            .await?
            .map(|cert| cert.is_valid_at(Utc::now()))
            .unwrap_or(false))
    }

    async fn revoke(&self, device_id: &str, reason: Option<&str>) -> Result<bool> {
        let Some(mut cert) = self.get_latest(device_id).await? else {
            warn!("Cannot revoke non-existent certificate for {device_id}");
            return Ok(false);
        };
        cert.revoked = true;
        cert.revoked_at = Some(Utc::now());
        cert.revocation_reason = Some(reason.unwrap_or("Manual revocation").to_string());
        self.save(&cert).await?;
        info!("Revoked certificate: device={device_id}, reason={reason:?}");
        Ok(true)
    }

    async fn list_expiring(&self, days: i64) -> Result<Vec<Certificate>> {
        let threshold = Utc::now() + Duration::days(days);
        Ok(self
            .scan_all()
            .await?
            .into_iter()
            .filter(|cert| !cert.revoked && cert.expires_at <= threshold)
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Certificate>> {
        self.scan_all().await
    }
}

/// Secrets Manager store. Secrets are versioned and encrypted at rest;
/// all names share a configurable prefix.
pub struct SecretsManagerStore {
    client: aws_sdk_secretsmanager::Client,
    prefix: String,
}

impl SecretsManagerStore {
    pub fn new(config: &SdkConfig, prefix: &str) -> Self {
        info!("Initialized SecretsManagerStore with prefix={prefix}");
        Self {
            client: aws_sdk_secretsmanager::Client::new(config),
            prefix: prefix.to_string(),
        }
    }

    fn secret_name(&self, key: &str) -> String {
        format!("{}/{key}", self.prefix)
    }
}

#[async_trait]
impl SecretStore for SecretsManagerStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self
            .client
            .get_secret_value()
            .secret_id(self.secret_name(key))
            .send()
            .await
        {
            Ok(output) => Ok(output.secret_string().map(str::to_string)),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_resource_not_found_exception() {
                    Ok(None)
                } else {
                    Err(persistence_err("get secret", service_err))
                }
            }
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let name = self.secret_name(key);
        match self
            .client
            .create_secret()
            .name(&name)
            .secret_string(value)
            .send()
            .await
        {
            Ok(_) => {
                info!("Created secret: {name}");
                Ok(())
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_resource_exists_exception() {
                    self.client
                        .put_secret_value()
                        .secret_id(&name)
                        .secret_string(value)
                        .send()
                        .await
                        .map_err(|e| persistence_err("update secret", e))?;
                    info!("Updated secret: {name}");
                    Ok(())
                } else {
                    Err(persistence_err("create secret", service_err))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self
            .client
            .delete_secret()
            .secret_id(self.secret_name(key))
            .force_delete_without_recovery(true)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_resource_not_found_exception() {
                    Ok(())
                } else {
                    Err(persistence_err("delete secret", service_err))
                }
            }
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut next_token = None;
        let prefix = format!("{}/", self.prefix);
        loop {
            let output = self
                .client
                .list_secrets()
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| persistence_err("list secrets", e))?;
            for secret in output.secret_list() {
                if let Some(name) = secret.name() {
                    if let Some(key) = name.strip_prefix(&prefix) {
                        keys.push(key.to_string());
                    }
                }
            }
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(keys)
    }
}

/// S3-backed blob store with server-side encryption and presigned GETs.
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub async fn new(
        config: &SdkConfig,
        bucket: &str,
        region: &str,
        auto_create: bool,
    ) -> Result<Self> {
        let store = Self {
            client: aws_sdk_s3::Client::new(config),
            bucket: bucket.to_string(),
        };
        if auto_create {
            store.ensure_bucket_exists(region).await?;
        }
        info!("Initialized S3BlobStore with bucket={bucket}");
        Ok(store)
    }

    async fn ensure_bucket_exists(&self, region: &str) -> Result<()> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            debug!("Bucket {} already exists", self.bucket);
            return Ok(());
        }

        info!("Creating S3 bucket: {}", self.bucket);
        let mut create = self.client.create_bucket().bucket(&self.bucket);
        // us-east-1 rejects an explicit location constraint.
        if region != "us-east-1" {
            create = create.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        create
            .send()
            .await
            .map_err(|e| Error::ProvisioningFailed(format!("create bucket failed: {e}")))?;

        self.client
            .put_bucket_encryption()
            .bucket(&self.bucket)
            .server_side_encryption_configuration(
                ServerSideEncryptionConfiguration::builder()
                    .rules(
                        ServerSideEncryptionRule::builder()
                            .apply_server_side_encryption_by_default(
                                ServerSideEncryptionByDefault::builder()
                                    .sse_algorithm(ServerSideEncryption::Aes256)
                                    .build()
                                    .map_err(|e| Error::ProvisioningFailed(e.to_string()))?,
                            )
                            .build(),
                    )
                    .build()
                    .map_err(|e| Error::ProvisioningFailed(e.to_string()))?,
            )
            .send()
            .await
            .map_err(|e| Error::ProvisioningFailed(format!("bucket encryption failed: {e}")))?;

        self.client
            .put_bucket_versioning()
            .bucket(&self.bucket)
            .versioning_configuration(
                VersioningConfiguration::builder()
                    .status(BucketVersioningStatus::Enabled)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Error::ProvisioningFailed(format!("bucket versioning failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn upload(&self, key: &str, content: &[u8], content_type: &str) -> Result<String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(content.to_vec()))
            .content_type(content_type)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .send()
            .await
            .map_err(|e| persistence_err("upload object", e))?;
        Ok(format!("s3://{}/{key}", self.bucket))
    }

    async fn download(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| persistence_err("read object body", e))?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(persistence_err("download object", service_err))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        if !self.exists(key).await? {
            return Ok(false);
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| persistence_err("delete object", e))?;
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(persistence_err("head object", service_err))
                }
            }
        }
    }

    async fn presigned_url(&self, key: &str, ttl_seconds: u64) -> Result<Option<String>> {
        if !self.exists(key).await? {
            return Ok(None);
        }
        let presigning = PresigningConfig::expires_in(StdDuration::from_secs(ttl_seconds))
            .map_err(|e| Error::Internal(format!("presigning config: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| persistence_err("presign object", e))?;
        Ok(Some(request.uri().to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation)
                .send()
                .await
                .map_err(|e| persistence_err("list objects", e))?;
            for object in output.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            continuation = output.next_continuation_token().map(str::to_string);
            if continuation.is_none() {
                break;
            }
        }
        Ok(keys)
    }
}
