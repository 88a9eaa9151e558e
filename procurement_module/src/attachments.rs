//! Moves inbound attachments into object storage and records where they went.
//!
//! Configuration:
//! - `SUPABASE_PROJECT_URL` / `SUPABASE_SECRET_KEY`: storage credentials
//! - `ATTACHMENTS_BUCKET`: bucket name (default: `proposal-attachments`)
//! - `ATTACHMENTS_PUBLIC`: public-read objects (default: true)
//! - `ATTACHMENTS_CDN_URL`: optional base URL used for stored links
//! - `STORAGE_TIMEOUT_SECS`: per-upload timeout (default: 30)

use std::sync::{Arc, LazyLock, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::inbound_email::InboundAttachment;
use crate::models::AttachmentMeta;

pub const DEFAULT_BUCKET: &str = "proposal-attachments";
const KEY_PREFIX: &str = "inbound";

static UNSAFE_FILENAME_CHARS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[\s/\\]+").ok());

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object storage is not configured")]
    NotConfigured,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upload timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectAcl {
    PublicRead,
    Private,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Stable link for a stored object.
    fn object_url(&self, key: &str) -> String;

    /// Time-limited link for a stored object.
    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String, StorageError>;
}

#[derive(Debug, Clone)]
pub struct SupabaseStorageConfig {
    pub project_url: String,
    pub service_key: String,
    pub bucket: String,
    pub acl: ObjectAcl,
    pub timeout: Duration,
}

/// Supabase Storage over its REST API.
pub struct SupabaseObjectStorage {
    config: SupabaseStorageConfig,
    client: Client,
    bucket_ready: OnceLock<()>,
}

impl SupabaseObjectStorage {
    pub fn new(config: SupabaseStorageConfig) -> Result<Self, StorageError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            config: SupabaseStorageConfig {
                project_url: config.project_url.trim_end_matches('/').to_string(),
                ..config
            },
            client,
            bucket_ready: OnceLock::new(),
        })
    }

    fn base(&self) -> &str {
        &self.config.project_url
    }

    async fn ensure_bucket_ready(&self) -> Result<(), StorageError> {
        if self.bucket_ready.get().is_some() {
            return Ok(());
        }

        let url = format!("{}/storage/v1/bucket", self.base());
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.service_key)
            .header("apikey", &self.config.service_key)
            .json(&json!({
                "id": self.config.bucket,
                "name": self.config.bucket,
                "public": self.config.acl == ObjectAcl::PublicRead
            }))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() || status == StatusCode::CONFLICT => {
                let _ = self.bucket_ready.set(());
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                // Supabase reports an existing bucket as 400 with a Duplicate error body.
                if body.contains("Duplicate") || body.contains("already exists") {
                    let _ = self.bucket_ready.set(());
                    return Ok(());
                }
                Err(StorageError::Storage(format!(
                    "bucket create failed (status {}): {}",
                    status, body
                )))
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for SupabaseObjectStorage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        self.ensure_bucket_ready().await?;

        let url = format!(
            "{}/storage/v1/object/{}/{}",
            self.base(),
            self.config.bucket,
            encode_key(key)
        );
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.service_key)
            .header("apikey", &self.config.service_key)
            .header("x-upsert", "true")
            .header(
                "content-type",
                content_type.unwrap_or("application/octet-stream"),
            )
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Storage(format!(
                "upload failed (status {}): {}",
                status, body
            )));
        }
        Ok(())
    }

    fn object_url(&self, key: &str) -> String {
        let visibility = match self.config.acl {
            ObjectAcl::PublicRead => "public",
            ObjectAcl::Private => "authenticated",
        };
        format!(
            "{}/storage/v1/object/{}/{}/{}",
            self.base(),
            visibility,
            self.config.bucket,
            encode_key(key)
        )
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        let url = format!(
            "{}/storage/v1/object/sign/{}/{}",
            self.base(),
            self.config.bucket,
            encode_key(key)
        );
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.service_key)
            .header("apikey", &self.config.service_key)
            .json(&json!({ "expiresIn": expires_in.as_secs() }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Storage(format!(
                "sign failed (status {}): {}",
                status, body
            )));
        }

        let signed: SignedUrlResponse = response.json().await?;
        Ok(format!("{}/storage/v1{}", self.base(), signed.signed_url))
    }
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Storage key for an inbound file: `inbound/<uuid>__<filename>`.
pub fn build_storage_key(filename: &str) -> String {
    let id = Uuid::new_v4();
    let cleaned = match UNSAFE_FILENAME_CHARS.as_ref() {
        Some(pattern) => pattern.replace_all(filename.trim(), "_").into_owned(),
        None => filename.trim().replace(char::is_whitespace, "_"),
    };
    let cleaned = if cleaned.is_empty() {
        format!("attachment-{}", id.simple())
    } else {
        cleaned
    };
    format!("{}/{}__{}", KEY_PREFIX, id, cleaned)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub storage_key: String,
    pub url: String,
    pub size: u64,
}

#[derive(Clone)]
pub struct AttachmentRelocator {
    storage: Option<Arc<dyn ObjectStorage>>,
    acl: ObjectAcl,
    cdn_base_url: Option<String>,
    timeout: Duration,
}

impl AttachmentRelocator {
    pub fn new(
        storage: Option<Arc<dyn ObjectStorage>>,
        acl: ObjectAcl,
        cdn_base_url: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            acl,
            cdn_base_url: cdn_base_url
                .map(|url| url.trim().trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            timeout,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.storage.is_some()
    }

    /// Uploads one file and returns its key, link and size.
    pub async fn relocate(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        content_type: Option<&str>,
    ) -> Result<StoredObject, StorageError> {
        let storage = self.storage.as_ref().ok_or(StorageError::NotConfigured)?;
        let key = build_storage_key(filename);
        let size = bytes.len() as u64;

        tokio::time::timeout(self.timeout, storage.put_object(&key, bytes, content_type))
            .await
            .map_err(|_| StorageError::Timeout(self.timeout))??;

        let url = match &self.cdn_base_url {
            Some(cdn) => format!("{}/{}", cdn, key),
            None => storage.object_url(&key),
        };
        debug!("attachment stored key={} size={}", key, size);
        Ok(StoredObject {
            storage_key: key,
            url,
            size,
        })
    }

    /// Link a client can fetch: the stored URL for public objects, a signed
    /// one for private objects.
    pub async fn download_url(
        &self,
        attachment: &AttachmentMeta,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        match (&self.storage, self.acl) {
            (Some(storage), ObjectAcl::Private) => {
                storage.signed_url(&attachment.storage_key, expires_in).await
            }
            _ => Ok(attachment.url.clone()),
        }
    }

    /// Uploads attachments one at a time, skipping any that fail.
    pub async fn relocate_all(&self, attachments: &[InboundAttachment]) -> Vec<AttachmentMeta> {
        if attachments.is_empty() {
            return Vec::new();
        }
        if !self.is_configured() {
            warn!(
                "object storage not configured; dropping {} attachment(s)",
                attachments.len()
            );
            return Vec::new();
        }

        let mut stored = Vec::with_capacity(attachments.len());
        for (index, attachment) in attachments.iter().enumerate() {
            let filename = attachment
                .filename
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("attachment-{}", index + 1));
            match self
                .relocate(
                    attachment.bytes.clone(),
                    &filename,
                    attachment.content_type.as_deref(),
                )
                .await
            {
                Ok(object) => stored.push(AttachmentMeta {
                    filename,
                    storage_key: object.storage_key,
                    url: object.url,
                    size: object.size,
                    content_type: attachment.content_type.clone(),
                }),
                Err(err) => warn!("attachment upload failed filename={}: {}", filename, err),
            }
        }
        info!(
            "attachments relocated stored={} skipped={}",
            stored.len(),
            attachments.len() - stored.len()
        );
        stored
    }
}
