//! Blob storage: the object-store seam plus its local filesystem implementation.

mod local;

pub use local::*;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

use crate::db::StoreError;
use crate::events::{BlobEvent, BlobEventKind};

/// Streamed object contents.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("object {0} not found")]
    NotFound(String),
    #[error("invalid object path {0}")]
    InvalidPath(String),
    #[error("blob io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("metadata encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<sqlx::Error> for BlobError {
    fn from(err: sqlx::Error) -> Self {
        BlobError::Store(StoreError::Database(err))
    }
}

/// Stored object attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub bucket: String,
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub metadata: BTreeMap<String, String>,
    pub time_created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl ObjectInfo {
    pub fn to_event(&self, kind: BlobEventKind) -> BlobEvent {
        BlobEvent {
            kind,
            bucket: self.bucket.clone(),
            name: self.name.clone(),
            content_type: self.content_type.clone(),
            size: self.size,
            metadata: self.metadata.clone(),
            time_created: self.time_created,
            updated: self.updated,
        }
    }
}

/// Object store operations. Finalize/delete events go to the outbox.
#[async_trait]
pub trait BlobStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Write an object. The finalized event is published only after the write completes.
    async fn upload(
        &self,
        path: &str,
        reader: BlobReader,
        content_type: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<ObjectInfo, BlobError>;

    async fn download(&self, path: &str) -> Result<BlobReader, BlobError>;

    async fn stat(&self, path: &str) -> Result<ObjectInfo, BlobError>;

    async fn delete(&self, path: &str) -> Result<(), BlobError>;

    /// Merge custom metadata keys. Emits no event.
    async fn update_metadata(
        &self,
        path: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<ObjectInfo, BlobError>;

    /// Time-limited download URL.
    fn signed_url(&self, path: &str, ttl: Duration) -> String;

    fn verify_signature(&self, path: &str, expires: i64, signature: &str) -> bool;
}

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn user_image_path(user_id: &str, file_name: &str) -> String {
    format!("users/{}/images/{}", user_id, sanitize_file_name(file_name))
}

pub fn user_file_path(user_id: &str, file_name: &str) -> String {
    format!("users/{}/files/{}", user_id, sanitize_file_name(file_name))
}

/// Guess a content type from the extension.
pub fn content_type_for(path: &str) -> &'static str {
    let ext = path
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("my photo (1).jpg"), "my_photo__1_.jpg");
        assert_eq!(sanitize_file_name("../etc/passwd"), ".._etc_passwd");
        assert_eq!(user_image_path("u1", "a b.png"), "users/u1/images/a_b.png");
        assert_eq!(user_file_path("u1", "r.pdf"), "users/u1/files/r.pdf");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("x/photo.JPG"), "image/jpeg");
        assert_eq!(content_type_for("x/blob"), "application/octet-stream");
    }
}
