//! Filesystem-backed blob store with SQLite metadata.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::{Row, SqlitePool};

use super::{BlobError, BlobReader, BlobStore, ObjectInfo};
use crate::events::{BlobEventKind, EventLog, TriggerEvent};

type HmacSha256 = Hmac<Sha256>;

const TMP_DIR: &str = ".incoming";

pub struct LocalBlobStore {
    pool: SqlitePool,
    events: EventLog,
    root: PathBuf,
    bucket: String,
    public_base_url: String,
    signing_key: Vec<u8>,
}

impl LocalBlobStore {
    pub async fn open(
        pool: SqlitePool,
        events: EventLog,
        root: &Path,
        bucket: &str,
        public_base_url: &str,
        signing_key: &[u8],
    ) -> Result<Self, BlobError> {
        tokio::fs::create_dir_all(root.join(TMP_DIR)).await?;
        Ok(Self {
            pool,
            events,
            root: root.to_path_buf(),
            bucket: bucket.to_string(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            signing_key: signing_key.to_vec(),
        })
    }

    fn file_path(&self, path: &str) -> Result<PathBuf, BlobError> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }

    fn signature(&self, path: &str, expires: i64) -> Option<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key).ok()?;
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Some(mac)
    }

    async fn load_info(&self, path: &str) -> Result<Option<ObjectInfo>, BlobError> {
        let row = sqlx::query(
            "SELECT content_type, size, metadata, time_created, updated FROM blob_objects WHERE bucket = ? AND name = ?",
        )
        .bind(&self.bucket)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let metadata: String = row.get("metadata");
        Ok(Some(ObjectInfo {
            bucket: self.bucket.clone(),
            name: path.to_string(),
            content_type: row.get("content_type"),
            size: row.get::<i64, _>("size") as u64,
            metadata: serde_json::from_str(&metadata)?,
            time_created: from_millis(row.get("time_created")),
            updated: from_millis(row.get("updated")),
        }))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(
        &self,
        path: &str,
        mut reader: BlobReader,
        content_type: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<ObjectInfo, BlobError> {
        let target = self.file_path(path)?;
        let staging = self
            .root
            .join(TMP_DIR)
            .join(uuid::Uuid::new_v4().to_string());

        let mut file = tokio::fs::File::create(&staging).await?;
        let size = match tokio::io::copy(&mut reader, &mut file).await {
            Ok(size) => size,
            Err(e) => {
                drop(file);
                tokio::fs::remove_file(&staging).await.ok();
                return Err(e.into());
            }
        };
        file.sync_all().await?;
        drop(file);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&staging, &target).await?;

        let now = Utc::now();
        let time_created = self
            .load_info(path)
            .await?
            .map(|info| info.time_created)
            .unwrap_or(now);
        let info = ObjectInfo {
            bucket: self.bucket.clone(),
            name: path.to_string(),
            content_type: content_type.to_string(),
            size,
            metadata,
            time_created,
            updated: now,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO blob_objects (bucket, name, content_type, size, metadata, time_created, updated)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, name) DO UPDATE SET
                content_type = excluded.content_type,
                size = excluded.size,
                metadata = excluded.metadata,
                updated = excluded.updated
            "#,
        )
        .bind(&info.bucket)
        .bind(&info.name)
        .bind(&info.content_type)
        .bind(info.size as i64)
        .bind(serde_json::to_string(&info.metadata)?)
        .bind(info.time_created.timestamp_millis())
        .bind(info.updated.timestamp_millis())
        .execute(&mut *tx)
        .await?;
        EventLog::record(
            &mut *tx,
            &TriggerEvent::Blob(info.to_event(BlobEventKind::Finalized)),
        )
        .await?;
        tx.commit().await?;
        self.events.notify();

        tracing::debug!(path, size, "object finalized");
        Ok(info)
    }

    async fn download(&self, path: &str) -> Result<BlobReader, BlobError> {
        let file_path = self.file_path(path)?;
        match tokio::fs::File::open(&file_path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, path: &str) -> Result<ObjectInfo, BlobError> {
        validate_path(path)?;
        self.load_info(path)
            .await?
            .ok_or_else(|| BlobError::NotFound(path.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<(), BlobError> {
        let file_path = self.file_path(path)?;
        let info = self.load_info(path).await?;

        match tokio::fs::remove_file(&file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && info.is_some() => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobError::NotFound(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        let Some(info) = info else {
            return Ok(());
        };
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM blob_objects WHERE bucket = ? AND name = ?")
            .bind(&self.bucket)
            .bind(path)
            .execute(&mut *tx)
            .await?;
        let mut gone = info;
        gone.updated = Utc::now();
        EventLog::record(
            &mut *tx,
            &TriggerEvent::Blob(gone.to_event(BlobEventKind::Deleted)),
        )
        .await?;
        tx.commit().await?;
        self.events.notify();
        Ok(())
    }

    async fn update_metadata(
        &self,
        path: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<ObjectInfo, BlobError> {
        let mut info = self.stat(path).await?;
        info.metadata.extend(metadata);
        info.updated = Utc::now();
        sqlx::query("UPDATE blob_objects SET metadata = ?, updated = ? WHERE bucket = ? AND name = ?")
            .bind(serde_json::to_string(&info.metadata)?)
            .bind(info.updated.timestamp_millis())
            .bind(&self.bucket)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(info)
    }

    fn signed_url(&self, path: &str, ttl: Duration) -> String {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = self
            .signature(path, expires)
            .map(|mac| hex::encode(mac.finalize().into_bytes()))
            .unwrap_or_default();
        format!(
            "{}/blobs/{}?expires={}&signature={}",
            self.public_base_url, path, expires, signature
        )
    }

    fn verify_signature(&self, path: &str, expires: i64, signature: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        self.signature(path, expires)
            .is_some_and(|mac| mac.verify_slice(&expected).is_ok())
    }
}

/// Relative path made of non-empty segments, none of which is `.` or `..`.
fn validate_path(path: &str) -> Result<(), BlobError> {
    let valid = !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && !path.starts_with(TMP_DIR)
        && path
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(BlobError::InvalidPath(path.to_string()))
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_blobs;
    use tokio::io::AsyncReadExt;

    fn reader(bytes: &'static [u8]) -> BlobReader {
        Box::pin(std::io::Cursor::new(bytes))
    }

    #[tokio::test]
    async fn test_upload_download_and_finalized_event() {
        let (_dir, events, blobs) = open_blobs().await;
        let info = blobs
            .upload(
                "users/u1/files/a.txt",
                reader(b"hello"),
                "text/plain",
                BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(info.size, 5);

        let mut contents = Vec::new();
        blobs
            .download("users/u1/files/a.txt")
            .await
            .unwrap()
            .read_to_end(&mut contents)
            .await
            .unwrap();
        assert_eq!(contents, b"hello");

        let claimed = events.claim(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        match &claimed[0].event {
            TriggerEvent::Blob(event) => {
                assert_eq!(event.kind, BlobEventKind::Finalized);
                assert_eq!(event.name, "users/u1/files/a.txt");
                assert_eq!(event.content_type, "text/plain");
                assert_eq!(event.size, 5);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_metadata_update_emits_nothing_and_delete_does() {
        let (_dir, events, blobs) = open_blobs().await;
        blobs
            .upload("a/b.png", reader(b"x"), "image/png", BTreeMap::new())
            .await
            .unwrap();
        events.claim(10, Duration::from_secs(30)).await.unwrap();

        let info = blobs
            .update_metadata(
                "a/b.png",
                BTreeMap::from([("thumbnailsGenerated".to_string(), "true".to_string())]),
            )
            .await
            .unwrap();
        assert_eq!(info.metadata["thumbnailsGenerated"], "true");
        assert!(events.claim(10, Duration::from_secs(30)).await.unwrap().is_empty());

        blobs.delete("a/b.png").await.unwrap();
        let claimed = events.claim(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(matches!(
            blobs.download("a/b.png").await,
            Err(BlobError::NotFound(_))
        ));
        assert!(matches!(blobs.delete("a/b.png").await, Err(BlobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_signed_urls() {
        let (_dir, _events, blobs) = open_blobs().await;
        let url = blobs.signed_url("a/b.png", Duration::from_secs(60));
        let parsed = reqwest::Url::parse(&url).unwrap();
        let params: BTreeMap<_, _> = parsed.query_pairs().into_owned().collect();
        let expires: i64 = params["expires"].parse().unwrap();

        assert_eq!(parsed.path(), "/blobs/a/b.png");
        assert!(blobs.verify_signature("a/b.png", expires, &params["signature"]));
        assert!(!blobs.verify_signature("a/c.png", expires, &params["signature"]));
        assert!(!blobs.verify_signature("a/b.png", expires - 3600, &params["signature"]));
    }

    #[test]
    fn test_path_validation() {
        assert!(validate_path("users/u1/images/a.jpg").is_ok());
        assert!(validate_path("../a.jpg").is_err());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("a//b").is_err());
        assert!(validate_path(".incoming/x").is_err());
    }
}
