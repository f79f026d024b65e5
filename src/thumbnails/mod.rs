//! Thumbnail generation for uploaded images.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use tokio::io::AsyncReadExt;

use crate::blob::{content_type_for, BlobError, BlobReader, BlobStore};
use crate::events::BlobEvent;
use crate::models::{split_path, ThumbnailSet, ThumbnailSize};

pub const META_GENERATED: &str = "thumbnailsGenerated";
pub const META_PROCESSED_AT: &str = "processedAt";
pub const META_DERIVED_FROM: &str = "derivedFrom";

const JPEG_QUALITY: u8 = 85;

#[derive(Debug, thiserror::Error)]
pub enum ThumbnailError {
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("failed to encode thumbnail: {0}")]
    Encode(#[from] image::ImageError),
    #[error("thumbnail worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotAnImage,
    AlreadyProcessed,
    Derived,
    SourceMissing,
    Undecodable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThumbnailOutcome {
    Generated(Vec<String>),
    Skipped(SkipReason),
}

#[derive(Clone)]
pub struct ThumbnailPipeline {
    blobs: Arc<dyn BlobStore>,
}

impl ThumbnailPipeline {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Derive the small/medium/large set for a finalized image and flag the source.
    pub async fn on_finalized(&self, event: &BlobEvent) -> Result<ThumbnailOutcome, ThumbnailError> {
        let Some(set) = ThumbnailSet::for_source(&event.name) else {
            return Ok(ThumbnailOutcome::Skipped(SkipReason::NotAnImage));
        };
        if is_derived(&event.name, &event.metadata) {
            return Ok(ThumbnailOutcome::Skipped(SkipReason::Derived));
        }

        // event metadata may predate an earlier run
        let source = match self.blobs.stat(&event.name).await {
            Ok(info) => info,
            Err(BlobError::NotFound(_)) => {
                return Ok(ThumbnailOutcome::Skipped(SkipReason::SourceMissing))
            }
            Err(e) => return Err(e.into()),
        };
        if source.metadata.get(META_GENERATED).map(String::as_str) == Some("true") {
            return Ok(ThumbnailOutcome::Skipped(SkipReason::AlreadyProcessed));
        }

        let mut bytes = Vec::with_capacity(source.size as usize);
        let mut reader = match self.blobs.download(&event.name).await {
            Ok(reader) => reader,
            Err(BlobError::NotFound(_)) => {
                return Ok(ThumbnailOutcome::Skipped(SkipReason::SourceMissing))
            }
            Err(e) => return Err(e.into()),
        };
        reader
            .read_to_end(&mut bytes)
            .await
            .map_err(BlobError::from)?;

        let format = ImageFormat::from_path(&event.name).ok();
        let rendered = tokio::task::spawn_blocking(move || render_all(&bytes, format)).await?;
        let rendered = match rendered {
            Ok(rendered) => rendered,
            Err(RenderError::Decode(e)) => {
                tracing::warn!(path = %event.name, error = %e, "image could not be decoded, skipping thumbnails");
                return Ok(ThumbnailOutcome::Skipped(SkipReason::Undecodable));
            }
            Err(RenderError::Encode(e)) => return Err(e.into()),
        };

        let content_type = if source.content_type.starts_with("image/") {
            source.content_type.clone()
        } else {
            content_type_for(&event.name).to_string()
        };
        let mut written = Vec::with_capacity(set.paths.len());
        for ((size, path), data) in set.paths.iter().zip(rendered) {
            let mut metadata = BTreeMap::new();
            metadata.insert(META_DERIVED_FROM.to_string(), event.name.clone());
            metadata.insert("size".to_string(), size.name().to_string());
            let reader: BlobReader = Box::pin(Cursor::new(data));
            self.blobs
                .upload(path, reader, &content_type, metadata)
                .await?;
            written.push(path.clone());
        }

        let mut flags = BTreeMap::new();
        flags.insert(META_GENERATED.to_string(), "true".to_string());
        flags.insert(META_PROCESSED_AT.to_string(), Utc::now().to_rfc3339());
        self.blobs.update_metadata(&event.name, flags).await?;

        tracing::info!(path = %event.name, count = written.len(), "thumbnails generated");
        Ok(ThumbnailOutcome::Generated(written))
    }

    /// Remove the derived set of a deleted image. Missing thumbnails are fine.
    pub async fn on_deleted(&self, event: &BlobEvent) -> Result<usize, ThumbnailError> {
        let Some(set) = ThumbnailSet::for_source(&event.name) else {
            return Ok(0);
        };
        if is_derived(&event.name, &event.metadata) {
            return Ok(0);
        }
        let mut removed = 0;
        for (_, path) in &set.paths {
            match self.blobs.delete(path).await {
                Ok(()) => removed += 1,
                Err(BlobError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if removed > 0 {
            tracing::info!(path = %event.name, removed, "thumbnails removed");
        }
        Ok(removed)
    }
}

/// Thumbnails themselves never get thumbnails.
fn is_derived(path: &str, metadata: &BTreeMap<String, String>) -> bool {
    metadata.contains_key(META_DERIVED_FROM)
        || split_path(path).is_some_and(|(dir, _, _)| dir == "thumbnails" || dir.ends_with("/thumbnails"))
}

enum RenderError {
    Decode(image::ImageError),
    Encode(image::ImageError),
}

fn render_all(bytes: &[u8], format: Option<ImageFormat>) -> Result<Vec<Vec<u8>>, RenderError> {
    let original = image::load_from_memory(bytes).map_err(RenderError::Decode)?;
    let format = format
        .or_else(|| image::guess_format(bytes).ok())
        .unwrap_or(ImageFormat::Png);
    ThumbnailSize::ALL
        .iter()
        .map(|size| {
            let resized = resize_to_width(&original, size.width());
            encode(&resized, format).map_err(RenderError::Encode)
        })
        .collect()
}

/// Width-pinned resize; height keeps the aspect ratio.
pub fn resize_to_width(image: &DynamicImage, width: u32) -> DynamicImage {
    let height = scaled_height(image.width(), image.height(), width);
    image.resize_exact(width, height, FilterType::Lanczos3)
}

pub fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    if width == 0 {
        return 1;
    }
    let scaled = (height as f64 * target_width as f64 / width as f64).round() as u32;
    scaled.max(1)
}

fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            DynamicImage::ImageRgb8(image.to_rgb8())
                .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY))?;
        }
        ImageFormat::Gif | ImageFormat::WebP => {
            DynamicImage::ImageRgba8(image.to_rgba8()).write_to(&mut Cursor::new(&mut buf), format)?;
        }
        _ => {
            image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BlobEventKind, TriggerEvent};
    use crate::test_support::open_blobs;
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 40, 40])));
        encode(&img, ImageFormat::Jpeg).unwrap()
    }

    async fn read_all(blobs: &dyn BlobStore, path: &str) -> Vec<u8> {
        let mut out = Vec::new();
        blobs
            .download(path)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        out
    }

    #[test]
    fn test_scaled_height_rounds() {
        assert_eq!(scaled_height(1200, 800, 150), 100);
        assert_eq!(scaled_height(1000, 333, 300), 100);
        assert_eq!(scaled_height(5000, 1, 150), 1);
    }

    #[test]
    fn test_derived_paths_are_recognised() {
        let empty = BTreeMap::new();
        assert!(is_derived("users/u1/images/thumbnails/photo_small.jpg", &empty));
        assert!(!is_derived("users/u1/images/photo.jpg", &empty));
        let mut meta = BTreeMap::new();
        meta.insert(META_DERIVED_FROM.to_string(), "x.jpg".to_string());
        assert!(is_derived("users/u1/images/photo.jpg", &meta));
    }

    #[tokio::test]
    async fn test_generates_three_sizes_once() {
        let (_dir, events, blobs) = open_blobs().await;
        let blobs: Arc<dyn BlobStore> = Arc::new(blobs);
        let pipeline = ThumbnailPipeline::new(blobs.clone());

        let info = blobs
            .upload(
                "users/u1/images/photo.jpg",
                Box::pin(Cursor::new(jpeg_bytes(1200, 800))),
                "image/jpeg",
                BTreeMap::new(),
            )
            .await
            .unwrap();
        let event = info.to_event(BlobEventKind::Finalized);

        let outcome = pipeline.on_finalized(&event).await.unwrap();
        let ThumbnailOutcome::Generated(paths) = outcome else {
            panic!("expected thumbnails, got {:?}", outcome);
        };
        assert_eq!(paths.len(), 3);

        for (path, (width, height)) in paths.iter().zip([(150, 100), (300, 200), (600, 400)]) {
            let decoded = image::load_from_memory(&read_all(blobs.as_ref(), path).await).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (width, height));
            let stat = blobs.stat(path).await.unwrap();
            assert_eq!(stat.metadata[META_DERIVED_FROM], "users/u1/images/photo.jpg");
        }
        let source = blobs.stat("users/u1/images/photo.jpg").await.unwrap();
        assert_eq!(source.metadata[META_GENERATED], "true");

        let before = events.backlog().await.unwrap();
        assert_eq!(
            pipeline.on_finalized(&event).await.unwrap(),
            ThumbnailOutcome::Skipped(SkipReason::AlreadyProcessed)
        );
        assert_eq!(events.backlog().await.unwrap(), before);

        // the finalized events of the thumbnails themselves are no-ops
        let claimed = events.claim(10, Duration::from_secs(30)).await.unwrap();
        for envelope in claimed {
            if let TriggerEvent::Blob(blob) = envelope.event {
                if blob.name.contains("/thumbnails/") {
                    assert_eq!(
                        pipeline.on_finalized(&blob).await.unwrap(),
                        ThumbnailOutcome::Skipped(SkipReason::Derived)
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn test_unsupported_and_undecodable_are_acknowledged() {
        let (_dir, _events, blobs) = open_blobs().await;
        let blobs: Arc<dyn BlobStore> = Arc::new(blobs);
        let pipeline = ThumbnailPipeline::new(blobs.clone());

        let pdf = blobs
            .upload(
                "users/u1/files/report.pdf",
                Box::pin(Cursor::new(b"%PDF".to_vec())),
                "application/pdf",
                BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            pipeline
                .on_finalized(&pdf.to_event(BlobEventKind::Finalized))
                .await
                .unwrap(),
            ThumbnailOutcome::Skipped(SkipReason::NotAnImage)
        );

        let broken = blobs
            .upload(
                "users/u1/images/broken.png",
                Box::pin(Cursor::new(b"not really a png".to_vec())),
                "image/png",
                BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            pipeline
                .on_finalized(&broken.to_event(BlobEventKind::Finalized))
                .await
                .unwrap(),
            ThumbnailOutcome::Skipped(SkipReason::Undecodable)
        );
    }

    #[tokio::test]
    async fn test_delete_removes_thumbnails_and_tolerates_missing() {
        let (_dir, _events, blobs) = open_blobs().await;
        let blobs: Arc<dyn BlobStore> = Arc::new(blobs);
        let pipeline = ThumbnailPipeline::new(blobs.clone());

        let info = blobs
            .upload(
                "users/u1/images/photo.jpg",
                Box::pin(Cursor::new(jpeg_bytes(300, 300))),
                "image/jpeg",
                BTreeMap::new(),
            )
            .await
            .unwrap();
        pipeline
            .on_finalized(&info.to_event(BlobEventKind::Finalized))
            .await
            .unwrap();
        blobs.delete("users/u1/images/photo.jpg").await.unwrap();

        let deleted = info.to_event(BlobEventKind::Deleted);
        assert_eq!(pipeline.on_deleted(&deleted).await.unwrap(), 3);
        assert_eq!(pipeline.on_deleted(&deleted).await.unwrap(), 0);
        assert!(matches!(
            blobs.stat("users/u1/images/thumbnails/photo_small.jpg").await,
            Err(BlobError::NotFound(_))
        ));
    }
}
