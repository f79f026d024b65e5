//! Blob-related models: thumbnail sets and temporary uploads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Image extensions eligible for thumbnails.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailSize {
    Small,
    Medium,
    Large,
}

impl ThumbnailSize {
    pub const ALL: [ThumbnailSize; 3] = [
        ThumbnailSize::Small,
        ThumbnailSize::Medium,
        ThumbnailSize::Large,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ThumbnailSize::Small => "small",
            ThumbnailSize::Medium => "medium",
            ThumbnailSize::Large => "large",
        }
    }

    /// Target width in pixels.
    pub fn width(&self) -> u32 {
        match self {
            ThumbnailSize::Small => 150,
            ThumbnailSize::Medium => 300,
            ThumbnailSize::Large => 600,
        }
    }
}

/// Split a blob path into (directory, stem, lowercase extension).
pub fn split_path(path: &str) -> Option<(&str, &str, String)> {
    let (dir, file) = match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    };
    let dot = file.rfind('.')?;
    let (stem, ext) = (&file[..dot], &file[dot + 1..]);
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some((dir, stem, ext.to_ascii_lowercase()))
}

pub fn is_image_path(path: &str) -> bool {
    split_path(path).is_some_and(|(_, _, ext)| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Derived thumbnail paths for a source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailSet {
    pub source: String,
    pub paths: Vec<(ThumbnailSize, String)>,
}

impl ThumbnailSet {
    /// `dir/thumbnails/<name>_<size>.<ext>` for every size, or `None` for non-image paths.
    pub fn for_source(source: &str) -> Option<Self> {
        let (dir, stem, ext) = split_path(source)?;
        if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            return None;
        }
        let original_ext = &source[source.len() - ext.len()..];
        let prefix = if dir.is_empty() {
            "thumbnails".to_string()
        } else {
            format!("{}/thumbnails", dir)
        };
        let paths = ThumbnailSize::ALL
            .iter()
            .map(|size| {
                (
                    *size,
                    format!("{}/{}_{}.{}", prefix, stem, size.name(), original_ext),
                )
            })
            .collect();
        Some(Self {
            source: source.to_string(),
            paths,
        })
    }
}

/// Upload scheduled for removal by the daily job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TempFile {
    #[serde(default)]
    pub id: String,
    pub path: String,
    pub user_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_paths() {
        let set = ThumbnailSet::for_source("users/u1/images/photo.jpg").unwrap();
        let paths: Vec<_> = set.paths.iter().map(|(_, p)| p.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "users/u1/images/thumbnails/photo_small.jpg",
                "users/u1/images/thumbnails/photo_medium.jpg",
                "users/u1/images/thumbnails/photo_large.jpg",
            ]
        );
    }

    #[test]
    fn test_non_images_have_no_thumbnails() {
        assert!(ThumbnailSet::for_source("users/u1/files/report.pdf").is_none());
        assert!(ThumbnailSet::for_source("users/u1/files/noext").is_none());
        assert!(is_image_path("a/B.PNG"));
    }
}
