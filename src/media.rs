//! Creative asset resolution against public blob storage.

use crate::config::MediaConfig;

/// How a resolved asset should be displayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn of(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        if path.to_ascii_lowercase().ends_with(".mp4") {
            MediaKind::Video
        } else {
            MediaKind::Image
        }
    }
}

pub trait MediaResolver: Send + Sync {
    /// Public URL for a stored asset, `None` when the reference is empty.
    fn public_url(&self, media_ref: &str) -> Option<String>;
}

/// Publicly readable bucket served under `/storage/v1/object/public/`
#[derive(Debug, Clone)]
pub struct PublicBucket {
    base_url: String,
    bucket: String,
}

impl PublicBucket {
    pub fn new(base_url: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bucket: bucket.into(),
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(config.public_base_url.clone(), config.bucket.clone())
    }
}

impl MediaResolver for PublicBucket {
    fn public_url(&self, media_ref: &str) -> Option<String> {
        let media_ref = media_ref.trim().trim_start_matches('/');
        if media_ref.is_empty() {
            return None;
        }
        Some(format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.bucket,
            media_ref
        ))
    }
}
