//! Capture backend with a fixed answer.

use crate::capture::{CaptureBackend, CaptureRequest, MediaTrack, TrackKind};
use crate::errors::LinkError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Grant this many video tracks
    Grant(usize),
    Deny,
    Unavailable,
    /// Never answer, like an unattended permission prompt
    Hang,
}

#[derive(Debug)]
pub struct StaticCapture {
    mode: CaptureMode,
    acquisitions: AtomicUsize,
    releases: AtomicUsize,
}

impl StaticCapture {
    pub fn new(mode: CaptureMode) -> Self {
        Self {
            mode,
            acquisitions: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    pub fn granting() -> Self {
        Self::new(CaptureMode::Grant(1))
    }

    pub fn denying() -> Self {
        Self::new(CaptureMode::Deny)
    }

    pub fn acquire_count(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureBackend for StaticCapture {
    async fn acquire(&self, request: CaptureRequest) -> Result<Vec<MediaTrack>, LinkError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            CaptureMode::Grant(count) if request.video => Ok((0..count)
                .map(|i| MediaTrack::new(format!("camera{}", i), TrackKind::Video, "scripted camera"))
                .collect()),
            CaptureMode::Grant(_) => Ok(Vec::new()),
            CaptureMode::Deny => Err(LinkError::PermissionDenied(
                "camera access denied by user".to_string(),
            )),
            CaptureMode::Unavailable => Err(LinkError::CaptureUnavailable(
                "no camera attached".to_string(),
            )),
            CaptureMode::Hang => std::future::pending().await,
        }
    }

    async fn release(&self, _tracks: &[MediaTrack]) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}
