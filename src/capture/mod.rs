//! Local capture device access and its shared, reference-counted handle.

pub mod device;
#[cfg(feature = "native-camera")]
pub mod native;
pub mod permissions;

use crate::config::CaptureConfig;
use crate::errors::LinkError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use device::{CaptureDeviceHandle, CaptureLease};
#[cfg(feature = "native-camera")]
pub use native::NokhwaBackend;
pub use permissions::{check_permission, check_permission_detailed, PermissionInfo, PermissionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Video,
    Audio,
}

/// One track produced by a capture device. Opaque to the session layer
/// beyond its id and kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
        }
    }
}

/// What to open on the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub video: bool,
    pub audio: bool,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            video: true,
            audio: false,
        }
    }
}

impl From<&CaptureConfig> for CaptureRequest {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            video: config.video,
            audio: config.audio,
        }
    }
}

/// Platform capture API. `acquire` may block on a user permission prompt;
/// callers bound it with a timeout.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn acquire(&self, request: CaptureRequest) -> Result<Vec<MediaTrack>, LinkError>;

    async fn release(&self, tracks: &[MediaTrack]);
}

/// Backend for hosts without a camera
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

#[async_trait]
impl CaptureBackend for NoCapture {
    async fn acquire(&self, _request: CaptureRequest) -> Result<Vec<MediaTrack>, LinkError> {
        Err(LinkError::CaptureUnavailable(
            "no capture device on this host".to_string(),
        ))
    }

    async fn release(&self, _tracks: &[MediaTrack]) {}
}
