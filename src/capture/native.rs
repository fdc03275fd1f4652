use crate::capture::permissions::check_permission_detailed;
use crate::capture::{CaptureBackend, CaptureRequest, MediaTrack, TrackKind};
use crate::errors::LinkError;
use async_trait::async_trait;
use nokhwa::{
    pixel_format::RgbFormat,
    query,
    utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType},
    CallbackCamera,
};
use std::collections::HashMap;
use std::sync::Mutex;

struct OpenCamera(CallbackCamera);

// CallbackCamera is only ever touched behind the backend's mutex.
unsafe impl Send for OpenCamera {}

/// Opens the first camera nokhwa can find and keeps its stream running
/// until released.
#[derive(Default)]
pub struct NokhwaBackend {
    open: Mutex<HashMap<String, OpenCamera>>,
}

impl NokhwaBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn open_first_camera(&self) -> Result<MediaTrack, LinkError> {
        check_permission_detailed().ensure_allowed()?;

        let cameras = query(ApiBackend::Auto).map_err(|e| {
            LinkError::CaptureUnavailable(format!("Failed to query cameras: {}", e))
        })?;
        let info = cameras
            .first()
            .ok_or_else(|| LinkError::CaptureUnavailable("No camera found".to_string()))?;

        let requested_format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
        let mut camera = CallbackCamera::new(info.index().clone(), requested_format, |_| {})
            .map_err(|e| classify(format!("Failed to initialize camera: {}", e)))?;
        camera
            .open_stream()
            .map_err(|e| classify(format!("Failed to start stream: {}", e)))?;

        let id = match info.index() {
            CameraIndex::Index(i) => format!("video{}", i),
            CameraIndex::String(s) => s.clone(),
        };
        let track = MediaTrack::new(id.clone(), TrackKind::Video, info.human_name());

        self.open
            .lock()
            .map_err(|_| LinkError::CaptureUnavailable("camera table poisoned".to_string()))?
            .insert(id, OpenCamera(camera));
        Ok(track)
    }
}

/// Platform backends report a denied prompt only through the error text.
fn classify(message: String) -> LinkError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        LinkError::PermissionDenied(message)
    } else {
        LinkError::CaptureUnavailable(message)
    }
}

#[async_trait]
impl CaptureBackend for NokhwaBackend {
    async fn acquire(&self, request: CaptureRequest) -> Result<Vec<MediaTrack>, LinkError> {
        if !request.video {
            return Ok(Vec::new());
        }
        if request.audio {
            log::warn!("Audio capture is not supported by the camera backend; video only");
        }
        let track = self.open_first_camera()?;
        log::info!("Opened camera {} ({})", track.id, track.label);
        Ok(vec![track])
    }

    async fn release(&self, tracks: &[MediaTrack]) {
        let Ok(mut open) = self.open.lock() else {
            return;
        };
        for track in tracks {
            if let Some(OpenCamera(mut camera)) = open.remove(&track.id) {
                if let Err(e) = camera.stop_stream() {
                    log::warn!("Failed to stop camera {}: {}", track.id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_permission_errors() {
        assert!(matches!(
            classify("Failed to start stream: Permission denied (os error 13)".to_string()),
            LinkError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify("Failed to start stream: device busy".to_string()),
            LinkError::CaptureUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_audio_only_request_opens_nothing() {
        let backend = NokhwaBackend::new();
        let tracks = backend
            .acquire(CaptureRequest {
                video: false,
                audio: true,
            })
            .await
            .unwrap();
        assert!(tracks.is_empty());
    }
}
