use crate::capture::{CaptureBackend, CaptureRequest, MediaTrack};
use crate::errors::LinkError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tracks opened on the local capture device, shared by at most
/// `max_consumers` leases within this process.
///
/// The underlying device is released exactly once: when the last
/// outstanding lease is released, or when [`CaptureDeviceHandle::release`]
/// forces it.
#[derive(Clone)]
pub struct CaptureDeviceHandle {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    backend: Arc<dyn CaptureBackend>,
    tracks: Vec<MediaTrack>,
    max_consumers: usize,
    consumers: Mutex<usize>,
    released: AtomicBool,
}

impl CaptureDeviceHandle {
    /// Open the device, giving up after `wait` so a pending permission
    /// prompt cannot stall the caller indefinitely.
    pub async fn acquire(
        backend: Arc<dyn CaptureBackend>,
        request: CaptureRequest,
        max_consumers: usize,
        wait: Duration,
    ) -> Result<Self, LinkError> {
        let tracks = match tokio::time::timeout(wait, backend.acquire(request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(LinkError::CaptureUnavailable(format!(
                    "no response from capture device within {:?}",
                    wait
                )))
            }
        };

        log::info!("Capture device opened with {} track(s)", tracks.len());
        Ok(Self {
            inner: Arc::new(DeviceInner {
                backend,
                tracks,
                max_consumers: max_consumers.max(1),
                consumers: Mutex::new(0),
                released: AtomicBool::new(false),
            }),
        })
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.inner.tracks
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.consumers.lock().map(|c| *c).unwrap_or(0)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Attach one more consumer (outbound session, local preview).
    pub fn lease(&self) -> Result<CaptureLease, LinkError> {
        if self.is_released() {
            return Err(LinkError::CaptureUnavailable(
                "capture device already released".to_string(),
            ));
        }

        let mut consumers = self
            .inner
            .consumers
            .lock()
            .map_err(|_| LinkError::CaptureUnavailable("capture handle poisoned".to_string()))?;
        if *consumers >= self.inner.max_consumers {
            return Err(LinkError::CaptureUnavailable(format!(
                "capture device already has {} consumer(s)",
                consumers
            )));
        }
        *consumers += 1;
        log::debug!("Capture lease taken ({} active)", *consumers);

        Ok(CaptureLease {
            handle: self.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// Release the device regardless of outstanding leases. No-op when
    /// already released.
    pub async fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.backend.release(&self.inner.tracks).await;
        log::info!("Capture device released");
    }

    /// Returns true when this was the last consumer.
    fn detach(&self) -> bool {
        match self.inner.consumers.lock() {
            Ok(mut consumers) => {
                *consumers = consumers.saturating_sub(1);
                log::debug!("Capture lease returned ({} active)", *consumers);
                *consumers == 0
            }
            Err(_) => true,
        }
    }
}

impl std::fmt::Debug for CaptureDeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureDeviceHandle")
            .field("tracks", &self.inner.tracks.len())
            .field("consumers", &self.consumer_count())
            .field("released", &self.is_released())
            .finish()
    }
}

/// One consumer's claim on a [`CaptureDeviceHandle`]
pub struct CaptureLease {
    handle: CaptureDeviceHandle,
    released: AtomicBool,
}

impl CaptureLease {
    pub fn tracks(&self) -> &[MediaTrack] {
        self.handle.tracks()
    }

    pub fn handle(&self) -> &CaptureDeviceHandle {
        &self.handle
    }

    /// Give the lease back; the device closes when this was the last one.
    /// Calling it again does nothing.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.handle.detach() {
            self.handle.release().await;
        }
    }
}

impl Drop for CaptureLease {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.handle.detach() && !self.handle.is_released() {
            let handle = self.handle.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { handle.release().await });
                }
                Err(_) => log::warn!("Capture lease dropped outside a runtime; device left open"),
            }
        }
    }
}
