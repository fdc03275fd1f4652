//! jobcam: job matching with a live verification camera
//!
//! A requester posts a job, a fulfiller accepts it, and the two sides open a
//! direct peer-to-peer video link bootstrapped over a per-job signaling
//! channel.
//!
//! # Features
//! - Job lifecycle with conditional (compare-and-swap) transitions
//! - Per-job signaling relay with self-echo filtering
//! - Offer/answer negotiation with trickle ICE and candidate buffering
//! - Reference-counted sharing of the local camera
//! - Optional Tauri plugin (`tauri` feature) and native camera (`native-camera`)
//!
//! # Usage
//! ```rust,ignore
//! use jobcam::{JobCoordinator, LinkConfig, MemoryJobStore, MemoryRelay, NoCapture, WebRtcTransport};
//! use std::sync::Arc;
//!
//! let coordinator = Arc::new(JobCoordinator::new(
//!     Arc::new(MemoryJobStore::new()),
//!     Arc::new(MemoryRelay::new()),
//!     Arc::new(WebRtcTransport::new()),
//!     Arc::new(NoCapture),
//!     LinkConfig::load_or_default(),
//! ));
//!
//! tauri::Builder::default()
//!     .plugin(jobcam::init(coordinator))
//!     .run(tauri::generate_context!())
//!     .expect("error while running tauri application");
//! ```
pub mod capture;
#[cfg(feature = "tauri")]
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod jobs;
pub mod media;
pub mod session;
pub mod signaling;
pub mod types;

// Test doubles - scripted transport and capture for offline runs
pub mod testing;

pub use capture::{CaptureBackend, CaptureDeviceHandle, CaptureLease, MediaTrack, NoCapture};
pub use config::LinkConfig;
pub use coordinator::{AcceptedJob, JobCoordinator};
pub use errors::LinkError;
pub use jobs::{JobBoard, JobStateMachine, JobStore, MemoryJobStore};
pub use media::{MediaKind, MediaResolver, PublicBucket};
pub use session::{PeerSession, SessionEvent, SessionState, SessionStats, WebRtcTransport};
pub use signaling::{MemoryRelay, NegotiationMessage, Role, SignalingChannel};
pub use types::{Job, JobId, JobStatus, NewJob, ParticipantId, ParticipantKind};

#[cfg(feature = "tauri")]
use std::sync::Arc;
#[cfg(feature = "tauri")]
use tauri::{
    plugin::{Builder, TauriPlugin},
    Manager, Runtime,
};

/// Initialize the jobcam plugin with all commands
#[cfg(feature = "tauri")]
pub fn init<R: Runtime>(coordinator: Arc<JobCoordinator>) -> TauriPlugin<R> {
    Builder::new("jobcam")
        .setup(move |app, _api| {
            app.manage(coordinator);
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::jobs::accept_job,
            commands::jobs::complete_job,
            commands::live::go_live,
            commands::live::watch_live,
            commands::live::leave_live,
            commands::live::get_session_stats,
        ])
        .build()
}

/// Initialize logging
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "jobcam=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_crate_info() {
        assert_eq!(NAME, "jobcam");
        assert!(!VERSION.is_empty());
        assert!(!DESCRIPTION.is_empty());
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }
}
