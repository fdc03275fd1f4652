//! Per-job arena tying a job's accepted window to its live resources.
//!
//! Each accepted job gets one context holding the shared capture handle, an
//! optional local preview lease and at most one session per role. Contexts
//! are created on accept and destroyed on completion, deletion, or shutdown.

use crate::capture::{CaptureBackend, CaptureDeviceHandle, CaptureLease, CaptureRequest};
use crate::config::LinkConfig;
use crate::errors::LinkError;
use crate::jobs::{JobChange, JobStateMachine, JobStore};
use crate::session::{PeerSession, PeerTransport, SessionDeps, SessionState, SessionStats};
use crate::signaling::{RelayTransport, Role, SignalingChannel};
use crate::types::{Job, JobId, JobStatus, ParticipantId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Result of a successful accept
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedJob {
    pub job: Job,
    /// False when the camera could not be opened; the job is still accepted
    pub media_available: bool,
    pub warning: Option<String>,
}

#[derive(Default)]
struct JobContext {
    capture: Option<CaptureDeviceHandle>,
    preview: Option<CaptureLease>,
    offerer: Option<Arc<PeerSession>>,
    answerer: Option<Arc<PeerSession>>,
    opening: Arc<Mutex<()>>,
}

impl JobContext {
    fn session(&self, role: Role) -> Option<&Arc<PeerSession>> {
        match role {
            Role::Offerer => self.offerer.as_ref(),
            Role::Answerer => self.answerer.as_ref(),
        }
    }

    fn slot(&mut self, role: Role) -> &mut Option<Arc<PeerSession>> {
        match role {
            Role::Offerer => &mut self.offerer,
            Role::Answerer => &mut self.answerer,
        }
    }

    async fn teardown(self) {
        for session in [self.offerer, self.answerer].into_iter().flatten() {
            session.stop().await;
        }
        if let Some(preview) = self.preview {
            preview.release().await;
        }
        if let Some(capture) = self.capture {
            capture.release().await;
        }
    }
}

pub struct JobCoordinator {
    jobs: JobStateMachine,
    capture: Arc<dyn CaptureBackend>,
    deps: SessionDeps,
    contexts: Mutex<HashMap<JobId, JobContext>>,
}

impl JobCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        relay: Arc<dyn RelayTransport>,
        transport: Arc<dyn PeerTransport>,
        capture: Arc<dyn CaptureBackend>,
        config: LinkConfig,
    ) -> Self {
        let signaling = SignalingChannel::new(relay, config.signaling.clone());
        Self {
            jobs: JobStateMachine::new(store),
            capture: capture.clone(),
            deps: SessionDeps {
                signaling,
                transport,
                capture,
                config,
            },
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn jobs(&self) -> &JobStateMachine {
        &self.jobs
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.jobs.store()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.deps.config
    }

    /// Fulfiller accepts an open job. The camera is opened first so the live
    /// session can reuse it; failing to open it does not block the accept.
    /// On any error nothing is left behind.
    pub async fn accept_job(
        &self,
        job_id: &str,
        fulfiller: &ParticipantId,
    ) -> Result<AcceptedJob, LinkError> {
        let id = JobId::parse(job_id)?;

        let (capture, warning) = match self.open_capture().await {
            Ok(handle) => (Some(handle), None),
            Err(e) => {
                if e.is_recoverable() {
                    log::warn!("Accepting job {} without camera: {}", id, e);
                } else {
                    log::error!("Camera setup failed for job {}: {}", id, e);
                }
                (None, Some(e.user_message()))
            }
        };

        let job = match self.jobs.accept(job_id, fulfiller).await {
            Ok(job) => job,
            Err(e) => {
                if let Some(capture) = capture {
                    capture.release().await;
                }
                return Err(e);
            }
        };

        let media_available = capture.is_some();
        let stale = {
            let mut contexts = self.contexts.lock().await;
            contexts.insert(
                id,
                JobContext {
                    capture,
                    ..JobContext::default()
                },
            )
        };
        if let Some(stale) = stale {
            stale.teardown().await;
        }

        Ok(AcceptedJob {
            job,
            media_available,
            warning,
        })
    }

    /// Fulfiller side: start (or return) the offering session.
    pub async fn go_live(&self, job_id: &JobId) -> Result<Arc<PeerSession>, LinkError> {
        self.open_session(job_id, Role::Offerer).await
    }

    /// Requester side: start (or return) the answering session.
    pub async fn watch_live(&self, job_id: &JobId) -> Result<Arc<PeerSession>, LinkError> {
        self.open_session(job_id, Role::Answerer).await
    }

    async fn open_session(&self, job_id: &JobId, role: Role) -> Result<Arc<PeerSession>, LinkError> {
        let job = self.store().get_job(job_id).await?;
        if job.status != JobStatus::Accepted {
            return Err(LinkError::InvalidJob(format!(
                "job {} is {}, live video needs an accepted job",
                job_id, job.status
            )));
        }

        // Opening is serialized per job. The arena lock is only taken for
        // map access, never across a relay join or a connection close.
        let gate = self
            .contexts
            .lock()
            .await
            .entry(*job_id)
            .or_default()
            .opening
            .clone();
        let _opening = gate.lock().await;

        let (finished, capture) = {
            let mut contexts = self.contexts.lock().await;
            let context = contexts.entry(*job_id).or_default();
            if let Some(existing) = context.session(role) {
                let state = existing.state();
                if !state.is_terminal() && !state.is_error() {
                    return Ok(existing.clone());
                }
            }
            (context.slot(role).take(), context.capture.clone())
        };
        if let Some(finished) = finished {
            finished.stop().await;
        }

        // A previous stream may have been the camera's last consumer.
        let (shared_capture, reopened) = match (role, capture) {
            (Role::Answerer, _) => (None, None),
            (Role::Offerer, Some(handle)) if handle.is_released() => {
                match self.open_capture().await {
                    Ok(fresh) => {
                        log::info!("Reopened camera for job {}", job_id);
                        (Some(fresh.clone()), Some(fresh))
                    }
                    Err(e) => {
                        log::warn!("Job {}: camera could not be reopened: {}", job_id, e);
                        (None, None)
                    }
                }
            }
            (Role::Offerer, capture) => (capture, None),
        };

        let session = Arc::new(PeerSession::new(role, self.deps.clone()));
        let started = session.start(*job_id, shared_capture).await;

        let installed = {
            let mut contexts = self.contexts.lock().await;
            match contexts.get_mut(job_id) {
                Some(context) => {
                    if let Some(fresh) = &reopened {
                        context.capture = Some(fresh.clone());
                    }
                    if started.is_ok() {
                        *context.slot(role) = Some(session.clone());
                    }
                    true
                }
                None => false,
            }
        };
        if !installed {
            session.stop().await;
            if let Some(fresh) = reopened {
                fresh.release().await;
            }
            return Err(LinkError::InvalidJob(format!(
                "job {} was released while going live",
                job_id
            )));
        }

        started?;
        Ok(session)
    }

    async fn open_capture(&self) -> Result<CaptureDeviceHandle, LinkError> {
        let config = &self.deps.config;
        CaptureDeviceHandle::acquire(
            self.capture.clone(),
            CaptureRequest::from(&config.capture),
            config.capture.max_consumers,
            config.session.capture_timeout(),
        )
        .await
    }

    /// Attach a local preview as the second consumer of the job's camera.
    pub async fn preview(&self, job_id: &JobId) -> Result<(), LinkError> {
        let mut contexts = self.contexts.lock().await;
        let context = contexts
            .get_mut(job_id)
            .ok_or_else(|| LinkError::NotFound(format!("no accepted job {}", job_id)))?;
        if context.preview.is_some() {
            return Ok(());
        }
        let capture = context.capture.as_ref().ok_or_else(|| {
            LinkError::CaptureUnavailable(format!("job {} has no camera", job_id))
        })?;
        context.preview = Some(capture.lease()?);
        Ok(())
    }

    pub async fn stop_preview(&self, job_id: &JobId) {
        let preview = {
            let mut contexts = self.contexts.lock().await;
            contexts.get_mut(job_id).and_then(|c| c.preview.take())
        };
        if let Some(preview) = preview {
            preview.release().await;
        }
    }

    /// Back-navigation: tear down one side's session, keep the job context.
    pub async fn leave_live(&self, job_id: &JobId, role: Role) {
        let session = {
            let mut contexts = self.contexts.lock().await;
            contexts.get_mut(job_id).and_then(|c| c.slot(role).take())
        };
        if let Some(session) = session {
            session.stop().await;
        }
    }

    /// Accepted -> Completed, then release everything the job held.
    pub async fn complete_job(&self, job_id: &str) -> Result<Job, LinkError> {
        let job = self.jobs.complete(job_id).await?;
        self.release_job(&job.id).await;
        Ok(job)
    }

    pub async fn session(&self, job_id: &JobId, role: Role) -> Option<Arc<PeerSession>> {
        self.contexts
            .lock()
            .await
            .get(job_id)
            .and_then(|c| c.session(role).cloned())
    }

    pub async fn session_stats(&self, job_id: &JobId, role: Role) -> Option<SessionStats> {
        self.session(job_id, role).await.map(|s| s.stats())
    }

    pub async fn session_state(&self, job_id: &JobId, role: Role) -> Option<SessionState> {
        self.session(job_id, role).await.map(|s| s.state())
    }

    pub async fn active_jobs(&self) -> Vec<JobId> {
        self.contexts.lock().await.keys().copied().collect()
    }

    /// Drop a job's context, stopping its sessions and closing its camera.
    pub async fn release_job(&self, job_id: &JobId) {
        let context = self.contexts.lock().await.remove(job_id);
        if let Some(context) = context {
            log::info!("Releasing live resources for job {}", job_id);
            context.teardown().await;
        }
    }

    /// Release contexts whose job was completed or deleted elsewhere.
    pub fn spawn_lifecycle_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let mut feed = self.store().subscribe();
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(JobChange::Updated(job)) if job.status == JobStatus::Completed => {
                        coordinator.release_job(&job.id).await
                    }
                    Ok(JobChange::Deleted(id)) => coordinator.release_job(&id).await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Lifecycle watch lagged by {} changes", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        let contexts: Vec<_> = self.contexts.lock().await.drain().collect();
        log::info!("Shutting down {} job context(s)", contexts.len());
        for (_, context) in contexts {
            context.teardown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::MemoryJobStore;
    use crate::signaling::MemoryRelay;
    use crate::testing::{ScriptedTransport, StaticCapture};
    use crate::types::NewJob;

    struct Fixture {
        store: Arc<MemoryJobStore>,
        capture: Arc<StaticCapture>,
        coordinator: JobCoordinator,
    }

    fn fixture(capture: StaticCapture) -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let capture = Arc::new(capture);
        let coordinator = JobCoordinator::new(
            store.clone(),
            Arc::new(MemoryRelay::new()),
            Arc::new(ScriptedTransport::new()),
            capture.clone(),
            LinkConfig::default(),
        );
        Fixture {
            store,
            capture,
            coordinator,
        }
    }

    async fn open_job(store: &MemoryJobStore) -> Job {
        store
            .create_job(
                NewJob::new("Shop front", "PT", "Porto", "Rua 1"),
                ParticipantId::new("client-1").unwrap(),
            )
            .await
            .unwrap()
    }

    fn provider(n: u32) -> ParticipantId {
        ParticipantId::new(format!("provider-{}", n)).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_id_touches_nothing() {
        let f = fixture(StaticCapture::granting());
        let result = f.coordinator.accept_job("", &provider(1)).await;
        assert!(matches!(result, Err(LinkError::InvalidId(_))));
        assert_eq!(f.capture.acquire_count(), 0);
        assert!(f.coordinator.active_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_accept_releases_camera() {
        let f = fixture(StaticCapture::granting());
        let result = f
            .coordinator
            .accept_job(&JobId::new().to_string(), &provider(1))
            .await;
        assert!(matches!(result, Err(LinkError::NotFound(_))));
        assert_eq!(f.capture.acquire_count(), 1);
        assert_eq!(f.capture.release_count(), 1);
        assert!(f.coordinator.active_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_accept_without_camera_is_not_fatal() {
        let f = fixture(StaticCapture::denying());
        let job = open_job(&f.store).await;

        let accepted = f
            .coordinator
            .accept_job(&job.id.to_string(), &provider(1))
            .await
            .unwrap();
        assert_eq!(accepted.job.status, JobStatus::Accepted);
        assert!(!accepted.media_available);
        assert!(accepted.warning.is_some());
        assert!(matches!(
            f.coordinator.preview(&job.id).await,
            Err(LinkError::CaptureUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_go_live_is_idempotent() {
        let f = fixture(StaticCapture::granting());
        let job = open_job(&f.store).await;
        f.coordinator
            .accept_job(&job.id.to_string(), &provider(1))
            .await
            .unwrap();

        let first = f.coordinator.go_live(&job.id).await.unwrap();
        let second = f.coordinator.go_live(&job.id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        f.coordinator.shutdown().await;
        assert_eq!(first.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_live_requires_accepted_job() {
        let f = fixture(StaticCapture::granting());
        let job = open_job(&f.store).await;
        assert!(matches!(
            f.coordinator.watch_live(&job.id).await,
            Err(LinkError::InvalidJob(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_releases_everything() {
        let f = fixture(StaticCapture::granting());
        let job = open_job(&f.store).await;
        f.coordinator
            .accept_job(&job.id.to_string(), &provider(1))
            .await
            .unwrap();
        f.coordinator.preview(&job.id).await.unwrap();
        let session = f.coordinator.go_live(&job.id).await.unwrap();

        let done = f.coordinator.complete_job(&job.id.to_string()).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(f.capture.release_count(), 1);
        assert!(f.coordinator.session(&job.id, Role::Offerer).await.is_none());
    }
}
