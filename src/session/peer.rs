//! Peer session actor.
//!
//! Each session runs one driver task that owns the peer connection, the
//! capture lease and the channel membership. Signaling messages and transport
//! callbacks are funneled into a bounded inbox and handled one at a time, so
//! no two handlers for the same session ever run concurrently.

use crate::capture::{CaptureBackend, CaptureDeviceHandle, CaptureLease, CaptureRequest};
use crate::config::{CaptureConfig, LinkConfig};
use crate::errors::LinkError;
use crate::session::state::{RemoteTrack, SessionEvent, SessionState, SessionStats};
use crate::session::transport::{
    LinkState, PeerConnection, PeerTransport, TransportEvent, TransportEventSink,
};
use crate::signaling::{
    ChannelHandle, IceCandidate, MessageKind, NegotiationMessage, Role, SessionDescription,
    SignalingChannel,
};
use crate::types::JobId;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub(crate) enum SessionInput {
    Signal(Result<NegotiationMessage, LinkError>),
    Transport(TransportEvent),
    Stop(oneshot::Sender<()>),
}

/// Collaborators a session needs, shared between sessions
#[derive(Clone)]
pub struct SessionDeps {
    pub signaling: SignalingChannel,
    pub transport: Arc<dyn PeerTransport>,
    pub capture: Arc<dyn CaptureBackend>,
    pub config: LinkConfig,
}

enum Control {
    Idle,
    Running {
        job_id: JobId,
        inbox: mpsc::Sender<SessionInput>,
        driver: JoinHandle<()>,
    },
    Closed,
}

/// One side of a two-party media session for a job
pub struct PeerSession {
    role: Role,
    deps: SessionDeps,
    stats: Arc<watch::Sender<SessionStats>>,
    events: broadcast::Sender<SessionEvent>,
    control: Mutex<Control>,
}

impl PeerSession {
    pub fn new(role: Role, deps: SessionDeps) -> Self {
        let (stats, _) = watch::channel(SessionStats::new(role));
        let (events, _) = broadcast::channel(64);
        Self {
            role,
            deps,
            stats: Arc::new(stats),
            events,
            control: Mutex::new(Control::Idle),
        }
    }

    /// Media source side: sends the offer.
    pub fn offerer(deps: SessionDeps) -> Self {
        Self::new(Role::Offerer, deps)
    }

    /// Pure receiver side: answers the offer.
    pub fn answerer(deps: SessionDeps) -> Self {
        Self::new(Role::Answerer, deps)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.stats.borrow().state.clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionStats> {
        self.stats.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Join the job's channel and start negotiating.
    ///
    /// Calling it again for the same job is a no-op, so repeated triggers
    /// never produce a second offer. An offerer reuses `shared_capture` while
    /// it is still open and otherwise opens the device itself; either way a
    /// capture failure only drops the session into no-media mode.
    ///
    /// A failed channel join returns `ChannelUnavailable` and emits `Failed`,
    /// but the session stays `Idle` instead of entering `Error` so the caller
    /// can retry `start`.
    pub async fn start(
        &self,
        job_id: JobId,
        shared_capture: Option<CaptureDeviceHandle>,
    ) -> Result<(), LinkError> {
        let mut control = self.control.lock().await;
        match &*control {
            Control::Closed => return Err(LinkError::SessionClosed),
            Control::Running {
                job_id: running, ..
            } => {
                if *running == job_id {
                    log::debug!("{} session for job {} already running", self.role, job_id);
                    return Ok(());
                }
                return Err(LinkError::Negotiation(format!(
                    "session already bound to job {}",
                    running
                )));
            }
            Control::Idle => {}
        }

        let handle = match self.deps.signaling.join(&job_id, self.role).await {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("{} could not join channel for job {}: {}", self.role, job_id, e);
                let _ = self.events.send(SessionEvent::Failed(e.to_string()));
                return Err(e);
            }
        };

        let (inbox_tx, inbox_rx) = mpsc::channel(self.deps.config.session.inbox_capacity.max(1));
        let forward = inbox_tx.clone();
        let listen = self.deps.signaling.on_message(&handle, move |message| {
            let forward = forward.clone();
            async move {
                let _ = forward.send(SessionInput::Signal(message)).await;
            }
        });
        if let Err(e) = listen {
            self.deps.signaling.leave(&handle).await;
            return Err(e);
        }

        self.stats.send_modify(|s| s.job_id = Some(job_id));

        let driver = Driver {
            role: self.role,
            job_id,
            config: self.deps.config.clone(),
            signaling: self.deps.signaling.clone(),
            handle,
            transport: self.deps.transport.clone(),
            capture_backend: self.deps.capture.clone(),
            shared_capture,
            sink: TransportEventSink::new(inbox_tx.clone()),
            inbox: inbox_rx,
            deferred: VecDeque::new(),
            connection: None,
            lease: None,
            pending: VecDeque::new(),
            remote_set: false,
            offer_sent: false,
            answer_sent: false,
            torn_down: false,
            deadline: None,
            stats: self.stats.clone(),
            events: self.events.clone(),
        };

        log::info!("Starting {} session for job {}", self.role, job_id);
        *control = Control::Running {
            job_id,
            inbox: inbox_tx,
            driver: tokio::spawn(driver.run()),
        };
        Ok(())
    }

    /// Close the connection, return the capture lease, leave the channel.
    /// Safe to call in any state and any number of times.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        match std::mem::replace(&mut *control, Control::Closed) {
            Control::Idle => {
                set_state(&self.stats, &self.events, SessionState::Closed);
            }
            Control::Running { inbox, driver, .. } => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if inbox.send(SessionInput::Stop(reply_tx)).await.is_ok() {
                    let _ = reply_rx.await;
                }
                if let Err(e) = driver.await {
                    log::error!("{} session driver ended abnormally: {}", self.role, e);
                    set_state(&self.stats, &self.events, SessionState::Closed);
                }
            }
            Control::Closed => {}
        }
    }

    /// Wait until the session state satisfies `predicate`.
    pub async fn wait_for_state<F>(
        &self,
        mut predicate: F,
        wait: Duration,
    ) -> Result<SessionState, LinkError>
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut stats = self.stats.subscribe();
        let outcome = tokio::time::timeout(wait, stats.wait_for(|s| predicate(&s.state))).await;
        match outcome {
            Ok(Ok(snapshot)) => Ok(snapshot.state.clone()),
            Ok(Err(_)) => Err(LinkError::SessionClosed),
            Err(_) => Err(LinkError::Timeout(format!(
                "{} session still {} after {:?}",
                self.role,
                self.state(),
                wait
            ))),
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        // Best effort: ask a still-running driver to tear down on its own.
        if let Ok(control) = self.control.try_lock() {
            if let Control::Running { inbox, .. } = &*control {
                let (reply_tx, _) = oneshot::channel();
                let _ = inbox.try_send(SessionInput::Stop(reply_tx));
            }
        }
    }
}

fn set_state(
    stats: &watch::Sender<SessionStats>,
    events: &broadcast::Sender<SessionEvent>,
    state: SessionState,
) {
    let changed = stats.send_if_modified(|s| {
        if s.state == state {
            false
        } else {
            s.state = state.clone();
            true
        }
    });
    if changed {
        let _ = events.send(SessionEvent::StateChanged(state));
    }
}

async fn obtain_media(
    shared: Option<CaptureDeviceHandle>,
    backend: Arc<dyn CaptureBackend>,
    config: CaptureConfig,
    wait: Duration,
) -> Result<CaptureLease, LinkError> {
    if let Some(handle) = shared {
        if !handle.is_released() {
            return handle.lease();
        }
        log::info!("Shared camera was already released, opening it again");
    }
    let handle = CaptureDeviceHandle::acquire(
        backend,
        CaptureRequest::from(&config),
        config.max_consumers,
        wait,
    )
    .await?;
    handle.lease()
}

/// Drive `work` while still honoring a stop request. Anything else that
/// arrives meanwhile is kept, in order, for later.
async fn until_stopped<F: Future>(
    inbox: &mut mpsc::Receiver<SessionInput>,
    deferred: &mut VecDeque<SessionInput>,
    work: F,
) -> Result<F::Output, oneshot::Sender<()>> {
    tokio::pin!(work);
    loop {
        tokio::select! {
            output = &mut work => return Ok(output),
            input = inbox.recv() => match input {
                Some(SessionInput::Stop(reply)) => return Err(reply),
                Some(other) => deferred.push_back(other),
                None => return Ok((&mut work).await),
            },
        }
    }
}

struct Driver {
    role: Role,
    job_id: JobId,
    config: LinkConfig,
    signaling: SignalingChannel,
    handle: ChannelHandle,
    transport: Arc<dyn PeerTransport>,
    capture_backend: Arc<dyn CaptureBackend>,
    shared_capture: Option<CaptureDeviceHandle>,
    sink: TransportEventSink,
    inbox: mpsc::Receiver<SessionInput>,
    deferred: VecDeque<SessionInput>,
    connection: Option<Box<dyn PeerConnection>>,
    lease: Option<CaptureLease>,
    /// Remote candidates received before the remote description
    pending: VecDeque<IceCandidate>,
    remote_set: bool,
    offer_sent: bool,
    answer_sent: bool,
    torn_down: bool,
    deadline: Option<Instant>,
    stats: Arc<watch::Sender<SessionStats>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Driver {
    async fn run(mut self) {
        self.deadline = Some(Instant::now() + self.config.session.negotiation_timeout());

        if let Err(reply) = self.bootstrap().await {
            self.close(reply).await;
            return;
        }

        while let Some(input) = self.deferred.pop_front() {
            if let Err(reply) = self.dispatch(input).await {
                self.close(reply).await;
                return;
            }
        }

        loop {
            let deadline = self.deadline;
            let expired = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let input = tokio::select! {
                input = self.inbox.recv() => input,
                _ = expired => {
                    self.fail(format!(
                        "negotiation did not complete within {:?}",
                        self.config.session.negotiation_timeout()
                    ))
                    .await;
                    continue;
                }
            };

            let Some(input) = input else { break };
            if let Err(reply) = self.dispatch(input).await {
                self.close(reply).await;
                return;
            }
        }
    }

    /// Returns the stop reply channel when a stop request ends the session.
    async fn dispatch(&mut self, input: SessionInput) -> Result<(), oneshot::Sender<()>> {
        match input {
            SessionInput::Stop(reply) => return Err(reply),
            _ if self.torn_down => {}
            SessionInput::Signal(Ok(message)) => self.on_signal(message).await,
            SessionInput::Signal(Err(e)) => {
                log::error!("Bad message on {}: {}", self.handle.topic(), e);
                self.fail(e.to_string()).await;
            }
            SessionInput::Transport(event) => self.on_transport(event).await,
        }
        Ok(())
    }

    async fn bootstrap(&mut self) -> Result<(), oneshot::Sender<()>> {
        if self.role == Role::Offerer {
            self.set_state(SessionState::AcquiringMedia);
            let media = obtain_media(
                self.shared_capture.take(),
                self.capture_backend.clone(),
                self.config.capture.clone(),
                self.config.session.capture_timeout(),
            );
            match until_stopped(&mut self.inbox, &mut self.deferred, media).await? {
                Ok(lease) => self.lease = Some(lease),
                Err(e) => {
                    log::warn!(
                        "Job {}: continuing without local media: {}",
                        self.job_id,
                        e
                    );
                    self.warn(e.user_message());
                }
            }
        }

        let connection = self
            .transport
            .create_connection(self.role, &self.config.ice, self.sink.clone())
            .await;
        match connection {
            Ok(connection) => self.connection = Some(connection),
            Err(e) => {
                self.fail(e.to_string()).await;
                return Ok(());
            }
        }

        match self.role {
            Role::Offerer => {
                self.set_state(SessionState::NegotiatingOffer);
                self.attach_tracks().await;
                if let Err(e) = self.send_offer().await {
                    self.fail(e.to_string()).await;
                    return Ok(());
                }
                self.set_state(SessionState::AwaitingAnswer);
            }
            Role::Answerer => self.set_state(SessionState::AwaitingOffer),
        }
        Ok(())
    }

    async fn attach_tracks(&mut self) {
        let (Some(connection), Some(lease)) = (&self.connection, &self.lease) else {
            return;
        };

        let mut attached = 0;
        let mut failures = Vec::new();
        for track in lease.tracks() {
            match connection.add_track(track).await {
                Ok(()) => attached += 1,
                Err(e) => failures.push(e.to_string()),
            }
        }
        for failure in failures {
            log::warn!("Job {}: track not attached: {}", self.job_id, failure);
            self.warn(failure);
        }
        self.stats.send_modify(|s| s.outbound_tracks = attached);
    }

    async fn send_offer(&mut self) -> Result<(), LinkError> {
        if self.offer_sent {
            return Ok(());
        }
        let connection = self.connection()?;
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;

        self.offer_sent = true;
        self.signaling
            .publish(&self.handle, &NegotiationMessage::offer(self.job_id, offer))
            .await?;
        self.stats.send_modify(|s| s.offers_sent += 1);
        log::info!("Offer sent for job {}", self.job_id);
        Ok(())
    }

    async fn send_answer(&mut self) -> Result<(), LinkError> {
        if self.answer_sent {
            return Ok(());
        }
        let connection = self.connection()?;
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;

        self.answer_sent = true;
        self.signaling
            .publish(&self.handle, &NegotiationMessage::answer(self.job_id, answer))
            .await?;
        self.stats.send_modify(|s| s.answers_sent += 1);
        log::info!("Answer sent for job {}", self.job_id);
        Ok(())
    }

    async fn on_signal(&mut self, message: NegotiationMessage) {
        match (self.role, message.kind) {
            (Role::Answerer, MessageKind::Offer) => {
                let Some(description) = message.session_description else {
                    return;
                };
                if self.remote_set {
                    log::debug!("Ignoring repeated offer for job {}", self.job_id);
                    return;
                }
                self.set_state(SessionState::NegotiatingAnswer);
                if let Err(e) = self.apply_remote(description).await {
                    self.fail(e.to_string()).await;
                    return;
                }
                if let Err(e) = self.send_answer().await {
                    self.fail(e.to_string()).await;
                    return;
                }
                self.flush_pending().await;
            }
            (Role::Offerer, MessageKind::Answer) => {
                let Some(description) = message.session_description else {
                    return;
                };
                if self.remote_set {
                    log::debug!("Ignoring repeated answer for job {}", self.job_id);
                    return;
                }
                if let Err(e) = self.apply_remote(description).await {
                    self.fail(e.to_string()).await;
                    return;
                }
                self.flush_pending().await;
            }
            (_, MessageKind::IceCandidate) => {
                let Some(candidate) = message.candidate else {
                    return;
                };
                if self.remote_set {
                    self.apply_candidate(candidate).await;
                } else {
                    self.pending.push_back(candidate);
                    self.stats.send_modify(|s| s.remote_candidates_buffered += 1);
                    log::debug!(
                        "Buffered remote candidate for job {} ({} pending)",
                        self.job_id,
                        self.pending.len()
                    );
                }
            }
            (role, kind) => {
                log::warn!("{} ignoring unexpected {:?} for job {}", role, kind, self.job_id);
            }
        }
    }

    async fn apply_remote(&mut self, description: SessionDescription) -> Result<(), LinkError> {
        self.connection()?.set_remote_description(description).await?;
        self.remote_set = true;
        Ok(())
    }

    /// Apply buffered candidates in the order they were received.
    async fn flush_pending(&mut self) {
        while let Some(candidate) = self.pending.pop_front() {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        let result = match self.connection() {
            Ok(connection) => connection.add_ice_candidate(candidate).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => self.stats.send_modify(|s| s.remote_candidates_applied += 1),
            Err(e) => {
                log::warn!("Job {}: remote candidate rejected: {}", self.job_id, e);
                self.stats.send_modify(|s| s.remote_candidates_rejected += 1);
                self.warn(e.to_string());
            }
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let message =
                    NegotiationMessage::ice_candidate(self.role, self.job_id, candidate);
                match self.signaling.publish(&self.handle, &message).await {
                    Ok(()) => self.stats.send_modify(|s| s.local_candidates_published += 1),
                    Err(e) => self.fail(e.to_string()).await,
                }
            }
            TransportEvent::ConnectionState(LinkState::Connected) => {
                self.deadline = None;
                self.set_state(SessionState::Connected);
            }
            TransportEvent::ConnectionState(LinkState::Disconnected) => {
                log::warn!("Job {}: peer connection interrupted", self.job_id);
            }
            TransportEvent::ConnectionState(LinkState::Failed) => {
                self.fail("peer connection failed".to_string()).await;
            }
            TransportEvent::ConnectionState(LinkState::Closed) => {
                self.fail("peer connection closed by transport".to_string())
                    .await;
            }
            TransportEvent::ConnectionState(other) => {
                log::debug!("Job {}: transport state {:?}", self.job_id, other);
            }
            TransportEvent::RemoteTrack(track) => self.on_remote_track(track),
        }
    }

    fn on_remote_track(&mut self, track: RemoteTrack) {
        log::info!("Job {}: incoming {} media {}", self.job_id, track.kind, track.id);
        self.stats.send_modify(|s| s.remote_tracks.push(track.clone()));
        let _ = self.events.send(SessionEvent::IncomingMedia(track));
    }

    fn connection(&self) -> Result<&dyn PeerConnection, LinkError> {
        self.connection
            .as_deref()
            .ok_or_else(|| LinkError::Negotiation("no peer connection".to_string()))
    }

    fn set_state(&self, state: SessionState) {
        if self.stats.borrow().state != state {
            log::info!(
                "{} session for job {} -> {}",
                self.role,
                self.job_id,
                state
            );
        }
        set_state(&self.stats, &self.events, state);
    }

    fn warn(&self, message: String) {
        let _ = self.events.send(SessionEvent::Warning(message));
    }

    /// Terminal failure: tear down and stay in `Error` until stopped.
    async fn fail(&mut self, reason: String) {
        if self.torn_down {
            return;
        }
        log::error!(
            "{} session for job {} failed: {}",
            self.role,
            self.job_id,
            reason
        );
        self.teardown().await;
        self.set_state(SessionState::Error(reason.clone()));
        let _ = self.events.send(SessionEvent::Failed(reason));
    }

    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.deadline = None;
        self.pending.clear();

        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                log::warn!("Job {}: {}", self.job_id, e);
            }
        }
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
        self.signaling.leave(&self.handle).await;
    }

    async fn close(mut self, reply: oneshot::Sender<()>) {
        self.teardown().await;
        self.set_state(SessionState::Closed);
        log::info!("{} session for job {} closed", self.role, self.job_id);
        let _ = reply.send(());
    }
}
