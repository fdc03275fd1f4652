use jobcam::capture::{CaptureBackend, CaptureDeviceHandle, CaptureRequest};
use jobcam::session::{
    LinkState, PeerSession, SessionDeps, SessionEvent, SessionState, SessionStats, TransportEvent,
};
use jobcam::signaling::{
    ChannelHandle, IceCandidate, MemoryRelay, MessageKind, NegotiationMessage, Role,
    SessionDescription, SignalingChannel,
};
use jobcam::testing::{CaptureMode, ScriptedTransport, StaticCapture, MALFORMED_SDP};
use jobcam::{JobId, LinkConfig, LinkError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    relay: MemoryRelay,
    transport: ScriptedTransport,
    config: LinkConfig,
}

impl Harness {
    fn new() -> Self {
        let mut config = LinkConfig::default();
        config.signaling.retry_delay_ms = 1;
        Self {
            relay: MemoryRelay::new(),
            transport: ScriptedTransport::new(),
            config,
        }
    }

    fn signaling(&self) -> SignalingChannel {
        SignalingChannel::new(Arc::new(self.relay.clone()), self.config.signaling.clone())
    }

    fn deps(&self, capture: Arc<dyn CaptureBackend>) -> SessionDeps {
        SessionDeps {
            signaling: self.signaling(),
            transport: Arc::new(self.transport.clone()),
            capture,
            config: self.config.clone(),
        }
    }

    fn offerer(&self, capture: Arc<StaticCapture>) -> PeerSession {
        PeerSession::offerer(self.deps(capture))
    }

    fn answerer(&self) -> PeerSession {
        PeerSession::answerer(self.deps(Arc::new(StaticCapture::denying())))
    }

    /// A bare participant driven by hand through the signaling channel.
    async fn fake_peer(
        &self,
        job_id: JobId,
        role: Role,
    ) -> (
        SignalingChannel,
        ChannelHandle,
        mpsc::UnboundedReceiver<NegotiationMessage>,
    ) {
        let signaling = self.signaling();
        let handle = signaling.join(&job_id, role).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        signaling
            .on_message(&handle, move |message| {
                let tx = tx.clone();
                async move {
                    if let Ok(message) = message {
                        let _ = tx.send(message);
                    }
                }
            })
            .unwrap();
        (signaling, handle, rx)
    }
}

fn connected(state: &SessionState) -> bool {
    *state == SessionState::Connected
}

async fn wait_stats<F>(session: &PeerSession, predicate: F) -> SessionStats
where
    F: FnMut(&SessionStats) -> bool,
{
    let mut stats = session.watch();
    let snapshot = timeout(WAIT, stats.wait_for(predicate))
        .await
        .expect("session stats did not converge")
        .expect("session dropped");
    snapshot.clone()
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return seen,
        }
    }
}

#[tokio::test]
async fn test_offer_answer_reaches_connected() {
    let harness = Harness::new();
    let job_id = JobId::new();
    let answerer = harness.answerer();
    let offerer = harness.offerer(Arc::new(StaticCapture::granting()));
    let mut answerer_events = answerer.subscribe_events();

    answerer.start(job_id, None).await.unwrap();
    offerer.start(job_id, None).await.unwrap();

    offerer.wait_for_state(connected, WAIT).await.unwrap();
    answerer.wait_for_state(connected, WAIT).await.unwrap();

    let offer_stats = offerer.stats();
    assert_eq!(offer_stats.job_id, Some(job_id));
    assert_eq!(offer_stats.offers_sent, 1);
    assert_eq!(offer_stats.answers_sent, 0);
    assert_eq!(offer_stats.outbound_tracks, 1);

    let offer_side = harness.transport.connection_for(Role::Offerer).unwrap();
    let answer_side = harness.transport.connection_for(Role::Answerer).unwrap();
    assert_eq!(offer_side.track_count(), 1);
    assert_eq!(answer_side.role(), Role::Answerer);
    assert_eq!(answer_side.remote_description(), offer_side.local_description());

    let answer_stats = wait_stats(&answerer, |s| !s.remote_tracks.is_empty()).await;
    assert_eq!(answer_stats.answers_sent, 1);
    assert_eq!(answer_stats.offers_sent, 0);
    assert_eq!(answer_stats.remote_tracks[0].kind, "video");

    let events = drain(&mut answerer_events);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::IncomingMedia(_))));
    assert!(events
        .iter()
        .any(|e| *e == SessionEvent::StateChanged(SessionState::NegotiatingAnswer)));

    offerer.stop().await;
    answerer.stop().await;
}

#[tokio::test]
async fn test_permission_denied_still_connects_without_media() {
    let harness = Harness::new();
    let job_id = JobId::new();
    let capture = Arc::new(StaticCapture::denying());
    let answerer = harness.answerer();
    let offerer = harness.offerer(capture.clone());
    let mut offerer_events = offerer.subscribe_events();
    let mut answerer_events = answerer.subscribe_events();

    answerer.start(job_id, None).await.unwrap();
    offerer.start(job_id, None).await.unwrap();

    offerer.wait_for_state(connected, WAIT).await.unwrap();
    answerer.wait_for_state(connected, WAIT).await.unwrap();

    assert_eq!(capture.acquire_count(), 1);
    assert_eq!(offerer.stats().outbound_tracks, 0);
    assert!(answerer.stats().remote_tracks.is_empty());
    assert!(!drain(&mut answerer_events)
        .iter()
        .any(|e| matches!(e, SessionEvent::IncomingMedia(_))));
    assert!(drain(&mut offerer_events)
        .iter()
        .any(|e| matches!(e, SessionEvent::Warning(_))));

    offerer.stop().await;
    answerer.stop().await;
}

#[tokio::test]
async fn test_own_messages_never_come_back() {
    let harness = Harness::new();
    let job_id = JobId::new();
    let answerer = harness.answerer();
    let offerer = harness.offerer(Arc::new(StaticCapture::granting()));

    answerer.start(job_id, None).await.unwrap();
    offerer.start(job_id, None).await.unwrap();
    offerer.wait_for_state(connected, WAIT).await.unwrap();

    let answer_side = wait_stats(&answerer, |s| s.local_candidates_published == 2).await;
    wait_stats(&offerer, |s| s.remote_candidates_applied == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Echoed offers or candidates would show up as extra applied candidates.
    let offer_side = offerer.stats();
    assert_eq!(
        offer_side.remote_candidates_applied,
        answer_side.local_candidates_published
    );
    assert_eq!(offer_side.remote_candidates_rejected, 0);
    assert_eq!(offer_side.state, SessionState::Connected);

    offerer.stop().await;
    answerer.stop().await;
}

#[tokio::test]
async fn test_early_candidates_are_buffered_in_order() {
    let harness = Harness::new();
    let job_id = JobId::new();
    let answerer = harness.answerer();
    answerer.start(job_id, None).await.unwrap();
    answerer
        .wait_for_state(|s| *s == SessionState::AwaitingOffer, WAIT)
        .await
        .unwrap();

    let (signaling, handle, mut inbox) = harness.fake_peer(job_id, Role::Offerer).await;
    for name in ["early-1", "early-2"] {
        let candidate = IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.1 9 typ host", name));
        signaling
            .publish(
                &handle,
                &NegotiationMessage::ice_candidate(Role::Offerer, job_id, candidate),
            )
            .await
            .unwrap();
    }
    wait_stats(&answerer, |s| s.remote_candidates_buffered == 2).await;
    assert_eq!(answerer.stats().remote_candidates_applied, 0);

    let offer = NegotiationMessage::offer(
        job_id,
        SessionDescription::offer("v=0\r\nm=application control\r\n"),
    );
    signaling.publish(&handle, &offer).await.unwrap();

    let stats = wait_stats(&answerer, |s| s.remote_candidates_applied == 2).await;
    assert_eq!(stats.remote_candidates_buffered, 2);
    answerer.wait_for_state(connected, WAIT).await.unwrap();

    let connection = harness.transport.connection_for(Role::Answerer).unwrap();
    let applied = connection.applied_candidates();
    assert!(applied[0].contains("early-1"));
    assert!(applied[1].contains("early-2"));

    // A repeated offer does not produce a second answer.
    signaling.publish(&handle, &offer).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut answers = 0;
    while let Ok(message) = inbox.try_recv() {
        if message.kind == MessageKind::Answer {
            answers += 1;
        }
    }
    assert_eq!(answers, 1);
    assert_eq!(answerer.stats().answers_sent, 1);

    answerer.stop().await;
    signaling.leave(&handle).await;
}

#[tokio::test]
async fn test_repeated_start_sends_one_offer() {
    let harness = Harness::new();
    let job_id = JobId::new();
    let (signaling, handle, mut inbox) = harness.fake_peer(job_id, Role::Answerer).await;
    let offerer = harness.offerer(Arc::new(StaticCapture::granting()));

    offerer.start(job_id, None).await.unwrap();
    offerer.start(job_id, None).await.unwrap();
    offerer
        .wait_for_state(|s| *s == SessionState::AwaitingAnswer, WAIT)
        .await
        .unwrap();
    offerer.start(job_id, None).await.unwrap();

    assert!(matches!(
        offerer.start(JobId::new(), None).await,
        Err(LinkError::Negotiation(_))
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut offers = 0;
    while let Ok(message) = inbox.try_recv() {
        if message.kind == MessageKind::Offer {
            offers += 1;
        }
    }
    assert_eq!(offers, 1);
    assert_eq!(offerer.stats().offers_sent, 1);

    offerer.stop().await;
    assert!(matches!(
        offerer.start(job_id, None).await,
        Err(LinkError::SessionClosed)
    ));
    signaling.leave(&handle).await;
}

#[tokio::test]
async fn test_stop_twice_leaves_nothing_behind() {
    let harness = Harness::new();
    let job_id = JobId::new();
    let capture = Arc::new(StaticCapture::granting());
    let answerer = harness.answerer();
    let offerer = harness.offerer(capture.clone());

    answerer.start(job_id, None).await.unwrap();
    offerer.start(job_id, None).await.unwrap();
    offerer.wait_for_state(connected, WAIT).await.unwrap();

    offerer.stop().await;
    offerer.stop().await;
    answerer.stop().await;
    answerer.stop().await;

    assert_eq!(offerer.state(), SessionState::Closed);
    assert_eq!(answerer.state(), SessionState::Closed);
    assert_eq!(harness.relay.subscriber_count(&format!("session-{}", job_id)), 0);
    assert!(harness.transport.connections().iter().all(|c| c.is_closed()));
    assert_eq!(capture.release_count(), 1);
}

#[tokio::test]
async fn test_stop_before_start() {
    let harness = Harness::new();
    let answerer = harness.answerer();
    answerer.stop().await;
    answerer.stop().await;
    assert_eq!(answerer.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_stop_while_waiting_for_camera_prompt() {
    let harness = Harness::new();
    let capture = Arc::new(StaticCapture::new(CaptureMode::Hang));
    let offerer = harness.offerer(capture.clone());

    offerer.start(JobId::new(), None).await.unwrap();
    offerer
        .wait_for_state(|s| *s == SessionState::AcquiringMedia, WAIT)
        .await
        .unwrap();

    timeout(Duration::from_secs(1), offerer.stop())
        .await
        .expect("stop blocked on the capture prompt");
    assert_eq!(offerer.state(), SessionState::Closed);
    assert_eq!(capture.release_count(), 0);
}

#[tokio::test]
async fn test_released_shared_camera_is_opened_again() {
    let harness = Harness::new();
    let capture = Arc::new(StaticCapture::granting());
    let shared = CaptureDeviceHandle::acquire(capture.clone(), CaptureRequest::default(), 2, WAIT)
        .await
        .unwrap();
    shared.release().await;
    assert!(shared.is_released());

    let offerer = harness.offerer(capture.clone());
    offerer.start(JobId::new(), Some(shared)).await.unwrap();
    offerer
        .wait_for_state(|s| *s == SessionState::AwaitingAnswer, WAIT)
        .await
        .unwrap();

    assert_eq!(offerer.stats().outbound_tracks, 1);
    assert_eq!(capture.acquire_count(), 2);

    offerer.stop().await;
    assert_eq!(capture.release_count(), 2);
}

#[tokio::test]
async fn test_malformed_answer_fails_and_tears_down() {
    let harness = Harness::new();
    let job_id = JobId::new();
    let capture = Arc::new(StaticCapture::granting());
    let offerer = harness.offerer(capture.clone());
    let mut events = offerer.subscribe_events();

    offerer.start(job_id, None).await.unwrap();
    offerer
        .wait_for_state(|s| *s == SessionState::AwaitingAnswer, WAIT)
        .await
        .unwrap();

    let (signaling, handle, _inbox) = harness.fake_peer(job_id, Role::Answerer).await;
    let answer = NegotiationMessage::answer(
        job_id,
        SessionDescription::answer(format!("v=0 {}", MALFORMED_SDP)),
    );
    signaling.publish(&handle, &answer).await.unwrap();

    let state = offerer.wait_for_state(SessionState::is_error, WAIT).await.unwrap();
    assert!(state.is_error());
    assert!(harness.transport.connection_for(Role::Offerer).unwrap().is_closed());
    assert_eq!(capture.release_count(), 1);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::Failed(_))));

    offerer.stop().await;
    assert_eq!(offerer.state(), SessionState::Closed);
    signaling.leave(&handle).await;
}

#[tokio::test]
async fn test_rejected_candidate_is_absorbed() {
    let harness = Harness::new();
    let job_id = JobId::new();
    let answerer = harness.answerer();
    let mut events = answerer.subscribe_events();
    answerer.start(job_id, None).await.unwrap();
    answerer
        .wait_for_state(|s| *s == SessionState::AwaitingOffer, WAIT)
        .await
        .unwrap();

    let (signaling, handle, _inbox) = harness.fake_peer(job_id, Role::Offerer).await;
    let offer = NegotiationMessage::offer(job_id, SessionDescription::offer("v=0\r\n"));
    signaling.publish(&handle, &offer).await.unwrap();
    for candidate in ["candidate:reject-me", "candidate:1 1 udp 1 10.0.0.1 9 typ host"] {
        signaling
            .publish(
                &handle,
                &NegotiationMessage::ice_candidate(Role::Offerer, job_id, IceCandidate::new(candidate)),
            )
            .await
            .unwrap();
    }

    answerer.wait_for_state(connected, WAIT).await.unwrap();
    let stats = answerer.stats();
    assert_eq!(stats.remote_candidates_rejected, 1);
    assert_eq!(stats.remote_candidates_applied, 1);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::Warning(_))));

    answerer.stop().await;
    signaling.leave(&handle).await;
}

#[tokio::test]
async fn test_transport_failure_is_terminal_but_disconnect_is_not() {
    let harness = Harness::new();
    let job_id = JobId::new();
    let answerer = harness.answerer();
    let offerer = harness.offerer(Arc::new(StaticCapture::granting()));

    answerer.start(job_id, None).await.unwrap();
    offerer.start(job_id, None).await.unwrap();
    offerer.wait_for_state(connected, WAIT).await.unwrap();

    let connection = harness.transport.connection_for(Role::Offerer).unwrap();
    connection.inject(TransportEvent::ConnectionState(LinkState::Disconnected));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(offerer.state(), SessionState::Connected);

    connection.inject(TransportEvent::ConnectionState(LinkState::Failed));
    offerer.wait_for_state(SessionState::is_error, WAIT).await.unwrap();
    assert!(connection.is_closed());

    offerer.stop().await;
    answerer.stop().await;
}

#[tokio::test]
async fn test_missing_offer_times_out_into_error() {
    let mut harness = Harness::new();
    harness.config.session.negotiation_timeout_ms = 150;
    let answerer = harness.answerer();

    answerer.start(JobId::new(), None).await.unwrap();
    let state = answerer.wait_for_state(SessionState::is_error, WAIT).await.unwrap();
    assert!(state.to_string().contains("did not complete"));

    answerer.stop().await;
    assert_eq!(answerer.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_join_failure_leaves_session_startable() {
    let harness = Harness::new();
    let job_id = JobId::new();
    let answerer = harness.answerer();

    harness.relay.set_online(false);
    assert!(matches!(
        answerer.start(job_id, None).await,
        Err(LinkError::ChannelUnavailable(_))
    ));
    assert_eq!(answerer.state(), SessionState::Idle);

    harness.relay.set_online(true);
    answerer.start(job_id, None).await.unwrap();
    answerer
        .wait_for_state(|s| *s == SessionState::AwaitingOffer, WAIT)
        .await
        .unwrap();
    answerer.stop().await;
}

#[tokio::test]
async fn test_connection_refused_is_an_error() {
    let harness = Harness::new();
    harness.transport.fail_connections(true);
    let answerer = harness.answerer();

    answerer.start(JobId::new(), None).await.unwrap();
    answerer
        .wait_for_state(SessionState::is_error, WAIT)
        .await
        .unwrap();
    answerer.stop().await;
}
