use crate::signaling::Role;
use crate::types::JobId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of a peer session.
///
/// Offerer: `Idle -> AcquiringMedia -> NegotiatingOffer -> AwaitingAnswer -> Connected`
/// Answerer: `Idle -> AwaitingOffer -> NegotiatingAnswer -> Connected`
///
/// `Error` is reachable from every non-terminal state; `Closed` is terminal
/// and reachable from everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AcquiringMedia,
    NegotiatingOffer,
    AwaitingAnswer,
    AwaitingOffer,
    NegotiatingAnswer,
    Connected,
    Error(String),
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SessionState::Error(_))
    }

    /// Done negotiating, successfully or not
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Error(_) | SessionState::Closed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::AcquiringMedia => write!(f, "acquiring_media"),
            SessionState::NegotiatingOffer => write!(f, "negotiating_offer"),
            SessionState::AwaitingAnswer => write!(f, "awaiting_answer"),
            SessionState::AwaitingOffer => write!(f, "awaiting_offer"),
            SessionState::NegotiatingAnswer => write!(f, "negotiating_answer"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Error(reason) => write!(f, "error: {}", reason),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Remote media announced by the transport. The session does not look
/// inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: String,
}

/// Snapshot of a session, published on every change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Set once the session has started
    pub job_id: Option<JobId>,
    pub role: Role,
    pub state: SessionState,
    pub outbound_tracks: usize,
    pub remote_tracks: Vec<RemoteTrack>,
    pub offers_sent: u32,
    pub answers_sent: u32,
    pub local_candidates_published: u32,
    pub remote_candidates_buffered: u32,
    pub remote_candidates_applied: u32,
    pub remote_candidates_rejected: u32,
}

impl SessionStats {
    pub fn new(role: Role) -> Self {
        Self {
            job_id: None,
            role,
            state: SessionState::Idle,
            outbound_tracks: 0,
            remote_tracks: Vec::new(),
            offers_sent: 0,
            answers_sent: 0,
            local_candidates_published: 0,
            remote_candidates_buffered: 0,
            remote_candidates_applied: 0,
            remote_candidates_rejected: 0,
        }
    }
}

/// Notifications for the surface consuming a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    IncomingMedia(RemoteTrack),
    /// Absorbed, per-operation failure (camera denied, one bad candidate)
    Warning(String),
    Failed(String),
}
