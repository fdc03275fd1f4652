//! Peer transport seam: the connection operations a session drives and the
//! asynchronous events it reports back.

use crate::capture::MediaTrack;
use crate::config::IceConfig;
use crate::errors::LinkError;
use crate::session::peer::SessionInput;
use crate::session::state::RemoteTrack;
use crate::signaling::{IceCandidate, Role, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    /// Transient; the transport may recover on its own
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(LinkState),
    RemoteTrack(RemoteTrack),
}

/// Where a connection delivers its callbacks. Events land in the owning
/// session's inbox and are handled one at a time.
#[derive(Clone)]
pub struct TransportEventSink {
    inbox: mpsc::Sender<SessionInput>,
}

impl TransportEventSink {
    pub(crate) fn new(inbox: mpsc::Sender<SessionInput>) -> Self {
        Self { inbox }
    }

    /// Never blocks, so it is safe to call from inside a connection method
    /// the session itself is awaiting.
    pub fn emit(&self, event: TransportEvent) {
        match self.inbox.try_send(SessionInput::Transport(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(input)) => {
                let inbox = self.inbox.clone();
                tokio::spawn(async move {
                    let _ = inbox.send(input).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                log::trace!("Session inbox closed, dropping transport event");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

/// One peer connection owned by exactly one session
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;

    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), LinkError>;

    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), LinkError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    async fn add_track(&self, track: &MediaTrack) -> Result<(), LinkError>;

    /// Closing an already-closed connection is a no-op.
    async fn close(&self) -> Result<(), LinkError>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_connection(
        &self,
        role: Role,
        ice: &IceConfig,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerConnection>, LinkError>;
}
