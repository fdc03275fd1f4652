//! Deterministic in-process peer transport.
//!
//! Descriptions are plain text: an offer lists one `m=<kind> <id>` line per
//! attached track, and the answering side announces each of those lines as
//! incoming media. Every description set locally yields two host candidates.
//! A connection reports `Connected` once both descriptions are set and at
//! least one remote candidate was applied.

use crate::capture::{MediaTrack, TrackKind};
use crate::config::IceConfig;
use crate::errors::LinkError;
use crate::session::state::RemoteTrack;
use crate::session::transport::{
    LinkState, PeerConnection, PeerTransport, TransportEvent, TransportEventSink,
};
use crate::signaling::{IceCandidate, Role, SdpType, SessionDescription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

/// Marker that makes `set_remote_description` fail.
pub const MALFORMED_SDP: &str = "malformed";
/// Marker that makes `add_ice_candidate` reject a candidate.
pub const REJECTED_CANDIDATE: &str = "reject";

#[derive(Clone, Default)]
pub struct ScriptedTransport {
    connections: Arc<Mutex<Vec<Arc<ScriptedConnection>>>>,
    fail_create: Arc<AtomicBool>,
    next_port: Arc<AtomicU16>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `create_connection` fail.
    pub fn fail_connections(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Every connection created so far, oldest first
    pub fn connections(&self) -> Vec<Arc<ScriptedConnection>> {
        self.connections
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn connection_for(&self, role: Role) -> Option<Arc<ScriptedConnection>> {
        self.connections().into_iter().rev().find(|c| c.role == role)
    }
}

#[async_trait]
impl PeerTransport for ScriptedTransport {
    async fn create_connection(
        &self,
        role: Role,
        _ice: &IceConfig,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerConnection>, LinkError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(LinkError::Transport("scripted transport refused".to_string()));
        }

        let base_port = 50_000 + self.next_port.fetch_add(2, Ordering::SeqCst);
        let connection = Arc::new(ScriptedConnection {
            role,
            base_port,
            events,
            state: Mutex::new(ConnectionLog::default()),
        });
        if let Ok(mut connections) = self.connections.lock() {
            connections.push(connection.clone());
        }
        Ok(Box::new(ScriptedHandle(connection)))
    }
}

#[derive(Default)]
struct ConnectionLog {
    tracks: Vec<MediaTrack>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    connected: bool,
    closed: bool,
}

pub struct ScriptedConnection {
    role: Role,
    base_port: u16,
    events: TransportEventSink,
    state: Mutex<ConnectionLog>,
}

impl ScriptedConnection {
    pub fn role(&self) -> Role {
        self.role
    }

    /// Remote candidates in the order they were applied
    pub fn applied_candidates(&self) -> Vec<String> {
        self.read(|log| log.applied.iter().map(|c| c.candidate.clone()).collect())
    }

    pub fn track_count(&self) -> usize {
        self.read(|log| log.tracks.len())
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.read(|log| log.remote.clone())
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.read(|log| log.local.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.read(|log| log.closed)
    }

    /// Push an arbitrary transport event, e.g. a failure.
    pub fn inject(&self, event: TransportEvent) {
        self.events.emit(event);
    }

    fn read<T>(&self, f: impl FnOnce(&ConnectionLog) -> T) -> T
    where
        T: Default,
    {
        self.state.lock().map(|log| f(&log)).unwrap_or_default()
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut ConnectionLog) -> Result<T, LinkError>) -> Result<T, LinkError> {
        let mut log = self
            .state
            .lock()
            .map_err(|_| LinkError::Transport("scripted connection poisoned".to_string()))?;
        if log.closed {
            return Err(LinkError::Transport("connection closed".to_string()));
        }
        f(&mut log)
    }

    fn maybe_connect(&self) {
        let now_connected = self
            .state
            .lock()
            .map(|mut log| {
                let ready = !log.connected
                    && !log.closed
                    && log.local.is_some()
                    && log.remote.is_some()
                    && !log.applied.is_empty();
                if ready {
                    log.connected = true;
                }
                ready
            })
            .unwrap_or(false);
        if now_connected {
            self.events
                .emit(TransportEvent::ConnectionState(LinkState::Connected));
        }
    }

    fn describe(&self, sdp_type: SdpType, tracks: &[MediaTrack]) -> SessionDescription {
        let mut sdp = format!("v=0\r\no=scripted {} IN IP4 127.0.0.1\r\n", self.role);
        for track in tracks {
            let kind = match track.kind {
                TrackKind::Video => "video",
                TrackKind::Audio => "audio",
            };
            sdp.push_str(&format!("m={} {}\r\n", kind, track.id));
        }
        sdp.push_str("m=application control\r\n");
        SessionDescription { sdp_type, sdp }
    }
}

/// Media sections announced by a scripted description
fn announced_tracks(sdp: &str) -> Vec<RemoteTrack> {
    sdp.lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("m=")?;
            let (kind, id) = rest.split_once(' ')?;
            matches!(kind, "video" | "audio").then(|| RemoteTrack {
                id: id.to_string(),
                kind: kind.to_string(),
            })
        })
        .collect()
}

struct ScriptedHandle(Arc<ScriptedConnection>);

#[async_trait]
impl PeerConnection for ScriptedHandle {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        let conn = &self.0;
        conn.with_log(|log| Ok(conn.describe(SdpType::Offer, &log.tracks)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        let conn = &self.0;
        conn.with_log(|log| match &log.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => {
                Ok(conn.describe(SdpType::Answer, &log.tracks))
            }
            _ => Err(LinkError::Negotiation(
                "cannot answer without a remote offer".to_string(),
            )),
        })
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), LinkError> {
        let conn = &self.0;
        conn.with_log(|log| {
            log.local = Some(description);
            Ok(())
        })?;

        // Trickle two host candidates once gathering starts.
        for offset in 0..2u16 {
            let candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                offset + 1,
                conn.base_port + offset
            ));
            conn.events.emit(TransportEvent::LocalCandidate(candidate));
        }
        conn.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        let conn = &self.0;
        if description.sdp.contains(MALFORMED_SDP) {
            return Err(LinkError::Negotiation(
                "failed to parse remote description".to_string(),
            ));
        }
        let incoming = if description.sdp_type == SdpType::Offer {
            announced_tracks(&description.sdp)
        } else {
            Vec::new()
        };
        conn.with_log(|log| {
            log.remote = Some(description);
            Ok(())
        })?;

        for track in incoming {
            conn.events.emit(TransportEvent::RemoteTrack(track));
        }
        conn.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        let conn = &self.0;
        conn.with_log(|log| {
            if log.remote.is_none() {
                return Err(LinkError::Negotiation(
                    "remote description not set".to_string(),
                ));
            }
            if candidate.candidate.contains(REJECTED_CANDIDATE) {
                return Err(LinkError::Negotiation(format!(
                    "unusable candidate {}",
                    candidate.candidate
                )));
            }
            log.applied.push(candidate);
            Ok(())
        })?;
        conn.maybe_connect();
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), LinkError> {
        self.0.with_log(|log| {
            log.tracks.push(track.clone());
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), LinkError> {
        let conn = &self.0;
        let first = conn
            .state
            .lock()
            .map(|mut log| !std::mem::replace(&mut log.closed, true))
            .unwrap_or(false);
        if first {
            conn.events
                .emit(TransportEvent::ConnectionState(LinkState::Closed));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announced_tracks() {
        let tracks = announced_tracks("v=0\r\nm=video cam0\r\nm=application control\r\n");
        assert_eq!(
            tracks,
            vec![RemoteTrack {
                id: "cam0".to_string(),
                kind: "video".to_string()
            }]
        );
    }
}
