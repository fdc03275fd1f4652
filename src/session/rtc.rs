//! `PeerTransport` over webrtc-rs.

use crate::capture::{MediaTrack, TrackKind};
use crate::config::{BundlePolicy, IceConfig, IceServer, IceTransportPolicy};
use crate::errors::LinkError;
use crate::session::state::RemoteTrack;
use crate::session::transport::{
    LinkState, PeerConnection, PeerTransport, TransportEvent, TransportEventSink,
};
use crate::signaling::{IceCandidate, Role, SdpType, SessionDescription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Label of the data channel the offerer always opens, so an offer without
/// camera tracks still negotiates a transport.
pub const CONTROL_CHANNEL_LABEL: &str = "jobcam";

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl From<&IceConfig> for RTCConfiguration {
    fn from(ice: &IceConfig) -> Self {
        RTCConfiguration {
            ice_servers: ice.servers.iter().map(RTCIceServer::from).collect(),
            ice_transport_policy: match ice.transport_policy {
                IceTransportPolicy::All => RTCIceTransportPolicy::All,
                IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            bundle_policy: match ice.bundle_policy {
                BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
                BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
                BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
            },
            ..Default::default()
        }
    }
}

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => LinkState::New,
            RTCPeerConnectionState::Connecting => LinkState::Connecting,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
        }
    }
}

impl TryFrom<SessionDescription> for RTCSessionDescription {
    type Error = LinkError;

    fn try_from(desc: SessionDescription) -> Result<Self, Self::Error> {
        match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp)
                .map_err(|e| LinkError::Negotiation(format!("Invalid SDP offer: {}", e))),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp)
                .map_err(|e| LinkError::Negotiation(format!("Invalid SDP answer: {}", e))),
        }
    }
}

impl TryFrom<RTCSessionDescription> for SessionDescription {
    type Error = LinkError;

    fn try_from(desc: RTCSessionDescription) -> Result<Self, Self::Error> {
        match desc.sdp_type {
            RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
            RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
            other => Err(LinkError::Negotiation(format!(
                "Unsupported SDP type {}",
                other
            ))),
        }
    }
}

fn candidate_from_rtc(candidate: &RTCIceCandidate) -> Result<IceCandidate, LinkError> {
    let init = candidate
        .to_json()
        .map_err(|e| LinkError::Transport(format!("Failed to serialize candidate: {}", e)))?;
    Ok(IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    })
}

/// Creates webrtc-rs peer connections with the default codecs and
/// interceptors registered.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcTransport;

impl WebRtcTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_connection(
        &self,
        role: Role,
        ice: &IceConfig,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerConnection>, LinkError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| LinkError::Transport(format!("Failed to register codecs: {}", e)))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| LinkError::Transport(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let peer_connection = Arc::new(
            api.new_peer_connection(RTCConfiguration::from(ice))
                .await
                .map_err(|e| {
                    LinkError::Transport(format!("Failed to create peer connection: {}", e))
                })?,
        );

        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // `None` marks the end of gathering.
            if let Some(candidate) = candidate {
                match candidate_from_rtc(&candidate) {
                    Ok(candidate) => sink.emit(TransportEvent::LocalCandidate(candidate)),
                    Err(e) => log::warn!("Dropping local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                log::debug!("Peer connection state changed: {}", state);
                sink.emit(TransportEvent::ConnectionState(state.into()));
                Box::pin(async {})
            },
        ));

        let sink = events;
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                sink.emit(TransportEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    kind: track.kind().to_string(),
                }));
                Box::pin(async {})
            },
        ));

        let control = if role == Role::Offerer {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let channel = peer_connection
                .create_data_channel(CONTROL_CHANNEL_LABEL, Some(init))
                .await
                .map_err(|e| LinkError::Transport(format!("Failed to create data channel: {}", e)))?;
            Some(channel)
        } else {
            None
        };

        log::info!("Created {} peer connection", role);
        Ok(Box::new(WebRtcConnection {
            role,
            peer_connection,
            _control: control,
            closed: AtomicBool::new(false),
        }))
    }
}

struct WebRtcConnection {
    role: Role,
    peer_connection: Arc<RTCPeerConnection>,
    _control: Option<Arc<RTCDataChannel>>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        log::info!("Creating SDP offer ({})", self.role);
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| LinkError::Negotiation(format!("Failed to create offer: {}", e)))?;
        SessionDescription::try_from(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        log::info!("Creating SDP answer ({})", self.role);
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| LinkError::Negotiation(format!("Failed to create answer: {}", e)))?;
        SessionDescription::try_from(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), LinkError> {
        let rtc_desc = RTCSessionDescription::try_from(description)?;
        self.peer_connection
            .set_local_description(rtc_desc)
            .await
            .map_err(|e| LinkError::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        log::info!("Setting remote description ({})", self.role);
        let rtc_desc = RTCSessionDescription::try_from(description)?;
        self.peer_connection
            .set_remote_description(rtc_desc)
            .await
            .map_err(|e| LinkError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        log::debug!("Adding ICE candidate ({}): {}", self.role, candidate.candidate);
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| LinkError::Negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), LinkError> {
        let mime_type = match track.kind {
            TrackKind::Video => MIME_TYPE_VP8,
            TrackKind::Audio => MIME_TYPE_OPUS,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            CONTROL_CHANNEL_LABEL.to_owned(),
        ));
        self.peer_connection
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| LinkError::Transport(format!("Failed to add track {}: {}", track.id, e)))?;
        log::info!("Attached local {:?} track {}", track.kind, track.id);
        Ok(())
    }

    async fn close(&self) -> Result<(), LinkError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("Closing {} peer connection", self.role);
        self.peer_connection
            .close()
            .await
            .map_err(|e| LinkError::Transport(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::session::peer::SessionInput;
    use tokio::sync::mpsc;

    async fn connection(role: Role) -> (Box<dyn PeerConnection>, mpsc::Receiver<SessionInput>) {
        let (tx, rx) = mpsc::channel(64);
        let ice = IceConfig {
            servers: Vec::new(),
            ..LinkConfig::default().ice
        };
        let conn = WebRtcTransport::new()
            .create_connection(role, &ice, TransportEventSink::new(tx))
            .await
            .unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn test_offer_carries_control_channel() {
        let (offerer, _rx) = connection(Role::Offerer).await;
        let offer = offerer.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("v=0"));
        assert!(offer.sdp.contains("m=application"));
    }

    #[tokio::test]
    async fn test_answer_for_remote_offer() {
        let (offerer, _orx) = connection(Role::Offerer).await;
        let (answerer, _arx) = connection(Role::Answerer).await;

        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();

        let answer = answerer.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_twice() {
        let (conn, _rx) = connection(Role::Answerer).await;
        conn.close().await.unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_remote_description_is_rejected() {
        let (conn, _rx) = connection(Role::Answerer).await;
        let result = conn
            .set_remote_description(SessionDescription::offer("not sdp"))
            .await;
        assert!(matches!(result, Err(LinkError::Negotiation(_))));
    }
}
