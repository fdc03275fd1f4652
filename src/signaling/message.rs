use crate::errors::LinkError;
use crate::types::JobId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which half of the negotiation a participant plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    pub fn peer(&self) -> Role {
        match self {
            Role::Offerer => Role::Answerer,
            Role::Answerer => Role::Offerer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => f.write_str("offerer"),
            Role::Answerer => f.write_str("answerer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Offer,
    Answer,
    IceCandidate,
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }
}

/// Envelope relayed over a job's signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationMessage {
    pub sender: Role,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    pub job_id: JobId,
}

impl NegotiationMessage {
    pub fn offer(job_id: JobId, description: SessionDescription) -> Self {
        Self {
            sender: Role::Offerer,
            kind: MessageKind::Offer,
            session_description: Some(description),
            candidate: None,
            job_id,
        }
    }

    pub fn answer(job_id: JobId, description: SessionDescription) -> Self {
        Self {
            sender: Role::Answerer,
            kind: MessageKind::Answer,
            session_description: Some(description),
            candidate: None,
            job_id,
        }
    }

    pub fn ice_candidate(sender: Role, job_id: JobId, candidate: IceCandidate) -> Self {
        Self {
            sender,
            kind: MessageKind::IceCandidate,
            session_description: None,
            candidate: Some(candidate),
            job_id,
        }
    }

    /// Checks the payload matches `kind`: a description for offers and
    /// answers (of the same SDP type, from the right role), a candidate
    /// otherwise, never both.
    pub fn validate(&self) -> Result<(), LinkError> {
        match self.kind {
            MessageKind::Offer | MessageKind::Answer => {
                let description = self.session_description.as_ref().ok_or_else(|| {
                    LinkError::MalformedMessage(format!("{:?} without session description", self.kind))
                })?;
                if self.candidate.is_some() {
                    return Err(LinkError::MalformedMessage(format!(
                        "{:?} must not carry a candidate",
                        self.kind
                    )));
                }
                let (expected_type, expected_sender) = match self.kind {
                    MessageKind::Offer => (SdpType::Offer, Role::Offerer),
                    _ => (SdpType::Answer, Role::Answerer),
                };
                if description.sdp_type != expected_type || self.sender != expected_sender {
                    return Err(LinkError::MalformedMessage(format!(
                        "{:?} from {} carries a {:?} description",
                        self.kind, self.sender, description.sdp_type
                    )));
                }
                if description.sdp.trim().is_empty() {
                    return Err(LinkError::MalformedMessage("empty session description".into()));
                }
            }
            MessageKind::IceCandidate => {
                let candidate = self.candidate.as_ref().ok_or_else(|| {
                    LinkError::MalformedMessage("ice candidate message without candidate".into())
                })?;
                if self.session_description.is_some() {
                    return Err(LinkError::MalformedMessage(
                        "ice candidate message must not carry a description".into(),
                    ));
                }
                if candidate.candidate.trim().is_empty() {
                    return Err(LinkError::MalformedMessage("empty candidate".into()));
                }
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes, LinkError> {
        self.validate()?;
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| LinkError::MalformedMessage(format!("encode failed: {}", e)))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, LinkError> {
        let message: NegotiationMessage = serde_json::from_slice(payload)
            .map_err(|e| LinkError::MalformedMessage(format!("decode failed: {}", e)))?;
        message.validate()?;
        Ok(message)
    }
}
