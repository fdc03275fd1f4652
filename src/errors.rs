use crate::types::JobStatus;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Invalid job id: {0}")]
    InvalidId(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Job already accepted: {0}")]
    AlreadyAccepted(String),
    #[error("Conflicting update: {0}")]
    Conflict(String),
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("Invalid job: {0}")]
    InvalidJob(String),
    #[error("Signaling channel unavailable: {0}")]
    ChannelUnavailable(String),
    #[error("Malformed negotiation message: {0}")]
    MalformedMessage(String),
    #[error("Permission denied error: {0}")]
    PermissionDenied(String),
    #[error("Capture device unavailable: {0}")]
    CaptureUnavailable(String),
    #[error("Negotiation error: {0}")]
    Negotiation(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Session is closed")]
    SessionClosed,
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LinkError {
    /// Per-operation failures that are absorbed locally instead of aborting
    /// the session (camera permission, missing device).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::PermissionDenied(_) | LinkError::CaptureUnavailable(_)
        )
    }

    /// Text shown to the participant.
    pub fn user_message(&self) -> String {
        match self {
            LinkError::Conflict(_) | LinkError::AlreadyAccepted(_) => {
                "This job is no longer available.".to_string()
            }
            LinkError::NotFound(_) => "No matching job was found.".to_string(),
            LinkError::InvalidId(_) => {
                "Cannot accept this job because it has no valid id.".to_string()
            }
            LinkError::PermissionDenied(_) | LinkError::CaptureUnavailable(_) => {
                "Camera is not available. The job continues without live video.".to_string()
            }
            LinkError::ChannelUnavailable(_) => {
                "Live connection is unavailable. Retry or go back.".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_message() {
        let err = LinkError::PermissionDenied("camera blocked".to_string());
        assert_eq!(err.to_string(), "Permission denied error: camera blocked");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = LinkError::InvalidTransition {
            from: JobStatus::Open,
            to: JobStatus::Completed,
        };
        assert_eq!(err.to_string(), "Invalid transition from open to completed");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(LinkError::PermissionDenied(String::new()).is_recoverable());
        assert!(LinkError::CaptureUnavailable(String::new()).is_recoverable());
        assert!(!LinkError::ChannelUnavailable(String::new()).is_recoverable());
        assert!(!LinkError::Negotiation(String::new()).is_recoverable());
    }

    #[test]
    fn test_lost_race_is_surfaced_as_unavailable() {
        let msg = LinkError::Conflict("job".into()).user_message();
        assert!(msg.contains("no longer available"));
    }
}
