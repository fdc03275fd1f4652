//! Per-job negotiation relay between a requester and a fulfiller.

pub mod channel;
pub mod message;
pub mod relay;

pub use channel::{ChannelHandle, SignalingChannel};
pub use message::{IceCandidate, MessageKind, NegotiationMessage, Role, SdpType, SessionDescription};
pub use relay::{MemoryRelay, RelaySubscription, RelayTransport};
