pub mod peer;
pub mod rtc;
pub mod state;
pub mod transport;

pub use peer::{PeerSession, SessionDeps};
pub use rtc::WebRtcTransport;
pub use state::{RemoteTrack, SessionEvent, SessionState, SessionStats};
pub use transport::{LinkState, PeerConnection, PeerTransport, TransportEvent, TransportEventSink};
