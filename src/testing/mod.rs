//! Test doubles for running negotiation without a network or a camera.
//!
//! Public so integration tests and embedding applications can drive full
//! requester/fulfiller flows in one process.

pub mod capture;
pub mod transport;

pub use capture::{CaptureMode, StaticCapture};
pub use transport::{ScriptedConnection, ScriptedTransport, MALFORMED_SDP, REJECTED_CANDIDATE};
