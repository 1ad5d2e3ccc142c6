//! Call-level error kinds and their propagation policy.

use std::time::Duration;

use intercom_audio::AudioError;
use intercom_proto::WireError;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The peer half-closed; an orderly end, not a failure.
    #[error("transport closed by peer")]
    TransportClosed,
    #[error("transport i/o: {0}")]
    TransportIo(String),
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("audio device i/o: {0}")]
    DeviceIo(String),
    #[error("no handshake reply within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("no accept decision within {0:?}")]
    AcceptTimeout(Duration),
    /// Expected during teardown; never surfaced above the call boundary.
    #[error("call cancelled")]
    Cancelled,
    #[error("peer rejected the call")]
    PeerRejected,
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl CallError {
    /// Ends that are nobody's fault: logged at info level, no error lamp,
    /// and do-not-disturb is left untouched.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            CallError::TransportClosed
                | CallError::HandshakeTimeout(_)
                | CallError::AcceptTimeout(_)
                | CallError::Cancelled
                | CallError::PeerRejected
        )
    }

    /// Errors the station cannot survive; the supervisor records them and
    /// exits with a failure code.
    pub fn is_fatal_to_station(&self) -> bool {
        matches!(self, CallError::InternalInvariant(_))
    }
}

impl From<WireError> for CallError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Closed => CallError::TransportClosed,
            other => CallError::TransportIo(other.to_string()),
        }
    }
}

impl From<AudioError> for CallError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::DeviceUnavailable(msg) => CallError::DeviceUnavailable(msg),
            AudioError::DeviceIo(msg) => CallError::DeviceIo(msg),
            // A closed buffer during teardown is the cancel path, not a fault.
            AudioError::BufferClosed => CallError::Cancelled,
        }
    }
}
