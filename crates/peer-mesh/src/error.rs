use thiserror::Error;

use crate::identity::PeerId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeshError {
    /// Connection id or state mismatch; expected under unordered delivery.
    #[error("stale {kind} from {peer}")]
    StaleMessage { peer: PeerId, kind: &'static str },
    #[error("connection to {0} already registered")]
    DuplicateConnection(PeerId),
    #[error("local capture unavailable: {0}")]
    CaptureUnavailable(String),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("signal relay error: {0}")]
    Relay(String),
    #[error("mesh task has shut down")]
    Shutdown,
}

impl MeshError {
    pub(crate) fn stale(peer: &PeerId, kind: &'static str) -> Self {
        MeshError::StaleMessage {
            peer: peer.clone(),
            kind,
        }
    }
}

impl From<signal_bus::BusError> for MeshError {
    fn from(err: signal_bus::BusError) -> Self {
        MeshError::Relay(err.to_string())
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
