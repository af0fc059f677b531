//! Boundary to the peer-connection implementation.
//!
//! A [`ConnectionHandle`] is opaque to the mesh: it consumes handshake
//! payloads received over the signal channel, produces its own through a
//! [`TransportSink`], and accepts local streams. Everything a handle reports
//! re-enters the mesh event queue, so handle implementations may be as
//! asynchronous as they like.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::MeshResult;
use crate::identity::{ConnectionId, PeerId, Role};
use crate::machine::MeshEvent;
use crate::media::{LocalStream, RemoteStream, StreamId};

/// Parameters for constructing one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub peer: PeerId,
    pub connection_id: ConnectionId,
    pub role: Role,
}

pub trait ConnectionHandle: Send {
    /// Feed a handshake payload received from the remote side.
    fn signal(&mut self, payload: Value) -> MeshResult<()>;
    fn attach_stream(&mut self, stream: &LocalStream) -> MeshResult<()>;
    fn detach_stream(&mut self, stream: &LocalStream) -> MeshResult<()>;
    /// Release the underlying connection. Must not emit further events.
    fn close(&mut self);
}

pub trait ConnectionFactory: Send + Sync {
    fn open(
        &self,
        request: ConnectionRequest,
        sink: TransportSink,
    ) -> MeshResult<Box<dyn ConnectionHandle>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// Locally generated handshake payload to relay to the remote peer.
    Signal(Value),
    /// The link is usable.
    Established,
    StreamReceived(RemoteStream),
    StreamEnded(StreamId),
    Closed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub peer: PeerId,
    pub connection_id: ConnectionId,
    pub kind: TransportEventKind,
}

/// Event sender handed to each handle, pre-bound to its peer and
/// connection id so stale handles can be told apart.
#[derive(Debug, Clone)]
pub struct TransportSink {
    peer: PeerId,
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl TransportSink {
    pub(crate) fn new(
        peer: PeerId,
        connection_id: ConnectionId,
        tx: mpsc::UnboundedSender<MeshEvent>,
    ) -> Self {
        Self {
            peer,
            connection_id,
            tx,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Queue an event for the mesh. Returns `false` once the mesh is gone.
    pub fn emit(&self, kind: TransportEventKind) -> bool {
        self.tx
            .send(MeshEvent::Transport(TransportEvent {
                peer: self.peer.clone(),
                connection_id: self.connection_id.clone(),
                kind,
            }))
            .is_ok()
    }
}
