use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::time::Instant;

use serde_json::Value;

use crate::error::{MeshError, MeshResult};
use crate::identity::{ConnectionId, PeerId, Role};
use crate::media::{LocalStream, RemoteStream, StreamId};
use crate::transport::ConnectionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Acceptor side: handle exists, transport not yet up.
    Accepting,
    Connected,
}

/// A connection handle bound to one handshake exchange.
pub struct LiveConnection {
    pub peer: PeerId,
    pub connection_id: ConnectionId,
    pub role: Role,
    pub phase: ConnectionPhase,
    pub opened_at: Instant,
    handle: Box<dyn ConnectionHandle>,
    attached: BTreeSet<StreamId>,
    remote_streams: BTreeMap<StreamId, RemoteStream>,
}

impl fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveConnection")
            .field("peer", &self.peer)
            .field("connection_id", &self.connection_id)
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("attached", &self.attached)
            .field("remote_streams", &self.remote_streams.len())
            .finish()
    }
}

impl LiveConnection {
    pub fn new(
        peer: PeerId,
        connection_id: ConnectionId,
        role: Role,
        handle: Box<dyn ConnectionHandle>,
        opened_at: Instant,
    ) -> Self {
        let phase = match role {
            Role::Initiator => ConnectionPhase::Connected,
            Role::Acceptor => ConnectionPhase::Accepting,
        };
        Self {
            peer,
            connection_id,
            role,
            phase,
            opened_at,
            handle,
            attached: BTreeSet::new(),
            remote_streams: BTreeMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    pub fn signal(&mut self, payload: Value) -> MeshResult<()> {
        self.handle.signal(payload)
    }

    /// Attach a local stream unless it is already attached.
    pub fn attach(&mut self, stream: &LocalStream) -> MeshResult<()> {
        if self.attached.contains(&stream.id) {
            return Ok(());
        }
        self.handle.attach_stream(stream)?;
        self.attached.insert(stream.id.clone());
        Ok(())
    }

    pub fn detach(&mut self, stream: &LocalStream) -> MeshResult<()> {
        if !self.attached.remove(&stream.id) {
            return Ok(());
        }
        self.handle.detach_stream(stream)
    }

    pub fn attached(&self) -> impl Iterator<Item = &StreamId> {
        self.attached.iter()
    }

    /// Returns `false` if the stream was already known.
    pub fn add_remote_stream(&mut self, stream: RemoteStream) -> bool {
        self.remote_streams.insert(stream.id.clone(), stream).is_none()
    }

    pub fn remove_remote_stream(&mut self, id: &StreamId) -> Option<RemoteStream> {
        self.remote_streams.remove(id)
    }

    pub fn remote_streams(&self) -> impl Iterator<Item = &RemoteStream> {
        self.remote_streams.values()
    }

    /// Close the handle, returning the remote streams it was carrying.
    pub fn close(mut self) -> Vec<RemoteStream> {
        self.handle.close();
        std::mem::take(&mut self.remote_streams).into_values().collect()
    }
}

/// Authoritative map from peer to its single live connection.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: BTreeMap<PeerId, LiveConnection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects rather than replaces an existing entry; the rejected
    /// connection is handed back so the caller can close it.
    pub fn insert(&mut self, connection: LiveConnection) -> Result<(), (MeshError, LiveConnection)> {
        if self.entries.contains_key(&connection.peer) {
            let err = MeshError::DuplicateConnection(connection.peer.clone());
            return Err((err, connection));
        }
        self.entries.insert(connection.peer.clone(), connection);
        Ok(())
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<LiveConnection> {
        self.entries.remove(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&LiveConnection> {
        self.entries.get(peer)
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut LiveConnection> {
        self.entries.get_mut(peer)
    }

    /// The entry for `peer` only if it belongs to `connection_id`.
    pub fn get_bound_mut(
        &mut self,
        peer: &PeerId,
        connection_id: &ConnectionId,
    ) -> Option<&mut LiveConnection> {
        self.entries
            .get_mut(peer)
            .filter(|entry| &entry.connection_id == connection_id)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.entries.keys()
    }

    /// Visit every entry in peer order.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&LiveConnection),
    {
        for entry in self.entries.values() {
            f(entry);
        }
    }

    pub fn for_each_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut LiveConnection),
    {
        for entry in self.entries.values_mut() {
            f(entry);
        }
    }

    /// Remove every entry, in peer order.
    pub fn drain(&mut self) -> Vec<LiveConnection> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

/// Connection ids remembered per peer after their connection is gone.
const RETIRED_IDS_PER_PEER: usize = 16;

/// Recently torn-down connection ids, so a re-delivered init for a dead
/// attempt cannot open a fresh handle. Bounded per peer; oldest ids fall out.
#[derive(Debug, Default)]
pub struct RetiredConnections {
    ids: BTreeMap<PeerId, VecDeque<ConnectionId>>,
}

impl RetiredConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, peer: &PeerId, connection_id: ConnectionId) {
        let ids = self.ids.entry(peer.clone()).or_default();
        if ids.contains(&connection_id) {
            return;
        }
        if ids.len() == RETIRED_IDS_PER_PEER {
            ids.pop_front();
        }
        ids.push_back(connection_id);
    }

    pub fn contains(&self, peer: &PeerId, connection_id: &ConnectionId) -> bool {
        self.ids
            .get(peer)
            .is_some_and(|ids| ids.contains(connection_id))
    }
}
