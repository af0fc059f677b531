//! Connection establishment state machine.
//!
//! [`Mesh`] owns every piece of per-peer state (roster mirror, pending
//! inits, connection registry, capture toggles) and is mutated only through
//! [`Mesh::handle`], one event at a time. Per-peer state is derived:
//!
//! | pending init | registry entry     | state        |
//! |--------------|--------------------|--------------|
//! | no           | none               | `Idle`       |
//! | yes          | none               | `Initiating` |
//! | no           | phase `Accepting`  | `Accepting`  |
//! | no           | phase `Connected`  | `Connected`  |
//!
//! Only the lower identity of a pair ever sends an init and only the higher
//! one ever accepts, so the pair cannot both initiate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::config::MeshConfig;
use crate::discovery;
use crate::error::{MeshError, MeshResult};
use crate::identity::{role_towards, ConnectionId, PeerId, Role};
use crate::media::{
    CaptureCompletion, CaptureProvider, CaptureRelease, LocalStream, MediaAttachment, RemoteStream,
    StreamId, StreamKind,
};
use crate::registry::{ConnectionPhase, ConnectionRegistry, LiveConnection, RetiredConnections};
use crate::roster::Roster;
use crate::signal::{SignalMessage, SignalRelay};
use crate::transport::{
    ConnectionFactory, ConnectionRequest, TransportEvent, TransportEventKind, TransportSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Initiating,
    Accepting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Closed,
    TransportFailure(String),
    RosterRemoved,
    HandshakeTimeout,
    RelayFailure(String),
    Shutdown,
}

/// Everything the mesh task reacts to.
#[derive(Debug)]
pub enum MeshEvent {
    Signal(SignalMessage),
    DiscoveryTick(Instant),
    Roster(BTreeSet<PeerId>),
    Transport(TransportEvent),
    SetCapture {
        kind: StreamKind,
        enabled: bool,
    },
    CaptureReady {
        kind: StreamKind,
        result: MeshResult<LocalStream>,
    },
    ProbePresence(Vec<PeerId>),
    AnswerPresence(PeerId),
    Inspect(oneshot::Sender<MeshSnapshot>),
    Shutdown,
}

/// Reported to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshNotification {
    PeerConnected {
        peer: PeerId,
        connection_id: ConnectionId,
        role: Role,
    },
    PeerDisconnected {
        peer: PeerId,
        connection_id: ConnectionId,
        reason: DisconnectReason,
    },
    RemoteStreamAdded {
        peer: PeerId,
        stream: RemoteStream,
    },
    RemoteStreamRemoved {
        peer: PeerId,
        stream_id: StreamId,
    },
    CaptureStarted {
        kind: StreamKind,
        stream_id: StreamId,
    },
    CaptureStopped {
        kind: StreamKind,
    },
    CaptureFailed {
        kind: StreamKind,
        error: MeshError,
    },
    PresenceRequested {
        peer: PeerId,
    },
    PresenceConfirmed {
        peer: PeerId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub peer: PeerId,
    pub state: PeerState,
    pub connection_id: Option<ConnectionId>,
    pub in_roster: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSnapshot {
    pub local: PeerId,
    pub peers: Vec<PeerStatus>,
    pub capture: Vec<StreamKind>,
}

impl MeshSnapshot {
    pub fn status(&self, peer: &PeerId) -> Option<&PeerStatus> {
        self.peers.iter().find(|status| &status.peer == peer)
    }

    pub fn connected(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|status| status.state == PeerState::Connected)
            .map(|status| status.peer.clone())
            .collect()
    }
}

/// An init this side sent and whose accept has not arrived yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInit {
    pub peer: PeerId,
    pub connection_id: ConnectionId,
    pub started_at: Instant,
    /// Handshake payloads that overtook the accept.
    pub buffered: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// External collaborators of a mesh.
#[derive(Clone)]
pub struct MeshServices {
    pub relay: Arc<dyn SignalRelay>,
    pub factory: Arc<dyn ConnectionFactory>,
    pub capture: Arc<dyn CaptureProvider>,
}

pub struct Mesh {
    local: PeerId,
    config: MeshConfig,
    services: MeshServices,
    roster: Roster,
    pending: BTreeMap<PeerId, PendingInit>,
    registry: ConnectionRegistry,
    retired: RetiredConnections,
    media: MediaAttachment,
    events: mpsc::UnboundedSender<MeshEvent>,
    notifications: mpsc::UnboundedSender<MeshNotification>,
}

impl Mesh {
    /// `events` must feed back into this mesh's queue: handles and capture
    /// completions report through it.
    pub fn new(
        local: PeerId,
        config: MeshConfig,
        services: MeshServices,
        events: mpsc::UnboundedSender<MeshEvent>,
        notifications: mpsc::UnboundedSender<MeshNotification>,
    ) -> Self {
        Self {
            local,
            config,
            services,
            roster: Roster::new(),
            pending: BTreeMap::new(),
            registry: ConnectionRegistry::new(),
            retired: RetiredConnections::new(),
            media: MediaAttachment::new(),
            events,
            notifications,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn pending(&self, peer: &PeerId) -> Option<&PendingInit> {
        self.pending.get(peer)
    }

    pub fn state_of(&self, peer: &PeerId) -> PeerState {
        if self.pending.contains_key(peer) {
            return PeerState::Initiating;
        }
        match self.registry.get(peer) {
            Some(entry) if entry.is_connected() => PeerState::Connected,
            Some(_) => PeerState::Accepting,
            None => PeerState::Idle,
        }
    }

    /// Connection id of the attempt or connection currently bound to `peer`.
    pub fn connection_id(&self, peer: &PeerId) -> Option<&ConnectionId> {
        self.pending
            .get(peer)
            .map(|pending| &pending.connection_id)
            .or_else(|| self.registry.get(peer).map(|entry| &entry.connection_id))
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        let peers: BTreeSet<&PeerId> = self.roster.iter().chain(self.registry.peers()).collect();
        MeshSnapshot {
            local: self.local.clone(),
            peers: peers
                .into_iter()
                .map(|peer| PeerStatus {
                    peer: peer.clone(),
                    state: self.state_of(peer),
                    connection_id: self.connection_id(peer).cloned(),
                    in_roster: self.roster.contains(peer),
                })
                .collect(),
            capture: self.media.active_kinds(),
        }
    }

    /// Process one event to completion.
    pub fn handle(&mut self, event: MeshEvent) -> Flow {
        let result = match event {
            MeshEvent::Signal(message) => self.on_signal(message),
            MeshEvent::DiscoveryTick(now) => {
                self.on_discovery_tick(now);
                Ok(())
            }
            MeshEvent::Roster(snapshot) => {
                self.on_roster(&snapshot);
                Ok(())
            }
            MeshEvent::Transport(event) => self.on_transport_event(event),
            MeshEvent::SetCapture { kind, enabled } => {
                self.set_capture(kind, enabled);
                Ok(())
            }
            MeshEvent::CaptureReady { kind, result } => {
                self.on_capture_ready(kind, result);
                Ok(())
            }
            MeshEvent::ProbePresence(peers) => self.probe_presence(&peers),
            MeshEvent::AnswerPresence(peer) => self.send(
                &peer,
                SignalMessage::PresenceAck {
                    from: self.local.clone(),
                },
            ),
            MeshEvent::Inspect(reply) => {
                let _ = reply.send(self.snapshot());
                Ok(())
            }
            MeshEvent::Shutdown => {
                self.shutdown();
                return Flow::Stop;
            }
        };
        if let Err(err) = result {
            self.report(err);
        }
        Flow::Continue
    }

    fn report(&self, err: MeshError) {
        match err {
            MeshError::StaleMessage { .. } => {
                trace!(target = "mesh", local = %self.local, error = %err, "discarded");
            }
            MeshError::DuplicateConnection(_) => {
                error!(target = "mesh", local = %self.local, error = %err, "rejected connection");
            }
            MeshError::CaptureUnavailable(_)
            | MeshError::TransportFailure(_)
            | MeshError::Relay(_) => {
                warn!(target = "mesh", local = %self.local, error = %err, "mesh operation failed");
            }
            MeshError::Shutdown => {
                debug!(target = "mesh", local = %self.local, "event after shutdown");
            }
        }
    }

    fn send(&self, to: &PeerId, message: SignalMessage) -> MeshResult<()> {
        self.services.relay.send(to, message)
    }

    fn notify(&self, notification: MeshNotification) {
        if self.notifications.send(notification).is_err() {
            trace!(target = "mesh", local = %self.local, "notification receiver dropped");
        }
    }

    fn on_signal(&mut self, message: SignalMessage) -> MeshResult<()> {
        let Some(from) = message.from().cloned() else {
            debug!(target = "mesh", local = %self.local, "ignoring unrecognised signal");
            return Ok(());
        };
        if from == self.local {
            return Ok(());
        }
        trace!(target = "mesh", local = %self.local, from = %from, kind = message.kind(), "signal in");
        match message {
            SignalMessage::DiscoveryProbe { .. } => self.send(
                &from,
                SignalMessage::DiscoveryAck {
                    from: self.local.clone(),
                },
            ),
            SignalMessage::DiscoveryAck { .. } => self.on_discovery_ack(from),
            SignalMessage::ConnectionInit { connection_id, .. } => {
                self.on_connection_init(from, connection_id)
            }
            SignalMessage::ConnectionAccept { connection_id, .. } => {
                self.on_connection_accept(from, connection_id)
            }
            SignalMessage::HandshakeData {
                connection_id,
                payload,
                ..
            } => self.on_handshake_data(from, connection_id, payload),
            SignalMessage::PresenceProbe { .. } => {
                self.notify(MeshNotification::PresenceRequested { peer: from });
                Ok(())
            }
            SignalMessage::PresenceAck { .. } => {
                self.notify(MeshNotification::PresenceConfirmed { peer: from });
                Ok(())
            }
            SignalMessage::Unknown => Ok(()),
        }
    }

    fn on_discovery_ack(&mut self, from: PeerId) -> MeshResult<()> {
        if !self.roster.contains(&from) || self.state_of(&from) != PeerState::Idle {
            return Err(MeshError::stale(&from, "discovery_ack"));
        }
        if role_towards(&self.local, &from) != Some(Role::Initiator) {
            trace!(target = "mesh", local = %self.local, peer = %from, "awaiting init from lower peer");
            return Ok(());
        }
        let connection_id = ConnectionId::generate();
        self.send(
            &from,
            SignalMessage::ConnectionInit {
                from: self.local.clone(),
                connection_id: connection_id.clone(),
            },
        )?;
        debug!(
            target = "mesh",
            local = %self.local,
            peer = %from,
            connection_id = %connection_id,
            "sent connection init"
        );
        self.pending.insert(
            from.clone(),
            PendingInit {
                peer: from,
                connection_id,
                started_at: Instant::now(),
                buffered: Vec::new(),
            },
        );
        Ok(())
    }

    fn on_connection_init(&mut self, from: PeerId, connection_id: ConnectionId) -> MeshResult<()> {
        if !self.roster.contains(&from) || self.state_of(&from) != PeerState::Idle {
            return Err(MeshError::stale(&from, "connection_init"));
        }
        if role_towards(&self.local, &from) != Some(Role::Acceptor) {
            debug!(
                target = "mesh",
                local = %self.local,
                peer = %from,
                "ignoring init from higher peer; local side initiates this pair"
            );
            return Err(MeshError::stale(&from, "connection_init"));
        }
        if self.retired.contains(&from, &connection_id) {
            // re-delivered init for an attempt that already ended
            return Err(MeshError::stale(&from, "connection_init"));
        }

        let handle = self.open_handle(&from, &connection_id, Role::Acceptor)?;
        let entry = LiveConnection::new(
            from.clone(),
            connection_id.clone(),
            Role::Acceptor,
            handle,
            Instant::now(),
        );
        self.register(entry)?;

        let accept = SignalMessage::ConnectionAccept {
            from: self.local.clone(),
            connection_id: connection_id.clone(),
        };
        if let Err(err) = self.send(&from, accept) {
            self.teardown(&from, DisconnectReason::RelayFailure(err.to_string()));
            return Err(err);
        }
        debug!(
            target = "mesh",
            local = %self.local,
            peer = %from,
            connection_id = %connection_id,
            "accepted connection init"
        );
        Ok(())
    }

    fn on_connection_accept(&mut self, from: PeerId, connection_id: ConnectionId) -> MeshResult<()> {
        let pending = match self.pending.remove(&from) {
            Some(pending) if pending.connection_id == connection_id => pending,
            Some(other) => {
                self.pending.insert(from.clone(), other);
                return Err(MeshError::stale(&from, "connection_accept"));
            }
            None => return Err(MeshError::stale(&from, "connection_accept")),
        };

        let handle = self.open_handle(&from, &connection_id, Role::Initiator)?;
        let mut entry = LiveConnection::new(
            from.clone(),
            connection_id.clone(),
            Role::Initiator,
            handle,
            Instant::now(),
        );
        for payload in pending.buffered {
            if let Err(err) = entry.signal(payload) {
                entry.close();
                return Err(err);
            }
        }
        self.register(entry)?;

        info!(
            target = "mesh",
            local = %self.local,
            peer = %from,
            connection_id = %connection_id,
            role = "initiator",
            "peer connected"
        );
        self.notify(MeshNotification::PeerConnected {
            peer: from,
            connection_id,
            role: Role::Initiator,
        });
        Ok(())
    }

    fn on_handshake_data(
        &mut self,
        from: PeerId,
        connection_id: ConnectionId,
        payload: Value,
    ) -> MeshResult<()> {
        if let Some(entry) = self.registry.get_bound_mut(&from, &connection_id) {
            if let Err(err) = entry.signal(payload) {
                self.teardown(&from, DisconnectReason::TransportFailure(err.to_string()));
                return Err(err);
            }
            return Ok(());
        }

        let limit = self.config.pending_signal_limit;
        match self.pending.get_mut(&from) {
            Some(pending) if pending.connection_id == connection_id => {
                if pending.buffered.len() >= limit {
                    debug!(
                        target = "mesh",
                        local = %self.local,
                        peer = %from,
                        limit,
                        "pending handshake buffer full; dropping payload"
                    );
                } else {
                    pending.buffered.push(payload);
                }
                Ok(())
            }
            _ => Err(MeshError::stale(&from, "handshake_data")),
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) -> MeshResult<()> {
        let TransportEvent {
            peer,
            connection_id,
            kind,
        } = event;
        let Some(entry) = self.registry.get_bound_mut(&peer, &connection_id) else {
            return Err(MeshError::stale(&peer, "transport_event"));
        };

        match kind {
            TransportEventKind::Signal(payload) => {
                let message = SignalMessage::HandshakeData {
                    from: self.local.clone(),
                    connection_id,
                    payload,
                };
                self.send(&peer, message)
            }
            TransportEventKind::Established => {
                if entry.phase == ConnectionPhase::Accepting {
                    entry.phase = ConnectionPhase::Connected;
                    info!(
                        target = "mesh",
                        local = %self.local,
                        peer = %peer,
                        connection_id = %connection_id,
                        role = "acceptor",
                        "peer connected"
                    );
                    self.notify(MeshNotification::PeerConnected {
                        peer,
                        connection_id,
                        role: Role::Acceptor,
                    });
                }
                Ok(())
            }
            TransportEventKind::StreamReceived(stream) => {
                if entry.add_remote_stream(stream.clone()) {
                    self.notify(MeshNotification::RemoteStreamAdded { peer, stream });
                }
                Ok(())
            }
            TransportEventKind::StreamEnded(stream_id) => {
                if entry.remove_remote_stream(&stream_id).is_some() {
                    self.notify(MeshNotification::RemoteStreamRemoved { peer, stream_id });
                }
                Ok(())
            }
            TransportEventKind::Closed => {
                self.teardown(&peer, DisconnectReason::Closed);
                Ok(())
            }
            TransportEventKind::Failed(reason) => {
                self.teardown(&peer, DisconnectReason::TransportFailure(reason.clone()));
                Err(MeshError::TransportFailure(reason))
            }
        }
    }

    fn on_roster(&mut self, snapshot: &BTreeSet<PeerId>) {
        let diff = self.roster.replace(&self.local, snapshot);
        if diff.is_empty() {
            return;
        }
        debug!(
            target = "mesh",
            local = %self.local,
            joined = diff.joined.len(),
            left = diff.left.len(),
            "roster changed"
        );
        for peer in &diff.left {
            self.teardown(peer, DisconnectReason::RosterRemoved);
        }
        for peer in &diff.joined {
            if let Err(err) = self.probe(peer) {
                self.report(err);
            }
        }
    }

    pub fn on_discovery_tick(&mut self, now: Instant) {
        self.sweep_stalled(now);
        let targets = discovery::probe_targets(&self.roster, |peer| {
            self.pending.contains_key(peer) || self.registry.contains(peer)
        });
        for peer in &targets {
            if let Err(err) = self.probe(peer) {
                self.report(err);
            }
        }
    }

    fn probe(&self, peer: &PeerId) -> MeshResult<()> {
        self.send(
            peer,
            SignalMessage::DiscoveryProbe {
                from: self.local.clone(),
            },
        )
    }

    fn probe_presence(&self, peers: &[PeerId]) -> MeshResult<()> {
        for peer in peers.iter().filter(|peer| **peer != self.local) {
            self.send(
                peer,
                SignalMessage::PresenceProbe {
                    from: self.local.clone(),
                },
            )?;
        }
        Ok(())
    }

    fn sweep_stalled(&mut self, now: Instant) {
        let timeout = self.config.handshake_timeout;
        let stalled_inits: Vec<PeerId> = self
            .pending
            .values()
            .filter(|pending| discovery::is_stalled(pending.started_at, now, timeout))
            .map(|pending| pending.peer.clone())
            .collect();
        for peer in stalled_inits {
            if let Some(pending) = self.pending.remove(&peer) {
                debug!(
                    target = "mesh",
                    local = %self.local,
                    peer = %peer,
                    connection_id = %pending.connection_id,
                    "abandoning stalled connection init"
                );
            }
        }

        let mut stalled_accepts = Vec::new();
        self.registry.for_each(|entry| {
            if entry.phase == ConnectionPhase::Accepting
                && discovery::is_stalled(entry.opened_at, now, timeout)
            {
                stalled_accepts.push(entry.peer.clone());
            }
        });
        for peer in stalled_accepts {
            self.teardown(&peer, DisconnectReason::HandshakeTimeout);
        }
    }

    fn open_handle(
        &self,
        peer: &PeerId,
        connection_id: &ConnectionId,
        role: Role,
    ) -> MeshResult<Box<dyn crate::transport::ConnectionHandle>> {
        let sink = TransportSink::new(peer.clone(), connection_id.clone(), self.events.clone());
        let request = ConnectionRequest {
            peer: peer.clone(),
            connection_id: connection_id.clone(),
            role,
        };
        self.services.factory.open(request, sink)
    }

    /// Attach active capture and insert. On failure the connection is
    /// closed and the peer stays idle.
    fn register(&mut self, mut entry: LiveConnection) -> MeshResult<()> {
        if let Err(err) = self.media.attach_active(&mut entry) {
            entry.close();
            return Err(err);
        }
        if let Err((err, rejected)) = self.registry.insert(entry) {
            rejected.close();
            return Err(err);
        }
        Ok(())
    }

    /// Drop whatever state exists for `peer` and release its handle.
    fn teardown(&mut self, peer: &PeerId, reason: DisconnectReason) {
        if let Some(pending) = self.pending.remove(peer) {
            debug!(
                target = "mesh",
                local = %self.local,
                peer = %peer,
                connection_id = %pending.connection_id,
                reason = ?reason,
                "abandoned connection init"
            );
            self.retired.record(peer, pending.connection_id);
        }
        let Some(entry) = self.registry.remove(peer) else {
            return;
        };
        let connection_id = entry.connection_id.clone();
        let was_connected = entry.is_connected();
        self.retired.record(peer, connection_id.clone());
        for stream in entry.close() {
            self.notify(MeshNotification::RemoteStreamRemoved {
                peer: peer.clone(),
                stream_id: stream.id,
            });
        }
        info!(
            target = "mesh",
            local = %self.local,
            peer = %peer,
            connection_id = %connection_id,
            reason = ?reason,
            "connection removed"
        );
        if was_connected {
            self.notify(MeshNotification::PeerDisconnected {
                peer: peer.clone(),
                connection_id,
                reason,
            });
        }
    }

    fn set_capture(&mut self, kind: StreamKind, enabled: bool) {
        if enabled {
            if !self.media.request(kind) {
                return;
            }
            debug!(target = "mesh.media", local = %self.local, kind = %kind, "starting capture");
            let capture = Arc::clone(&self.services.capture);
            let events = self.events.clone();
            tokio::spawn(async move {
                let result = capture.start(kind).await;
                // mesh gone while the device was coming up: nobody else will stop it
                if let Err(mpsc::error::SendError(MeshEvent::CaptureReady {
                    result: Ok(stream),
                    ..
                })) = events.send(MeshEvent::CaptureReady { kind, result })
                {
                    capture.stop(&stream);
                }
            });
            return;
        }

        match self.media.release(kind) {
            CaptureRelease::NotRequested => {}
            CaptureRelease::Cancelled => {
                debug!(target = "mesh.media", local = %self.local, kind = %kind, "capture cancelled while starting");
            }
            CaptureRelease::Stopped(stream) => {
                let mut failed = Vec::new();
                self.registry.for_each_mut(|entry| {
                    if let Err(err) = entry.detach(&stream) {
                        failed.push((entry.peer.clone(), err));
                    }
                });
                self.services.capture.stop(&stream);
                debug!(target = "mesh.media", local = %self.local, kind = %kind, "capture stopped");
                self.notify(MeshNotification::CaptureStopped { kind });
                self.drop_failed(failed);
            }
        }
    }

    fn on_capture_ready(&mut self, kind: StreamKind, result: MeshResult<LocalStream>) {
        let stream = match result {
            Ok(stream) => stream,
            Err(err) => {
                let err = if matches!(err, MeshError::CaptureUnavailable(_)) {
                    err
                } else {
                    MeshError::CaptureUnavailable(err.to_string())
                };
                if self.media.fail(kind) {
                    warn!(target = "mesh.media", local = %self.local, kind = %kind, error = %err, "capture failed");
                    self.notify(MeshNotification::CaptureFailed { kind, error: err });
                }
                return;
            }
        };

        match self.media.complete(kind, stream) {
            CaptureCompletion::Activated(stream) => {
                let mut failed = Vec::new();
                self.registry.for_each_mut(|entry| {
                    if let Err(err) = entry.attach(&stream) {
                        failed.push((entry.peer.clone(), err));
                    }
                });
                info!(
                    target = "mesh.media",
                    local = %self.local,
                    kind = %kind,
                    stream_id = %stream.id,
                    connections = self.registry.len(),
                    "capture active"
                );
                self.notify(MeshNotification::CaptureStarted {
                    kind,
                    stream_id: stream.id.clone(),
                });
                self.drop_failed(failed);
            }
            CaptureCompletion::Unwanted(stream) => {
                debug!(target = "mesh.media", local = %self.local, kind = %kind, "stopping capture that finished after toggle-off");
                self.services.capture.stop(&stream);
            }
        }
    }

    fn drop_failed(&mut self, failed: Vec<(PeerId, MeshError)>) {
        for (peer, err) in failed {
            self.teardown(&peer, DisconnectReason::TransportFailure(err.to_string()));
            self.report(err);
        }
    }

    fn shutdown(&mut self) {
        for stream in self.media.drain_active() {
            self.services.capture.stop(&stream);
        }
        self.pending.clear();
        let entries = self.registry.drain();
        let closed = entries.len();
        for entry in entries {
            let peer = entry.peer.clone();
            let connection_id = entry.connection_id.clone();
            let was_connected = entry.is_connected();
            entry.close();
            if was_connected {
                self.notify(MeshNotification::PeerDisconnected {
                    peer,
                    connection_id,
                    reason: DisconnectReason::Shutdown,
                });
            }
        }
        info!(target = "mesh", local = %self.local, closed, "mesh shut down");
    }

    /// Release resources carried by an event that arrived after shutdown.
    pub fn discard_after_shutdown(&self, event: MeshEvent) {
        if let MeshEvent::CaptureReady {
            kind,
            result: Ok(stream),
        } = event
        {
            debug!(target = "mesh.media", local = %self.local, kind = %kind, "stopping capture that finished after shutdown");
            self.services.capture.stop(&stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCaptureProvider, MockConnectionFactory, RecordingRelay};
    use std::time::Duration;

    struct Harness {
        mesh: Mesh,
        relay: Arc<RecordingRelay>,
        factory: Arc<MockConnectionFactory>,
        capture: Arc<MockCaptureProvider>,
        events: mpsc::UnboundedReceiver<MeshEvent>,
        notifications: mpsc::UnboundedReceiver<MeshNotification>,
    }

    fn peers(names: &[&str]) -> BTreeSet<PeerId> {
        names.iter().map(|name| PeerId::from(*name)).collect()
    }

    fn harness_with(local: &str, roster: &[&str], config: MeshConfig) -> Harness {
        let relay = Arc::new(RecordingRelay::new());
        let factory = Arc::new(MockConnectionFactory::passive());
        let capture = Arc::new(MockCaptureProvider::new());
        let (events_tx, events) = mpsc::unbounded_channel();
        let (notify_tx, notifications) = mpsc::unbounded_channel();
        let services = MeshServices {
            relay: relay.clone(),
            factory: factory.clone(),
            capture: capture.clone(),
        };
        let mut mesh = Mesh::new(PeerId::from(local), config, services, events_tx, notify_tx);
        mesh.handle(MeshEvent::Roster(peers(roster)));
        relay.take();
        Harness {
            mesh,
            relay,
            factory,
            capture,
            events,
            notifications,
        }
    }

    fn harness(local: &str, roster: &[&str]) -> Harness {
        harness_with(local, roster, MeshConfig::default())
    }

    impl Harness {
        fn signal(&mut self, message: SignalMessage) {
            self.mesh.handle(MeshEvent::Signal(message));
        }

        /// Feed back everything handles queued so far.
        fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.mesh.handle(event);
            }
        }

        async fn next_event(&mut self) {
            let event = tokio::time::timeout(Duration::from_secs(1), self.events.recv())
                .await
                .expect("event in time")
                .expect("event channel open");
            self.mesh.handle(event);
        }

        fn notifications(&mut self) -> Vec<MeshNotification> {
            let mut out = Vec::new();
            while let Ok(notification) = self.notifications.try_recv() {
                out.push(notification);
            }
            out
        }

        fn state(&self, peer: &str) -> PeerState {
            self.mesh.state_of(&PeerId::from(peer))
        }

        fn connect_as_initiator(&mut self, peer: &str) -> ConnectionId {
            let peer = PeerId::from(peer);
            self.signal(SignalMessage::DiscoveryAck { from: peer.clone() });
            let connection_id = self
                .mesh
                .pending(&peer)
                .expect("pending init")
                .connection_id
                .clone();
            self.signal(SignalMessage::ConnectionAccept {
                from: peer,
                connection_id: connection_id.clone(),
            });
            connection_id
        }
    }

    #[test]
    fn ack_from_higher_peer_sends_init() {
        let mut h = harness("alice", &["bob"]);
        h.signal(SignalMessage::DiscoveryAck {
            from: PeerId::from("bob"),
        });

        let sent = h.relay.take();
        assert_eq!(sent.len(), 1);
        let (to, message) = &sent[0];
        assert_eq!(to, &PeerId::from("bob"));
        let pending = h.mesh.pending(&PeerId::from("bob")).expect("pending");
        assert_eq!(
            message,
            &SignalMessage::ConnectionInit {
                from: PeerId::from("alice"),
                connection_id: pending.connection_id.clone(),
            }
        );
        assert_eq!(h.state("bob"), PeerState::Initiating);
    }

    #[test]
    fn ack_from_lower_peer_waits_for_init() {
        let mut h = harness("bob", &["alice"]);
        h.signal(SignalMessage::DiscoveryAck {
            from: PeerId::from("alice"),
        });
        assert!(h.relay.take().is_empty());
        assert_eq!(h.state("alice"), PeerState::Idle);
    }

    #[test]
    fn repeated_ack_sends_one_init() {
        let mut h = harness("alice", &["bob"]);
        for _ in 0..3 {
            h.signal(SignalMessage::DiscoveryAck {
                from: PeerId::from("bob"),
            });
        }
        assert_eq!(h.relay.take().len(), 1);
    }

    #[test]
    fn probe_is_answered_even_outside_roster() {
        let mut h = harness("alice", &["bob"]);
        h.signal(SignalMessage::DiscoveryProbe {
            from: PeerId::from("zed"),
        });
        assert_eq!(
            h.relay.take(),
            vec![(
                PeerId::from("zed"),
                SignalMessage::DiscoveryAck {
                    from: PeerId::from("alice")
                }
            )]
        );
    }

    #[test]
    fn ack_outside_roster_is_ignored() {
        let mut h = harness("alice", &["bob"]);
        h.signal(SignalMessage::DiscoveryAck {
            from: PeerId::from("zed"),
        });
        assert!(h.relay.take().is_empty());
        assert_eq!(h.state("zed"), PeerState::Idle);
    }

    #[test]
    fn messages_from_self_are_ignored() {
        let mut h = harness("alice", &["bob"]);
        h.signal(SignalMessage::DiscoveryProbe {
            from: PeerId::from("alice"),
        });
        h.signal(SignalMessage::Unknown);
        assert!(h.relay.take().is_empty());
    }

    #[test]
    fn init_from_lower_peer_is_accepted() {
        let mut h = harness("bob", &["alice"]);
        h.signal(SignalMessage::ConnectionInit {
            from: PeerId::from("alice"),
            connection_id: ConnectionId::from("c-1"),
        });

        assert_eq!(
            h.relay.take(),
            vec![(
                PeerId::from("alice"),
                SignalMessage::ConnectionAccept {
                    from: PeerId::from("bob"),
                    connection_id: ConnectionId::from("c-1"),
                }
            )]
        );
        assert_eq!(h.state("alice"), PeerState::Accepting);
        assert_eq!(
            h.factory.opened(),
            vec![ConnectionRequest {
                peer: PeerId::from("alice"),
                connection_id: ConnectionId::from("c-1"),
                role: Role::Acceptor,
            }]
        );
    }

    #[test]
    fn init_from_higher_peer_is_ignored() {
        let mut h = harness("alice", &["bob"]);
        h.signal(SignalMessage::ConnectionInit {
            from: PeerId::from("bob"),
            connection_id: ConnectionId::from("c-1"),
        });
        assert!(h.relay.take().is_empty());
        assert!(h.factory.opened().is_empty());
        assert_eq!(h.state("bob"), PeerState::Idle);
    }

    #[test]
    fn second_init_while_accepting_is_ignored() {
        let mut h = harness("bob", &["alice"]);
        for id in ["c-1", "c-2"] {
            h.signal(SignalMessage::ConnectionInit {
                from: PeerId::from("alice"),
                connection_id: ConnectionId::from(id),
            });
        }
        assert_eq!(h.relay.take().len(), 1);
        assert_eq!(h.factory.opened().len(), 1);
        assert_eq!(
            h.mesh.connection_id(&PeerId::from("alice")),
            Some(&ConnectionId::from("c-1"))
        );
    }

    #[test]
    fn accept_with_other_connection_id_is_stale() {
        let mut h = harness("alice", &["bob"]);
        h.signal(SignalMessage::DiscoveryAck {
            from: PeerId::from("bob"),
        });
        h.signal(SignalMessage::ConnectionAccept {
            from: PeerId::from("bob"),
            connection_id: ConnectionId::from("not-mine"),
        });
        assert_eq!(h.state("bob"), PeerState::Initiating);
        assert!(h.factory.opened().is_empty());
    }

    #[test]
    fn accept_without_pending_is_stale() {
        let mut h = harness("alice", &["bob"]);
        h.signal(SignalMessage::ConnectionAccept {
            from: PeerId::from("bob"),
            connection_id: ConnectionId::from("c-1"),
        });
        assert_eq!(h.state("bob"), PeerState::Idle);
        assert!(h.notifications().is_empty());
    }

    #[test]
    fn accept_connects_initiator_and_flushes_early_handshake() {
        let mut h = harness("alice", &["bob"]);
        let bob = PeerId::from("bob");
        h.signal(SignalMessage::DiscoveryAck { from: bob.clone() });
        let connection_id = h.mesh.pending(&bob).expect("pending").connection_id.clone();

        let early = serde_json::json!({ "candidate": "host 1" });
        h.signal(SignalMessage::HandshakeData {
            from: bob.clone(),
            connection_id: connection_id.clone(),
            payload: early.clone(),
        });
        assert_eq!(h.mesh.pending(&bob).expect("pending").buffered, vec![early.clone()]);

        h.signal(SignalMessage::ConnectionAccept {
            from: bob.clone(),
            connection_id: connection_id.clone(),
        });
        assert_eq!(h.state("bob"), PeerState::Connected);
        assert!(h.mesh.pending(&bob).is_none());
        let probe = h.factory.probe_for(&bob).expect("handle opened");
        assert_eq!(probe.signals(), vec![early]);
        assert_eq!(
            h.notifications(),
            vec![MeshNotification::PeerConnected {
                peer: bob,
                connection_id,
                role: Role::Initiator,
            }]
        );
    }

    #[test]
    fn pending_buffer_is_bounded() {
        let config = MeshConfig {
            pending_signal_limit: 2,
            ..MeshConfig::default()
        };
        let mut h = harness_with("alice", &["bob"], config);
        let bob = PeerId::from("bob");
        h.signal(SignalMessage::DiscoveryAck { from: bob.clone() });
        let connection_id = h.mesh.pending(&bob).expect("pending").connection_id.clone();
        for n in 0..5 {
            h.signal(SignalMessage::HandshakeData {
                from: bob.clone(),
                connection_id: connection_id.clone(),
                payload: serde_json::json!(n),
            });
        }
        assert_eq!(h.mesh.pending(&bob).expect("pending").buffered.len(), 2);
    }

    #[test]
    fn acceptor_connects_when_transport_is_established() {
        let mut h = harness("bob", &["alice"]);
        let alice = PeerId::from("alice");
        h.signal(SignalMessage::ConnectionInit {
            from: alice.clone(),
            connection_id: ConnectionId::from("c-1"),
        });
        assert!(h.notifications().is_empty());

        let probe = h.factory.probe_for(&alice).expect("handle");
        assert!(probe.emit(TransportEventKind::Established));
        h.pump();

        assert_eq!(h.state("alice"), PeerState::Connected);
        assert_eq!(
            h.notifications(),
            vec![MeshNotification::PeerConnected {
                peer: alice,
                connection_id: ConnectionId::from("c-1"),
                role: Role::Acceptor,
            }]
        );
    }

    #[test]
    fn handshake_data_routes_by_connection_id() {
        let mut h = harness("bob", &["alice"]);
        let alice = PeerId::from("alice");
        h.signal(SignalMessage::ConnectionInit {
            from: alice.clone(),
            connection_id: ConnectionId::from("c-1"),
        });
        h.signal(SignalMessage::HandshakeData {
            from: alice.clone(),
            connection_id: ConnectionId::from("c-0"),
            payload: serde_json::json!("stale"),
        });
        h.signal(SignalMessage::HandshakeData {
            from: alice.clone(),
            connection_id: ConnectionId::from("c-1"),
            payload: serde_json::json!("fresh"),
        });
        let probe = h.factory.probe_for(&alice).expect("handle");
        assert_eq!(probe.signals(), vec![serde_json::json!("fresh")]);
    }

    #[test]
    fn local_handshake_payloads_are_relayed() {
        let mut h = harness("bob", &["alice"]);
        let alice = PeerId::from("alice");
        h.signal(SignalMessage::ConnectionInit {
            from: alice.clone(),
            connection_id: ConnectionId::from("c-1"),
        });
        h.relay.take();

        let probe = h.factory.probe_for(&alice).expect("handle");
        probe.emit(TransportEventKind::Signal(serde_json::json!({ "sdp": "answer" })));
        h.pump();

        assert_eq!(
            h.relay.take(),
            vec![(
                alice,
                SignalMessage::HandshakeData {
                    from: PeerId::from("bob"),
                    connection_id: ConnectionId::from("c-1"),
                    payload: serde_json::json!({ "sdp": "answer" }),
                }
            )]
        );
    }

    #[test]
    fn events_from_replaced_connection_are_discarded() {
        let mut h = harness("alice", &["bob"]);
        let bob = PeerId::from("bob");
        let first = h.connect_as_initiator("bob");
        let old = h.factory.probe_for(&bob).expect("first handle");

        old.emit(TransportEventKind::Closed);
        h.pump();
        assert_eq!(h.state("bob"), PeerState::Idle);
        assert!(old.is_closed());

        let second = h.connect_as_initiator("bob");
        assert_ne!(first, second);
        h.notifications();

        old.emit(TransportEventKind::Failed("late".into()));
        h.pump();
        assert_eq!(h.state("bob"), PeerState::Connected);
        assert_eq!(h.mesh.connection_id(&bob), Some(&second));
        assert!(h.notifications().is_empty());
    }

    #[test]
    fn transport_failure_tears_down() {
        let mut h = harness("alice", &["bob"]);
        let connection_id = h.connect_as_initiator("bob");
        h.notifications();
        let probe = h.factory.probe_for(&PeerId::from("bob")).expect("handle");
        probe.emit(TransportEventKind::Failed("ice failed".into()));
        h.pump();

        assert_eq!(h.state("bob"), PeerState::Idle);
        assert!(probe.is_closed());
        assert_eq!(
            h.notifications(),
            vec![MeshNotification::PeerDisconnected {
                peer: PeerId::from("bob"),
                connection_id,
                reason: DisconnectReason::TransportFailure("ice failed".into()),
            }]
        );
    }

    #[test]
    fn roster_removal_tears_down_connection() {
        let mut h = harness("alice", &["bob", "carol"]);
        h.connect_as_initiator("bob");
        h.signal(SignalMessage::DiscoveryAck {
            from: PeerId::from("carol"),
        });
        h.notifications();

        h.mesh.handle(MeshEvent::Roster(peers(&["alice"])));

        assert_eq!(h.state("bob"), PeerState::Idle);
        assert_eq!(h.state("carol"), PeerState::Idle);
        assert!(h.mesh.registry().is_empty());
        assert!(h
            .factory
            .probe_for(&PeerId::from("bob"))
            .expect("handle")
            .is_closed());
        assert!(matches!(
            h.notifications().as_slice(),
            [MeshNotification::PeerDisconnected {
                reason: DisconnectReason::RosterRemoved,
                ..
            }]
        ));
    }

    #[test]
    fn joining_peer_is_probed_immediately() {
        let mut h = harness("alice", &["bob"]);
        h.mesh.handle(MeshEvent::Roster(peers(&["bob", "carol"])));
        assert_eq!(
            h.relay.take(),
            vec![(
                PeerId::from("carol"),
                SignalMessage::DiscoveryProbe {
                    from: PeerId::from("alice")
                }
            )]
        );
    }

    #[test]
    fn discovery_tick_probes_idle_members_only() {
        let mut h = harness("alice", &["bob", "carol", "dave"]);
        h.connect_as_initiator("bob");
        h.signal(SignalMessage::DiscoveryAck {
            from: PeerId::from("carol"),
        });
        h.relay.take();

        h.mesh.handle(MeshEvent::DiscoveryTick(Instant::now()));
        assert_eq!(
            h.relay.take(),
            vec![(
                PeerId::from("dave"),
                SignalMessage::DiscoveryProbe {
                    from: PeerId::from("alice")
                }
            )]
        );
    }

    #[test]
    fn stalled_init_is_abandoned_and_reprobed() {
        let mut h = harness("alice", &["bob"]);
        h.signal(SignalMessage::DiscoveryAck {
            from: PeerId::from("bob"),
        });
        h.relay.take();

        let later = Instant::now() + Duration::from_secs(31);
        h.mesh.handle(MeshEvent::DiscoveryTick(later));
        assert_eq!(h.state("bob"), PeerState::Idle);
        assert_eq!(
            h.relay.sent_to(&PeerId::from("bob")),
            vec![SignalMessage::DiscoveryProbe {
                from: PeerId::from("alice")
            }]
        );
    }

    #[test]
    fn stalled_accept_is_closed() {
        let mut h = harness("bob", &["alice"]);
        h.signal(SignalMessage::ConnectionInit {
            from: PeerId::from("alice"),
            connection_id: ConnectionId::from("c-1"),
        });
        let probe = h.factory.probe_for(&PeerId::from("alice")).expect("handle");

        h.mesh
            .handle(MeshEvent::DiscoveryTick(Instant::now() + Duration::from_secs(45)));
        assert_eq!(h.state("alice"), PeerState::Idle);
        assert!(probe.is_closed());
        // never announced, so nothing to retract
        assert!(h.notifications().is_empty());
    }

    #[test]
    fn disabled_timeout_keeps_stalled_init() {
        let config = MeshConfig::default().with_handshake_timeout(None);
        let mut h = harness_with("alice", &["bob"], config);
        h.signal(SignalMessage::DiscoveryAck {
            from: PeerId::from("bob"),
        });
        h.mesh
            .handle(MeshEvent::DiscoveryTick(Instant::now() + Duration::from_secs(3600)));
        assert_eq!(h.state("bob"), PeerState::Initiating);
    }

    #[test]
    fn connected_entries_survive_timeout_sweep() {
        let mut h = harness("alice", &["bob"]);
        h.connect_as_initiator("bob");
        h.mesh
            .handle(MeshEvent::DiscoveryTick(Instant::now() + Duration::from_secs(120)));
        assert_eq!(h.state("bob"), PeerState::Connected);
    }

    #[test]
    fn relay_failure_on_init_leaves_peer_idle() {
        let mut h = harness("alice", &["bob"]);
        h.relay.set_failing(true);
        h.signal(SignalMessage::DiscoveryAck {
            from: PeerId::from("bob"),
        });
        assert_eq!(h.state("bob"), PeerState::Idle);
    }

    #[test]
    fn relay_failure_on_accept_closes_handle() {
        let mut h = harness("bob", &["alice"]);
        h.relay.set_failing(true);
        h.signal(SignalMessage::ConnectionInit {
            from: PeerId::from("alice"),
            connection_id: ConnectionId::from("c-1"),
        });
        assert_eq!(h.state("alice"), PeerState::Idle);
        assert!(h
            .factory
            .probe_for(&PeerId::from("alice"))
            .expect("handle")
            .is_closed());
    }

    #[test]
    fn failed_open_returns_initiator_to_idle() {
        let mut h = harness("alice", &["bob"]);
        h.factory.fail_opens_to(PeerId::from("bob"));
        h.connect_as_initiator("bob");
        assert_eq!(h.state("bob"), PeerState::Idle);
        assert!(h.mesh.registry().is_empty());
        assert!(h.notifications().is_empty());
    }

    #[test]
    fn remote_streams_are_reported_and_retracted_on_teardown() {
        let mut h = harness("alice", &["bob"]);
        h.connect_as_initiator("bob");
        h.notifications();
        let bob = PeerId::from("bob");
        let probe = h.factory.probe_for(&bob).expect("handle");
        let stream = RemoteStream {
            id: StreamId::new("s-1"),
            kind: StreamKind::Video,
        };
        probe.emit(TransportEventKind::StreamReceived(stream.clone()));
        probe.emit(TransportEventKind::StreamReceived(stream.clone()));
        h.pump();
        assert_eq!(
            h.notifications(),
            vec![MeshNotification::RemoteStreamAdded {
                peer: bob.clone(),
                stream: stream.clone(),
            }]
        );

        probe.emit(TransportEventKind::Closed);
        h.pump();
        let notes = h.notifications();
        assert_eq!(
            notes[0],
            MeshNotification::RemoteStreamRemoved {
                peer: bob,
                stream_id: stream.id,
            }
        );
        assert!(matches!(notes[1], MeshNotification::PeerDisconnected { .. }));
    }

    #[test]
    fn presence_probe_and_answer() {
        let mut h = harness("alice", &["bob"]);
        let bob = PeerId::from("bob");
        h.signal(SignalMessage::PresenceProbe { from: bob.clone() });
        assert_eq!(
            h.notifications(),
            vec![MeshNotification::PresenceRequested { peer: bob.clone() }]
        );

        h.mesh.handle(MeshEvent::AnswerPresence(bob.clone()));
        h.mesh
            .handle(MeshEvent::ProbePresence(vec![bob.clone(), PeerId::from("alice")]));
        assert_eq!(
            h.relay.sent_to(&bob),
            vec![
                SignalMessage::PresenceAck {
                    from: PeerId::from("alice")
                },
                SignalMessage::PresenceProbe {
                    from: PeerId::from("alice")
                },
            ]
        );

        h.signal(SignalMessage::PresenceAck { from: bob.clone() });
        assert_eq!(
            h.notifications(),
            vec![MeshNotification::PresenceConfirmed { peer: bob }]
        );
    }

    #[tokio::test]
    async fn capture_attaches_to_existing_and_new_connections() {
        let mut h = harness("alice", &["bob", "carol"]);
        h.connect_as_initiator("bob");
        h.notifications();

        h.mesh.handle(MeshEvent::SetCapture {
            kind: StreamKind::Video,
            enabled: true,
        });
        // second toggle while starting does nothing
        h.mesh.handle(MeshEvent::SetCapture {
            kind: StreamKind::Video,
            enabled: true,
        });
        h.next_event().await;

        let started = h.capture.started();
        assert_eq!(started.len(), 1);
        let stream = started[0].clone();
        let bob = h.factory.probe_for(&PeerId::from("bob")).expect("bob handle");
        assert_eq!(bob.attached(), vec![stream.id.clone()]);
        assert_eq!(
            h.notifications(),
            vec![MeshNotification::CaptureStarted {
                kind: StreamKind::Video,
                stream_id: stream.id.clone(),
            }]
        );

        h.connect_as_initiator("carol");
        let carol = h.factory.probe_for(&PeerId::from("carol")).expect("carol handle");
        assert_eq!(carol.attached(), vec![stream.id.clone()]);

        h.mesh.handle(MeshEvent::SetCapture {
            kind: StreamKind::Video,
            enabled: false,
        });
        assert_eq!(bob.detached(), vec![stream.id.clone()]);
        assert_eq!(carol.detached(), vec![stream.id.clone()]);
        assert_eq!(h.capture.stopped(), vec![stream.id]);
        assert!(h.mesh.snapshot().capture.is_empty());
    }

    #[tokio::test]
    async fn unavailable_capture_reverts_toggle() {
        let mut h = harness("alice", &["bob"]);
        h.capture.make_unavailable(StreamKind::Audio);
        h.mesh.handle(MeshEvent::SetCapture {
            kind: StreamKind::Audio,
            enabled: true,
        });
        h.next_event().await;

        assert!(matches!(
            h.notifications().as_slice(),
            [MeshNotification::CaptureFailed {
                kind: StreamKind::Audio,
                error: MeshError::CaptureUnavailable(_),
            }]
        ));
        assert!(h.mesh.snapshot().capture.is_empty());
    }

    #[tokio::test]
    async fn capture_finishing_after_toggle_off_is_stopped() {
        let mut h = harness("alice", &["bob"]);
        h.connect_as_initiator("bob");
        h.mesh.handle(MeshEvent::SetCapture {
            kind: StreamKind::Screen,
            enabled: true,
        });
        h.mesh.handle(MeshEvent::SetCapture {
            kind: StreamKind::Screen,
            enabled: false,
        });
        h.next_event().await;

        let started = h.capture.started();
        assert_eq!(h.capture.stopped(), vec![started[0].id.clone()]);
        let bob = h.factory.probe_for(&PeerId::from("bob")).expect("handle");
        assert!(bob.attached().is_empty());
    }

    #[tokio::test]
    async fn failed_attach_drops_new_connection() {
        let mut h = harness("alice", &["bob"]);
        h.mesh.handle(MeshEvent::SetCapture {
            kind: StreamKind::Audio,
            enabled: true,
        });
        h.next_event().await;
        h.factory.set_fail_attach(true);

        h.connect_as_initiator("bob");
        assert_eq!(h.state("bob"), PeerState::Idle);
        assert!(h
            .factory
            .probe_for(&PeerId::from("bob"))
            .expect("handle")
            .is_closed());
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let mut h = harness("bob", &["alice", "carol"]);
        h.signal(SignalMessage::ConnectionInit {
            from: PeerId::from("alice"),
            connection_id: ConnectionId::from("c-1"),
        });
        h.mesh.handle(MeshEvent::SetCapture {
            kind: StreamKind::Video,
            enabled: true,
        });
        h.next_event().await;

        assert_eq!(h.mesh.handle(MeshEvent::Shutdown), Flow::Stop);
        assert!(h.mesh.registry().is_empty());
        assert!(h
            .factory
            .probe_for(&PeerId::from("alice"))
            .expect("handle")
            .is_closed());
        assert_eq!(h.capture.stopped().len(), 1);
    }

    #[test]
    fn snapshot_reports_roster_and_states() {
        let mut h = harness("alice", &["bob", "carol"]);
        h.connect_as_initiator("bob");
        let snapshot = h.mesh.snapshot();
        assert_eq!(snapshot.local, PeerId::from("alice"));
        assert_eq!(snapshot.connected(), vec![PeerId::from("bob")]);
        let carol = snapshot.status(&PeerId::from("carol")).expect("carol listed");
        assert_eq!(carol.state, PeerState::Idle);
        assert!(carol.in_roster);
        assert!(carol.connection_id.is_none());
    }

    #[test]
    fn redelivered_init_for_closed_connection_is_stale() {
        let mut h = harness("bob", &["alice"]);
        let alice = PeerId::from("alice");
        let init = |id: &str| SignalMessage::ConnectionInit {
            from: PeerId::from("alice"),
            connection_id: ConnectionId::from(id),
        };
        h.signal(init("c-1"));
        let first = h.factory.probe_for(&alice).expect("first handle");
        first.emit(TransportEventKind::Established);
        first.emit(TransportEventKind::Closed);
        h.pump();
        assert_eq!(h.state("alice"), PeerState::Idle);
        h.relay.take();

        h.signal(init("c-1"));
        assert_eq!(h.state("alice"), PeerState::Idle);
        assert_eq!(h.factory.opened().len(), 1);
        assert!(h.relay.take().is_empty());

        h.signal(init("c-2"));
        assert_eq!(h.state("alice"), PeerState::Accepting);
        assert_eq!(h.mesh.connection_id(&alice), Some(&ConnectionId::from("c-2")));
        assert_eq!(h.factory.opened().len(), 2);
    }

    #[test]
    fn redelivered_init_after_handshake_timeout_is_stale() {
        let mut h = harness("bob", &["alice"]);
        let init = SignalMessage::ConnectionInit {
            from: PeerId::from("alice"),
            connection_id: ConnectionId::from("c-1"),
        };
        h.signal(init.clone());
        h.mesh
            .handle(MeshEvent::DiscoveryTick(Instant::now() + Duration::from_secs(45)));
        assert_eq!(h.state("alice"), PeerState::Idle);

        h.signal(init);
        assert_eq!(h.state("alice"), PeerState::Idle);
        assert_eq!(h.factory.opened().len(), 1);
    }

    #[test]
    fn ack_while_connected_changes_nothing() {
        let mut h = harness("alice", &["bob"]);
        let bob = PeerId::from("bob");
        let connection_id = h.connect_as_initiator("bob");
        h.relay.take();

        h.signal(SignalMessage::DiscoveryAck { from: bob.clone() });
        h.signal(SignalMessage::DiscoveryAck { from: bob.clone() });

        assert!(h.relay.take().is_empty());
        assert_eq!(h.factory.opened().len(), 1);
        assert_eq!(h.state("bob"), PeerState::Connected);
        assert_eq!(h.mesh.connection_id(&bob), Some(&connection_id));
    }

    #[test]
    fn mismatched_handshake_while_initiating_leaves_buffer_untouched() {
        let mut h = harness("alice", &["bob"]);
        let bob = PeerId::from("bob");
        h.signal(SignalMessage::DiscoveryAck { from: bob.clone() });
        let before = h.mesh.pending(&bob).expect("pending").clone();

        h.signal(SignalMessage::HandshakeData {
            from: bob.clone(),
            connection_id: ConnectionId::from("someone-else"),
            payload: serde_json::json!({ "sdp": "offer" }),
        });

        assert_eq!(h.mesh.pending(&bob), Some(&before));
        assert!(h.mesh.pending(&bob).expect("pending").buffered.is_empty());
        assert_eq!(h.state("bob"), PeerState::Initiating);
        assert!(h.factory.opened().is_empty());
    }

    #[tokio::test]
    async fn capture_finishing_after_shutdown_is_stopped() {
        let mut h = harness("alice", &["bob"]);
        h.mesh.handle(MeshEvent::SetCapture {
            kind: StreamKind::Video,
            enabled: true,
        });
        assert_eq!(h.mesh.handle(MeshEvent::Shutdown), Flow::Stop);

        let event = tokio::time::timeout(Duration::from_secs(1), h.events.recv())
            .await
            .expect("event in time")
            .expect("event channel open");
        h.mesh.discard_after_shutdown(event);

        let started = h.capture.started();
        assert_eq!(started.len(), 1);
        assert_eq!(h.capture.stopped(), vec![started[0].id.clone()]);
    }
}
