//! In-memory stand-ins for the relay, the connection layer and capture
//! devices. Used by the tests and by the simulator binary.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{MeshError, MeshResult};
use crate::identity::{PeerId, Role};
use crate::media::{CaptureProvider, LocalStream, StreamId, StreamKind};
use crate::signal::{SignalMessage, SignalRelay};
use crate::transport::{
    ConnectionFactory, ConnectionHandle, ConnectionRequest, TransportEventKind, TransportSink,
};

/// Relay that records outbound messages instead of delivering them.
#[derive(Default)]
pub struct RecordingRelay {
    sent: Mutex<Vec<(PeerId, SignalMessage)>>,
    failing: AtomicBool,
}

impl RecordingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail with a relay error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Drain what was sent so far.
    pub fn take(&self) -> Vec<(PeerId, SignalMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_to(&self, peer: &PeerId) -> Vec<SignalMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|(to, _)| to == peer)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl SignalRelay for RecordingRelay {
    fn send(&self, to: &PeerId, message: SignalMessage) -> MeshResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MeshError::Relay(format!("refusing {}", message.kind())));
        }
        self.sent.lock().push((to.clone(), message));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HandleState {
    request: Option<ConnectionRequest>,
    sink: Option<TransportSink>,
    negotiate: bool,
    fail_attach: bool,
    signals: Vec<Value>,
    attached: Vec<StreamId>,
    detached: Vec<StreamId>,
    closed: bool,
}

/// Scripted connection handle.
///
/// With negotiation on, the initiator emits an offer as soon as it is
/// opened, the acceptor answers an offer and reports itself established, and
/// the initiator reports established once the answer arrives.
pub struct MockHandle {
    state: Arc<Mutex<HandleState>>,
}

/// Test-side view of a [`MockHandle`].
#[derive(Clone)]
pub struct HandleProbe {
    state: Arc<Mutex<HandleState>>,
}

impl MockHandle {
    /// A handle with no sink, for exercising bookkeeping alone.
    pub fn detached() -> (MockHandle, HandleProbe) {
        let state = Arc::new(Mutex::new(HandleState::default()));
        (
            MockHandle {
                state: Arc::clone(&state),
            },
            HandleProbe { state },
        )
    }

    fn opened(
        request: ConnectionRequest,
        sink: TransportSink,
        negotiate: bool,
        fail_attach: bool,
    ) -> (MockHandle, HandleProbe) {
        let role = request.role;
        let state = Arc::new(Mutex::new(HandleState {
            request: Some(request),
            sink: Some(sink.clone()),
            negotiate,
            fail_attach,
            ..HandleState::default()
        }));
        if negotiate && role == Role::Initiator {
            sink.emit(TransportEventKind::Signal(json!({ "sdp": "offer" })));
        }
        (
            MockHandle {
                state: Arc::clone(&state),
            },
            HandleProbe { state },
        )
    }
}

impl ConnectionHandle for MockHandle {
    fn signal(&mut self, payload: Value) -> MeshResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MeshError::TransportFailure("handle closed".into()));
        }
        state.signals.push(payload.clone());
        if !state.negotiate {
            return Ok(());
        }
        let role = state.request.as_ref().map(|request| request.role);
        let Some(sink) = state.sink.clone() else {
            return Ok(());
        };
        drop(state);

        match (role, payload.get("sdp").and_then(Value::as_str)) {
            (Some(Role::Acceptor), Some("offer")) => {
                sink.emit(TransportEventKind::Signal(json!({ "sdp": "answer" })));
                sink.emit(TransportEventKind::Established);
            }
            (Some(Role::Initiator), Some("answer")) => {
                sink.emit(TransportEventKind::Established);
            }
            _ => {}
        }
        Ok(())
    }

    fn attach_stream(&mut self, stream: &LocalStream) -> MeshResult<()> {
        let mut state = self.state.lock();
        if state.fail_attach {
            return Err(MeshError::TransportFailure(format!(
                "cannot attach {}",
                stream.kind
            )));
        }
        state.attached.push(stream.id.clone());
        Ok(())
    }

    fn detach_stream(&mut self, stream: &LocalStream) -> MeshResult<()> {
        self.state.lock().detached.push(stream.id.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().closed = true;
    }
}

impl HandleProbe {
    pub fn request(&self) -> Option<ConnectionRequest> {
        self.state.lock().request.clone()
    }

    pub fn signals(&self) -> Vec<Value> {
        self.state.lock().signals.clone()
    }

    pub fn attached(&self) -> Vec<StreamId> {
        self.state.lock().attached.clone()
    }

    pub fn detached(&self) -> Vec<StreamId> {
        self.state.lock().detached.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Push a transport event as if the handle produced it. Works on closed
    /// handles too, which is how late events are simulated.
    pub fn emit(&self, kind: TransportEventKind) -> bool {
        let sink = self.state.lock().sink.clone();
        sink.map(|sink| sink.emit(kind)).unwrap_or(false)
    }
}

#[derive(Default)]
struct FactoryState {
    opened: Vec<(ConnectionRequest, HandleProbe)>,
    fail_open: BTreeSet<PeerId>,
}

/// Hands out [`MockHandle`]s and remembers each one.
#[derive(Default)]
pub struct MockConnectionFactory {
    negotiate: bool,
    fail_attach: AtomicBool,
    state: Mutex<FactoryState>,
}

impl MockConnectionFactory {
    /// Handles only record what they are given.
    pub fn passive() -> Self {
        Self::default()
    }

    /// Handles run the offer/answer script.
    pub fn negotiating() -> Self {
        Self {
            negotiate: true,
            ..Self::default()
        }
    }

    /// Fail every `open` towards `peer`.
    pub fn fail_opens_to(&self, peer: PeerId) {
        self.state.lock().fail_open.insert(peer);
    }

    pub fn set_fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<ConnectionRequest> {
        self.state
            .lock()
            .opened
            .iter()
            .map(|(request, _)| request.clone())
            .collect()
    }

    /// Probe for the most recent handle opened towards `peer`.
    pub fn probe_for(&self, peer: &PeerId) -> Option<HandleProbe> {
        self.state
            .lock()
            .opened
            .iter()
            .rev()
            .find(|(request, _)| &request.peer == peer)
            .map(|(_, probe)| probe.clone())
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn open(
        &self,
        request: ConnectionRequest,
        sink: TransportSink,
    ) -> MeshResult<Box<dyn ConnectionHandle>> {
        let mut state = self.state.lock();
        if state.fail_open.contains(&request.peer) {
            return Err(MeshError::TransportFailure(format!(
                "open towards {} refused",
                request.peer
            )));
        }
        let fail_attach = self.fail_attach.load(Ordering::SeqCst);
        let (handle, probe) = MockHandle::opened(request.clone(), sink, self.negotiate, fail_attach);
        state.opened.push((request, probe));
        Ok(Box::new(handle))
    }
}

/// Capture provider that hands out labelled streams immediately.
#[derive(Default)]
pub struct MockCaptureProvider {
    unavailable: Mutex<BTreeSet<StreamKind>>,
    started: Mutex<Vec<LocalStream>>,
    stopped: Mutex<Vec<StreamId>>,
}

impl MockCaptureProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_unavailable(&self, kind: StreamKind) {
        self.unavailable.lock().insert(kind);
    }

    pub fn started(&self) -> Vec<LocalStream> {
        self.started.lock().clone()
    }

    pub fn stopped(&self) -> Vec<StreamId> {
        self.stopped.lock().clone()
    }
}

#[async_trait]
impl CaptureProvider for MockCaptureProvider {
    async fn start(&self, kind: StreamKind) -> MeshResult<LocalStream> {
        if self.unavailable.lock().contains(&kind) {
            return Err(MeshError::CaptureUnavailable(format!("no {kind} device")));
        }
        let stream = LocalStream::new(kind, format!("mock-{kind}"));
        self.started.lock().push(stream.clone());
        Ok(stream)
    }

    fn stop(&self, stream: &LocalStream) {
        self.stopped.lock().push(stream.id.clone());
    }
}
