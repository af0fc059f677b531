//! The mesh event task and the handle the presentation layer talks to.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::MeshConfig;
use crate::discovery;
use crate::error::{MeshError, MeshResult};
use crate::identity::PeerId;
use crate::machine::{Flow, Mesh, MeshEvent, MeshNotification, MeshServices, MeshSnapshot};
use crate::media::StreamKind;
use crate::signal::SignalInbox;

/// Start a mesh for `local` on the current runtime.
///
/// `roster` publishes full membership snapshots; `inbox` carries signal
/// messages addressed to `local`. Both may close independently, after which
/// the mesh keeps its last roster and simply stops receiving.
pub fn spawn_mesh(
    local: PeerId,
    config: MeshConfig,
    services: MeshServices,
    roster: watch::Receiver<BTreeSet<PeerId>>,
    inbox: SignalInbox,
) -> MeshHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let period = config.discovery_interval;
    let mesh = Mesh::new(local.clone(), config, services, events_tx.clone(), notify_tx);
    info!(target = "mesh", local = %local, period_ms = period.as_millis() as u64, "mesh starting");
    let task = tokio::spawn(run(mesh, events_rx, inbox, roster, period));
    MeshHandle {
        local,
        events: events_tx,
        notifications: Some(notify_rx),
        task: Some(task),
    }
}

async fn run(
    mut mesh: Mesh,
    mut events: mpsc::UnboundedReceiver<MeshEvent>,
    mut inbox: SignalInbox,
    mut roster: watch::Receiver<BTreeSet<PeerId>>,
    period: Duration,
) {
    let mut ticker = discovery::ticker(period);
    let initial = roster.borrow_and_update().clone();
    mesh.handle(MeshEvent::Roster(initial));

    let mut inbox_open = true;
    let mut roster_open = true;
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => event,
                None => MeshEvent::Shutdown,
            },
            message = inbox.recv(), if inbox_open => match message {
                Some(message) => MeshEvent::Signal(message),
                None => {
                    debug!(target = "mesh", local = %mesh.local(), "signal inbox closed");
                    inbox_open = false;
                    continue;
                }
            },
            changed = roster.changed(), if roster_open => match changed {
                Ok(()) => MeshEvent::Roster(roster.borrow_and_update().clone()),
                Err(_) => {
                    debug!(target = "mesh", local = %mesh.local(), "roster source closed");
                    roster_open = false;
                    continue;
                }
            },
            instant = ticker.tick() => MeshEvent::DiscoveryTick(instant.into_std()),
        };
        if mesh.handle(event) == Flow::Stop {
            break;
        }
    }

    // capture starts still in flight see a closed queue and stop their own
    // stream; anything already queued is released here
    events.close();
    while let Ok(event) = events.try_recv() {
        mesh.discard_after_shutdown(event);
    }
}

/// Owner-side handle to a running mesh. Dropping it shuts the mesh down.
pub struct MeshHandle {
    local: PeerId,
    events: mpsc::UnboundedSender<MeshEvent>,
    notifications: Option<mpsc::UnboundedReceiver<MeshNotification>>,
    task: Option<JoinHandle<()>>,
}

impl MeshHandle {
    pub fn local(&self) -> &PeerId {
        &self.local
    }

    fn submit(&self, event: MeshEvent) -> MeshResult<()> {
        self.events.send(event).map_err(|_| MeshError::Shutdown)
    }

    /// Switch a capture kind on or off. Repeated toggles are idempotent.
    pub fn set_capture(&self, kind: StreamKind, enabled: bool) -> MeshResult<()> {
        self.submit(MeshEvent::SetCapture { kind, enabled })
    }

    /// Ask `peers` to confirm they are present.
    pub fn probe_presence(&self, peers: Vec<PeerId>) -> MeshResult<()> {
        self.submit(MeshEvent::ProbePresence(peers))
    }

    pub fn answer_presence(&self, peer: PeerId) -> MeshResult<()> {
        self.submit(MeshEvent::AnswerPresence(peer))
    }

    pub async fn snapshot(&self) -> MeshResult<MeshSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.submit(MeshEvent::Inspect(tx))?;
        rx.await.map_err(|_| MeshError::Shutdown)
    }

    /// The notification stream. Available once.
    pub fn take_notifications(&mut self) -> Option<mpsc::UnboundedReceiver<MeshNotification>> {
        self.notifications.take()
    }

    /// Close every connection, stop capture and wait for the task to exit.
    pub async fn shutdown(mut self) -> MeshResult<()> {
        let _ = self.events.send(MeshEvent::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!(target = "mesh", local = %self.local, error = %err, "mesh task ended abnormally");
                return Err(MeshError::Shutdown);
            }
        }
        Ok(())
    }
}

impl Drop for MeshHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.events.send(MeshEvent::Shutdown);
        }
    }
}
