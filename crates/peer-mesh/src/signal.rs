use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use signal_bus::{Bus, BusError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{MeshError, MeshResult};
use crate::identity::{ConnectionId, PeerId};

/// Messages exchanged over the signal channel. The recipient is addressed by
/// the relay; every message names its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    DiscoveryProbe {
        from: PeerId,
    },
    DiscoveryAck {
        from: PeerId,
    },
    ConnectionInit {
        from: PeerId,
        connection_id: ConnectionId,
    },
    ConnectionAccept {
        from: PeerId,
        connection_id: ConnectionId,
    },
    HandshakeData {
        from: PeerId,
        connection_id: ConnectionId,
        payload: Value,
    },
    PresenceProbe {
        from: PeerId,
    },
    PresenceAck {
        from: PeerId,
    },
    /// Any tag this build does not know about.
    #[serde(other)]
    Unknown,
}

impl SignalMessage {
    pub fn from(&self) -> Option<&PeerId> {
        match self {
            SignalMessage::DiscoveryProbe { from }
            | SignalMessage::DiscoveryAck { from }
            | SignalMessage::ConnectionInit { from, .. }
            | SignalMessage::ConnectionAccept { from, .. }
            | SignalMessage::HandshakeData { from, .. }
            | SignalMessage::PresenceProbe { from }
            | SignalMessage::PresenceAck { from } => Some(from),
            SignalMessage::Unknown => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::DiscoveryProbe { .. } => "discovery_probe",
            SignalMessage::DiscoveryAck { .. } => "discovery_ack",
            SignalMessage::ConnectionInit { .. } => "connection_init",
            SignalMessage::ConnectionAccept { .. } => "connection_accept",
            SignalMessage::HandshakeData { .. } => "handshake_data",
            SignalMessage::PresenceProbe { .. } => "presence_probe",
            SignalMessage::PresenceAck { .. } => "presence_ack",
            SignalMessage::Unknown => "unknown",
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Outbound half of the signal channel. Sending never blocks and gives no
/// delivery guarantee.
pub trait SignalRelay: Send + Sync {
    fn send(&self, to: &PeerId, message: SignalMessage) -> MeshResult<()>;
}

/// Inbound signal messages addressed to the local peer.
pub type SignalInbox = mpsc::UnboundedReceiver<SignalMessage>;

/// Relay over a topic bus: each peer listens on `<namespace>.<peer-id>`.
pub struct BusRelay {
    bus: Arc<dyn Bus>,
    namespace: String,
    pump: Option<JoinHandle<()>>,
}

impl BusRelay {
    /// Build a relay for `local` and start pumping its topic into the
    /// returned inbox. Must be called inside a tokio runtime.
    pub fn connect(
        bus: Arc<dyn Bus>,
        namespace: impl Into<String>,
        local: &PeerId,
    ) -> (Arc<Self>, SignalInbox) {
        let namespace = namespace.into();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let topic = topic_for(&namespace, local);
        let rx = bus.subscribe(&topic);
        let pump = tokio::spawn(pump_inbound(rx, inbox_tx, topic));
        let relay = Arc::new(Self {
            bus,
            namespace,
            pump: Some(pump),
        });
        (relay, inbox_rx)
    }

    pub fn topic_for(&self, peer: &PeerId) -> String {
        topic_for(&self.namespace, peer)
    }
}

impl SignalRelay for BusRelay {
    fn send(&self, to: &PeerId, message: SignalMessage) -> MeshResult<()> {
        let payload = message
            .encode()
            .map_err(|err| MeshError::Relay(format!("encode {}: {err}", message.kind())))?;
        let topic = self.topic_for(to);
        trace!(
            target = "mesh.relay",
            to = %to,
            kind = message.kind(),
            len = payload.len(),
            "publishing signal"
        );
        match self.bus.publish(&topic, payload) {
            Ok(()) => Ok(()),
            // nobody listening on that topic; indistinguishable from loss
            Err(BusError::Closed) => {
                debug!(target = "mesh.relay", to = %to, "no listener for signal topic");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for BusRelay {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.take() {
            handle.abort();
        }
    }
}

fn topic_for(namespace: &str, peer: &PeerId) -> String {
    format!("{namespace}.{peer}")
}

async fn pump_inbound(
    mut rx: broadcast::Receiver<signal_bus::BusMessage>,
    inbox: mpsc::UnboundedSender<SignalMessage>,
    topic: String,
) {
    loop {
        match rx.recv().await {
            Ok(message) => match SignalMessage::decode(&message.payload) {
                Ok(signal) => {
                    if inbox.send(signal).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(
                        target = "mesh.relay",
                        topic = %topic,
                        error = %err,
                        "discarding undecodable signal"
                    );
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    target = "mesh.relay",
                    topic = %topic,
                    skipped,
                    "signal receiver lagged; messages lost"
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
