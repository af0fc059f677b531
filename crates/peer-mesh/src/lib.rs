//! Full-mesh connection establishment between peers that can only reach
//! each other through an unordered, lossy signal relay.
//!
//! Each peer runs one [`Mesh`] on a single task. Discovery probes find
//! roster members, the lower identity of each pair initiates, and connection
//! ids keep late messages from earlier attempts from touching newer state.

pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod machine;
pub mod media;
pub mod mock;
pub mod registry;
pub mod roster;
pub mod runtime;
pub mod signal;
pub mod transport;

pub use config::MeshConfig;
pub use error::{MeshError, MeshResult};
pub use identity::{role_towards, ConnectionId, PeerId, Role};
pub use machine::{
    DisconnectReason, Flow, Mesh, MeshEvent, MeshNotification, MeshServices, MeshSnapshot,
    PeerState, PeerStatus, PendingInit,
};
pub use media::{CaptureProvider, LocalStream, RemoteStream, StreamId, StreamKind};
pub use registry::{ConnectionPhase, ConnectionRegistry, LiveConnection, RetiredConnections};
pub use roster::{Roster, RosterDiff};
pub use runtime::{spawn_mesh, MeshHandle};
pub use signal::{BusRelay, SignalInbox, SignalMessage, SignalRelay};
pub use transport::{
    ConnectionFactory, ConnectionHandle, ConnectionRequest, TransportEvent, TransportEventKind,
    TransportSink,
};
