use std::env;
use std::time::Duration;

const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 3_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PENDING_SIGNAL_LIMIT: usize = 64;
const DEFAULT_SIGNAL_NAMESPACE: &str = "mesh.signal";
const MIN_DISCOVERY_INTERVAL: Duration = Duration::from_millis(1);

/// Tunables for a mesh instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Period of the discovery loop.
    pub discovery_interval: Duration,
    /// Age after which an unfinished init or accept is abandoned. `None`
    /// keeps stalled attempts until the transport reports closure.
    pub handshake_timeout: Option<Duration>,
    /// Handshake payloads held per pending init while its accept is in flight.
    pub pending_signal_limit: usize,
    /// Topic prefix for the bus relay; each peer listens on `<namespace>.<peer>`.
    pub signal_namespace: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_millis(DEFAULT_DISCOVERY_INTERVAL_MS),
            handshake_timeout: Some(Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS)),
            pending_signal_limit: DEFAULT_PENDING_SIGNAL_LIMIT,
            signal_namespace: DEFAULT_SIGNAL_NAMESPACE.to_string(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from `PEER_MESH_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let discovery_interval = env::var("PEER_MESH_DISCOVERY_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_DISCOVERY_INTERVAL_MS);
        let handshake_timeout = env::var("PEER_MESH_HANDSHAKE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS);
        let pending_signal_limit = env::var("PEER_MESH_PENDING_SIGNAL_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PENDING_SIGNAL_LIMIT);
        let signal_namespace = env::var("PEER_MESH_SIGNAL_NAMESPACE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SIGNAL_NAMESPACE.to_string());

        Self {
            discovery_interval: Duration::from_millis(discovery_interval),
            handshake_timeout: (handshake_timeout > 0)
                .then(|| Duration::from_millis(handshake_timeout)),
            pending_signal_limit,
            signal_namespace,
        }
    }

    /// A zero interval is raised to one millisecond.
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval.max(MIN_DISCOVERY_INTERVAL);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}
