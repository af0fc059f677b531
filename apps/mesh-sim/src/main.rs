mod telemetry;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use peer_mesh::mock::{MockCaptureProvider, MockConnectionFactory};
use peer_mesh::{
    spawn_mesh, BusRelay, MeshConfig, MeshHandle, MeshServices, PeerId, StreamKind,
};
use signal_bus::{Bus, LocalBus, LossyBus};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mesh-sim", about = "Simulate mesh connection establishment in-process")]
struct Cli {
    /// Number of peers in the group.
    #[arg(long, short = 'n', default_value_t = 4)]
    peers: usize,

    /// Probability that a signal message is lost.
    #[arg(long, default_value_t = 0.0)]
    drop_rate: f64,

    /// Probability that a signal message is delivered twice.
    #[arg(long, default_value_t = 0.0)]
    duplicate_rate: f64,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 30)]
    duration_secs: u64,

    /// Overrides PEER_MESH_DISCOVERY_INTERVAL_MS.
    #[arg(long)]
    discovery_ms: Option<u64>,

    /// Turn on a capture kind at the first peer once the mesh has formed.
    #[arg(long, value_parser = parse_kind)]
    capture: Option<StreamKind>,

    #[arg(long, env = "MESH_SIM_LOG", default_value = "info")]
    log_filter: String,
}

fn parse_kind(value: &str) -> Result<StreamKind, String> {
    match value {
        "audio" => Ok(StreamKind::Audio),
        "video" => Ok(StreamKind::Video),
        "screen" => Ok(StreamKind::Screen),
        other => Err(format!("unknown capture kind `{other}`")),
    }
}

struct SimPeer {
    handle: MeshHandle,
    factory: Arc<MockConnectionFactory>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter);

    if cli.peers < 2 {
        bail!("need at least two peers, got {}", cli.peers);
    }
    let mut config = MeshConfig::from_env();
    if let Some(ms) = cli.discovery_ms {
        config = config.with_discovery_interval(Duration::from_millis(ms.max(1)));
    }

    let local_bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
    let bus: Arc<dyn Bus> = if cli.drop_rate > 0.0 || cli.duplicate_rate > 0.0 {
        Arc::new(
            LossyBus::new(local_bus, cli.seed)
                .with_drop_rate(cli.drop_rate)
                .with_duplicate_rate(cli.duplicate_rate),
        )
    } else {
        local_bus
    };

    let ids: Vec<PeerId> = (0..cli.peers)
        .map(|n| PeerId::from(format!("peer-{n:03}")))
        .collect();
    let roster: BTreeSet<PeerId> = ids.iter().cloned().collect();
    let (_roster_tx, roster_rx) = watch::channel(roster);

    info!(
        peers = cli.peers,
        drop_rate = cli.drop_rate,
        duplicate_rate = cli.duplicate_rate,
        seed = cli.seed,
        discovery_ms = config.discovery_interval.as_millis() as u64,
        "starting simulation"
    );

    let mut peers = Vec::with_capacity(ids.len());
    for id in &ids {
        let (relay, inbox) = BusRelay::connect(bus.clone(), config.signal_namespace.clone(), id);
        let factory = Arc::new(MockConnectionFactory::negotiating());
        let services = MeshServices {
            relay,
            factory: factory.clone(),
            capture: Arc::new(MockCaptureProvider::new()),
        };
        let handle = spawn_mesh(id.clone(), config.clone(), services, roster_rx.clone(), inbox);
        peers.push(SimPeer { handle, factory });
    }

    let started = Instant::now();
    let deadline = started + Duration::from_secs(cli.duration_secs);
    let expected_links = cli.peers * (cli.peers - 1);
    let mut converged = false;
    while Instant::now() < deadline {
        let links = count_links(&peers).await?;
        if links == expected_links {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let elapsed = started.elapsed();
    let opened: usize = peers.iter().map(|peer| peer.factory.opened().len()).sum();
    if converged {
        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            handles_opened = opened,
            "mesh converged"
        );
    } else {
        let links = count_links(&peers).await?;
        warn!(
            links,
            expected_links,
            handles_opened = opened,
            "mesh did not converge before the deadline"
        );
    }

    if let (true, Some(kind)) = (converged, cli.capture) {
        let first = peers.first().context("no peers")?;
        first.handle.set_capture(kind, true)?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = first.handle.snapshot().await?;
        info!(peer = %snapshot.local, capture = ?snapshot.capture, "capture state");
    }

    for peer in peers {
        peer.handle.shutdown().await?;
    }

    if !converged {
        bail!("mesh of {} peers did not converge", cli.peers);
    }
    Ok(())
}

/// Directed links in the Connected state, summed over every peer.
async fn count_links(peers: &[SimPeer]) -> Result<usize> {
    let mut links = 0;
    for peer in peers {
        let snapshot = peer
            .handle
            .snapshot()
            .await
            .with_context(|| format!("snapshot of {}", peer.handle.local()))?;
        links += snapshot.connected().len();
    }
    Ok(links)
}
