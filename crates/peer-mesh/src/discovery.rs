//! Discovery loop policy: who gets probed on a tick and when a handshake
//! counts as stalled. The timer itself lives in the runtime.

use std::time::{Duration, Instant};

use tokio::time::{self, Interval, MissedTickBehavior};

use crate::identity::PeerId;
use crate::roster::Roster;

/// Roster members that are neither connected nor mid-handshake, in peer order.
pub fn probe_targets<F>(roster: &Roster, is_busy: F) -> Vec<PeerId>
where
    F: Fn(&PeerId) -> bool,
{
    roster.iter().filter(|peer| !is_busy(peer)).cloned().collect()
}

pub fn is_stalled(started_at: Instant, now: Instant, timeout: Option<Duration>) -> bool {
    match timeout {
        Some(limit) => now.saturating_duration_since(started_at) >= limit,
        None => false,
    }
}

/// Discovery timer. A late tick is pushed back rather than bursting, since
/// back-to-back probes buy nothing.
/// A zero period would panic in tokio; it is raised to one millisecond.
pub(crate) fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
