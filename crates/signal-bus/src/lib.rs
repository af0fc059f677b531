use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Best-effort topic fan-out. Delivery to a topic without subscribers fails
/// with [`BusError::Closed`]; callers treat that as a dropped message.
pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

/// In-process bus keyed by topic name.
#[derive(Debug)]
pub struct LocalBus {
    capacity: usize,
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(topic);
        sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| BusError::Closed)
    }
}

/// Wraps another bus and drops or duplicates published messages at fixed
/// rates. The RNG is seeded so runs are reproducible.
pub struct LossyBus {
    inner: Arc<dyn Bus>,
    drop_rate: f64,
    duplicate_rate: f64,
    rng: Mutex<StdRng>,
}

impl LossyBus {
    pub fn new(inner: Arc<dyn Bus>, seed: u64) -> Self {
        Self {
            inner,
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn with_drop_rate(mut self, rate: f64) -> Self {
        self.drop_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_duplicate_rate(mut self, rate: f64) -> Self {
        self.duplicate_rate = rate.clamp(0.0, 1.0);
        self
    }

    fn roll(&self, rate: f64) -> bool {
        rate > 0.0 && self.rng.lock().gen_bool(rate)
    }
}

impl Bus for LossyBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.inner.subscribe(topic)
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        if self.roll(self.drop_rate) {
            trace!(target = "signal.bus", topic, "dropping published message");
            return Ok(());
        }
        self.inner.publish(topic, payload.clone())?;
        if self.roll(self.duplicate_rate) {
            trace!(target = "signal.bus", topic, "duplicating published message");
            self.inner.publish(topic, payload)?;
        }
        Ok(())
    }
}
