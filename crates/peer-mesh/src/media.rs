use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MeshResult;
use crate::registry::LiveConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Audio,
    Video,
    Screen,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
            StreamKind::Screen => "screen",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stream produced by local capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub id: StreamId,
    pub kind: StreamKind,
    pub label: String,
}

impl LocalStream {
    pub fn new(kind: StreamKind, label: impl Into<String>) -> Self {
        Self {
            id: StreamId::generate(),
            kind,
            label: label.into(),
        }
    }
}

/// A stream a remote peer sends over its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: StreamId,
    pub kind: StreamKind,
}

/// Local capture devices. `start` may take a while (permission prompts,
/// device warm-up); the mesh runs it off the event task.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    /// Fails with `MeshError::CaptureUnavailable` when the device cannot be
    /// opened.
    async fn start(&self, kind: StreamKind) -> MeshResult<LocalStream>;
    fn stop(&self, stream: &LocalStream);
}

#[derive(Debug)]
enum CaptureSlot {
    Starting,
    Active(LocalStream),
}

/// Outcome of a finished capture start.
#[derive(Debug, PartialEq, Eq)]
pub enum CaptureCompletion {
    /// The toggle is still on; the stream is now active.
    Activated(LocalStream),
    /// The toggle went off while starting; the caller must stop the stream.
    Unwanted(LocalStream),
}

/// Outcome of switching a capture kind off.
#[derive(Debug, PartialEq, Eq)]
pub enum CaptureRelease {
    NotRequested,
    /// Switched off before the device came up.
    Cancelled,
    /// The stream was live; the caller detaches and stops it.
    Stopped(LocalStream),
}

/// Per-kind capture toggle state. Which connections carry which stream is
/// tracked on the connections themselves.
#[derive(Debug, Default)]
pub struct MediaAttachment {
    slots: BTreeMap<StreamKind, CaptureSlot>,
}

impl MediaAttachment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `kind` as wanted. Returns `true` when a capture start must be
    /// issued, `false` when it is already starting or active.
    pub fn request(&mut self, kind: StreamKind) -> bool {
        if self.slots.contains_key(&kind) {
            return false;
        }
        self.slots.insert(kind, CaptureSlot::Starting);
        true
    }

    pub fn complete(&mut self, kind: StreamKind, stream: LocalStream) -> CaptureCompletion {
        match self.slots.get_mut(&kind) {
            Some(slot) if matches!(slot, CaptureSlot::Starting) => {
                *slot = CaptureSlot::Active(stream.clone());
                CaptureCompletion::Activated(stream)
            }
            // switched off (or restarted) meanwhile
            _ => CaptureCompletion::Unwanted(stream),
        }
    }

    /// A start failed; the toggle reverts to off. Returns whether a start
    /// was actually outstanding.
    pub fn fail(&mut self, kind: StreamKind) -> bool {
        if matches!(self.slots.get(&kind), Some(CaptureSlot::Starting)) {
            self.slots.remove(&kind);
            return true;
        }
        false
    }

    pub fn release(&mut self, kind: StreamKind) -> CaptureRelease {
        match self.slots.remove(&kind) {
            None => CaptureRelease::NotRequested,
            Some(CaptureSlot::Starting) => CaptureRelease::Cancelled,
            Some(CaptureSlot::Active(stream)) => CaptureRelease::Stopped(stream),
        }
    }

    pub fn active_streams(&self) -> impl Iterator<Item = &LocalStream> {
        self.slots.values().filter_map(|slot| match slot {
            CaptureSlot::Active(stream) => Some(stream),
            CaptureSlot::Starting => None,
        })
    }

    pub fn active_kinds(&self) -> Vec<StreamKind> {
        self.active_streams().map(|stream| stream.kind).collect()
    }

    /// Attach every active stream to a freshly created connection.
    pub fn attach_active(&self, connection: &mut LiveConnection) -> MeshResult<()> {
        for stream in self.active_streams() {
            connection.attach(stream)?;
        }
        Ok(())
    }

    /// Forget every toggle, returning the streams that were live.
    pub fn drain_active(&mut self) -> Vec<LocalStream> {
        std::mem::take(&mut self.slots)
            .into_values()
            .filter_map(|slot| match slot {
                CaptureSlot::Active(stream) => Some(stream),
                CaptureSlot::Starting => None,
            })
            .collect()
    }
}
