//! Mirador core types: object identity, deltas, watch events, faults.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// Cache key for one object, unique within a single informer's scope.
/// Conventionally `namespace/name`, or the bare name for unscoped objects.
pub type ObjectKey = String;

/// Seam between the engine and whatever object shape is being cached.
///
/// The engine never looks inside objects beyond these two accessors, which
/// keeps it agnostic to the concrete types flowing through it.
pub trait Identity: Clone + Send + Sync + 'static {
    /// Stable cache key. `None` marks a malformed object; the engine skips
    /// and reports such objects instead of aborting the stream.
    fn object_key(&self) -> Option<ObjectKey>;

    /// Opaque version token issued by the remote store for this object.
    /// Non-decreasing per object; never ordered across distinct objects.
    fn resource_version(&self) -> Option<String>;
}

/// Raw JSON objects carry identity under `metadata`, so dynamic payloads can
/// be cached without a typed wrapper.
impl Identity for serde_json::Value {
    fn object_key(&self) -> Option<ObjectKey> {
        let meta = self.get("metadata")?;
        let name = meta.get("name").and_then(|v| v.as_str())?;
        match meta.get("namespace").and_then(|v| v.as_str()) {
            Some(ns) => Some(format!("{ns}/{name}")),
            None => Some(name.to_string()),
        }
    }

    fn resource_version(&self) -> Option<String> {
        self.get("metadata")?
            .get("resourceVersion")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// How a pending change reached the queue.
///
/// `Sync` carries the initial enumeration and resync reconfirmations;
/// `Replaced` carries relist enumerations so consumers can tell the two
/// apart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    Sync,
    Replaced,
}

/// One recorded, possibly-compressed change pending application to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta<T> {
    pub kind: DeltaKind,
    pub object: T,
}

/// Result of one full enumeration of the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPage<T> {
    pub items: Vec<T>,
    /// Version token to resume a watch from.
    pub resource_version: String,
}

/// One event from the remote store's change-notification stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Advances the resumption point without representing an object change.
    Bookmark { resource_version: String },
}

/// Terminal condition of a watch stream.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum WatchError {
    /// The resumption token was rejected as too old; a full relist is the
    /// only way forward.
    #[error("resume version too old: {0}")]
    Expired(String),
    /// Connection-level failure; reconnecting from the last token is safe.
    #[error("watch stream error: {0}")]
    Transient(String),
}

/// Recoverable faults surfaced to the owning application. None of these stop
/// the engine.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum Fault {
    #[error("malformed event skipped: {reason}")]
    MalformedEvent { reason: String },
    #[error("handler {handle} failed during {event}: {reason}")]
    HandlerFailure {
        handle: u64,
        event: String,
        reason: String,
    },
    #[error("store inconsistency for {key}: {reason}")]
    StoreInconsistency { key: ObjectKey, reason: String },
}

/// Destination for [`Fault`] reports. Every fault is logged; forwarding onto
/// a channel is opt-in and a closed receiver is ignored.
#[derive(Clone, Default)]
pub struct FaultSink {
    tx: Option<mpsc::UnboundedSender<Fault>>,
}

impl FaultSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Fault>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that only logs.
    pub fn log_only() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, fault: Fault) {
        warn!(%fault, "recoverable fault");
        if let Some(tx) = &self.tx {
            let _ = tx.send(fault);
        }
    }
}

pub mod prelude {
    pub use super::{
        Delta, DeltaKind, Fault, FaultSink, Identity, ListPage, ObjectKey, WatchError, WatchEvent,
    };
}
