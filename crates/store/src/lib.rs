//! Mirador store: compressing delta queue and indexed latest-state cache.
//!
//! The two halves communicate only through the informer's dispatch loop; the
//! queue additionally holds a [`KnownKeys`] view of the store so a relist can
//! synthesize deletes for objects that vanished while disconnected.

#![forbid(unsafe_code)]

use mirador_core::{Identity, ObjectKey};

pub mod index;
pub mod queue;

pub use index::{IndexFn, IndexedStore};
pub use queue::{DeltaChain, DeltaQueue};

/// Read-only view of which keys the cache currently holds, with the last
/// snapshot per key. Implemented by [`IndexedStore`]; the queue uses it as
/// the baseline key set during `replace` and `resync`.
pub trait KnownKeys<T: Identity>: Send + Sync {
    fn known_keys(&self) -> Vec<ObjectKey>;
    fn last_snapshot(&self, key: &str) -> Option<T>;
}
