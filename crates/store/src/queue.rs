//! Ordered, compressing queue of pending per-key delta chains.
//!
//! Single producer (the reflector) and single consumer (the dispatch loop).
//! Keys keep FIFO order by first enqueue since the queue last drained; deltas
//! for one key accumulate into a chain and are popped together.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use metrics::counter;
use mirador_core::{Delta, DeltaKind, Fault, FaultSink, Identity, ObjectKey};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tokio::sync::Notify;
use tracing::debug;

use crate::KnownKeys;

/// Pending deltas for one key, oldest first.
pub type DeltaChain<T> = SmallVec<[Delta<T>; 4]>;

pub struct DeltaQueue<T: Identity> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    known: Arc<dyn KnownKeys<T>>,
    faults: FaultSink,
}

struct Inner<T> {
    chains: FxHashMap<ObjectKey, DeltaChain<T>>,
    order: VecDeque<ObjectKey>,
    /// True once the first enumeration has been installed.
    populated: bool,
    /// Keys from the first enumeration not yet popped; `has_synced` gates on
    /// this reaching zero.
    initial_remaining: usize,
    closed: bool,
}

impl<T: Identity> DeltaQueue<T> {
    pub fn new(known: Arc<dyn KnownKeys<T>>, faults: FaultSink) -> Self {
        Self {
            inner: Mutex::new(Inner {
                chains: FxHashMap::default(),
                order: VecDeque::new(),
                populated: false,
                initial_remaining: 0,
                closed: false,
            }),
            notify: Notify::new(),
            known,
            faults,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once every key from the first enumeration has been popped, i.e.
    /// the store has caught up to the initial snapshot.
    pub fn has_synced(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.populated && inner.initial_remaining == 0
    }

    /// Enqueue one change observed on the watch stream.
    pub fn add(&self, kind: DeltaKind, object: T) {
        let Some(key) = object.object_key() else {
            self.faults.report(Fault::MalformedEvent {
                reason: "watch object has no extractable key".into(),
            });
            return;
        };
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        Self::push_locked(&mut inner, &self.faults, key, Delta { kind, object });
        drop(inner);
        self.notify.notify_one();
    }

    /// Install a full enumeration result. `kind` is `Sync` for the first
    /// list and `Replaced` for relists.
    ///
    /// Keys known to the cache (stored or pending) but absent from `items`
    /// get a synthesized `Deleted` delta, enqueued before the new set so
    /// consumers observe the disappearance first.
    pub fn replace(&self, items: Vec<T>, kind: DeltaKind) {
        let mut keyed: Vec<(ObjectKey, T)> = Vec::with_capacity(items.len());
        for object in items {
            match object.object_key() {
                Some(key) => keyed.push((key, object)),
                None => self.faults.report(Fault::MalformedEvent {
                    reason: "listed object has no extractable key".into(),
                }),
            }
        }
        let new_keys: FxHashSet<ObjectKey> = keyed.iter().map(|(k, _)| k.clone()).collect();

        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }

        // Baseline: everything the store holds plus everything still pending.
        let mut baseline = self.known.known_keys();
        for key in inner.chains.keys() {
            if !baseline.iter().any(|k| k == key) {
                baseline.push(key.clone());
            }
        }

        let mut deleted = 0usize;
        for key in baseline {
            if new_keys.contains(key.as_str()) {
                continue;
            }
            let snapshot = self
                .known
                .last_snapshot(&key)
                .or_else(|| Self::newest_pending(&inner, &key));
            let Some(object) = snapshot else { continue };
            Self::push_locked(
                &mut inner,
                &self.faults,
                key,
                Delta { kind: DeltaKind::Deleted, object },
            );
            deleted += 1;
        }
        if deleted > 0 {
            debug!(count = deleted, "synthesized deletes for keys missing from enumeration");
            counter!("queue_replace_deletes", deleted as u64);
        }

        for (key, object) in keyed {
            if kind == DeltaKind::Sync && Self::redundant_sync_locked(&inner, &self.known, &key, &object) {
                counter!("queue_syncs_dropped", 1);
                continue;
            }
            Self::push_locked(&mut inner, &self.faults, key, Delta { kind, object });
        }

        if !inner.populated {
            inner.populated = true;
            inner.initial_remaining = inner.order.len();
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Re-enqueue a `Sync` delta for every stored key without a pending
    /// chain. Keys with pending work are skipped; their chain will reach the
    /// consumer anyway. Returns how many syncs were enqueued.
    pub fn resync(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return 0;
        }
        let mut queued = 0usize;
        for key in self.known.known_keys() {
            if inner.chains.contains_key(&key) {
                continue;
            }
            let Some(object) = self.known.last_snapshot(&key) else { continue };
            Self::push_locked(
                &mut inner,
                &self.faults,
                key,
                Delta { kind: DeltaKind::Sync, object },
            );
            queued += 1;
        }
        drop(inner);
        if queued > 0 {
            debug!(count = queued, "resync enqueued");
            self.notify.notify_one();
        }
        queued
    }

    /// Remove and return the chain for the earliest-enqueued pending key.
    /// Waits until something is pending; returns `None` once closed.
    pub async fn pop(&self) -> Option<(ObjectKey, DeltaChain<T>)> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    return None;
                }
                if let Some(key) = inner.order.pop_front() {
                    let chain = inner.chains.remove(&key).unwrap_or_default();
                    if inner.initial_remaining > 0 {
                        inner.initial_remaining -= 1;
                    }
                    return Some((key, chain));
                }
            }
            notified.await;
        }
    }

    /// Unblock any waiting `pop` for shutdown. Deltas still queued are
    /// dropped; a fresh start always relists.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    fn newest_pending(inner: &Inner<T>, key: &str) -> Option<T> {
        inner
            .chains
            .get(key)
            .and_then(|chain| chain.last())
            .map(|d| d.object.clone())
    }

    /// A plain `Sync` adds nothing when the key has no pending work and the
    /// stored snapshot already carries the same version token.
    fn redundant_sync_locked(
        inner: &Inner<T>,
        known: &Arc<dyn KnownKeys<T>>,
        key: &str,
        object: &T,
    ) -> bool {
        if inner.chains.contains_key(key) {
            return false;
        }
        match (known.last_snapshot(key), object.resource_version()) {
            (Some(stored), Some(rv)) => stored.resource_version().as_deref() == Some(rv.as_str()),
            _ => false,
        }
    }

    fn push_locked(inner: &mut Inner<T>, faults: &FaultSink, key: ObjectKey, delta: Delta<T>) {
        let fresh = !inner.chains.contains_key(&key);
        let chain = inner.chains.entry(key.clone()).or_default();
        match (chain.last().map(|d| d.kind), delta.kind) {
            // Change after a pending delete: the remote resurrected the key
            // while we were buffering. Keep the newer state.
            (Some(DeltaKind::Deleted), DeltaKind::Added | DeltaKind::Updated) => {
                faults.report(Fault::StoreInconsistency {
                    key: key.clone(),
                    reason: "change arrived for a key with a pending delete".into(),
                });
                chain.clear();
                chain.push(delta);
            }
            // An update folds into the pending entry; a chain that began as
            // Added stays Added, the object is still new to consumers.
            (Some(DeltaKind::Added), DeltaKind::Updated) => {
                let last = chain.last_mut().unwrap();
                last.object = delta.object;
                counter!("queue_deltas_coalesced", 1);
            }
            (Some(DeltaKind::Updated), DeltaKind::Updated) => {
                let last = chain.last_mut().unwrap();
                last.object = delta.object;
                counter!("queue_deltas_coalesced", 1);
            }
            // Duplicate deletes keep only the newest snapshot.
            (Some(DeltaKind::Deleted), DeltaKind::Deleted) => {
                *chain.last_mut().unwrap() = delta;
                counter!("queue_deltas_coalesced", 1);
            }
            _ => chain.push(delta),
        }
        if fresh {
            inner.order.push_back(key);
        }
    }
}
