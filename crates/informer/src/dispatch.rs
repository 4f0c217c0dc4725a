//! Single authoritative consumer of the delta queue.
//!
//! Applies each popped chain to the store first, then notifies every
//! registered handler in registration order. The registry mutex is held for
//! the whole apply+notify section and for late-join replay, which is what
//! makes the join-consistency contract hold.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::counter;
use mirador_core::{Delta, DeltaKind, Fault, FaultSink, Identity, ObjectKey};
use mirador_store::{DeltaChain, IndexedStore};
use tracing::debug;

/// Opaque registration handle; removal by handle alone stops future
/// dispatch.
pub type Handle = u64;

/// Callback set invoked from the dispatch loop. Callbacks run sequentially
/// and must not block for long; an `Err` is reported and isolated, never
/// fatal.
pub struct EventHandler<T> {
    pub on_add: Box<dyn Fn(&T) -> anyhow::Result<()> + Send>,
    pub on_update: Box<dyn Fn(&T, &T) -> anyhow::Result<()> + Send>,
    pub on_delete: Box<dyn Fn(&T) -> anyhow::Result<()> + Send>,
}

impl<T> Default for EventHandler<T> {
    fn default() -> Self {
        Self {
            on_add: Box::new(|_| Ok(())),
            on_update: Box::new(|_, _| Ok(())),
            on_delete: Box::new(|_| Ok(())),
        }
    }
}

struct Listener<T> {
    handle: Handle,
    handler: EventHandler<T>,
    resync_every: Option<Duration>,
    next_resync: Option<Instant>,
    /// Due for resync; sync-kind updates are delivered only while set. The
    /// mark stays until the whole round's sync deltas have been dispatched,
    /// so a dispatch loop lagging behind the deadline scanner cannot lose
    /// the round.
    syncing: bool,
}

struct Registry<T> {
    listeners: Vec<Listener<T>>,
    next_handle: Handle,
    /// Sync deltas from the current resync round still waiting in the
    /// queue. Counted down as they are dispatched; marks clear at zero.
    outstanding_syncs: usize,
}

pub struct Dispatcher<T: Identity> {
    store: Arc<IndexedStore<T>>,
    registry: Mutex<Registry<T>>,
    faults: FaultSink,
}

impl<T: Identity> Dispatcher<T> {
    pub fn new(store: Arc<IndexedStore<T>>, faults: FaultSink) -> Self {
        Self {
            store,
            registry: Mutex::new(Registry {
                listeners: Vec::new(),
                next_handle: 1,
                outstanding_syncs: 0,
            }),
            faults,
        }
    }

    /// Register a handler. A late joiner first receives a synthetic add for
    /// every object currently stored, with no live event interleaved and no
    /// item delivered twice.
    pub fn add_handler(&self, handler: EventHandler<T>, resync_every: Option<Duration>) -> Handle {
        let mut reg = self.registry.lock().unwrap();
        let handle = reg.next_handle;
        reg.next_handle += 1;

        // Store content cannot move under us: every mutation happens inside
        // `dispatch`, which holds the same lock.
        let replay = self.store.list();
        debug!(handle, items = replay.len(), "replaying store to new handler");
        for object in &replay {
            if let Err(err) = (handler.on_add)(object) {
                self.report_handler_failure(handle, "replay-add", err);
            }
        }

        let now = Instant::now();
        reg.listeners.push(Listener {
            handle,
            handler,
            resync_every,
            next_resync: resync_every.map(|d| now + d),
            syncing: false,
        });
        handle
    }

    /// Deregister. Returns false for an unknown handle.
    pub fn remove_handler(&self, handle: Handle) -> bool {
        let mut reg = self.registry.lock().unwrap();
        let before = reg.listeners.len();
        reg.listeners.retain(|l| l.handle != handle);
        reg.listeners.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.registry.lock().unwrap().listeners.len()
    }

    /// Scan resync deadlines. Listeners past due are marked syncing and
    /// rescheduled; returns true when at least one came due, in which case
    /// the caller re-enqueues sync deltas and opens the round with
    /// [`open_sync_round`](Self::open_sync_round). Marks are cleared by
    /// `dispatch` once the round drains, never here.
    pub fn mark_due_resyncs(&self, now: Instant) -> bool {
        let mut reg = self.registry.lock().unwrap();
        let mut any = false;
        for l in reg.listeners.iter_mut() {
            if let (Some(every), Some(next)) = (l.resync_every, l.next_resync) {
                if next <= now {
                    l.syncing = true;
                    l.next_resync = Some(now + every);
                    any = true;
                }
            }
        }
        any
    }

    /// Record how many sync deltas the resync round just enqueued. Listener
    /// marks stay set until that many sync deltas have been dispatched. A
    /// round of zero clears the marks right away; a round opened while the
    /// previous one is still draining supersedes it.
    pub fn open_sync_round(&self, queued: usize) {
        let mut reg = self.registry.lock().unwrap();
        reg.outstanding_syncs = queued;
        if queued == 0 {
            for l in reg.listeners.iter_mut() {
                l.syncing = false;
            }
        }
    }

    /// Apply one popped chain to the store, then fan each resulting event
    /// out to the listeners.
    pub fn dispatch(&self, key: &ObjectKey, chain: DeltaChain<T>) {
        let mut reg = self.registry.lock().unwrap();
        for Delta { kind, object } in chain {
            match kind {
                DeltaKind::Added | DeltaKind::Updated | DeltaKind::Sync | DeltaKind::Replaced => {
                    let old = self.store.upsert(key, object.clone());
                    match old {
                        Some(old) => {
                            // A reconfirmation carries no change; it only
                            // reaches listeners that asked to be resynced.
                            let is_sync = kind == DeltaKind::Sync
                                || (kind == DeltaKind::Replaced
                                    && old.resource_version() == object.resource_version());
                            self.notify_update(&reg, &old, &object, is_sync);
                        }
                        None => self.notify_add(&reg, &object),
                    }
                }
                DeltaKind::Deleted => {
                    // The delta snapshot is the final known state, whether
                    // from the stream or synthesized at relist; consumers
                    // must tolerate deletes for objects they never saw.
                    let _ = self.store.delete(key);
                    self.notify_delete(&reg, &object);
                }
            }
            // Count the round's sync deltas out as they land; marks come
            // off only when the last one has been delivered.
            if kind == DeltaKind::Sync && reg.outstanding_syncs > 0 {
                reg.outstanding_syncs -= 1;
                if reg.outstanding_syncs == 0 {
                    for l in reg.listeners.iter_mut() {
                        l.syncing = false;
                    }
                }
            }
        }
        counter!("dispatcher_chains_applied", 1);
    }

    fn notify_add(&self, reg: &Registry<T>, object: &T) {
        for l in reg.listeners.iter() {
            if let Err(err) = (l.handler.on_add)(object) {
                self.report_handler_failure(l.handle, "add", err);
            }
        }
    }

    fn notify_update(&self, reg: &Registry<T>, old: &T, new: &T, is_sync: bool) {
        for l in reg.listeners.iter() {
            if is_sync && !l.syncing {
                continue;
            }
            if let Err(err) = (l.handler.on_update)(old, new) {
                self.report_handler_failure(l.handle, "update", err);
            }
        }
    }

    fn notify_delete(&self, reg: &Registry<T>, object: &T) {
        for l in reg.listeners.iter() {
            if let Err(err) = (l.handler.on_delete)(object) {
                self.report_handler_failure(l.handle, "delete", err);
            }
        }
    }

    fn report_handler_failure(&self, handle: Handle, event: &str, err: anyhow::Error) {
        counter!("dispatcher_handler_failures", 1);
        self.faults.report(Fault::HandlerFailure {
            handle,
            event: event.to_string(),
            reason: err.to_string(),
        });
    }
}
