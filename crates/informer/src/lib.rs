//! Mirador informer: the cache-sync engine.
//!
//! A [`SharedInformer`] mirrors one remote collection into an
//! [`IndexedStore`] and fans an ordered change stream out to registered
//! handlers. It consumes the remote store only through the [`ListerWatcher`]
//! boundary; credentials, URL construction and typed clients live behind
//! that trait, outside this crate.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod dispatch;
pub mod reflector;

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use futures::stream::BoxStream;
use mirador_core::{FaultSink, Identity, ListPage, WatchError, WatchEvent};
use mirador_store::{DeltaQueue, IndexedStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use backoff::BackoffPolicy;
pub use dispatch::{Dispatcher, EventHandler, Handle};
pub use reflector::Reflector;

/// Watch stream supplied by the collaborator. Ends on disconnect; yields
/// `Err` for server-signaled conditions.
pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>, WatchError>>;

/// Minimal contract to the remote store. Implementations must make both
/// calls abortable (dropping the future or stream cancels the request) so a
/// stop signal takes effect promptly.
#[async_trait::async_trait]
pub trait ListerWatcher<T: Identity>: Send + Sync {
    /// Enumerate everything, optionally resuming from a version token.
    async fn list(&self, resource_version: Option<&str>) -> anyhow::Result<ListPage<T>>;

    /// Open a change stream from the given version token.
    async fn watch(&self, resource_version: &str) -> anyhow::Result<WatchStream<T>>;
}

/// How often listener resync deadlines are scanned.
const RESYNC_SCAN_INTERVAL: Duration = Duration::from_millis(250);

pub struct InformerConfig {
    pub backoff: BackoffPolicy,
    /// Default resync period for handlers that don't override it. `None`
    /// disables resync for such handlers.
    pub resync_period: Option<Duration>,
    pub faults: FaultSink,
}

impl Default for InformerConfig {
    fn default() -> Self {
        let mut backoff = BackoffPolicy::default();
        if let Some(cap) = std::env::var("MIRADOR_BACKOFF_MAX_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            backoff.cap = Duration::from_secs(cap);
        }
        let resync_period = std::env::var("MIRADOR_RESYNC_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        Self { backoff, resync_period, faults: FaultSink::log_only() }
    }
}

/// One informer instance: store + queue + dispatcher + reflector, scoped to
/// a single remote collection. Instances for different collections are fully
/// independent.
pub struct SharedInformer<T: Identity> {
    lw: Arc<dyn ListerWatcher<T>>,
    store: Arc<IndexedStore<T>>,
    queue: Arc<DeltaQueue<T>>,
    dispatcher: Arc<Dispatcher<T>>,
    last_rv: Arc<ArcSwapOption<String>>,
    cfg: InformerConfig,
}

impl<T: Identity> SharedInformer<T> {
    pub fn new(lw: Arc<dyn ListerWatcher<T>>) -> Self {
        Self::with_config(lw, InformerConfig::default())
    }

    pub fn with_config(lw: Arc<dyn ListerWatcher<T>>, cfg: InformerConfig) -> Self {
        let store = Arc::new(IndexedStore::new());
        let queue = Arc::new(DeltaQueue::new(store.clone(), cfg.faults.clone()));
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), cfg.faults.clone()));
        Self {
            lw,
            store,
            queue,
            dispatcher,
            last_rv: Arc::new(ArcSwapOption::empty()),
            cfg,
        }
    }

    /// Read access to the cache; valid before, during and after `run`.
    pub fn store(&self) -> Arc<IndexedStore<T>> {
        self.store.clone()
    }

    /// Register a handler. Joining after start replays the current store
    /// content as synthetic adds before any live event.
    pub fn add_event_handler(
        &self,
        handler: EventHandler<T>,
        resync_period: Option<Duration>,
    ) -> Handle {
        self.dispatcher
            .add_handler(handler, resync_period.or(self.cfg.resync_period))
    }

    pub fn remove_event_handler(&self, handle: Handle) -> bool {
        self.dispatcher.remove_handler(handle)
    }

    /// True once the deltas from the first full enumeration have all been
    /// applied, i.e. the store has caught up to the initial snapshot.
    pub fn has_synced(&self) -> bool {
        self.queue.has_synced()
    }

    /// Last version token observed by the reflector; empty before the first
    /// list and after an expiry-forced relist begins.
    pub fn last_sync_resource_version(&self) -> String {
        self.last_rv
            .load_full()
            .map(|s| (*s).clone())
            .unwrap_or_default()
    }

    /// Run until `stop` fires. The batch being applied when stop arrives
    /// finishes; deltas still queued are dropped (a fresh start relists).
    pub async fn run(&self, stop: CancellationToken) {
        let reflector = Reflector::new(
            self.lw.clone(),
            self.queue.clone(),
            self.last_rv.clone(),
            self.cfg.backoff.clone(),
        );
        let reflector_task = {
            let stop = stop.clone();
            tokio::spawn(async move { reflector.run(stop).await })
        };

        // Unblock pop() the moment stop fires.
        let closer_task = {
            let stop = stop.clone();
            let queue = self.queue.clone();
            tokio::spawn(async move {
                stop.cancelled().await;
                queue.close();
            })
        };

        let resync_task = {
            let stop = stop.clone();
            let queue = self.queue.clone();
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(RESYNC_SCAN_INTERVAL);
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            if dispatcher.mark_due_resyncs(Instant::now()) {
                                debug!("resync due; re-enqueueing sync deltas");
                                let queued = queue.resync();
                                dispatcher.open_sync_round(queued);
                            }
                        }
                    }
                }
            })
        };

        while let Some((key, chain)) = self.queue.pop().await {
            self.dispatcher.dispatch(&key, chain);
        }

        let _ = tokio::join!(reflector_task, closer_task, resync_task);
        info!("informer stopped");
    }
}
