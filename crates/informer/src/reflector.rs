//! List-then-watch loop feeding the delta queue.
//!
//! One reflector owns one queue. It lists, installs the result as the
//! queue's baseline, then streams watch events; a broken stream reconnects
//! from the last observed version token, an expired token forces a relist,
//! and only cancellation ends the loop.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use metrics::counter;
use mirador_core::{DeltaKind, Identity, WatchError, WatchEvent};
use mirador_store::DeltaQueue;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::ListerWatcher;

enum WatchOutcome {
    /// Resume token rejected; go back to a full list.
    Relist,
    Stopped,
}

pub struct Reflector<T: Identity> {
    lw: Arc<dyn ListerWatcher<T>>,
    queue: Arc<DeltaQueue<T>>,
    /// Last version token observed, shared with the informer facade.
    last_rv: Arc<ArcSwapOption<String>>,
    policy: BackoffPolicy,
}

impl<T: Identity> Reflector<T> {
    pub fn new(
        lw: Arc<dyn ListerWatcher<T>>,
        queue: Arc<DeltaQueue<T>>,
        last_rv: Arc<ArcSwapOption<String>>,
        policy: BackoffPolicy,
    ) -> Self {
        Self { lw, queue, last_rv, policy }
    }

    /// Drive list/watch until `stop` fires. Transient faults back off and
    /// retry; nothing here returns an error to the caller.
    pub async fn run(&self, stop: CancellationToken) {
        let mut list_backoff = Backoff::new(self.policy.clone());
        let mut listed_once = false;
        loop {
            if stop.is_cancelled() {
                break;
            }

            let resume = self.last_rv.load_full();
            let page = tokio::select! {
                _ = stop.cancelled() => break,
                res = self.lw.list(resume.as_deref().map(|s| s.as_str())) => match res {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(error = %err, "list failed; backing off");
                        counter!("reflector_list_failures", 1);
                        let delay = list_backoff.next_delay();
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = sleep(delay) => {}
                        }
                        continue;
                    }
                },
            };
            list_backoff.reset();
            counter!("reflector_lists", 1);
            info!(items = page.items.len(), version = %page.resource_version, "listed");

            let kind = if listed_once { DeltaKind::Replaced } else { DeltaKind::Sync };
            let mut rv = page.resource_version;
            self.queue.replace(page.items, kind);
            listed_once = true;
            self.last_rv.store(Some(Arc::new(rv.clone())));

            match self.watch_until_broken(&stop, &mut rv).await {
                WatchOutcome::Relist => {
                    counter!("reflector_relists", 1);
                    self.last_rv.store(None);
                }
                WatchOutcome::Stopped => break,
            }
        }
        debug!("reflector stopped");
    }

    /// Open and consume watch streams from `rv`, reconnecting on transient
    /// breakage. Returns only for a relist or cancellation.
    async fn watch_until_broken(&self, stop: &CancellationToken, rv: &mut String) -> WatchOutcome {
        let mut backoff = Backoff::new(self.policy.clone());
        loop {
            if stop.is_cancelled() {
                return WatchOutcome::Stopped;
            }
            let mut stream = tokio::select! {
                _ = stop.cancelled() => return WatchOutcome::Stopped,
                res = self.lw.watch(rv) => match res {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(error = %err, "watch open failed; backing off");
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = stop.cancelled() => return WatchOutcome::Stopped,
                            _ = sleep(delay) => {}
                        }
                        continue;
                    }
                },
            };
            counter!("reflector_watch_opens", 1);

            let mut delivered = 0usize;
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => return WatchOutcome::Stopped,
                    ev = stream.next() => ev,
                };
                match event {
                    Some(Ok(ev)) => {
                        self.apply_event(ev, rv);
                        delivered += 1;
                    }
                    Some(Err(WatchError::Expired(msg))) => {
                        info!(%msg, "resume token expired; forcing relist");
                        return WatchOutcome::Relist;
                    }
                    Some(Err(WatchError::Transient(msg))) => {
                        warn!(%msg, "watch stream error; reconnecting");
                        break;
                    }
                    None => {
                        debug!(events = delivered, "watch disconnected; reconnecting");
                        break;
                    }
                }
            }
            counter!("reflector_watch_reconnects", 1);
            if delivered > 0 {
                backoff.reset();
            } else {
                // No progress since the last open; don't spin on a dead
                // endpoint.
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = stop.cancelled() => return WatchOutcome::Stopped,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    fn apply_event(&self, event: WatchEvent<T>, rv: &mut String) {
        match event {
            WatchEvent::Added(o) => {
                self.advance(&o, rv);
                self.queue.add(DeltaKind::Added, o);
            }
            WatchEvent::Modified(o) => {
                self.advance(&o, rv);
                self.queue.add(DeltaKind::Updated, o);
            }
            WatchEvent::Deleted(o) => {
                self.advance(&o, rv);
                self.queue.add(DeltaKind::Deleted, o);
            }
            WatchEvent::Bookmark { resource_version } => {
                *rv = resource_version.clone();
                self.last_rv.store(Some(Arc::new(resource_version)));
            }
        }
    }

    fn advance(&self, object: &T, rv: &mut String) {
        if let Some(version) = object.resource_version() {
            *rv = version.clone();
            self.last_rv.store(Some(Arc::new(version)));
        }
    }
}
