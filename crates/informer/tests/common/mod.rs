#![allow(dead_code)]

//! Scripted in-memory stand-in for the remote store, plus event-recording
//! handlers shared by the integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use mirador_core::{Identity, ListPage, WatchError, WatchEvent};
use mirador_informer::{BackoffPolicy, EventHandler, InformerConfig, ListerWatcher, WatchStream};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub type Item = Result<WatchEvent<Value>, WatchError>;

pub fn obj(name: &str, rv: u64) -> Value {
    json!({ "metadata": { "namespace": "ns", "name": name, "resourceVersion": rv.to_string() } })
}

pub fn key(name: &str) -> String {
    format!("ns/{name}")
}

pub enum WatchScript {
    /// Deliver the items, then disconnect.
    Events(Vec<Item>),
    /// Deliver the items, then hold the stream open.
    EventsThenPend(Vec<Item>),
    /// Stream fed through a channel; disconnects when the sender drops.
    Channel(mpsc::UnboundedReceiver<Item>),
}

/// Scripted List/Watch collaborator. Exhausted scripts park the caller, so
/// an unexpected extra call hangs against the stop signal instead of
/// failing some later assertion.
#[derive(Default)]
pub struct ScriptedCluster {
    lists: Mutex<VecDeque<Result<ListPage<Value>, String>>>,
    watches: Mutex<VecDeque<WatchScript>>,
    pub list_calls: AtomicUsize,
    pub watch_calls: AtomicUsize,
}

impl ScriptedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_list(&self, items: Vec<Value>, rv: u64) {
        self.lists
            .lock()
            .unwrap()
            .push_back(Ok(ListPage { items, resource_version: rv.to_string() }));
    }

    pub fn push_list_error(&self, msg: &str) {
        self.lists.lock().unwrap().push_back(Err(msg.to_string()));
    }

    pub fn push_watch(&self, script: WatchScript) {
        self.watches.lock().unwrap().push_back(script);
    }

    /// Queue a channel-backed watch and hand back its sender.
    pub fn watch_channel(&self) -> mpsc::UnboundedSender<Item> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push_watch(WatchScript::Channel(rx));
        tx
    }

    pub fn lists_served(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watches_served(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ListerWatcher<Value> for ScriptedCluster {
    async fn list(&self, _resource_version: Option<&str>) -> anyhow::Result<ListPage<Value>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.lists.lock().unwrap().pop_front();
        match next {
            Some(Ok(page)) => Ok(page),
            Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
            None => futures::future::pending().await,
        }
    }

    async fn watch(&self, _resource_version: &str) -> anyhow::Result<WatchStream<Value>> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.watches.lock().unwrap().pop_front();
        Ok(match next {
            Some(WatchScript::Events(items)) => stream::iter(items).boxed(),
            Some(WatchScript::EventsThenPend(items)) => {
                stream::iter(items).chain(stream::pending()).boxed()
            }
            Some(WatchScript::Channel(rx)) => Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })),
            None => stream::pending().boxed(),
        })
    }
}

/// What a recording handler observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Add(String, String),
    Update(String, String),
    Delete(String),
}

pub type EventLog = Arc<Mutex<Vec<Seen>>>;

pub fn new_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn snapshot(log: &EventLog) -> Vec<Seen> {
    log.lock().unwrap().clone()
}

fn name_of(v: &Value) -> String {
    v["metadata"]["name"].as_str().unwrap_or("?").to_string()
}

fn rv_of(v: &Value) -> String {
    v.resource_version().unwrap_or_default()
}

pub fn recording_handler(log: EventLog) -> EventHandler<Value> {
    let add_log = log.clone();
    let update_log = log.clone();
    EventHandler {
        on_add: Box::new(move |o| {
            add_log.lock().unwrap().push(Seen::Add(name_of(o), rv_of(o)));
            Ok(())
        }),
        on_update: Box::new(move |_old, new| {
            update_log
                .lock()
                .unwrap()
                .push(Seen::Update(name_of(new), rv_of(new)));
            Ok(())
        }),
        on_delete: Box::new(move |o| {
            log.lock().unwrap().push(Seen::Delete(name_of(o)));
            Ok(())
        }),
    }
}

/// Backoff tuned so retry paths finish within test timeouts.
pub fn fast_config() -> InformerConfig {
    InformerConfig {
        backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(50),
            jitter: Duration::from_millis(5),
        },
        ..InformerConfig::default()
    }
}

pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
