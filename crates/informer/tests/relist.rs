#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use mirador_core::{Identity, WatchError, WatchEvent};
use mirador_informer::SharedInformer;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

fn spawn_informer(
    informer: Arc<SharedInformer<Value>>,
) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let stop = CancellationToken::new();
    let task = {
        let informer = informer.clone();
        let stop = stop.clone();
        tokio::spawn(async move { informer.run(stop).await })
    };
    (stop, task)
}

async fn shutdown(stop: CancellationToken, task: tokio::task::JoinHandle<()>) {
    stop.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("informer did not stop promptly")
        .unwrap();
}

#[tokio::test]
async fn expired_token_forces_relist_with_synthesized_delete() {
    let cluster = Arc::new(ScriptedCluster::new());
    cluster.push_list(vec![obj("a", 5), obj("b", 5)], 5);
    // Watch delivers one add, then drops the connection.
    cluster.push_watch(WatchScript::Events(vec![Ok(WatchEvent::Added(obj("c", 8)))]));
    // The reconnect is rejected as too old, forcing a relist.
    cluster.push_watch(WatchScript::Events(vec![Err(WatchError::Expired(
        "410 gone".into(),
    ))]));
    // b disappeared while we were disconnected.
    cluster.push_list(vec![obj("a", 9), obj("c", 9)], 9);
    cluster.push_watch(WatchScript::EventsThenPend(vec![]));

    let informer = Arc::new(SharedInformer::with_config(cluster.clone(), fast_config()));
    let log = new_log();
    informer.add_event_handler(recording_handler(log.clone()), None);
    let (stop, task) = spawn_informer(informer.clone());

    wait_for("relist applied", || {
        let store = informer.store();
        store.get(&key("b")).is_none()
            && store.get(&key("a")).and_then(|o| o.resource_version()).as_deref() == Some("9")
            && store.get(&key("c")).and_then(|o| o.resource_version()).as_deref() == Some("9")
    })
    .await;

    let seen = snapshot(&log);
    let deletes: Vec<usize> = seen
        .iter()
        .enumerate()
        .filter(|(_, s)| matches!(s, Seen::Delete(_)))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(deletes.len(), 1, "exactly one delete, got {seen:?}");
    assert_eq!(seen[deletes[0]], Seen::Delete("b".into()));

    // The synthesized delete is enqueued ahead of the relisted set, so it
    // must land before a's relisted state reaches the handler.
    let relist_update_a = seen
        .iter()
        .position(|s| matches!(s, Seen::Update(n, rv) if n == "a" && rv == "9"))
        .expect("relist update for a delivered");
    assert!(deletes[0] < relist_update_a, "order was {seen:?}");

    assert_eq!(cluster.lists_served(), 2);
    shutdown(stop, task).await;
}

#[tokio::test]
async fn list_failures_back_off_and_retry() {
    let cluster = Arc::new(ScriptedCluster::new());
    cluster.push_list_error("connection refused");
    cluster.push_list_error("connection refused");
    cluster.push_list(vec![obj("a", 1)], 1);
    cluster.push_watch(WatchScript::EventsThenPend(vec![]));

    let informer = Arc::new(SharedInformer::with_config(cluster.clone(), fast_config()));
    let (stop, task) = spawn_informer(informer.clone());

    wait_for("sync despite list failures", || informer.has_synced()).await;
    assert_eq!(cluster.lists_served(), 3);
    assert_eq!(informer.store().len(), 1);

    shutdown(stop, task).await;
}

#[tokio::test]
async fn broken_watch_reconnects_without_relisting() {
    let cluster = Arc::new(ScriptedCluster::new());
    cluster.push_list(vec![obj("a", 1)], 1);
    // Dies immediately, then a stream that delivers and ends, then quiet.
    cluster.push_watch(WatchScript::Events(vec![]));
    cluster.push_watch(WatchScript::Events(vec![Ok(WatchEvent::Modified(obj("a", 2)))]));
    cluster.push_watch(WatchScript::EventsThenPend(vec![]));

    let informer = Arc::new(SharedInformer::with_config(cluster.clone(), fast_config()));
    let (stop, task) = spawn_informer(informer.clone());

    wait_for("update applied after reconnects", || {
        informer
            .store()
            .get(&key("a"))
            .and_then(|o| o.resource_version())
            .as_deref()
            == Some("2")
    })
    .await;

    assert_eq!(cluster.lists_served(), 1, "broken watches must not relist");
    assert!(cluster.watches_served() >= 3);

    shutdown(stop, task).await;
}

#[tokio::test]
async fn transient_stream_error_reconnects_from_last_version() {
    let cluster = Arc::new(ScriptedCluster::new());
    cluster.push_list(vec![obj("a", 1)], 1);
    cluster.push_watch(WatchScript::Events(vec![
        Ok(WatchEvent::Modified(obj("a", 2))),
        Err(WatchError::Transient("reset by peer".into())),
    ]));
    cluster.push_watch(WatchScript::EventsThenPend(vec![Ok(WatchEvent::Modified(
        obj("a", 3),
    ))]));

    let informer = Arc::new(SharedInformer::with_config(cluster.clone(), fast_config()));
    let (stop, task) = spawn_informer(informer.clone());

    wait_for("second stream applies", || {
        informer
            .store()
            .get(&key("a"))
            .and_then(|o| o.resource_version())
            .as_deref()
            == Some("3")
    })
    .await;
    assert_eq!(cluster.lists_served(), 1);
    assert_eq!(informer.last_sync_resource_version(), "3");

    shutdown(stop, task).await;
}
