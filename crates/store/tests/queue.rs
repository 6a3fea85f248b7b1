#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use jobmon_core::{ObjectKey, RetrySettings, StoreError};
use jobmon_store::{DispatchQueue, RetryDecision, Retryable};

#[derive(Debug)]
struct Flaky;

impl fmt::Display for Flaky {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("list pods timed out") }
}

impl Retryable for Flaky {
    fn is_retryable(&self) -> bool { true }
}

fn key(name: &str) -> ObjectKey { ObjectKey::new("batch", name) }

#[tokio::test]
async fn burst_of_adds_yields_one_dequeue() {
    let q = DispatchQueue::new(RetrySettings::default());
    q.add(key("a"));
    q.add(key("a"));
    let got = q.get().await.expect("key");
    assert_eq!(got, key("a"));
    q.done(&got);
    assert!(q.is_empty(), "duplicate add must collapse into the first slot");
    assert!(tokio::time::timeout(Duration::from_millis(20), q.get()).await.is_err());
}

#[tokio::test]
async fn change_during_dispatch_redispatches_once_after_done() {
    let q = DispatchQueue::new(RetrySettings::default());
    q.add(key("a"));
    let got = q.get().await.expect("key");
    // in flight: further adds park behind the dispatch
    q.add(key("a"));
    q.add(key("a"));
    assert_eq!(q.len(), 0);
    q.done(&got);
    assert_eq!(q.len(), 1);
    let again = q.get().await.expect("redispatch");
    assert_eq!(again, key("a"));
    q.done(&again);
    assert!(q.is_empty());
}

#[tokio::test]
async fn keys_are_served_fifo() {
    let q = DispatchQueue::new(RetrySettings::default());
    for n in ["a", "b", "c"] { q.add(key(n)); }
    let mut out = Vec::new();
    for _ in 0..3 {
        let k = q.get().await.expect("key");
        q.done(&k);
        out.push(k.name);
    }
    assert_eq!(out, vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_are_dropped_after_five_requeues() {
    let q = DispatchQueue::new(RetrySettings::default());
    q.add(key("flaky"));
    for attempt in 1..=5 {
        let got = q.get().await.expect("redelivered");
        q.done(&got);
        assert_eq!(q.handle_result(&got, Err(Flaky)), RetryDecision::Requeued { attempt });
        assert_eq!(q.num_requeues(&got), attempt);
    }
    let got = q.get().await.expect("last delivery");
    q.done(&got);
    assert_eq!(q.handle_result(&got, Err(Flaky)), RetryDecision::Dropped);
    assert_eq!(q.num_requeues(&got), 0);
    assert!(tokio::time::timeout(Duration::from_secs(3600), q.get()).await.is_err(), "dropped key must not come back on its own");

    // a fresh external event brings it back
    q.add(key("flaky"));
    assert_eq!(q.get().await, Some(key("flaky")));
}

#[tokio::test(start_paused = true)]
async fn success_clears_retry_history() {
    let q = DispatchQueue::new(RetrySettings::default());
    q.add(key("a"));
    let got = q.get().await.expect("key");
    q.done(&got);
    q.handle_result(&got, Err(Flaky));
    let got = q.get().await.expect("retry");
    q.done(&got);
    assert_eq!(q.handle_result::<Flaky>(&got, Ok(())), RetryDecision::Forgotten);
    assert_eq!(q.num_requeues(&got), 0);
}

#[tokio::test]
async fn non_retryable_errors_drop_immediately() {
    let q = DispatchQueue::new(RetrySettings::default());
    let k = key("forbidden");
    let decision = q.handle_result(&k, Err(StoreError::Fatal("pods is forbidden".into())));
    assert_eq!(decision, RetryDecision::Dropped);
    assert!(q.is_empty());
}

#[tokio::test]
async fn shutdown_wakes_blocked_getters() {
    let q = DispatchQueue::new(RetrySettings::default());
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        })
        .collect();
    tokio::task::yield_now().await;
    q.shut_down();
    for w in waiters {
        let got = tokio::time::timeout(Duration::from_secs(1), w).await.expect("woken").expect("join");
        assert!(got.is_none());
    }
}

#[tokio::test]
async fn parallel_workers_never_share_a_key() {
    let q = DispatchQueue::new(RetrySettings::default());
    q.add(key("a"));
    let first = q.get().await.expect("key");
    q.add(key("a"));
    q.add(key("b"));
    let second = q.get().await.expect("key");
    assert_eq!(second, key("b"), "in-flight key must not be handed to another worker");
    q.done(&first);
    q.done(&second);
    assert_eq!(q.get().await, Some(key("a")));
}
