//! jobmon store: the dispatch queue and the local job cache

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use jobmon_core::{JobEventHandler, JobSnapshot, JobSource, ObjectKey, RetrySettings, StoreResult};
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

/// Classifies a failure for the queue's retry policy.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for jobmon_core::StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, jobmon_core::StoreError::Transient(_))
    }
}

/// What `handle_result` did with a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Forgotten,
    Requeued { attempt: u32 },
    Dropped,
}

#[derive(Default)]
struct State {
    order: VecDeque<ObjectKey>,
    /// Keys waiting to be processed, whether queued or parked behind an in-flight dispatch.
    dirty: FxHashSet<ObjectKey>,
    processing: FxHashSet<ObjectKey>,
    requeues: FxHashMap<ObjectKey, u32>,
    shutting_down: bool,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    retry: RetrySettings,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Deduplicating, rate-limited work queue keyed by job identity.
///
/// A key is either absent, queued, in flight, or in flight with a pending redispatch.
/// Adding a key that is queued is a no-op; adding one that is in flight parks it until
/// `done` releases the slot, so at most one dispatch per key runs at any time.
#[derive(Clone)]
pub struct DispatchQueue {
    shared: Arc<Shared>,
}

impl DispatchQueue {
    pub fn new(retry: RetrySettings) -> Self {
        Self { shared: Arc::new(Shared { state: Mutex::new(State::default()), notify: Notify::new(), retry }) }
    }

    pub fn len(&self) -> usize { self.shared.lock().order.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn is_shutting_down(&self) -> bool { self.shared.lock().shutting_down }

    pub fn add(&self, key: ObjectKey) {
        let mut st = self.shared.lock();
        if st.shutting_down || st.dirty.contains(&key) {
            return;
        }
        st.dirty.insert(key.clone());
        if st.processing.contains(&key) {
            return;
        }
        st.order.push_back(key);
        gauge!("jobmon_queue_depth", st.order.len() as f64);
        drop(st);
        self.shared.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.shared.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.order.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    gauge!("jobmon_queue_depth", st.order.len() as f64);
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release the in-flight slot for `key`, requeueing it if it changed meanwhile.
    pub fn done(&self, key: &ObjectKey) {
        let mut st = self.shared.lock();
        st.processing.remove(key);
        if st.dirty.contains(key) && !st.shutting_down {
            st.order.push_back(key.clone());
            gauge!("jobmon_queue_depth", st.order.len() as f64);
            drop(st);
            self.shared.notify.notify_one();
        }
    }

    pub fn forget(&self, key: &ObjectKey) {
        self.shared.lock().requeues.remove(key);
    }

    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.shared.lock().requeues.get(key).copied().unwrap_or(0)
    }

    /// Requeue after the key's next backoff step.
    pub fn add_rate_limited(&self, key: ObjectKey) {
        let delay = {
            let mut st = self.shared.lock();
            let n = st.requeues.entry(key.clone()).or_insert(0);
            let delay = backoff(&self.shared.retry, *n);
            *n += 1;
            delay
        };
        self.add_after(key, delay);
    }

    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Apply the bounded retry policy to the outcome of processing `key`.
    pub fn handle_result<E>(&self, key: &ObjectKey, result: Result<(), E>) -> RetryDecision
    where
        E: Retryable + fmt::Display,
    {
        let err = match result {
            Ok(()) => {
                self.forget(key);
                return RetryDecision::Forgotten;
            }
            Err(e) => e,
        };
        let attempt = self.num_requeues(key);
        if err.is_retryable() && attempt < self.shared.retry.max_requeues {
            info!(key = %key, error = %err, attempt = attempt + 1, "error syncing job; retrying");
            counter!("jobmon_queue_retries_total", 1u64);
            self.add_rate_limited(key.clone());
            return RetryDecision::Requeued { attempt: attempt + 1 };
        }
        self.forget(key);
        error!(key = %key, error = %err, attempts = attempt, "dropping job out of the queue");
        counter!("jobmon_queue_dropped_total", 1u64);
        RetryDecision::Dropped
    }

    /// Stop handing out work and wake every waiting `get`.
    pub fn shut_down(&self) {
        self.shared.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
        debug!("dispatch queue shut down");
    }
}

/// Exponential backoff: `base * 2^n`, capped at `max`.
pub fn backoff(retry: &RetrySettings, n: u32) -> Duration {
    2u32.checked_pow(n)
        .and_then(|exp| retry.base.checked_mul(exp))
        .map(|d| d.min(retry.max))
        .unwrap_or(retry.max)
}

type JobMap = FxHashMap<ObjectKey, Arc<JobSnapshot>>;

/// Local job cache fed by the watcher. Readers get lock-free point lookups.
pub struct JobCache {
    items: ArcSwap<JobMap>,
    synced: watch::Sender<bool>,
}

impl Default for JobCache {
    fn default() -> Self { Self::new() }
}

impl JobCache {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self { items: ArcSwap::from_pointee(JobMap::default()), synced }
    }

    pub fn len(&self) -> usize { self.items.load().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn is_synced(&self) -> bool { *self.synced.borrow() }

    pub fn mark_synced(&self) {
        if !self.synced.send_replace(true) {
            info!(jobs = self.len(), "job cache synced");
        }
    }

    /// Insert or replace a job, notifying `handler` of an add or update.
    pub fn apply(&self, job: JobSnapshot, handler: &dyn JobEventHandler) {
        let key = job.key();
        let job = Arc::new(job);
        let prev = self.items.rcu(|cur| {
            let mut next = JobMap::clone(cur);
            next.insert(key.clone(), Arc::clone(&job));
            next
        });
        match prev.get(&key) {
            Some(old) => handler.on_update(old, &job),
            None => handler.on_add(&job),
        }
    }

    /// Drop a job, notifying `handler` with its final state.
    pub fn delete(&self, job: JobSnapshot, handler: &dyn JobEventHandler) {
        let key = job.key();
        self.items.rcu(|cur| {
            let mut next = JobMap::clone(cur);
            next.remove(&key);
            next
        });
        handler.on_delete(&job);
    }

    /// Replace the whole cache after a (re)list and mark it synced.
    pub fn replace(&self, jobs: Vec<JobSnapshot>, handler: &dyn JobEventHandler) {
        let next: JobMap = jobs.into_iter().map(|j| (j.key(), Arc::new(j))).collect();
        let prev = self.items.swap(Arc::new(next.clone()));
        for (key, old) in prev.iter() {
            if !next.contains_key(key) {
                handler.on_delete(old);
            }
        }
        for (key, job) in next.iter() {
            match prev.get(key) {
                Some(old) => handler.on_update(old, job),
                None => handler.on_add(job),
            }
        }
        debug!(count = next.len(), "job cache relisted");
        self.mark_synced();
    }
}

#[async_trait::async_trait]
impl JobSource for JobCache {
    fn get_by_key(&self, key: &ObjectKey) -> StoreResult<Option<Arc<JobSnapshot>>> {
        Ok(self.items.load().get(key).cloned())
    }

    async fn wait_for_sync(&self, timeout: Duration) -> bool {
        let mut rx = self.synced.subscribe();
        tokio::time::timeout(timeout, async move { rx.wait_for(|s| *s).await.is_ok() }).await.unwrap_or(false)
    }
}

/// Subscribes the dispatch queue to cache notifications.
pub struct EnqueueHandler {
    queue: DispatchQueue,
}

impl EnqueueHandler {
    pub fn new(queue: DispatchQueue) -> Self { Self { queue } }
}

impl JobEventHandler for EnqueueHandler {
    fn on_add(&self, job: &JobSnapshot) {
        self.queue.add(job.key());
    }

    fn on_update(&self, _old: &JobSnapshot, new: &JobSnapshot) {
        self.queue.add(new.key());
    }

    fn on_delete(&self, job: &JobSnapshot) {
        self.queue.add(job.key());
    }
}
