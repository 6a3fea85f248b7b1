//! In-memory collaborators for exercising the pipeline without a cluster.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use jobmon_core::{
    AlertRecord, AlertSink, EventRecord, JobCondition, JobSnapshot, Labels, ObjectStore, PodSnapshot, Selector,
    StoreError, StoreResult,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Job whose selector carries `controller-uid=uid-<name>`.
pub fn job(namespace: &str, name: &str) -> JobSnapshot {
    let mut selector = Labels::new();
    selector.insert("controller-uid".into(), format!("uid-{}", name));
    JobSnapshot { namespace: namespace.into(), name: name.into(), selector, ..Default::default() }
}

pub fn condition(kind: &str, status: bool, reason: &str, message: &str) -> JobCondition {
    JobCondition {
        kind: kind.into(),
        status,
        reason: reason.into(),
        message: message.into(),
        last_transition: None,
    }
}

pub fn pod(name: &str, created: Option<DateTime<Utc>>) -> PodSnapshot {
    PodSnapshot { name: name.into(), created, ..Default::default() }
}

/// Pod labelled as belonging to `job`.
pub fn job_pod(job: &JobSnapshot, label: &str, name: &str, created: Option<DateTime<Utc>>) -> PodSnapshot {
    let mut p = pod(name, created);
    p.namespace = job.namespace.clone();
    if let Some((key, id)) = job.controller_entry(label) {
        p.labels.insert(key.into(), id.into());
    }
    p
}

#[derive(Default)]
pub struct InMemoryStore {
    jobs: Mutex<BTreeSet<String>>,
    pods: Mutex<Vec<PodSnapshot>>,
    events: Mutex<Vec<(String, EventRecord)>>,
    failing_pod_deletes: Mutex<HashSet<String>>,
    list_pods_error: Mutex<Option<StoreError>>,
    list_events_error: Mutex<Option<StoreError>>,
    pod_queries: AtomicUsize,
    event_queries: AtomicUsize,
}

impl InMemoryStore {
    pub fn add_job(&self, job: &JobSnapshot) {
        lock(&self.jobs).insert(job.key().to_string());
    }

    pub fn add_pod(&self, pod: PodSnapshot) {
        lock(&self.pods).push(pod);
    }

    pub fn add_event(&self, namespace: &str, ev: EventRecord) {
        lock(&self.events).push((namespace.to_string(), ev));
    }

    pub fn fail_pod_delete(&self, name: &str) {
        lock(&self.failing_pod_deletes).insert(name.to_string());
    }

    pub fn fail_list_pods(&self, err: StoreError) {
        *lock(&self.list_pods_error) = Some(err);
    }

    pub fn fail_list_events(&self, err: StoreError) {
        *lock(&self.list_events_error) = Some(err);
    }

    pub fn clear_failures(&self) {
        lock(&self.failing_pod_deletes).clear();
        *lock(&self.list_pods_error) = None;
        *lock(&self.list_events_error) = None;
    }

    /// Remaining job keys, sorted.
    pub fn jobs(&self) -> Vec<String> {
        lock(&self.jobs).iter().cloned().collect()
    }

    /// Remaining pod names, sorted.
    pub fn pod_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.pods).iter().map(|p| p.name.clone()).collect();
        names.sort();
        names
    }

    pub fn pod_queries(&self) -> usize {
        self.pod_queries.load(Ordering::SeqCst)
    }

    pub fn event_queries(&self) -> usize {
        self.event_queries.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ObjectStore for InMemoryStore {
    async fn list_pods(&self, namespace: &str, labels: &Selector) -> StoreResult<Vec<PodSnapshot>> {
        self.pod_queries.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = lock(&self.list_pods_error).clone() {
            return Err(e);
        }
        Ok(lock(&self.pods)
            .iter()
            .filter(|p| p.namespace == namespace && labels.matches(&p.labels))
            .cloned()
            .collect())
    }

    async fn list_events(&self, namespace: &str, fields: &Selector) -> StoreResult<Vec<EventRecord>> {
        self.event_queries.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = lock(&self.list_events_error).clone() {
            return Err(e);
        }
        Ok(lock(&self.events)
            .iter()
            .filter(|(ns, e)| ns == namespace && e.involved_name == fields.value)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let key = jobmon_core::ObjectKey::new(namespace, name).to_string();
        if lock(&self.jobs).remove(&key) {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("jobs \"{}\" not found", name)))
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> StoreResult<()> {
        if lock(&self.failing_pod_deletes).contains(name) {
            return Err(StoreError::Transient(format!("deleting pod {}: connection reset", name)));
        }
        let mut pods = lock(&self.pods);
        let before = pods.len();
        pods.retain(|p| !(p.namespace == namespace && p.name == name));
        if pods.len() == before {
            return Err(StoreError::NotFound(format!("pods \"{}\" not found", name)));
        }
        Ok(())
    }
}

/// Keeps every alert it is given.
#[derive(Default)]
pub struct RecordingSink {
    alerts: Mutex<Vec<AlertRecord>>,
    fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self { alerts: Mutex::new(Vec::new()), fail: true }
    }

    pub fn alerts(&self) -> Vec<AlertRecord> {
        lock(&self.alerts).clone()
    }
}

#[async_trait::async_trait]
impl AlertSink for RecordingSink {
    async fn emit(&self, alert: &AlertRecord) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("sink unavailable");
        }
        lock(&self.alerts).push(alert.clone());
        Ok(())
    }
}
