//! jobmon core types, errors and the traits the pipeline talks to.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub type Labels = BTreeMap<String, String>;

/// Prefix of the job labels Kubernetes sets from 1.27 on.
pub const BATCH_LABEL_PREFIX: &str = "batch.kubernetes.io/";

/// `namespace/name` identity of a job; the unit the dispatch queue deduplicates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Complete,
    Failed,
    Other(String),
}

impl From<&str> for ConditionType {
    fn from(s: &str) -> Self {
        match s {
            "Complete" => ConditionType::Complete,
            "Failed" => ConditionType::Failed,
            other => ConditionType::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCondition {
    pub kind: ConditionType,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition: Option<DateTime<Utc>>,
}

/// Read-only point-in-time view of a Job. Shared as `Arc` and never mutated once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub namespace: String,
    pub name: String,
    pub owner_refs: usize,
    /// `spec.completions`; `None` means the API default of 1.
    pub completions: Option<i32>,
    pub succeeded: i32,
    pub failed: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub conditions: Vec<JobCondition>,
    pub labels: Labels,
    pub annotations: Labels,
    /// `spec.selector.matchLabels`
    pub selector: Labels,
}

impl JobSnapshot {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn required_completions(&self) -> i32 {
        self.completions.unwrap_or(1)
    }

    /// First condition that is true and terminal (Complete or Failed), if any.
    pub fn terminal_condition(&self) -> Option<&JobCondition> {
        self.conditions
            .iter()
            .find(|c| c.status && matches!(c.kind, ConditionType::Complete | ConditionType::Failed))
    }

    /// Selector entry for `label`, as `(key, value)`. An unprefixed label also matches
    /// its `batch.kubernetes.io/` form, the only one Kubernetes 1.27+ puts in job selectors.
    pub fn controller_entry(&self, label: &str) -> Option<(&str, &str)> {
        if let Some((k, v)) = self.selector.get_key_value(label) {
            return Some((k.as_str(), v.as_str()));
        }
        if label.contains('/') {
            return None;
        }
        self.selector
            .get_key_value(&format!("{}{}", BATCH_LABEL_PREFIX, label))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Value the job's pods carry under `label`, taken from the job selector.
    pub fn controller_id(&self, label: &str) -> Option<&str> {
        self.controller_entry(label).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerTermination {
    pub exit_code: i32,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub signal: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    /// Present only when the container has terminated.
    pub terminated: Option<ContainerTermination>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub namespace: String,
    pub name: String,
    /// `status.phase`, e.g. "Failed"; empty when unknown.
    pub phase: String,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub labels: Labels,
    pub containers: SmallVec<[ContainerStatus; 2]>,
}

impl PodSnapshot {
    pub fn is_failed(&self) -> bool {
        self.phase == "Failed"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
    Other,
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "Normal" => EventType::Normal,
            "Warning" => EventType::Warning,
            _ => EventType::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub involved_name: String,
    pub kind: EventType,
    pub reason: String,
    pub message: String,
}

/// Single `key=value` equality requirement, used as a label or field selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub key: String,
    pub value: String,
}

impl Selector {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }

    /// Field selector matching events about the named object.
    pub fn involved_object(name: &str) -> Self {
        Self::new("involvedObject.name", name)
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        labels.get(&self.key).map(|v| v == &self.value).unwrap_or(false)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Structured incident record for a failed job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub job: String,
    pub pod: String,
    pub namespace: String,
    pub reason: String,
    pub message: String,
    pub summary: String,
    pub annotations: Labels,
    pub events: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_status: Option<String>,
    pub failed_pods: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<i32>,
}

/// Errors crossing the object store boundary, classified once where they are produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Local job cache as seen by the dispatcher.
#[async_trait::async_trait]
pub trait JobSource: Send + Sync {
    fn get_by_key(&self, key: &ObjectKey) -> StoreResult<Option<Arc<JobSnapshot>>>;

    /// Wait until the initial listing has landed. Returns false on timeout.
    async fn wait_for_sync(&self, timeout: Duration) -> bool;
}

/// Receives add/update/delete notifications for jobs.
pub trait JobEventHandler: Send + Sync {
    fn on_add(&self, job: &JobSnapshot);
    fn on_update(&self, old: &JobSnapshot, new: &JobSnapshot);
    fn on_delete(&self, job: &JobSnapshot);
}

/// Cluster calls the pipeline makes. Every call may race other actors, so implementations
/// must report a vanished object as `StoreError::NotFound`.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_pods(&self, namespace: &str, labels: &Selector) -> StoreResult<Vec<PodSnapshot>>;
    async fn list_events(&self, namespace: &str, fields: &Selector) -> StoreResult<Vec<EventRecord>>;
    async fn delete_job(&self, namespace: &str, name: &str) -> StoreResult<()>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> StoreResult<()>;
}

#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: &AlertRecord) -> anyhow::Result<()>;
}

/// Exponential per-key backoff for the dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub base: Duration,
    pub max: Duration,
    pub max_requeues: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { base: Duration::from_millis(5), max: Duration::from_secs(1000), max_requeues: 5 }
    }
}

/// Runtime settings assembled by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Minimum age since completion before a job may be reaped.
    pub retention_period: Duration,
    /// Failure threshold that forces a reap; negative disables it.
    pub max_failures: i32,
    pub workers: usize,
    pub controller_label: String,
    pub channel_capacity: usize,
    pub sync_timeout: Duration,
    pub delete_concurrency: usize,
    /// Watch a single namespace instead of the whole cluster.
    pub namespace: Option<String>,
    pub retry: RetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retention_period: Duration::ZERO,
            max_failures: -1,
            workers: 1,
            controller_label: "controller-uid".to_string(),
            channel_capacity: 5,
            sync_timeout: Duration::from_secs(60),
            delete_concurrency: 4,
            namespace: None,
            retry: RetrySettings::default(),
        }
    }
}

pub mod prelude {
    pub use super::{
        AlertRecord, AlertSink, ConditionType, ContainerStatus, ContainerTermination, EventRecord, EventType,
        JobCondition, JobEventHandler, JobSnapshot, JobSource, Labels, ObjectKey, ObjectStore, PodSnapshot,
        Selector, Settings, StoreError, StoreResult,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(kind: &str, status: bool) -> JobCondition {
        JobCondition { kind: kind.into(), status, reason: String::new(), message: String::new(), last_transition: None }
    }

    #[test]
    fn object_key_renders() {
        assert_eq!(ObjectKey::new("batch", "nightly").to_string(), "batch/nightly");
        assert_eq!(ObjectKey::new("", "solo").to_string(), "solo");
    }

    #[test]
    fn controller_id_falls_back_to_batch_prefix() {
        let mut job = JobSnapshot::default();
        job.selector.insert("batch.kubernetes.io/controller-uid".into(), "abc".into());
        assert_eq!(job.controller_entry("controller-uid"), Some(("batch.kubernetes.io/controller-uid", "abc")));
        assert_eq!(job.controller_id("controller-uid"), Some("abc"));
        assert_eq!(job.controller_id("batch.kubernetes.io/controller-uid"), Some("abc"));
        assert!(job.controller_id("example.com/controller-uid").is_none());

        job.selector.insert("controller-uid".into(), "legacy".into());
        assert_eq!(job.controller_entry("controller-uid"), Some(("controller-uid", "legacy")));
    }

    #[test]
    fn terminal_condition_skips_false_and_other() {
        let job = JobSnapshot {
            conditions: vec![cond("Failed", false), cond("Suspended", true), cond("Complete", true), cond("Failed", true)],
            ..Default::default()
        };
        assert_eq!(job.terminal_condition().map(|c| c.kind.clone()), Some(ConditionType::Complete));
        assert!(JobSnapshot::default().terminal_condition().is_none());
    }

    #[test]
    fn completions_default_to_one() {
        assert_eq!(JobSnapshot::default().required_completions(), 1);
        let job = JobSnapshot { completions: Some(3), ..Default::default() };
        assert_eq!(job.required_completions(), 3);
    }

    #[test]
    fn selector_renders_and_matches() {
        let s = Selector::new("controller-uid", "abc");
        assert_eq!(s.to_string(), "controller-uid=abc");
        let mut labels = Labels::new();
        assert!(!s.matches(&labels));
        labels.insert("controller-uid".into(), "abc".into());
        assert!(s.matches(&labels));
        assert_eq!(Selector::involved_object("p-1").to_string(), "involvedObject.name=p-1");
    }
}
