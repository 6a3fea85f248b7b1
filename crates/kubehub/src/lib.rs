//! jobmon kubehub: job watcher wiring and the kube-backed object store

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use jobmon_core::{
    ContainerStatus, ContainerTermination, EventRecord, JobCondition, JobEventHandler, JobSnapshot, ObjectStore,
    PodSnapshot, Selector, StoreError, StoreResult,
};
use jobmon_store::JobCache;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event as K8sEvent, Pod};
use kube::{
    api::{Api, DeleteParams, ListParams},
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Client,
};
use metrics::counter;
use tracing::{debug, info, warn};

/// Decide once, at the boundary, what a kube error means to the pipeline.
pub fn classify(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message),
        kube::Error::Api(ae) if ae.code == 408 || ae.code == 429 || ae.code >= 500 => {
            StoreError::Transient(format!("{} ({})", ae.message, ae.code))
        }
        kube::Error::Api(ae) => StoreError::Fatal(format!("{} ({})", ae.message, ae.code)),
        kube::Error::SerdeError(e) => StoreError::Fatal(e.to_string()),
        other => StoreError::Transient(other.to_string()),
    }
}

pub fn job_snapshot(job: &Job) -> JobSnapshot {
    let meta = &job.metadata;
    let spec = job.spec.as_ref();
    let status = job.status.as_ref();
    JobSnapshot {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        owner_refs: meta.owner_references.as_ref().map(Vec::len).unwrap_or(0),
        completions: spec.and_then(|s| s.completions),
        succeeded: status.and_then(|s| s.succeeded).unwrap_or(0),
        failed: status.and_then(|s| s.failed).unwrap_or(0),
        start_time: status.and_then(|s| s.start_time.as_ref()).map(|t| t.0),
        completion_time: status.and_then(|s| s.completion_time.as_ref()).map(|t| t.0),
        conditions: status
            .and_then(|s| s.conditions.as_ref())
            .map(|cs| {
                cs.iter()
                    .map(|c| JobCondition {
                        kind: c.type_.as_str().into(),
                        status: c.status == "True",
                        reason: c.reason.clone().unwrap_or_default(),
                        message: c.message.clone().unwrap_or_default(),
                        last_transition: c.last_transition_time.as_ref().map(|t| t.0),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        selector: spec
            .and_then(|s| s.selector.as_ref())
            .and_then(|s| s.match_labels.clone())
            .unwrap_or_default(),
    }
}

pub fn pod_snapshot(pod: &Pod) -> PodSnapshot {
    let meta = &pod.metadata;
    let status = pod.status.as_ref();
    PodSnapshot {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
        reason: status.and_then(|s| s.reason.clone()),
        message: status.and_then(|s| s.message.clone()),
        created: meta.creation_timestamp.as_ref().map(|t| t.0),
        labels: meta.labels.clone().unwrap_or_default(),
        containers: status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|cs| {
                cs.iter()
                    .map(|c| ContainerStatus {
                        name: c.name.clone(),
                        terminated: c.state.as_ref().and_then(|st| st.terminated.as_ref()).map(|t| ContainerTermination {
                            exit_code: t.exit_code,
                            reason: t.reason.clone(),
                            message: t.message.clone(),
                            signal: t.signal,
                            started_at: t.started_at.as_ref().map(|x| x.0),
                            finished_at: t.finished_at.as_ref().map(|x| x.0),
                        }),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

pub fn event_record(ev: &K8sEvent) -> EventRecord {
    EventRecord {
        involved_name: ev.involved_object.name.clone().unwrap_or_default(),
        kind: ev.type_.as_deref().unwrap_or("").into(),
        reason: ev.reason.clone().unwrap_or_default(),
        message: ev.message.clone().unwrap_or_default(),
    }
}

/// Object store backed by the API server.
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl ObjectStore for KubeObjectStore {
    async fn list_pods(&self, namespace: &str, labels: &Selector) -> StoreResult<Vec<PodSnapshot>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&labels.to_string());
        let list = api.list(&lp).await.map_err(classify)?;
        Ok(list.items.iter().map(pod_snapshot).collect())
    }

    async fn list_events(&self, namespace: &str, fields: &Selector) -> StoreResult<Vec<EventRecord>> {
        let api: Api<K8sEvent> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().fields(&fields.to_string());
        let list = api.list(&lp).await.map_err(classify)?;
        Ok(list.items.iter().map(event_record).collect())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::background()).await.map_err(classify)?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await.map_err(classify)?;
        Ok(())
    }
}

/// List+watch jobs into `cache`, notifying `handler` of every change. Runs until the
/// stream ends; watch errors are retried with backoff by the watcher itself.
pub async fn run_job_watcher(
    client: Client,
    namespace: Option<&str>,
    cache: Arc<JobCache>,
    handler: Arc<dyn JobEventHandler>,
) -> Result<()> {
    let api: Api<Job> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "job watcher started");
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(Event::Applied(job)) => cache.apply(job_snapshot(&job), handler.as_ref()),
            Ok(Event::Deleted(job)) => cache.delete(job_snapshot(&job), handler.as_ref()),
            Ok(Event::Restarted(list)) => {
                debug!(count = list.len(), "watch restart");
                cache.replace(list.iter().map(job_snapshot).collect(), handler.as_ref());
            }
            Err(e) => {
                counter!("jobmon_watch_errors_total", 1u64);
                warn!(error = %e, "job watch error");
            }
        }
    }
    warn!("job watcher stream ended");
    Ok(())
}
