//! Failure context for failed jobs.

use std::sync::Arc;

use jobmon_core::{AlertRecord, AlertSink, JobCondition, JobSnapshot, ObjectStore};
use metrics::counter;
use tracing::{debug, error};

use crate::pods::{failed_pods, job_pods, oldest_pod, pod_status, termination_state, warning_events};
use crate::ReconcileError;

/// Rebuilds what happened to a failed job from its pods and their events.
pub struct AlertComposer {
    store: Arc<dyn ObjectStore>,
    sink: Arc<dyn AlertSink>,
    label: String,
}

impl AlertComposer {
    pub fn new(store: Arc<dyn ObjectStore>, sink: Arc<dyn AlertSink>, label: String) -> Self {
        Self { store, sink, label }
    }

    /// Build the incident record. Zero pods is a sparse but valid alert; a failed
    /// lookup is an error so no half-built alert ever goes out.
    pub async fn compose(&self, job: &JobSnapshot, condition: &JobCondition) -> Result<AlertRecord, ReconcileError> {
        let pods = job_pods(self.store.as_ref(), job, &self.label).await?;
        let mut alert = AlertRecord {
            job: job.name.clone(),
            namespace: job.namespace.clone(),
            reason: condition.reason.clone(),
            message: condition.message.clone(),
            summary: format!("{} failed - {}", job.name, condition.message),
            annotations: job.annotations.clone(),
            run: job.labels.get("run").cloned(),
            failed_pods: failed_pods(&pods),
            ..Default::default()
        };

        let Some(pod) = oldest_pod(&pods) else {
            debug!(job = %job.key(), "no pods left for failed job");
            return Ok(alert);
        };
        alert.pod = pod.name.clone();
        alert.pod_phase = (!pod.phase.is_empty()).then(|| pod.phase.clone());
        alert.pod_status = pod_status(pod);
        alert.events = warning_events(self.store.as_ref(), pod).await?;
        if let Some(t) = termination_state(pod) {
            alert.exit_code = Some(t.exit_code);
            alert.exit_reason = t.reason.clone();
            alert.exit_message = t.message.clone();
            alert.exit_signal = t.signal;
        }
        Ok(alert)
    }

    /// Compose and hand the record to the sink.
    pub async fn alert(&self, job: &JobSnapshot, condition: &JobCondition) -> Result<(), ReconcileError> {
        let record = self.compose(job, condition).await?;
        match self.sink.emit(&record).await {
            Ok(()) => counter!("jobmon_alerts_emitted_total", 1u64),
            Err(e) => {
                counter!("jobmon_alerts_failed_total", 1u64);
                error!(job = %job.key(), error = %e, "alert sink rejected record");
            }
        }
        Ok(())
    }
}
