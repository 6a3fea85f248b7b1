//! Routes finished jobs: completed ones to the reaper, failed ones to the alert composer.

use std::sync::Arc;

use jobmon_core::{ConditionType, JobSnapshot};
use jobmon_store::DispatchQueue;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{AlertComposer, Dispatch, ReconcileError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Unfinished,
    Completed,
    Failed,
}

impl Classification {
    fn as_str(self) -> &'static str {
        match self {
            Classification::Unfinished => "unfinished",
            Classification::Completed => "completed",
            Classification::Failed => "failed",
        }
    }
}

pub struct Classifier {
    queue: DispatchQueue,
    reap_tx: mpsc::Sender<Arc<JobSnapshot>>,
    alerts: AlertComposer,
}

impl Classifier {
    pub fn new(queue: DispatchQueue, reap_tx: mpsc::Sender<Arc<JobSnapshot>>, alerts: AlertComposer) -> Self {
        Self { queue, reap_tx, alerts }
    }

    /// Consume dispatched jobs until every dispatcher worker has hung up. Each outcome
    /// feeds the queue's retry policy. Dropping `self` on return closes the reaper input.
    pub async fn run(self, mut rx: mpsc::Receiver<Dispatch>) {
        info!("starting job classifier");
        while let Some(d) = rx.recv().await {
            let result = self.process(&d).await;
            if let Ok(c) = &result {
                counter!("jobmon_jobs_classified_total", 1u64, "outcome" => c.as_str());
            }
            if let Err(e) = &result {
                warn!(job = %d.key, error = %e, "processing job failed");
            }
            self.queue.handle_result(&d.key, result.map(|_| ()));
        }
        info!("stopping job classifier");
    }

    pub async fn process(&self, d: &Dispatch) -> Result<Classification, ReconcileError> {
        let Some(cond) = d.job.terminal_condition() else {
            debug!(job = %d.key, "job not finished");
            return Ok(Classification::Unfinished);
        };
        match cond.kind {
            ConditionType::Complete => {
                self.reap_tx.send(Arc::clone(&d.job)).await.map_err(|_| ReconcileError::ChannelClosed)?;
                Ok(Classification::Completed)
            }
            ConditionType::Failed => {
                self.alerts.alert(&d.job, cond).await?;
                Ok(Classification::Failed)
            }
            ConditionType::Other(_) => Ok(Classification::Unfinished),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{condition, job, InMemoryStore, RecordingSink};
    use jobmon_core::RetrySettings;

    fn classifier(store: Arc<InMemoryStore>, sink: Arc<RecordingSink>) -> (Classifier, mpsc::Receiver<Arc<JobSnapshot>>) {
        let (tx, rx) = mpsc::channel(5);
        let composer = AlertComposer::new(store, sink, "controller-uid".into());
        (Classifier::new(DispatchQueue::new(RetrySettings::default()), tx, composer), rx)
    }

    fn dispatch(j: JobSnapshot) -> Dispatch {
        Dispatch { key: j.key(), job: Arc::new(j) }
    }

    #[tokio::test]
    async fn unfinished_job_has_no_effects() {
        let store = Arc::new(InMemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let (c, mut reap_rx) = classifier(store.clone(), sink.clone());
        let mut j = job("batch", "running");
        j.conditions.push(condition("Failed", false, "", ""));
        j.conditions.push(condition("Suspended", true, "", ""));
        assert_eq!(c.process(&dispatch(j)).await.expect("ok"), Classification::Unfinished);
        assert!(reap_rx.try_recv().is_err());
        assert!(sink.alerts().is_empty());
        assert_eq!(store.pod_queries(), 0);
    }

    #[tokio::test]
    async fn complete_goes_to_reaper() {
        let store = Arc::new(InMemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let (c, mut reap_rx) = classifier(store, sink.clone());
        let mut j = job("batch", "done");
        j.conditions.push(condition("Complete", true, "", ""));
        assert_eq!(c.process(&dispatch(j)).await.expect("ok"), Classification::Completed);
        assert_eq!(reap_rx.try_recv().expect("forwarded").name, "done");
        assert!(sink.alerts().is_empty());
    }

    #[tokio::test]
    async fn first_true_terminal_condition_wins() {
        let store = Arc::new(InMemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let (c, mut reap_rx) = classifier(store, sink.clone());
        let mut j = job("batch", "flip");
        j.conditions.push(condition("Failed", true, "BackoffLimitExceeded", "gave up"));
        j.conditions.push(condition("Complete", true, "", ""));
        assert_eq!(c.process(&dispatch(j)).await.expect("ok"), Classification::Failed);
        assert!(reap_rx.try_recv().is_err());
        assert_eq!(sink.alerts().len(), 1);
    }

    #[tokio::test]
    async fn closed_reaper_is_reported() {
        let store = Arc::new(InMemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let (c, reap_rx) = classifier(store, sink);
        drop(reap_rx);
        let mut j = job("batch", "done");
        j.conditions.push(condition("Complete", true, "", ""));
        assert!(matches!(c.process(&dispatch(j)).await, Err(ReconcileError::ChannelClosed)));
    }
}
