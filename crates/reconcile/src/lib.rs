//! jobmon reconciliation pipeline.
//!
//! Event source → dispatch queue → dispatcher workers → classifier → {alert composer |
//! reaper}. Collaborators (job source, object store, alert sink) are injected; nothing
//! here reaches for a global client.

#![forbid(unsafe_code)]

use std::sync::Arc;

use jobmon_core::{AlertSink, JobSnapshot, JobSource, ObjectKey, ObjectStore, Settings, StoreError};
use jobmon_store::{DispatchQueue, Retryable};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod alert;
pub mod classifier;
pub mod dispatcher;
pub mod pods;
pub mod reap;
pub mod sink;
pub mod testing;

pub use alert::AlertComposer;
pub use classifier::{Classification, Classifier};
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use reap::{decide, should_reap, ReapDecision, ReapExecutor, ReapPolicy, ReapReport, Reaper};
pub use sink::{JsonAlertSink, LogAlertSink};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("downstream channel closed")]
    ChannelClosed,
}

impl Retryable for ReconcileError {
    fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Store(e) => e.is_retryable(),
            ReconcileError::Configuration(_) | ReconcileError::ChannelClosed => false,
        }
    }
}

/// A live job handed from a dispatcher worker to the classifier.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub key: ObjectKey,
    pub job: Arc<JobSnapshot>,
}

/// Everything the pipeline needs, injected by the caller.
pub struct Pipeline {
    pub settings: Settings,
    pub queue: DispatchQueue,
    pub source: Arc<dyn JobSource>,
    pub store: Arc<dyn ObjectStore>,
    pub sink: Arc<dyn AlertSink>,
}

/// Running pipeline. `shutdown` stops in dependency order: queue, workers, classifier,
/// reaper (which waits for in-flight deletions).
pub struct PipelineHandle {
    queue: DispatchQueue,
    workers: DispatcherHandle,
    classifier: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl Pipeline {
    /// Spawn the reaper and classifier, wait for the cache to sync, then start workers.
    pub async fn start(self) -> anyhow::Result<PipelineHandle> {
        let s = self.settings;
        let cap = s.channel_capacity.max(1);
        let (job_tx, job_rx) = mpsc::channel::<Dispatch>(cap);
        let (reap_tx, reap_rx) = mpsc::channel::<Arc<JobSnapshot>>(cap);

        let executor = ReapExecutor::new(self.store.clone(), s.controller_label.clone());
        let policy = ReapPolicy::new(s.max_failures, s.retention_period);
        let reaper = Reaper::new(policy, executor, s.delete_concurrency, self.queue.clone());
        let reaper = tokio::spawn(reaper.run(reap_rx));

        let composer = AlertComposer::new(self.store.clone(), self.sink.clone(), s.controller_label.clone());
        let classifier = Classifier::new(self.queue.clone(), reap_tx, composer);
        let classifier = tokio::spawn(classifier.run(job_rx));

        let dispatcher = Dispatcher::new(self.queue.clone(), self.source.clone(), job_tx, s.workers);
        let workers = dispatcher.start(s.sync_timeout).await?;
        info!(workers = s.workers, max_failures = s.max_failures, retention = ?s.retention_period, "pipeline started");
        Ok(PipelineHandle { queue: self.queue, workers, classifier, reaper })
    }
}

impl PipelineHandle {
    pub async fn shutdown(self) {
        self.queue.shut_down();
        self.workers.join().await;
        if let Err(e) = self.classifier.await {
            warn!(error = %e, "classifier task failed");
        }
        if let Err(e) = self.reaper.await {
            warn!(error = %e, "reaper task failed");
        }
        info!("pipeline stopped");
    }
}
