//! Worker pool draining the dispatch queue into the classifier channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use jobmon_core::{JobSource, ObjectKey};
use jobmon_store::DispatchQueue;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{Dispatch, ReconcileError};

#[derive(Clone)]
pub struct Dispatcher {
    queue: DispatchQueue,
    source: Arc<dyn JobSource>,
    tx: mpsc::Sender<Dispatch>,
    workers: usize,
}

/// Running workers; `join` returns once every worker has seen the queue shut down.
pub struct DispatcherHandle {
    tasks: JoinSet<()>,
}

impl DispatcherHandle {
    pub async fn join(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "dispatch worker panicked");
            }
        }
        info!("stopping job dispatcher");
    }
}

impl Dispatcher {
    pub fn new(queue: DispatchQueue, source: Arc<dyn JobSource>, tx: mpsc::Sender<Dispatch>, workers: usize) -> Self {
        Self { queue, source, tx, workers: workers.max(1) }
    }

    /// Wait for the job cache, then spawn the workers. Not syncing in time is fatal:
    /// working from a partial view could reap or alert on the wrong set of jobs.
    pub async fn start(self, sync_timeout: Duration) -> Result<DispatcherHandle> {
        info!("starting job dispatcher");
        if !self.source.wait_for_sync(sync_timeout).await {
            bail!("timed out waiting for job cache to sync after {:?}", sync_timeout);
        }
        let mut tasks = JoinSet::new();
        for id in 0..self.workers {
            let worker = self.clone();
            tasks.spawn(async move {
                while worker.process_next_item().await {}
                debug!(worker = id, "dispatch worker exiting");
            });
        }
        Ok(DispatcherHandle { tasks })
    }

    /// Handle one key. Returns false when the worker should stop.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let keep_going = self.dispatch(&key).await;
        self.queue.done(&key);
        keep_going
    }

    async fn dispatch(&self, key: &ObjectKey) -> bool {
        match self.source.get_by_key(key) {
            Err(e) => {
                warn!(job = %key, error = %e, "fetching job from cache failed");
                self.queue.handle_result(key, Err(ReconcileError::from(e)));
                true
            }
            Ok(None) => {
                debug!(job = %key, "job does not exist anymore");
                self.queue.forget(key);
                true
            }
            Ok(Some(job)) => {
                // Blocks while the classifier is busy; this is where backpressure lands.
                if self.tx.send(Dispatch { key: key.clone(), job }).await.is_err() {
                    warn!(job = %key, "classifier channel closed; worker stopping");
                    return false;
                }
                true
            }
        }
    }
}
