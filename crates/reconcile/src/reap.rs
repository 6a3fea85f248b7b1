//! Reap policy and best-effort deletion of finished jobs and their pods.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::FutureExt;
use jobmon_core::{JobSnapshot, ObjectStore, StoreResult};
use jobmon_store::DispatchQueue;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::pods::job_pods;
use crate::ReconcileError;

/// Outcome of the reap policy for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapDecision {
    Reap,
    Keep,
    /// Finished but still inside the retention period; eligible after the given delay.
    RecheckIn(Duration),
}

/// Evaluate the reap policy. The order of the checks matters: owned jobs are never
/// touched, and an exceeded failure threshold wins over completion and retention.
pub fn decide(job: &JobSnapshot, max_failures: i32, retention: Duration, now: DateTime<Utc>) -> ReapDecision {
    if job.owner_refs > 0 {
        return ReapDecision::Keep;
    }
    if max_failures >= 0 && job.failed > max_failures {
        return ReapDecision::Reap;
    }
    if job.succeeded < job.required_completions() {
        return ReapDecision::Keep;
    }
    if let Some(done) = job.completion_time {
        // a completion time in the future (clock skew) only pushes the deadline out
        let Some(due) = ChronoDuration::from_std(retention).ok().and_then(|r| done.checked_add_signed(r)) else {
            return ReapDecision::Keep;
        };
        if now < due {
            return match (due - now).to_std() {
                Ok(wait) => ReapDecision::RecheckIn(wait),
                Err(_) => ReapDecision::Keep,
            };
        }
    }
    ReapDecision::Reap
}

/// Whether a job should be deleted now.
pub fn should_reap(job: &JobSnapshot, max_failures: i32, retention: Duration, now: DateTime<Utc>) -> bool {
    decide(job, max_failures, retention, now) == ReapDecision::Reap
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    pub max_failures: i32,
    pub retention: Duration,
}

impl ReapPolicy {
    pub fn new(max_failures: i32, retention: Duration) -> Self {
        Self { max_failures, retention }
    }

    pub fn evaluate(&self, job: &JobSnapshot) -> ReapDecision {
        decide(job, self.max_failures, self.retention, Utc::now())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub job_deleted: bool,
    pub pods_attempted: usize,
    pub pods_failed: usize,
}

/// Deletes a job and the pods carrying its controller label.
pub struct ReapExecutor {
    store: Arc<dyn ObjectStore>,
    label: String,
}

/// Treat "already gone" as done.
fn tolerate_missing(res: StoreResult<()>) -> StoreResult<()> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

impl ReapExecutor {
    pub fn new(store: Arc<dyn ObjectStore>, label: String) -> Self {
        Self { store, label }
    }

    /// Best effort: a failing pod delete is logged and counted, never fatal. Only a job
    /// without its controller label is refused, since its pods could not be found.
    pub async fn reap(&self, job: &JobSnapshot) -> Result<ReapReport, ReconcileError> {
        let key = job.key();
        let pods = match job_pods(self.store.as_ref(), job, &self.label).await {
            Ok(pods) => Some(pods),
            Err(ReconcileError::Store(e)) => {
                warn!(job = %key, error = %e, "listing job pods failed; deleting job only");
                None
            }
            Err(e) => return Err(e),
        };

        let mut report = ReapReport::default();
        match tolerate_missing(self.store.delete_job(&job.namespace, &job.name).await) {
            Ok(()) => report.job_deleted = true,
            Err(e) => {
                counter!("jobmon_delete_errors_total", 1u64, "kind" => "job");
                error!(job = %key, error = %e, "deleting job failed");
            }
        }

        debug!(job = %key, "deleting pods");
        for pod in pods.iter().flatten() {
            report.pods_attempted += 1;
            if let Err(e) = tolerate_missing(self.store.delete_pod(&pod.namespace, &pod.name).await) {
                report.pods_failed += 1;
                counter!("jobmon_delete_errors_total", 1u64, "kind" => "pod");
                error!(job = %key, pod = %pod.name, error = %e, "deleting pod failed");
            }
        }
        info!(job = %key, count = report.pods_attempted, errors = report.pods_failed, "deleted pods");
        Ok(report)
    }
}

/// Single loop over completed jobs. Deletions run on a bounded pool so the loop keeps
/// consuming; on end of input it waits for every in-flight deletion. Jobs still inside
/// their retention period are put back on the dispatch queue for when they become due.
pub struct Reaper {
    policy: ReapPolicy,
    executor: Arc<ReapExecutor>,
    permits: Arc<Semaphore>,
    queue: DispatchQueue,
}

impl Reaper {
    pub fn new(policy: ReapPolicy, executor: ReapExecutor, concurrency: usize, queue: DispatchQueue) -> Self {
        Self { policy, executor: Arc::new(executor), permits: Arc::new(Semaphore::new(concurrency.max(1))), queue }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<Arc<JobSnapshot>>) {
        info!("starting job reaper");
        let mut tasks: JoinSet<()> = JoinSet::new();
        while let Some(job) = rx.recv().await {
            while let Some(Some(res)) = tasks.join_next().now_or_never() {
                log_join(res);
            }
            match self.policy.evaluate(&job) {
                ReapDecision::Reap => {}
                ReapDecision::Keep => {
                    debug!(job = %job.key(), "job not eligible for reaping");
                    continue;
                }
                ReapDecision::RecheckIn(wait) => {
                    debug!(job = %job.key(), wait = ?wait, "job inside retention period; rechecking later");
                    self.queue.add_after(job.key(), wait);
                    continue;
                }
            }
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            let executor = Arc::clone(&self.executor);
            tasks.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                match executor.reap(&job).await {
                    Ok(report) => {
                        counter!("jobmon_jobs_reaped_total", 1u64);
                        info!(
                            name = %job.name,
                            namespace = %job.namespace,
                            config = ?job.annotations,
                            pods = report.pods_attempted,
                            "job reaped"
                        );
                    }
                    Err(e) => error!(job = %job.key(), error = %e, "refusing to reap job"),
                }
                histogram!("jobmon_reap_ms", started.elapsed().as_secs_f64() * 1000.0);
            });
        }
        debug!(in_flight = tasks.len(), "waiting for deletions");
        while let Some(res) = tasks.join_next().await {
            log_join(res);
        }
        info!("stopping job reaper");
    }
}

fn log_join(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        warn!(error = %e, "reap task panicked");
    }
}
