#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use jobmon_core::{AlertSink, JobEventHandler, RetrySettings, Settings};
use jobmon_kubehub::{run_job_watcher, KubeObjectStore};
use jobmon_reconcile::{JsonAlertSink, LogAlertSink, Pipeline};
use jobmon_store::{DispatchQueue, EnqueueHandler, JobCache};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "jobmon", version, about = "Alert on failed Kubernetes Jobs and reap finished ones")]
struct Cli {
    /// How long a completed job is kept before it is deleted (e.g. "30m", "2h")
    #[arg(long = "retention-period", env = "JOBMON_RETENTION_PERIOD", value_parser = humantime::parse_duration, default_value = "0s")]
    retention_period: Duration,

    /// Delete a job once its failed pod count exceeds this; negative disables
    #[arg(long = "failures", env = "JOBMON_MAX_FAILURES", default_value_t = -1, allow_hyphen_values = true)]
    max_failures: i32,

    /// Dispatcher workers
    #[arg(long = "workers", env = "JOBMON_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Pod label linking a pod to its owning job
    #[arg(long = "controller-label", env = "JOBMON_CONTROLLER_LABEL", default_value = "controller-uid")]
    controller_label: String,

    /// Watch a single namespace (default: all namespaces)
    #[arg(long = "ns", env = "JOBMON_NAMESPACE")]
    namespace: Option<String>,

    /// Give up if the job cache has not synced within this long
    #[arg(long = "sync-timeout", env = "JOBMON_SYNC_TIMEOUT", value_parser = humantime::parse_duration, default_value = "60s")]
    sync_timeout: Duration,

    /// Concurrent job deletions
    #[arg(long = "delete-concurrency", env = "JOBMON_DELETE_CONCURRENCY", default_value_t = 4)]
    delete_concurrency: usize,

    /// Capacity of the stage-to-stage channels
    #[arg(long = "channel-capacity", env = "JOBMON_CHANNEL_CAPACITY", default_value_t = 5)]
    channel_capacity: usize,

    /// Retries per job before it is dropped from the queue
    #[arg(long = "max-requeues", env = "JOBMON_MAX_REQUEUES", default_value_t = 5)]
    max_requeues: u32,

    /// Log filter (EnvFilter syntax)
    #[arg(long = "log", env = "JOBMON_LOG", default_value = "info")]
    log: String,

    #[arg(long = "log-format", env = "JOBMON_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Where failure alerts go
    #[arg(long = "alert-output", env = "JOBMON_ALERT_OUTPUT", value_enum, default_value_t = AlertOutput::Log)]
    alert_output: AlertOutput,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogFormat { Text, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum AlertOutput { Log, Json }

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            retention_period: self.retention_period,
            max_failures: self.max_failures,
            workers: self.workers,
            controller_label: self.controller_label.clone(),
            channel_capacity: self.channel_capacity,
            sync_timeout: self.sync_timeout,
            delete_concurrency: self.delete_concurrency,
            namespace: self.namespace.clone(),
            retry: RetrySettings { max_requeues: self.max_requeues, ..RetrySettings::default() },
        }
    }

    fn sink(&self) -> Arc<dyn AlertSink> {
        match self.alert_output {
            AlertOutput::Log => Arc::new(LogAlertSink),
            AlertOutput::Json => Arc::new(JsonAlertSink),
        }
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::from_str(level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match format {
        LogFormat::Text => fmt.init(),
        LogFormat::Json => fmt.json().init(),
    }
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("JOBMON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid JOBMON_METRICS_ADDR; expected host:port");
        }
    }
}

#[cfg(unix)]
async fn terminated() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM; Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminated() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log, cli.log_format);
    init_metrics();
    info!(version = env!("CARGO_PKG_VERSION"), commit = option_env!("GIT_COMMIT").unwrap_or("unknown"), "starting jobmon");

    let settings = cli.settings();
    let client = kube::Client::try_default().await.context("building kube client")?;
    let cache = Arc::new(JobCache::new());
    let queue = DispatchQueue::new(settings.retry);

    let watcher = tokio::spawn({
        let client = client.clone();
        let ns = settings.namespace.clone();
        let cache = cache.clone();
        let handler: Arc<dyn JobEventHandler> = Arc::new(EnqueueHandler::new(queue.clone()));
        async move {
            if let Err(e) = run_job_watcher(client, ns.as_deref(), cache, handler).await {
                error!(error = ?e, "job watcher failed");
            }
        }
    });

    let pipeline = Pipeline {
        settings,
        queue,
        source: cache,
        store: Arc::new(KubeObjectStore::new(client)),
        sink: cli.sink(),
    };
    let handle = match pipeline.start().await {
        Ok(h) => h,
        Err(e) => {
            watcher.abort();
            return Err(e.context("starting pipeline"));
        }
    };

    terminated().await;
    info!("shutdown signal received");
    watcher.abort();
    handle.shutdown().await;
    Ok(())
}
