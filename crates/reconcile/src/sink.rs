//! Alert sinks shipped with the binary.

use std::io::Write;

use anyhow::Context;
use jobmon_core::{AlertRecord, AlertSink};
use tracing::error;

/// Emits each alert as one structured ERROR event under the `jobmon::alert` target, so a
/// subscriber layer (or log shipper) can route it. The message is rendered up front;
/// everything else travels as fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait::async_trait]
impl AlertSink for LogAlertSink {
    async fn emit(&self, a: &AlertRecord) -> anyhow::Result<()> {
        error!(
            target: "jobmon::alert",
            job = %a.job,
            pod = %a.pod,
            namespace = %a.namespace,
            condition_reason = %a.reason,
            condition_message = %a.message,
            config = ?a.annotations,
            events = %a.events,
            run = ?a.run,
            pod_phase = ?a.pod_phase,
            pod_status = ?a.pod_status,
            failed_pods = a.failed_pods,
            exit_code = ?a.exit_code,
            exit_reason = ?a.exit_reason,
            exit_message = ?a.exit_message,
            exit_signal = ?a.exit_signal,
            "{}",
            a.summary
        );
        Ok(())
    }
}

/// Writes one JSON document per alert to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonAlertSink;

#[async_trait::async_trait]
impl AlertSink for JsonAlertSink {
    async fn emit(&self, a: &AlertRecord) -> anyhow::Result<()> {
        let line = serde_json::to_string(a).context("serializing alert")?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", line).context("writing alert")?;
        out.flush().context("flushing alert")?;
        Ok(())
    }
}
