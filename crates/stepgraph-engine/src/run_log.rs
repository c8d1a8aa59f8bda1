use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use stepgraph_core::types::{RunId, RuntimeEvent};

/// JSONL runtime logger.
///
/// Consumes [`RuntimeEvent`]s from the event bus and writes one JSON object
/// per line. The file is append-only, so a crash mid-run leaves every earlier
/// line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Create a new RunLogger.
    ///
    /// Logs are written to `{log_dir}/{run_id}/{timestamp}.jsonl`.
    /// `level` controls verbosity: 1=run summary, 2=+joins, maps and errors,
    /// 3=+every step.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write entries until cancellation, or until `run_id` completes or fails.
    ///
    /// Take `rx` from `EventBus::subscribe` before starting the run so no
    /// early event is missed.
    pub async fn run(self, mut rx: broadcast::Receiver<RuntimeEvent>, run_id: RunId, cancel: CancellationToken) {
        let run_dir = self.log_dir.join(run_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let entry = match self.event_to_entry(&event) {
                                Some(e) => e,
                                None => continue,
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                // Flush after each entry for crash resilience
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            // Stop once the top-level run is done
                            let finished = matches!(
                                &event,
                                RuntimeEvent::RunComplete { run_id: id, .. } | RuntimeEvent::RunError { run_id: id, .. }
                                    if *id == run_id
                            );
                            if finished {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        // Final flush
        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert a RuntimeEvent to a log entry (returns None if filtered by level).
    fn event_to_entry(&self, event: &RuntimeEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, step: Option<&str>, detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().to_string(),
            event_type: event_type.to_string(),
            step: step.map(str::to_string),
            detail,
        };

        match event {
            // L1: Always logged (run summary)
            RuntimeEvent::RunStarted { process, trigger, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "process": process, "trigger": trigger })),
            )),
            RuntimeEvent::RunComplete {
                activations,
                elapsed_ms,
                ..
            } => Some(entry(
                "run_complete",
                None,
                Some(serde_json::json!({
                    "activations": activations,
                    "elapsed_ms": elapsed_ms,
                })),
            )),
            RuntimeEvent::RunError { error, .. } => {
                Some(entry("run_error", None, Some(serde_json::json!({ "error": error }))))
            }

            // L2: joins, maps and failures
            RuntimeEvent::JoinFired { step_id, group, .. } if self.level >= 2 => Some(entry(
                "join_fired",
                Some(step_id.as_str()),
                Some(serde_json::json!({ "group": group })),
            )),
            RuntimeEvent::MapCompleted { step_id, elements, .. } if self.level >= 2 => Some(entry(
                "map_completed",
                Some(step_id.as_str()),
                Some(serde_json::json!({ "elements": elements })),
            )),
            RuntimeEvent::StepFailed { record, .. } if self.level >= 2 => Some(entry(
                "step_failed",
                Some(record.step_id.as_str()),
                Some(serde_json::json!({
                    "function": record.function,
                    "kind": record.kind,
                    "message": truncate_str(&record.message, 500),
                })),
            )),
            RuntimeEvent::ErrorRouted {
                step_id,
                function,
                global,
                ..
            } if self.level >= 2 => Some(entry(
                "error_routed",
                Some(step_id.as_str()),
                Some(serde_json::json!({ "function": function, "global": global })),
            )),

            // L3: every step
            RuntimeEvent::StepActivated { step_id, entry: name, .. } if self.level >= 3 => Some(entry(
                "step_activated",
                Some(step_id.as_str()),
                Some(serde_json::json!({ "entry": name })),
            )),
            RuntimeEvent::StepCompleted {
                step_id,
                entry: name,
                emitted,
                elapsed_ms,
                ..
            } if self.level >= 3 => Some(entry(
                "step_completed",
                Some(step_id.as_str()),
                Some(serde_json::json!({
                    "entry": name,
                    "emitted": emitted,
                    "elapsed_ms": elapsed_ms,
                })),
            )),

            _ => None,
        }
    }
}

/// Truncate a string for logging.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
