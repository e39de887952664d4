//! Report sink — one structured record per worker lifecycle event.
//!
//! Records go out on a broadcast channel (observers may lag or be absent;
//! sends never fail the controller) and are mirrored to the tracing log.

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// A single report record.
///
/// Exactly one terminal record (`Success`, `Failure`, or `Superseded`) is
/// emitted per worker instance, ever.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum Report {
    /// A validation worker was launched for `file`.
    #[serde(rename = "task.started")]
    Started { file: String, ts: String },
    /// A running worker was cancelled because a newer change to its file
    /// arrived. Deliberately distinct from `Failure` — observers must not
    /// conflate cancellation with a real validation failure.
    #[serde(rename = "task.superseded")]
    Superseded { file: String, ts: String },
    #[serde(rename = "task.success")]
    Success {
        file: String,
        exit_code: i32,
        output: String,
        ts: String,
    },
    /// Validation exited non-zero, or could not be launched (exit code -1).
    #[serde(rename = "task.failure")]
    Failure {
        file: String,
        exit_code: i32,
        output: String,
        ts: String,
    },
    /// The watcher observed a new revision on the tracked branch.
    #[serde(rename = "watch.changes")]
    Changes {
        branch: String,
        old: String,
        new: String,
        files: Vec<String>,
        ts: String,
    },
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Broadcasts report records to all subscribers.
#[derive(Clone, Debug)]
pub struct Reporter {
    tx: broadcast::Sender<Report>,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Subscribe to all report records.
    pub fn subscribe(&self) -> broadcast::Receiver<Report> {
        self.tx.subscribe()
    }

    pub fn started(&self, file: &str) {
        info!(file = %file, "validation started");
        self.emit(Report::Started {
            file: file.to_string(),
            ts: now(),
        });
    }

    pub fn superseded(&self, file: &str) {
        info!(file = %file, "validation superseded by a newer change");
        self.emit(Report::Superseded {
            file: file.to_string(),
            ts: now(),
        });
    }

    pub fn success(&self, file: &str, output: &str) {
        info!(file = %file, "validation succeeded");
        self.emit(Report::Success {
            file: file.to_string(),
            exit_code: 0,
            output: output.to_string(),
            ts: now(),
        });
    }

    pub fn failure(&self, file: &str, exit_code: i32, output: &str) {
        error!(file = %file, exit_code, "validation failed");
        self.emit(Report::Failure {
            file: file.to_string(),
            exit_code,
            output: output.to_string(),
            ts: now(),
        });
    }

    pub fn changes(&self, branch: &str, old: &str, new: &str, files: &[String]) {
        info!(branch = %branch, old = %old, new = %new, count = files.len(), "new revision detected");
        self.emit(Report::Changes {
            branch: branch.to_string(),
            old: old.to_string(),
            new: new.to_string(),
            files: files.to_vec(),
            ts: now(),
        });
    }

    fn emit(&self, report: Report) {
        if let Ok(json) = serde_json::to_string(&report) {
            debug!(record = %json, "report emitted");
        }
        // Ignore errors — no subscribers is fine
        let _ = self.tx.send(report);
    }
}
