//! Data structures for the process registry.
//!
//! This module defines the persisted form of a watched command execution
//! (`ProcessRecord`), its lifecycle status (`ProcessStatus`), and the
//! project-wide aggregate (`ProcessIndex`) stored in `index.json`.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a watched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
#[clap(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// The child has been spawned and has not been observed to exit.
    Running,
    /// The child exited with code 0.
    Completed,
    /// The child exited non-zero, failed to start, or was killed (-1).
    Failed,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One watched command execution, persisted as `processes/<id>/meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Unique token derived from a nanosecond timestamp. Also names the
    /// record's on-disk directory, so it never contains path separators.
    pub id: String,
    /// OS process id; 0 until the child has actually started.
    pub pid: u32,
    /// Display string for the command.
    pub command: String,
    /// The literal argv, in order.
    pub args: Vec<String>,
    /// Absolute path the command ran in.
    pub cwd: String,
    /// When the child was launched.
    pub started_at: DateTime<Utc>,
    /// When the child terminated; absent while running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: ProcessStatus,
    /// Exit code; absent while running, -1 when forcibly killed or the
    /// child could not be started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Project-relative path to the stdout log.
    pub stdout_path: String,
    /// Project-relative path to the stderr log.
    pub stderr_path: String,
}

impl ProcessRecord {
    pub fn is_running(&self) -> bool {
        self.status == ProcessStatus::Running
    }
}

/// The project-wide aggregate of all records, persisted as `index.json`.
///
/// Insertion-ordered; the store appends on first `put` and replaces in
/// place on subsequent ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessIndex {
    pub processes: Vec<ProcessRecord>,
}

impl ProcessIndex {
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Replaces the record with a matching id, or appends it.
    pub fn upsert(&mut self, record: ProcessRecord) {
        match self.processes.iter_mut().find(|p| p.id == record.id) {
            Some(slot) => *slot = record,
            None => self.processes.push(record),
        }
    }

    /// Drops the record with the given id, if present.
    pub fn remove(&mut self, id: &str) {
        self.processes.retain(|p| p.id != id);
    }
}

/// Generates a process id from the current wall clock, nanosecond
/// resolution. Monotonic enough to avoid collision for one writer.
pub fn generate_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    nanos.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> ProcessRecord {
        ProcessRecord {
            id: id.to_string(),
            pid: 42,
            command: "sleep 5".to_string(),
            args: vec!["sleep".to_string(), "5".to_string()],
            cwd: "/tmp".to_string(),
            started_at: Utc::now(),
            ended_at: None,
            status: ProcessStatus::Running,
            exit_code: None,
            stdout_path: format!(".devrack/processes/{}/stdout.log", id),
            stderr_path: format!(".devrack/processes/{}/stderr.log", id),
        }
    }

    #[test]
    fn running_record_omits_terminal_fields() {
        let json = serde_json::to_value(sample("p1")).unwrap();
        assert!(json.get("ended_at").is_none());
        assert!(json.get("exit_code").is_none());
        assert_eq!(json["status"], "running");
    }

    #[test]
    fn record_round_trips() {
        let mut record = sample("p2");
        record.status = ProcessStatus::Completed;
        record.exit_code = Some(0);
        record.ended_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(&record).unwrap();
        let back: ProcessRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn upsert_replaces_by_id() {
        let mut index = ProcessIndex::default();
        index.upsert(sample("a"));
        index.upsert(sample("b"));
        let mut updated = sample("a");
        updated.pid = 99;
        index.upsert(updated);
        assert_eq!(index.len(), 2);
        assert_eq!(index.processes[0].pid, 99);
        assert_eq!(index.processes[0].id, "a");
    }

    #[test]
    fn generated_ids_have_no_separators() {
        let id = generate_id();
        assert!(!id.contains('/'));
        assert!(!id.contains('\\'));
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }
}
