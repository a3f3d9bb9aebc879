//! Query and mutation operations over the process registry.
//!
//! This is the shared surface behind both the `ps` CLI and the MCP tools.
//! Each operation takes a typed argument struct (deserialized once from
//! the loosely-typed wire bag at the boundary) and returns a serializable
//! result or a [`RegistryError`]. Every read path reconciles recorded
//! `running` status against actual process liveness before the record
//! leaves this module.

use std::fs;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RegistryError, Result};
use crate::liveness::{reconcile, send_signal, KillSignal, LivenessProbe, OsProbe};
use crate::record::{ProcessRecord, ProcessStatus};
use crate::store::RecordStore;

/// Default log tail length when the caller does not say.
pub const DEFAULT_TAIL_LINES: i64 = 100;

/// Which log stream(s) to return from the logs operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
#[clap(rename_all = "lowercase")]
pub enum StreamSelect {
    #[default]
    Both,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListArgs {
    /// Exact-match status filter.
    pub status: Option<ProcessStatus>,
    /// Truncate to this many records when positive.
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShowArgs {
    pub process_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogsArgs {
    pub process_id: String,
    #[serde(default)]
    pub stream: StreamSelect,
    pub lines: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KillArgs {
    pub process_id: String,
    pub signal: Option<KillSignal>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CleanArgs {
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub failed: bool,
    /// RFC 3339 timestamp; records started strictly before it are removed.
    pub before: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub processes: Vec<ProcessRecord>,
    /// Unreconciled index size, before filtering.
    pub total: usize,
    /// Count after the status filter and limit.
    pub filtered: usize,
}

#[derive(Debug, Serialize)]
pub struct LogSizes {
    pub stdout: u64,
    pub stderr: u64,
}

#[derive(Debug, Serialize)]
pub struct ShowResponse {
    #[serde(flatten)]
    pub record: ProcessRecord,
    pub log_size: LogSizes,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub process_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct KillResponse {
    pub process_id: String,
    pub signal: KillSignal,
    pub killed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CleanResponse {
    /// Number of deletions attempted, not confirmed-successful ones;
    /// inspect `errors` for the failures.
    pub cleaned: usize,
    pub errors: Vec<String>,
}

/// The registry API: a stateless router over the record store. No record
/// is cached across calls, so a concurrent runner's writes are always
/// picked up on the next operation.
pub struct Registry {
    store: RecordStore,
    probe: Box<dyn LivenessProbe + Send + Sync>,
    default_tail: i64,
    strip_ansi: bool,
}

impl Registry {
    pub fn new(store: RecordStore) -> Self {
        Self::with_probe(store, Box::new(OsProbe))
    }

    pub fn with_probe(store: RecordStore, probe: Box<dyn LivenessProbe + Send + Sync>) -> Self {
        Self {
            store,
            probe,
            default_tail: DEFAULT_TAIL_LINES,
            strip_ansi: true,
        }
    }

    /// Applies project-config defaults for log tailing.
    pub fn set_log_defaults(&mut self, tail_lines: Option<i64>, strip_ansi: Option<bool>) {
        if let Some(lines) = tail_lines {
            self.default_tail = lines;
        }
        if let Some(strip) = strip_ansi {
            self.strip_ansi = strip;
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Lists records, newest first, after reconciling stale `running`
    /// entries in memory.
    pub fn list(&self, args: ListArgs) -> Result<ListResponse> {
        let mut processes = self.store.list()?;
        let total = processes.len();
        for record in &mut processes {
            reconcile(record, self.probe.as_ref());
        }
        if let Some(status) = args.status {
            processes.retain(|record| record.status == status);
        }
        processes.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = args.limit {
            if limit > 0 && processes.len() > limit as usize {
                processes.truncate(limit as usize);
            }
        }
        debug!(total, filtered = processes.len(), "listed processes");
        Ok(ListResponse {
            filtered: processes.len(),
            total,
            processes,
        })
    }

    /// Fetches one record with live log-size annotations.
    pub fn show(&self, args: ShowArgs) -> Result<ShowResponse> {
        let mut record = self.store.get(&args.process_id)?;
        reconcile(&mut record, self.probe.as_ref());
        let log_size = LogSizes {
            stdout: file_size(&self.store.stdout_path(&record.id)),
            stderr: file_size(&self.store.stderr_path(&record.id)),
        };
        Ok(ShowResponse { record, log_size })
    }

    /// Returns the requested log tail(s). A missing or empty log file
    /// yields an empty sequence, never an error.
    pub fn logs(&self, args: LogsArgs) -> Result<LogsResponse> {
        // Unknown ids fail here; absent log files do not.
        let record = self.store.get(&args.process_id)?;
        let lines = args.lines.unwrap_or(self.default_tail);

        let mut response = LogsResponse {
            process_id: record.id.clone(),
            stdout: None,
            stderr: None,
        };
        if matches!(args.stream, StreamSelect::Both | StreamSelect::Stdout) {
            let tail = RecordStore::read_tail(&self.store.stdout_path(&record.id), lines)?;
            response.stdout = Some(self.sanitize(tail));
        }
        if matches!(args.stream, StreamSelect::Both | StreamSelect::Stderr) {
            let tail = RecordStore::read_tail(&self.store.stderr_path(&record.id), lines)?;
            response.stderr = Some(self.sanitize(tail));
        }
        Ok(response)
    }

    /// Sends a termination signal to a running process and persists the
    /// record as failed. Fire-and-forget: the process may still be
    /// shutting down when this returns.
    pub fn kill(&self, args: KillArgs) -> Result<KillResponse> {
        let signal = args.signal.unwrap_or(KillSignal::Sigterm);
        let mut record = self.store.get(&args.process_id)?;
        if !record.is_running() {
            return Err(RegistryError::InvalidState(format!(
                "process is not running (status: {})",
                record.status
            )));
        }
        if !self.probe.is_alive(record.pid) {
            return Err(RegistryError::InvalidState(
                "process is no longer running".to_string(),
            ));
        }

        send_signal(record.pid, signal)?;
        info!(id = %record.id, pid = record.pid, %signal, "sent termination signal");

        let killed_at = Utc::now();
        record.status = ProcessStatus::Failed;
        record.exit_code = Some(-1);
        record.ended_at = Some(killed_at);
        self.store.put(&record)?;

        Ok(KillResponse {
            process_id: record.id,
            signal,
            killed_at,
        })
    }

    /// Removes records matching the selectors, collecting per-id errors
    /// without aborting the batch. With no selector set, nothing matches.
    pub fn clean(&self, args: CleanArgs) -> Result<CleanResponse> {
        let before = match &args.before {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map(|ts| ts.with_timezone(&Utc))
                    .map_err(|err| {
                        RegistryError::InvalidArgument(format!(
                            "invalid date format (use RFC 3339): {}",
                            err
                        ))
                    })?,
            ),
            None => None,
        };

        let selected: Vec<String> = self
            .store
            .list()?
            .into_iter()
            .filter(|record| {
                args.all
                    || (args.completed && record.status == ProcessStatus::Completed)
                    || (args.failed && record.status == ProcessStatus::Failed)
                    || before.map(|ts| record.started_at < ts).unwrap_or(false)
            })
            .map(|record| record.id)
            .collect();

        let mut errors = Vec::new();
        for id in &selected {
            if let Err(err) = self.store.delete(id) {
                errors.push(format!("{}: {}", id, err));
            }
        }
        info!(cleaned = selected.len(), failed = errors.len(), "cleaned records");
        Ok(CleanResponse {
            cleaned: selected.len(),
            errors,
        })
    }

    fn sanitize(&self, lines: Vec<String>) -> Vec<String> {
        if !self.strip_ansi {
            return lines;
        }
        lines
            .into_iter()
            .map(|line| {
                let stripped = strip_ansi_escapes::strip(line.as_bytes());
                String::from_utf8_lossy(&stripped).into_owned()
            })
            .collect()
    }
}

fn file_size(path: &std::path::Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Probe that reports a fixed set of pids as alive.
    struct PidSetProbe(Vec<u32>);

    impl LivenessProbe for PidSetProbe {
        fn is_alive(&self, pid: u32) -> bool {
            self.0.contains(&pid)
        }
    }

    fn record(id: &str, pid: u32, status: ProcessStatus, started_secs: i64) -> ProcessRecord {
        let (ended_at, exit_code) = match status {
            ProcessStatus::Running => (None, None),
            ProcessStatus::Completed => (Some(Utc::now()), Some(0)),
            ProcessStatus::Failed => (Some(Utc::now()), Some(1)),
        };
        ProcessRecord {
            id: id.to_string(),
            pid,
            command: "sleep 60".to_string(),
            args: vec!["sleep".to_string(), "60".to_string()],
            cwd: "/tmp".to_string(),
            started_at: Utc.timestamp_opt(started_secs, 0).unwrap(),
            ended_at,
            status,
            exit_code,
            stdout_path: format!(".devrack/processes/{}/stdout.log", id),
            stderr_path: format!(".devrack/processes/{}/stderr.log", id),
        }
    }

    fn registry(live_pids: Vec<u32>) -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open_or_init(dir.path()).unwrap();
        let registry = Registry::with_probe(store, Box::new(PidSetProbe(live_pids)));
        (dir, registry)
    }

    #[test]
    fn list_sorts_newest_first_and_limits() {
        let (_dir, registry) = registry(vec![]);
        for (id, secs) in [("old", 100), ("mid", 200), ("new", 300)] {
            registry
                .store()
                .put(&record(id, 0, ProcessStatus::Completed, secs))
                .unwrap();
        }
        let result = registry
            .list(ListArgs {
                status: None,
                limit: Some(2),
            })
            .unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(result.filtered, 2);
        let ids: Vec<&str> = result.processes.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[test]
    fn list_reconciles_dead_running_records() {
        let (_dir, registry) = registry(vec![]);
        registry
            .store()
            .put(&record("dead", 4242, ProcessStatus::Running, 100))
            .unwrap();

        let result = registry.list(ListArgs::default()).unwrap();
        assert_eq!(result.processes[0].status, ProcessStatus::Failed);
        assert_eq!(result.processes[0].exit_code, Some(-1));
        // Reconciliation is in-memory; the stored record is untouched.
        assert_eq!(
            registry.store().get("dead").unwrap().status,
            ProcessStatus::Running
        );
    }

    #[test]
    fn list_filters_by_reconciled_status() {
        let (_dir, registry) = registry(vec![777]);
        registry
            .store()
            .put(&record("live", 777, ProcessStatus::Running, 100))
            .unwrap();
        registry
            .store()
            .put(&record("done", 0, ProcessStatus::Completed, 200))
            .unwrap();

        let result = registry
            .list(ListArgs {
                status: Some(ProcessStatus::Running),
                limit: None,
            })
            .unwrap();
        assert_eq!(result.filtered, 1);
        assert_eq!(result.processes[0].id, "live");
        assert_eq!(result.total, 2);
    }

    #[test]
    fn show_annotates_log_sizes() {
        let (_dir, registry) = registry(vec![]);
        let rec = record("p", 0, ProcessStatus::Completed, 100);
        registry.store().put(&rec).unwrap();
        fs::write(registry.store().stdout_path("p"), "hello\n").unwrap();

        let shown = registry
            .show(ShowArgs {
                process_id: "p".to_string(),
            })
            .unwrap();
        assert_eq!(shown.log_size.stdout, 6);
        assert_eq!(shown.log_size.stderr, 0);
    }

    #[test]
    fn show_unknown_id_is_not_found() {
        let (_dir, registry) = registry(vec![]);
        let err = registry
            .show(ShowArgs {
                process_id: "missing".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn logs_returns_empty_for_missing_files() {
        let (_dir, registry) = registry(vec![]);
        registry
            .store()
            .put(&record("p", 0, ProcessStatus::Completed, 100))
            .unwrap();

        let logs = registry
            .logs(LogsArgs {
                process_id: "p".to_string(),
                stream: StreamSelect::Both,
                lines: None,
            })
            .unwrap();
        assert_eq!(logs.stdout, Some(vec![]));
        assert_eq!(logs.stderr, Some(vec![]));
    }

    #[test]
    fn logs_honors_stream_selection_and_strips_ansi() {
        let (_dir, registry) = registry(vec![]);
        registry
            .store()
            .put(&record("p", 0, ProcessStatus::Completed, 100))
            .unwrap();
        fs::write(
            registry.store().stdout_path("p"),
            "\u{1b}[32mgreen\u{1b}[0m line\n",
        )
        .unwrap();

        let logs = registry
            .logs(LogsArgs {
                process_id: "p".to_string(),
                stream: StreamSelect::Stdout,
                lines: None,
            })
            .unwrap();
        assert_eq!(logs.stdout, Some(vec!["green line".to_string()]));
        assert!(logs.stderr.is_none());
    }

    #[test]
    fn kill_rejects_non_running_records() {
        let (_dir, registry) = registry(vec![]);
        let rec = record("done", 0, ProcessStatus::Completed, 100);
        registry.store().put(&rec).unwrap();

        let err = registry
            .kill(KillArgs {
                process_id: "done".to_string(),
                signal: None,
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidState(_)));
        // Record left unmodified.
        assert_eq!(registry.store().get("done").unwrap(), rec);
    }

    #[test]
    fn kill_rejects_stale_running_records() {
        let (_dir, registry) = registry(vec![]);
        registry
            .store()
            .put(&record("stale", 9999, ProcessStatus::Running, 100))
            .unwrap();

        let err = registry
            .kill(KillArgs {
                process_id: "stale".to_string(),
                signal: None,
            })
            .unwrap_err();
        match err {
            RegistryError::InvalidState(msg) => {
                assert!(msg.contains("no longer running"), "{}", msg)
            }
            other => panic!("expected InvalidState, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn kill_terminates_a_live_child_and_marks_it_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open_or_init(dir.path()).unwrap();
        let registry = Registry::new(store);

        let mut child = std::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .unwrap();
        let pid = child.id();
        registry
            .store()
            .put(&record("victim", pid, ProcessStatus::Running, 100))
            .unwrap();

        let result = registry
            .kill(KillArgs {
                process_id: "victim".to_string(),
                signal: Some(KillSignal::Sigkill),
            })
            .unwrap();
        assert_eq!(result.signal, KillSignal::Sigkill);

        let stored = registry.store().get("victim").unwrap();
        assert_eq!(stored.status, ProcessStatus::Failed);
        assert_eq!(stored.exit_code, Some(-1));
        assert!(stored.ended_at.is_some());

        // Reap the child so the test does not leak a zombie.
        let _ = child.wait();
    }

    #[test]
    fn clean_all_empties_the_index() {
        let (_dir, registry) = registry(vec![]);
        registry
            .store()
            .put(&record("a", 0, ProcessStatus::Completed, 100))
            .unwrap();
        registry
            .store()
            .put(&record("b", 0, ProcessStatus::Failed, 200))
            .unwrap();

        let result = registry
            .clean(CleanArgs {
                all: true,
                ..CleanArgs::default()
            })
            .unwrap();
        assert_eq!(result.cleaned, 2);
        assert!(result.errors.is_empty());
        assert!(registry.store().list().unwrap().is_empty());
        assert!(matches!(
            registry.store().get("a").unwrap_err(),
            RegistryError::NotFound(_)
        ));
    }

    #[test]
    fn clean_by_status_keeps_the_rest() {
        let (_dir, registry) = registry(vec![]);
        registry
            .store()
            .put(&record("ok", 0, ProcessStatus::Completed, 100))
            .unwrap();
        registry
            .store()
            .put(&record("bad", 0, ProcessStatus::Failed, 200))
            .unwrap();

        let result = registry
            .clean(CleanArgs {
                completed: true,
                ..CleanArgs::default()
            })
            .unwrap();
        assert_eq!(result.cleaned, 1);
        let surviving: Vec<String> = registry
            .store()
            .list()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(surviving, vec!["bad"]);
    }

    #[test]
    fn clean_before_uses_strict_timestamp() {
        let (_dir, registry) = registry(vec![]);
        registry
            .store()
            .put(&record("old", 0, ProcessStatus::Completed, 1_000))
            .unwrap();
        registry
            .store()
            .put(&record("new", 0, ProcessStatus::Completed, 2_000_000_000))
            .unwrap();

        let cutoff = Utc.timestamp_opt(1_000_000, 0).unwrap().to_rfc3339();
        let result = registry
            .clean(CleanArgs {
                before: Some(cutoff),
                ..CleanArgs::default()
            })
            .unwrap();
        assert_eq!(result.cleaned, 1);
        assert_eq!(registry.store().list().unwrap()[0].id, "new");
    }

    #[test]
    fn clean_rejects_malformed_timestamps() {
        let (_dir, registry) = registry(vec![]);
        let err = registry
            .clean(CleanArgs {
                before: Some("yesterday".to_string()),
                ..CleanArgs::default()
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArgument(_)));
    }

    #[test]
    fn clean_with_no_selectors_removes_nothing() {
        let (_dir, registry) = registry(vec![]);
        registry
            .store()
            .put(&record("keep", 0, ProcessStatus::Completed, 100))
            .unwrap();
        let result = registry.clean(CleanArgs::default()).unwrap();
        assert_eq!(result.cleaned, 0);
        assert_eq!(registry.store().list().unwrap().len(), 1);
    }
}
