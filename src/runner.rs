//! Foreground command execution with persistent logging.
//!
//! This module spawns a child command in the foreground, streams its output
//! to the terminal and to per-process log files simultaneously, and writes
//! registry records at start and at termination. The record is written
//! three times at most: once with pid 0 immediately before the spawn, once
//! with the real pid, and once with the terminal status.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::warn;

use crate::project::{self, DATA_DIR_NAME};
use crate::record::{generate_id, ProcessRecord, ProcessStatus};
use crate::store::RecordStore;

/// Exit code recorded when the child was killed by a signal or could not
/// be started.
pub const KILLED_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Execute from the project root instead of the invocation directory.
    pub workspace: bool,
    /// Prepend `<project-root>/bin` to PATH.
    pub local_bin: bool,
}

/// Runs a command in the foreground and returns its exit code.
///
/// `cwd` is the invocation directory; the registry lands at the enclosing
/// git root (or `cwd` itself outside a repository).
pub async fn run_command(args: &[String], options: RunOptions, cwd: &Path) -> Result<i32> {
    anyhow::ensure!(!args.is_empty(), "no command specified");

    let project_root = project::runner_root(cwd);
    let work_dir = if options.workspace {
        project_root.clone()
    } else {
        cwd.to_path_buf()
    };

    let store = RecordStore::open_or_init(&project_root)
        .with_context(|| format!("failed to create {} directory", DATA_DIR_NAME))?;
    let id = generate_id();
    let process_dir = store.process_dir(&id);
    std::fs::create_dir_all(&process_dir)
        .with_context(|| format!("failed to create {}", process_dir.display()))?;

    let stdout_log = tokio::fs::File::create(store.stdout_path(&id))
        .await
        .context("failed to create stdout log")?;
    let stderr_log = tokio::fs::File::create(store.stderr_path(&id))
        .await
        .context("failed to create stderr log")?;

    let mut record = ProcessRecord {
        id: id.clone(),
        pid: 0,
        command: shell_words::join(args.iter().map(String::as_str)),
        args: args.to_vec(),
        cwd: work_dir.display().to_string(),
        started_at: Utc::now(),
        ended_at: None,
        status: ProcessStatus::Running,
        exit_code: None,
        stdout_path: format!("{}/processes/{}/stdout.log", DATA_DIR_NAME, id),
        stderr_path: format!("{}/processes/{}/stderr.log", DATA_DIR_NAME, id),
    };
    // First put happens before the spawn so a crash between the two still
    // leaves a discoverable record.
    put_record(&store, &record);

    let mut command = build_command(args);
    command.current_dir(&work_dir);
    if options.local_bin {
        if let Some(path) = local_bin_path(&project_root) {
            command.env("PATH", path);
        }
    }
    command
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            record.status = ProcessStatus::Failed;
            record.exit_code = Some(KILLED_EXIT_CODE);
            record.ended_at = Some(Utc::now());
            put_record(&store, &record);
            if err.kind() == std::io::ErrorKind::NotFound {
                anyhow::bail!("command not found: {}", args[0]);
            }
            return Err(err).context("failed to start command");
        }
    };

    let pid = child.id().unwrap_or(0);
    record.pid = pid;
    put_record(&store, &record);
    spawn_signal_forwarder(pid);

    let mut stream_tasks = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        stream_tasks.push(tokio::spawn(tee_stream(
            stdout,
            tokio::io::stdout(),
            stdout_log,
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        stream_tasks.push(tokio::spawn(tee_stream(
            stderr,
            tokio::io::stderr(),
            stderr_log,
        )));
    }

    let status = child.wait().await.context("failed to wait for command")?;
    // Drain both streams fully before stamping the terminal record.
    for task in stream_tasks {
        let _ = task.await;
    }

    let code = status.code().unwrap_or(KILLED_EXIT_CODE);
    record.ended_at = Some(Utc::now());
    record.exit_code = Some(code);
    record.status = if code == 0 {
        ProcessStatus::Completed
    } else {
        ProcessStatus::Failed
    };
    put_record(&store, &record);

    Ok(code)
}

// A single trailing argument runs through the shell, mirroring `sh -c`
// usage; multiple arguments run the program directly.
fn build_command(args: &[String]) -> Command {
    if args.len() == 1 {
        #[cfg(unix)]
        {
            let mut command = Command::new("sh");
            command.arg("-c").arg(&args[0]);
            command
        }
        #[cfg(not(unix))]
        {
            let mut command = Command::new("cmd");
            command.arg("/C").arg(&args[0]);
            command
        }
    } else {
        let mut command = Command::new(&args[0]);
        command.args(&args[1..]);
        command
    }
}

/// PATH with `<project-root>/bin` prepended, when that directory exists.
fn local_bin_path(project_root: &Path) -> Option<std::ffi::OsString> {
    let bin_dir: PathBuf = project_root.join("bin");
    if !bin_dir.is_dir() {
        return None;
    }
    let current = std::env::var_os("PATH").unwrap_or_default();
    let mut paths = vec![bin_dir];
    paths.extend(std::env::split_paths(&current));
    std::env::join_paths(paths).ok()
}

// Failing to persist a record must not take down the watched command.
fn put_record(store: &RecordStore, record: &ProcessRecord) {
    if let Err(err) = store.put(record) {
        warn!(id = %record.id, error = %err, "failed to save process record");
    }
}

/// Forwards SIGINT/SIGTERM received by devrack to the child.
fn spawn_signal_forwarder(pid: u32) {
    if pid == 0 {
        return;
    }
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => forward_signal(pid, libc::SIGINT),
                _ = sigterm.recv() => forward_signal(pid, libc::SIGTERM),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = crate::liveness::send_signal(pid, crate::liveness::KillSignal::Sigterm);
        }
    });
}

#[cfg(unix)]
fn forward_signal(pid: u32, sig: libc::c_int) {
    unsafe {
        let _ = libc::kill(pid as libc::pid_t, sig);
    }
}

// Copy child output to the terminal and the log file as it arrives.
async fn tee_stream<R, T, L>(mut reader: R, mut terminal: T, mut log: L)
where
    R: AsyncRead + Unpin,
    T: AsyncWrite + Unpin,
    L: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let _ = terminal.write_all(&buffer[..n]).await;
                let _ = terminal.flush().await;
                let _ = log.write_all(&buffer[..n]).await;
            }
        }
    }
    let _ = log.flush().await;
}
