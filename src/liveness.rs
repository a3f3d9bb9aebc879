//! Process liveness probing and status reconciliation.
//!
//! A record that says `running` is never trusted blindly: every read path
//! asks the OS whether the pid still exists and corrects stale status
//! before the record reaches a consumer. The probe is a capability trait so
//! the platform-specific check stays in one place and tests can substitute
//! a fake.

use serde::{Deserialize, Serialize};

use crate::record::{ProcessRecord, ProcessStatus};

/// Checks whether a pid refers to a live OS process.
pub trait LivenessProbe {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Termination signal a caller may request for a running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum KillSignal {
    #[serde(rename = "SIGTERM")]
    #[value(name = "SIGTERM")]
    Sigterm,
    #[serde(rename = "SIGKILL")]
    #[value(name = "SIGKILL")]
    Sigkill,
}

impl std::fmt::Display for KillSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillSignal::Sigterm => f.write_str("SIGTERM"),
            KillSignal::Sigkill => f.write_str("SIGKILL"),
        }
    }
}

/// Delivers a termination signal. Fire-and-forget: the caller does not
/// wait for the process to actually exit.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: KillSignal) -> std::io::Result<()> {
    let sig = match signal {
        KillSignal::Sigterm => libc::SIGTERM,
        KillSignal::Sigkill => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Windows has no signals; both requests terminate the process handle.
#[cfg(windows)]
pub fn send_signal(pid: u32, _signal: KillSignal) -> std::io::Result<()> {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle == 0 {
            return Err(std::io::Error::last_os_error());
        }
        let rc = TerminateProcess(handle, 1);
        CloseHandle(handle);
        if rc == 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
pub fn send_signal(_pid: u32, _signal: KillSignal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals not supported on this platform",
    ))
}

/// The real, platform-appropriate probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProbe;

#[cfg(unix)]
impl LivenessProbe for OsProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        // Signal 0 performs the permission and existence checks without
        // delivering anything. Any error counts as not running.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
}

#[cfg(windows)]
impl LivenessProbe for OsProbe {
    fn is_alive(&self, pid: u32) -> bool {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{
            OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
        };
        if pid == 0 {
            return false;
        }
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle == 0 {
                return false;
            }
            CloseHandle(handle);
            true
        }
    }
}

#[cfg(not(any(unix, windows)))]
impl LivenessProbe for OsProbe {
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}

/// Corrects a stale `running` record against actual process liveness.
///
/// Returns `true` when the record was changed. Non-running records are
/// left untouched, so reconciling twice is a no-op. `ended_at` stays
/// unset: the process's real end time was never observed.
pub fn reconcile(record: &mut ProcessRecord, probe: &dyn LivenessProbe) -> bool {
    if !record.is_running() || probe.is_alive(record.pid) {
        return false;
    }
    record.status = ProcessStatus::Failed;
    if record.exit_code.is_none() {
        record.exit_code = Some(-1);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// Probe with a canned answer.
    pub struct FixedProbe(pub bool);

    impl LivenessProbe for FixedProbe {
        fn is_alive(&self, _pid: u32) -> bool {
            self.0
        }
    }

    fn running(pid: u32) -> ProcessRecord {
        ProcessRecord {
            id: "t".to_string(),
            pid,
            command: "sleep 60".to_string(),
            args: vec!["sleep".to_string(), "60".to_string()],
            cwd: "/".to_string(),
            started_at: Utc::now(),
            ended_at: None,
            status: ProcessStatus::Running,
            exit_code: None,
            stdout_path: String::new(),
            stderr_path: String::new(),
        }
    }

    #[test]
    fn dead_running_record_is_marked_failed() {
        let mut record = running(12345);
        let changed = reconcile(&mut record, &FixedProbe(false));
        assert!(changed);
        assert_eq!(record.status, ProcessStatus::Failed);
        assert_eq!(record.exit_code, Some(-1));
        assert!(record.ended_at.is_none());
    }

    #[test]
    fn live_running_record_is_untouched() {
        let mut record = running(12345);
        assert!(!reconcile(&mut record, &FixedProbe(true)));
        assert_eq!(record.status, ProcessStatus::Running);
    }

    #[test]
    fn reconcile_is_idempotent_on_terminal_records() {
        let mut record = running(12345);
        record.status = ProcessStatus::Completed;
        record.exit_code = Some(0);
        let before = record.clone();
        assert!(!reconcile(&mut record, &FixedProbe(false)));
        assert_eq!(record, before);
    }

    #[cfg(unix)]
    #[test]
    fn os_probe_sees_own_process() {
        let probe = OsProbe;
        assert!(probe.is_alive(std::process::id()));
        assert!(!probe.is_alive(0));
    }

    #[test]
    fn signal_names_round_trip_through_serde() {
        let sig: KillSignal = serde_json::from_str("\"SIGKILL\"").unwrap();
        assert_eq!(sig, KillSignal::Sigkill);
        assert_eq!(serde_json::to_string(&KillSignal::Sigterm).unwrap(), "\"SIGTERM\"");
        assert_eq!(KillSignal::Sigterm.to_string(), "SIGTERM");
    }
}
