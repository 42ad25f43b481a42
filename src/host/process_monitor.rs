//! Foreground-process observer: periodically inspects which process is the
//! current foreground child of the shell and reports `ForegroundInfo` only
//! when something actually changed, so the mux doesn't get a FOREGROUND_CHANGE
//! frame on every poll tick.
//!
//! Grounded in this codebase's `daemon::lifecycle::is_process_running`, which
//! already uses `sysinfo` for cross-platform process inspection; here we
//! extend that same crate to walk the process tree under the shell's pid
//! rather than just checking liveness of a single pid.

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

use crate::control_proto::ForegroundInfo;

pub struct ProcessMonitor {
    system: System,
    shell_pid: u32,
    last: Option<ForegroundInfo>,
}

impl ProcessMonitor {
    pub fn new(shell_pid: u32) -> Self {
        Self {
            system: System::new_with_specifics(
                RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
            ),
            shell_pid,
            last: None,
        }
    }

    /// Re-scan the process table and return the foreground descendant's
    /// info if it changed since the last `poll`. "Foreground" here is
    /// approximated as the deepest, most-recently-started descendant of the
    /// shell pid still alive — the same heuristic a terminal emulator uses
    /// when it has no direct access to the pty's session leader foreground
    /// group.
    pub fn poll(&mut self) -> Option<ForegroundInfo> {
        self.system.refresh_processes();

        let current = self.deepest_descendant();
        if current != self.last {
            self.last = current.clone();
            return current;
        }
        None
    }

    fn deepest_descendant(&self) -> Option<ForegroundInfo> {
        let root = Pid::from_u32(self.shell_pid);
        let mut frontier = vec![root];
        let mut best: Option<&sysinfo::Process> = None;

        while let Some(pid) = frontier.pop() {
            for (candidate_pid, process) in self.system.processes() {
                if process.parent() == Some(pid) {
                    frontier.push(*candidate_pid);
                    let replace = match best {
                        None => true,
                        Some(current_best) => {
                            process.start_time() >= current_best.start_time()
                        }
                    };
                    if replace {
                        best = Some(process);
                    }
                }
            }
        }

        best.map(|p| ForegroundInfo {
            pid: p.pid().as_u32(),
            name: p.name().to_string(),
            cmdline: p.cmd().join(" "),
            cwd: p.cwd().to_string_lossy().into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_descendants_yields_none_without_panicking() {
        // pid 999999999 almost certainly has no children on any real system.
        let mut monitor = ProcessMonitor::new(999_999_999);
        assert_eq!(monitor.poll(), None);
    }

    #[test]
    fn repeated_poll_with_unchanged_foreground_reports_none_after_first() {
        let mut monitor = ProcessMonitor::new(std::process::id());
        // First poll may or may not find a descendant depending on test
        // harness internals; what matters is idempotency afterward.
        let first = monitor.poll();
        let second = monitor.poll();
        if first.is_none() {
            assert_eq!(second, None);
        }
    }
}
