//! Reaping terminated workers

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use prefork_core::{ProcessId, Termination};

use crate::error::SupervisorError;
use crate::report::ReportReceiver;

/// Whether a wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Block,
    Poll,
}

/// One reaped child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitEvent {
    pub pid: ProcessId,
    pub termination: Termination,
    /// Replacement count the worker reported before exiting
    pub report: Option<u32>,
}

/// Result of one wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapOutcome {
    Exited(ExitEvent),
    /// A signal arrived while blocked
    Interrupted,
    /// No children exist at all
    NoChildren,
    /// Children exist, none has exited yet (only in [`WaitMode::Poll`])
    Pending,
}

/// Source of child exit events.
pub trait Reap {
    fn wait_any(&mut self, mode: WaitMode) -> Result<ReapOutcome, SupervisorError>;
}

/// Classify a wait status. `None` for statuses that are not a termination.
pub fn classify(status: WaitStatus) -> Option<(ProcessId, Termination)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid.as_raw(), Termination::Exited(code))),
        WaitStatus::Signaled(pid, signal, core_dumped) => Some((
            pid.as_raw(),
            Termination::Signaled { signal: signal as i32, core_dumped },
        )),
        WaitStatus::StillAlive | WaitStatus::Stopped(..) | WaitStatus::Continued(_) => None,
        other => other.pid().map(|pid| (pid.as_raw(), Termination::Unknown)),
    }
}

/// `waitpid(-1)` plus the exit-report channel.
#[derive(Debug)]
pub struct ChildReaper {
    reports: ReportReceiver,
}

impl ChildReaper {
    pub fn new(reports: ReportReceiver) -> Self {
        Self { reports }
    }

    fn report_for(&mut self, pid: ProcessId) -> Option<u32> {
        match self.reports.take(pid) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(pid, error = %e, "Cannot read exit reports");
                None
            }
        }
    }
}

impl Reap for ChildReaper {
    fn wait_any(&mut self, mode: WaitMode) -> Result<ReapOutcome, SupervisorError> {
        let flags = match mode {
            WaitMode::Block => None,
            WaitMode::Poll => Some(WaitPidFlag::WNOHANG),
        };

        loop {
            let status = match waitpid(Pid::from_raw(-1), flags) {
                Ok(status) => status,
                Err(Errno::EINTR) => return Ok(ReapOutcome::Interrupted),
                Err(Errno::ECHILD) => return Ok(ReapOutcome::NoChildren),
                Err(e) => return Err(SupervisorError::Wait(e.into())),
            };

            if status == WaitStatus::StillAlive {
                return Ok(ReapOutcome::Pending);
            }

            match classify(status) {
                Some((pid, termination)) => {
                    let report = self.report_for(pid);
                    return Ok(ReapOutcome::Exited(ExitEvent { pid, termination, report }));
                }
                // Stop/continue notifications; keep waiting.
                None => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn test_classify() {
        let pid = Pid::from_raw(1234);
        assert_eq!(
            classify(WaitStatus::Exited(pid, 3)),
            Some((1234, Termination::Exited(3)))
        );
        assert_eq!(
            classify(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            Some((1234, Termination::Signaled { signal: libc::SIGSEGV, core_dumped: true }))
        );
        assert_eq!(classify(WaitStatus::StillAlive), None);
        assert_eq!(classify(WaitStatus::Stopped(pid, Signal::SIGSTOP)), None);
        assert_eq!(classify(WaitStatus::Continued(pid)), None);
    }
}
