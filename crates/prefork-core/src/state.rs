//! Worker lifecycle and termination types

use core::fmt;

/// Lifecycle of a worker process, as seen from inside the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Process exists, shared resources not yet attached
    Spawned = 0,

    /// In the accept/serve loop
    Serving = 1,

    /// Leaving cleanly (shutdown or recycle)
    ExitingNormal = 2,

    /// Leaving because the accept loop failed
    ExitingError = 3,
}

impl WorkerState {
    /// Check if the worker has left the serve loop
    #[inline]
    pub const fn is_exiting(&self) -> bool {
        matches!(self, WorkerState::ExitingNormal | WorkerState::ExitingError)
    }

    /// Whether `next` is a legal successor of this state
    pub const fn can_transition_to(&self, next: WorkerState) -> bool {
        matches!(
            (self, next),
            (WorkerState::Spawned, WorkerState::Serving)
                | (WorkerState::Spawned, WorkerState::ExitingError)
                | (WorkerState::Serving, WorkerState::ExitingNormal)
                | (WorkerState::Serving, WorkerState::ExitingError)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Spawned => write!(f, "spawned"),
            WorkerState::Serving => write!(f, "serving"),
            WorkerState::ExitingNormal => write!(f, "exiting"),
            WorkerState::ExitingError => write!(f, "exiting (error)"),
        }
    }
}

/// How a child process ended, as reported by `wait`.
///
/// Signals are plain numbers here so this type stays platform agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Normal exit with status code
    Exited(i32),
    /// Killed by a signal
    Signaled { signal: i32, core_dumped: bool },
    /// Anything else `wait` can report
    Unknown,
}

impl Termination {
    /// Normal exit with status 0
    #[inline]
    pub const fn is_clean(&self) -> bool {
        matches!(self, Termination::Exited(0))
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exited with code {}", code),
            Termination::Signaled { signal, core_dumped: true } => {
                write!(f, "killed by signal {} (core dumped)", signal)
            }
            Termination::Signaled { signal, .. } => write!(f, "killed by signal {}", signal),
            Termination::Unknown => write!(f, "unknown termination"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(WorkerState::Spawned.can_transition_to(WorkerState::Serving));
        assert!(WorkerState::Serving.can_transition_to(WorkerState::ExitingNormal));
        assert!(WorkerState::Serving.can_transition_to(WorkerState::ExitingError));
        assert!(!WorkerState::ExitingNormal.can_transition_to(WorkerState::Serving));
        assert!(!WorkerState::Spawned.can_transition_to(WorkerState::ExitingNormal));
        assert!(WorkerState::ExitingError.is_exiting());
        assert!(!WorkerState::Serving.is_exiting());
    }

    #[test]
    fn test_termination_display() {
        assert_eq!(Termination::Exited(0).to_string(), "exited with code 0");
        assert!(Termination::Exited(0).is_clean());
        assert!(!Termination::Exited(1).is_clean());
        let t = Termination::Signaled { signal: 9, core_dumped: false };
        assert_eq!(t.to_string(), "killed by signal 9");
        assert!(!t.is_clean());
    }
}
