//! Worker process creation
//!
//! Two strategies share the [`Spawn`] trait:
//!
//! - [`ForkSpawner`]: plain `fork()`. The child inherits the listener,
//!   mutex mapping and report pipe and runs the serve loop directly.
//! - [`ExecSpawner`]: re-executes the current binary with `--worker`.
//!   Descriptor numbers and the mutex path travel in the environment.
//!
//! Neither waits for the child; the supervisor's reaper does.

use std::ffi::OsString;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, ForkResult, Pid};

use prefork_core::handoff;
use prefork_core::ProcessId;

use crate::error::SpawnError;
use crate::listener::ListenerHandle;
use crate::mutex::ProcessMutex;
use crate::report::ReportSender;
use crate::signal::Shutdown;
use crate::worker::{ConnectionHandler, Worker, WorkerContext};

/// Creates worker processes and signals them.
pub trait Spawn {
    /// Start one worker and return its pid.
    fn spawn(&mut self) -> Result<ProcessId, SpawnError>;

    /// Ask a worker to stop (SIGTERM), or kill it (SIGKILL) when `force`.
    fn signal(&mut self, pid: ProcessId, force: bool) -> io::Result<()> {
        let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        kill(Pid::from_raw(pid), sig).map_err(io::Error::from)
    }
}

/// `fork()` spawner. The supervisor must be single-threaded.
pub struct ForkSpawner<'a, H: ?Sized> {
    ctx: WorkerContext<'a>,
    handler: &'a H,
    shutdown: Shutdown,
}

impl<'a, H: ConnectionHandler + ?Sized> ForkSpawner<'a, H> {
    pub fn new(ctx: WorkerContext<'a>, handler: &'a H, shutdown: Shutdown) -> Self {
        Self { ctx, handler, shutdown }
    }
}

impl<H: ConnectionHandler + ?Sized> Spawn for ForkSpawner<'_, H> {
    fn spawn(&mut self) -> Result<ProcessId, SpawnError> {
        // SAFETY: called from the single-threaded supervisor loop; the child
        // never returns into it.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => Ok(child.as_raw()),
            Ok(ForkResult::Child) => {
                let code = Worker::new(self.ctx, self.handler, &self.shutdown).run_to_exit();
                std::process::exit(code)
            }
            Err(e) => Err(SpawnError::Fork(e.into())),
        }
    }
}

/// Re-exec spawner.
#[derive(Debug, Clone)]
pub struct ExecSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    listen_fd: RawFd,
    report_fd: RawFd,
    mutex_path: Option<PathBuf>,
}

impl ExecSpawner {
    pub fn new(
        program: impl Into<PathBuf>,
        listener: ListenerHandle<'_>,
        reporter: &ReportSender,
        mutex: Option<&ProcessMutex>,
    ) -> Self {
        Self {
            program: program.into(),
            args: vec![OsString::from(handoff::WORKER_FLAG)],
            listen_fd: listener.raw_fd(),
            report_fd: reporter.raw_fd(),
            mutex_path: mutex.and_then(|m| m.backing_path()).map(Path::to_path_buf),
        }
    }

    /// Re-execute the running binary.
    pub fn current_exe(
        listener: ListenerHandle<'_>,
        reporter: &ReportSender,
        mutex: Option<&ProcessMutex>,
    ) -> Result<Self, SpawnError> {
        let exe = std::env::current_exe().map_err(SpawnError::CurrentExe)?;
        Ok(Self::new(exe, listener, reporter, mutex))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(handoff::LISTEN_FD, self.listen_fd.to_string())
            .env(handoff::REPORT_FD, self.report_fd.to_string());
        match self.mutex_path {
            Some(ref path) => cmd.env(handoff::MUTEX_PATH, path),
            None => cmd.env_remove(handoff::MUTEX_PATH),
        };

        let keep = [self.listen_fd, self.report_fd];
        // SAFETY: only async-signal-safe fcntl calls between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                for fd in keep {
                    clear_cloexec(fd)?;
                }
                Ok(())
            });
        }
        cmd
    }
}

impl Spawn for ExecSpawner {
    fn spawn(&mut self) -> Result<ProcessId, SpawnError> {
        let child = self.command().spawn().map_err(|source| SpawnError::Exec {
            path: self.program.clone(),
            source,
        })?;
        Ok(child.id() as ProcessId)
    }
}

fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::SharedListener;
    use crate::report;
    use nix::sys::wait::{waitpid, WaitStatus};
    use std::ffi::OsStr;

    #[test]
    fn test_exec_command_hands_off_resources() {
        let listener = SharedListener::bind("127.0.0.1:0".parse().unwrap(), 8).unwrap();
        let (_rx, tx) = report::channel().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mutex = ProcessMutex::create_at(dir.path().join("accept.mutex")).unwrap();

        let spawner = ExecSpawner::new("/bin/true", listener.handle(), &tx, Some(&mutex));
        let cmd = spawner.command();

        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, vec![OsStr::new("--worker")]);

        let envs: Vec<_> = cmd.get_envs().collect();
        let listen_fd = listener.handle().raw_fd().to_string();
        assert!(envs.contains(&(OsStr::new(handoff::LISTEN_FD), Some(OsStr::new(&listen_fd)))));
        let mutex_path = dir.path().join("accept.mutex");
        assert!(envs.contains(&(OsStr::new(handoff::MUTEX_PATH), Some(mutex_path.as_os_str()))));
    }

    #[test]
    fn test_exec_spawn_returns_child_pid() {
        let listener = SharedListener::bind("127.0.0.1:0".parse().unwrap(), 8).unwrap();
        let (_rx, tx) = report::channel().unwrap();

        let mut spawner = ExecSpawner::new("/bin/true", listener.handle(), &tx, None);
        let pid = spawner.spawn().unwrap();
        assert!(pid > 0);

        let status = waitpid(Pid::from_raw(pid), None).unwrap();
        assert_eq!(status, WaitStatus::Exited(Pid::from_raw(pid), 0));
    }

    #[test]
    fn test_exec_spawn_missing_program() {
        let listener = SharedListener::bind("127.0.0.1:0".parse().unwrap(), 8).unwrap();
        let (_rx, tx) = report::channel().unwrap();

        let mut spawner =
            ExecSpawner::new("/nonexistent/prefork-worker", listener.handle(), &tx, None);
        assert!(matches!(spawner.spawn(), Err(SpawnError::Exec { .. })));
    }
}
