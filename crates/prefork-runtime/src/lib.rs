//! # prefork-runtime
//!
//! Linux runtime for the prefork supervisor.
//!
//! This crate provides:
//! - Single-instance lock file (`flock`)
//! - Shared listening socket, one backlog for every worker
//! - Process-shared accept mutex (robust pthread mutex in shared memory)
//! - Exit-report pipe between workers and the supervisor
//! - Fork and re-exec spawners, `waitpid` reaper
//! - Worker serve loop and the supervisor reap/respawn loop
//! - Startup scripts and server orchestration

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod error;
        pub mod listener;
        pub mod lock;
        pub mod mutex;
        pub mod reap;
        pub mod report;
        pub mod script;
        pub mod server;
        pub mod signal;
        pub mod spawn;
        pub mod supervisor;
        pub mod worker;

        // Re-exports
        pub use error::{
            ListenError, LockError, MutexError, ReportError, Result, ScriptError, ServerError,
            SpawnError, SupervisorError, WorkerError,
        };
        pub use listener::{ListenerHandle, SharedListener};
        pub use lock::LockGuard;
        pub use mutex::{ProcessMutex, ProcessMutexGuard};
        pub use reap::{ChildReaper, ExitEvent, Reap, ReapOutcome, WaitMode};
        pub use report::{ReportReceiver, ReportSender};
        pub use script::{run_scripts, select_scripts};
        pub use server::{run_worker_from_env, BoundServer, RunSummary, Server};
        pub use signal::Shutdown;
        pub use spawn::{ExecSpawner, ForkSpawner, Spawn};
        pub use supervisor::Supervisor;
        pub use worker::{ConnectionHandler, Worker, WorkerContext, WorkerSettings};
    } else {
        compile_error!("prefork-runtime supports Linux only");
    }
}
