//! # prefork-core
//!
//! Core types for the prefork process-pool supervisor.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Sockets, processes and signals live in `prefork-runtime`.
//!
//! ## Modules
//!
//! - `config` - Server configuration (defaults, env overrides, builder)
//! - `env` - Environment variable utilities
//! - `error` - Error types
//! - `logging` - tracing subscriber setup
//! - `pool` - Supervisor-side alive-worker bookkeeping
//! - `protocol` - Worker exit-report frame
//! - `state` - Worker lifecycle and termination classification

pub mod config;
pub mod env;
pub mod error;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod state;

// Re-exports for convenience
pub use config::{RunMode, ServerConfig, SpawnMode};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};
pub use error::{ConfigError, ProtocolError};
pub use logging::{LogConfig, LogFormat};
pub use pool::{resolve_replacements, PoolStats, ProcessId, WorkerRecord, WorkerSet};
pub use protocol::{ExitCause, ExitReport, ReportDecoder, REPORT_FRAME_LEN};
pub use state::{Termination, WorkerState};

/// Environment keys used to hand shared resources to a re-executed worker.
pub mod handoff {
    /// Listening socket descriptor number
    pub const LISTEN_FD: &str = "PREFORK_LISTEN_FD";
    /// Write end of the exit-report pipe
    pub const REPORT_FD: &str = "PREFORK_REPORT_FD";
    /// Backing file of the accept mutex (absent when accepts are not serialized)
    pub const MUTEX_PATH: &str = "PREFORK_MUTEX_PATH";
    /// Command-line flag marking a worker image
    pub const WORKER_FLAG: &str = "--worker";
}
