//! prefork-httpd: HTTP/1.1 server on a pre-forked worker pool
//!
//! Usage:
//!     prefork-httpd [-d] [SCRIPT.sh ...]
//!
//! Everything else is configured through `PREFORK_*` environment
//! variables (port, pool size, lock file, spawn mode, ...).
//!
//! Benchmark:
//!     PREFORK_NUM_CHILDREN=8 ./target/release/prefork-httpd
//!     wrk -t4 -c100 -d10s http://127.0.0.1:8080/

mod http;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::Parser;

use prefork_core::logging::{self, LogConfig};
use prefork_core::{RunMode, ServerConfig};
use prefork_runtime::{
    run_scripts, run_worker_from_env, select_scripts, RunSummary, Server, ServerError, Shutdown,
};

use crate::http::HttpHandler;

#[derive(Parser, Debug)]
#[command(name = "prefork-httpd", version, about = "HTTP server on a pre-forked process pool")]
struct Cli {
    /// Serve from a single process with debug logging
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Internal: this process is a re-executed worker
    #[arg(long, hide = true)]
    worker: bool,

    /// Startup scripts to run before serving
    #[arg(value_name = "SCRIPT")]
    scripts: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log = if cli.debug { LogConfig::for_debug() } else { LogConfig::new() };
    logging::init(log.with_env_overrides());

    match run(&cli) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            tracing::error!(error = %e, "Fatal");
            eprintln!("prefork-httpd: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<i32, ServerError> {
    let shutdown = Shutdown::from_signals().map_err(ServerError::Signal)?;
    let handler = HttpHandler::from_env();

    let mut config = ServerConfig::try_from_env()?;
    if cli.debug {
        config = config.run_mode(RunMode::Debug);
    }

    if cli.worker {
        return run_worker_from_env(&config, &handler, &shutdown);
    }

    let scripts = select_scripts(&config, &cli.scripts);
    run_scripts(&scripts)?;

    let server = Server::bind(config)?;
    match server.serve(&handler, &shutdown)? {
        RunSummary::Pooled(stats) => tracing::info!(
            spawned = stats.spawned,
            reaped = stats.reaped,
            spawn_failures = stats.spawn_failures,
            "Server stopped"
        ),
        RunSummary::Debug { served, cause } => {
            let requests = handler.stats().requests.load(Ordering::Relaxed);
            tracing::info!(served, requests, reason = ?cause, "Server stopped")
        }
    }
    Ok(0)
}
