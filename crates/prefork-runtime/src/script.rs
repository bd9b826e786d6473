//! Startup scripts
//!
//! Arguments ending in a recognized extension are run with `sh`, in
//! order, before the lock is taken. The first failure stops startup.

use std::path::PathBuf;
use std::process::Command;

use prefork_core::ServerConfig;

use crate::error::ScriptError;

/// Interpreter used for every startup script.
pub const SCRIPT_SHELL: &str = "sh";

/// Pick the startup scripts out of the command-line arguments.
///
/// Other arguments are ignored with a warning.
pub fn select_scripts<I, S>(config: &ServerConfig, args: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = S>,
    S: Into<PathBuf>,
{
    args.into_iter()
        .map(Into::into)
        .filter(|path: &PathBuf| {
            let keep = config.is_startup_script(path);
            if !keep {
                tracing::warn!(arg = %path.display(), "Ignoring argument without a script extension");
            }
            keep
        })
        .collect()
}

/// Run each script to completion, in order.
pub fn run_scripts(scripts: &[PathBuf]) -> Result<(), ScriptError> {
    for path in scripts {
        tracing::info!(script = %path.display(), "Running startup script");
        let status = Command::new(SCRIPT_SHELL)
            .arg(path)
            .status()
            .map_err(|source| ScriptError::Launch { path: path.clone(), source })?;
        if !status.success() {
            return Err(ScriptError::Failed { path: path.clone(), status });
        }
    }
    Ok(())
}
