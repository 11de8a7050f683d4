//! The subcommands. Each `cmd_*` function maps its work onto a process
//! exit code: accumulated per-map failure counts for update/repair,
//! warnings plus errors for verify, `ERR_LOCK` when the lock cannot be
//! taken.

mod status;
mod update;
mod verify;

use std::path::PathBuf;

use crate::cli::GlobalArgs;
use crate::config::{self, Config};
use crate::error::{Error, Result};

pub use status::cmd_status;
pub use update::{cmd_repair, cmd_update};
pub use verify::cmd_verify;

/// Exit code when the system-wide lock is unavailable.
pub const ERR_LOCK: i32 = 200;

/// Failure counts are capped below `ERR_LOCK` and the shell-reserved
/// codes.
pub const MAX_FAILURE_EXIT: usize = 199;

pub(crate) fn config_path(global: &GlobalArgs) -> PathBuf {
    if let Some(path) = &global.config_file {
        return path.clone();
    }
    if let Some(path) = std::env::var_os(config::ENV_CONFIG_OVERRIDE) {
        return PathBuf::from(path);
    }
    PathBuf::from(config::DEFAULT_CONFIG_FILE)
}

pub(crate) fn load_config(global: &GlobalArgs, maps: &[String]) -> Result<Config> {
    let path = config_path(global);
    tracing::debug!(path = %path.display(), "loading configuration");
    Config::load(&path, maps)
}

pub(crate) fn configuration_failed(err: &Error) -> i32 {
    tracing::error!(%err, "cannot run with this configuration");
    1
}

#[must_use]
pub(crate) fn failures_to_exit_code(failures: usize) -> i32 {
    i32::try_from(failures.min(MAX_FAILURE_EXIT)).unwrap_or(MAX_FAILURE_EXIT as i32)
}
