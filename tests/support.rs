use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Locate the binary under test.
pub fn nsscache_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_nsscache"))
}

pub struct CommandResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run the nsscache binary with the given arguments.
///
/// # Errors
///
/// Returns an error if the binary cannot be spawned.
pub fn run_nsscache(args: &[&str]) -> Result<CommandResult, Box<dyn Error>> {
    let output: Output = Command::new(nsscache_bin()).args(args).output()?;
    Ok(CommandResult {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Lay out a minimal runtime directory: cache dir, timestamp dir, and a
/// configuration file pointing at them. Returns the config path.
///
/// # Errors
///
/// Returns an error if any of the files cannot be written.
pub fn write_runtime_config(
    root: &Path,
    maps: &str,
    extra: &str,
) -> Result<PathBuf, Box<dyn Error>> {
    let cache_dir = root.join("cache");
    let timestamp_dir = root.join("timestamps");
    fs::create_dir_all(&cache_dir)?;
    fs::create_dir_all(&timestamp_dir)?;

    let config_path = root.join("nsscache.conf");
    let body = format!(
        "[DEFAULT]\n\
         source = ldap\n\
         cache = files\n\
         maps = {maps}\n\
         timestamp_dir = {}\n\
         lockfile = {}\n\
         ldap_uri = ldap://ldap.example.com\n\
         ldap_base = ou=people,dc=example,dc=com\n\
         files_dir = {}\n\
         {extra}\n",
        timestamp_dir.display(),
        root.join("lock").display(),
        cache_dir.display(),
    );
    fs::write(&config_path, body)?;
    Ok(config_path)
}
