//! Exercises the compiled binary: argument handling, configuration
//! errors, the status report, and cross-process lock contention.

mod support;

use std::fs;

use tempfile::TempDir;

use nsscache::lock::PidFile;
use support::{run_nsscache, write_runtime_config};

#[test]
fn no_arguments_prints_usage() {
    let result = run_nsscache(&[]).unwrap();
    assert_ne!(result.code, 0);
    assert!(result.stderr.contains("Usage"));
}

#[test]
fn missing_config_file_fails_with_exit_one() {
    let result = run_nsscache(&["update", "-c", "/nonexistent/nsscache.conf"]).unwrap();
    assert_eq!(result.code, 1);
}

#[test]
fn unknown_map_filter_fails_with_exit_one() {
    let dir = TempDir::new().unwrap();
    let config = write_runtime_config(dir.path(), "passwd", "").unwrap();
    let result = run_nsscache(&["update", "-c", config.to_str().unwrap(), "-m", "hosts"]).unwrap();
    assert_eq!(result.code, 1);
}

#[test]
fn status_reports_epoch_timestamps() {
    let dir = TempDir::new().unwrap();
    let config = write_runtime_config(dir.path(), "passwd", "").unwrap();
    fs::write(
        dir.path().join("timestamps/timestamp-passwd-modify"),
        "1970-01-01T00:00:02Z\n",
    )
    .unwrap();

    let result =
        run_nsscache(&["status", "-c", config.to_str().unwrap(), "--epoch"]).unwrap();
    assert_eq!(result.code, 0, "stderr: {}", result.stderr);
    assert!(result.stdout.contains("NSS map: passwd"));
    assert!(result.stdout.contains("last-modify-timestamp: 2"));
    // No update has ever run.
    assert!(result.stdout.contains("last-update-timestamp: 0"));
}

#[test]
fn status_honours_a_custom_template() {
    let dir = TempDir::new().unwrap();
    let config = write_runtime_config(dir.path(), "passwd", "").unwrap();

    let result = run_nsscache(&[
        "status",
        "-c",
        config.to_str().unwrap(),
        "--template",
        "%(map)s/%(key)s=%(value)s",
        "--epoch",
    ])
    .unwrap();
    assert_eq!(result.code, 0);
    assert!(result.stdout.contains("passwd/last-modify-timestamp=0"));
}

#[test]
fn held_lock_makes_update_exit_with_err_lock() {
    let dir = TempDir::new().unwrap();
    let config = write_runtime_config(dir.path(), "passwd", "").unwrap();

    let mut lock = PidFile::new(Some(dir.path().join("lock")));
    assert!(lock.lock(false).unwrap());

    let result = run_nsscache(&["update", "-c", config.to_str().unwrap()]).unwrap();
    assert_eq!(result.code, 200, "stderr: {}", result.stderr);

    lock.release();
}

#[test]
fn update_with_unreachable_source_counts_the_failure() {
    let dir = TempDir::new().unwrap();
    // One retry and no delay keeps the failing-bind path fast.
    let config = write_runtime_config(
        dir.path(),
        "passwd",
        "ldap_uri = ldap://127.0.0.1:1\nldap_retry_max = 1\nldap_retry_delay = 0",
    )
    .unwrap();

    let result = run_nsscache(&["update", "-c", config.to_str().unwrap()]).unwrap();
    assert_eq!(result.code, 1, "stderr: {}", result.stderr);
    assert!(!dir.path().join("cache/passwd.cache").exists());
}
