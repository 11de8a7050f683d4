//! Cross-process exclusion via a pid-file with an advisory lock.
//!
//! The kernel drops the advisory lock when the holder dies, so stale locks
//! cannot wedge updates. The pid is stored in the file purely so other
//! tooling can see who holds (or last held) it; the file is deliberately
//! not removed on release.
//!
//! A forced takeover reads the stored pid, checks `/proc/<pid>/cmdline` for
//! this program's name (a reused pid must not be signaled), sends SIGTERM,
//! deletes the file, and retries the lock exactly once. Killing the holder
//! keeps a half-finished peer from committing over our changes after we
//! are done.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{Error, Result};

const DEFAULT_STATE_DIR: &str = "/var/run";
const PROC_DIR: &str = "/proc";
const PROGRAM_NAME: &str = "nsscache";

pub struct PidFile {
    filename: PathBuf,
    file: Option<File>,
    locked: bool,
    pid: u32,
    proc_dir: PathBuf,
    program_name: String,
}

impl PidFile {
    #[must_use]
    pub fn new(filename: Option<PathBuf>) -> Self {
        let filename =
            filename.unwrap_or_else(|| Path::new(DEFAULT_STATE_DIR).join(PROGRAM_NAME));
        tracing::debug!(filename = %filename.display(), "using lock file");
        Self {
            filename,
            file: None,
            locked: false,
            pid: std::process::id(),
            proc_dir: PathBuf::from(PROC_DIR),
            program_name: PROGRAM_NAME.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_proc_dir(mut self, proc_dir: &Path) -> Self {
        self.proc_dir = proc_dir.to_path_buf();
        self
    }

    /// Open the pid file without truncating: whether it is locked by
    /// someone else is not known yet.
    fn open(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.filename)
            .map_err(|err| Error::from_io(err, "opening lock file"))?;
        fs::set_permissions(&self.filename, fs::Permissions::from_mode(0o644))?;
        self.file = Some(file);
        Ok(())
    }

    /// Try to take the lock. With `force`, a live holder is terminated and
    /// the lock retaken.
    pub fn lock(&mut self, force: bool) -> Result<bool> {
        if self.file.is_none() {
            match self.open() {
                Err(Error::PermissionDenied(why)) => {
                    tracing::warn!(%why, "permission denied opening lock file");
                    return Ok(false);
                }
                other => other?,
            }
        }

        let acquired = self.try_flock()?;
        if acquired {
            let file = self.file.as_mut().expect("lock file is open");
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            writeln!(file, "{}", self.pid)?;
            file.flush()?;
            tracing::debug!(filename = %self.filename.display(), "successfully locked");
            self.locked = true;
            return Ok(true);
        }

        if !force {
            tracing::debug!(filename = %self.filename.display(), "already locked");
            return Ok(false);
        }

        tracing::debug!("retrying lock");
        self.send_term()?;
        self.clear_lock()?;
        // Only once, or a stubborn holder would recurse forever.
        self.lock(false)
    }

    #[allow(unsafe_code)]
    fn try_flock(&self) -> Result<bool> {
        let file = self.file.as_ref().expect("lock file is open");
        // Safety: the fd is valid for the lifetime of `file`.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EWOULDBLOCK | libc::EACCES) => Ok(false),
            _ => Err(Error::Io(err)),
        }
    }

    /// SIGTERM the pid stored in the lock file, but only when that process
    /// still looks like this program.
    #[allow(unsafe_code)]
    fn send_term(&mut self) -> Result<()> {
        let file = self.file.as_mut().expect("lock file is open");
        file.seek(SeekFrom::Start(0))?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;

        let Ok(pid) = content.trim().parse::<u32>() else {
            tracing::warn!(content = %content.trim(),
                "not sending TERM, could not parse pid file content");
            return Ok(());
        };
        tracing::debug!(pid, "retrieved pid");

        if !self.holder_matches(pid) {
            return Ok(());
        }

        tracing::debug!(pid, "sending SIGTERM");
        // Safety: plain signal send; failure (e.g. the holder exited
        // between the check and the kill) is acceptable.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        Ok(())
    }

    /// Does `/proc/<pid>/cmdline` exist and name this program?
    fn holder_matches(&self, pid: u32) -> bool {
        let cmdline_path = self.proc_dir.join(pid.to_string()).join("cmdline");
        let cmdline = match fs::read(&cmdline_path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => {
                tracing::debug!(pid, "process does not exist, skipping signal");
                return false;
            }
        };
        let pattern =
            Regex::new(&format!(".*{}", regex::escape(&self.program_name))).expect("static regex");
        if pattern.is_match(&cmdline) {
            true
        } else {
            tracing::debug!(pid, "process is running but is not {}, skipping signal",
                self.program_name);
            false
        }
    }

    /// Delete the pid file so a fresh one (and a fresh lock) can be taken.
    fn clear_lock(&mut self) -> Result<()> {
        tracing::debug!(filename = %self.filename.display(), "clearing old pid file");
        self.file = None;
        fs::remove_file(&self.filename)?;
        Ok(())
    }

    #[must_use]
    pub const fn locked(&self) -> bool {
        self.locked
    }

    /// Release the advisory lock, keeping the pid file in place.
    #[allow(unsafe_code)]
    pub fn release(&mut self) {
        if let Some(file) = &self.file {
            // Safety: the fd is valid; unlocking cannot fail meaningfully.
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        self.locked = false;
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if self.locked {
            self.release();
        }
    }
}
