//! On-disk cache writers.
//!
//! A cache writer owns one (backend, map kind, mountpoint) triple and runs a
//! temp-file transaction: `begin` opens a temp file next to the final path
//! (same filesystem, so the rename in `commit` is atomic), `write` drains a
//! map into it, `verify` reads it back and compares key sets, `commit`
//! fsyncs, fixes ownership/mode, and renames into place. Readers of the
//! final path see either the old file or the new one, never a partial write.

mod files;
mod nssdb;

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::maps::{Map, MapKind};

pub use files::FilesCache;
pub use nssdb::NssDbCache;

pub trait Cache {
    fn kind(&self) -> MapKind;

    /// The final on-disk pathname of this cache.
    fn cache_path(&self) -> PathBuf;

    /// Load the current on-disk cache. `CacheNotFound` when the file is
    /// missing, `CacheInvalid` when it cannot be parsed.
    fn read(&self) -> Result<Map>;

    /// Open a fresh temp file in the cache directory.
    fn begin(&mut self) -> Result<()>;

    /// Drain `map` into the temp file, returning the set of keys written.
    /// The map is empty afterwards; verification reads a fresh copy back
    /// rather than duplicating the data in memory.
    fn write(&mut self, map: &mut Map) -> Result<BTreeSet<String>>;

    /// Re-read the temp file and compare its key set against what `write`
    /// reported. Rolls back and fails on any mismatch.
    fn verify(&mut self, written: &BTreeSet<String>) -> Result<()>;

    /// Flush, fix permissions, and atomically rename into place.
    fn commit(&mut self) -> Result<()>;

    /// Close and remove the temp file. A second rollback is a no-op.
    fn rollback(&mut self) -> Result<()>;

    /// Where the automount master map should point for this cache. Only
    /// meaningful for backends that serve automount maps.
    fn map_location(&self) -> Result<PathBuf> {
        Err(Error::UnsupportedMap(format!(
            "{} cache has no map location",
            self.kind()
        )))
    }

    /// The full transaction: begin, write, verify (unless forced), commit.
    /// Rolls back before reporting any failure.
    fn write_map(&mut self, mut map: Map, force_write: bool) -> Result<()> {
        self.begin()?;
        let written = match self.write(&mut map) {
            Ok(written) => written,
            Err(err) => {
                self.rollback()?;
                return Err(err);
            }
        };
        if !force_write {
            self.verify(&written)?;
        }
        self.commit()
    }
}

/// Explicit backend table; called instead of any import-time registry.
pub fn create(
    options: &Options,
    kind: MapKind,
    mountpoint: Option<&str>,
) -> Result<Box<dyn Cache>> {
    match options.name() {
        "files" => Ok(Box::new(FilesCache::new(options, kind, mountpoint))),
        "nssdb" => Ok(Box::new(NssDbCache::new(options, kind)?)),
        other => Err(Error::Configuration(format!("unknown cache {other:?}"))),
    }
}

/// Copy mode and ownership from the system's own copy of this map
/// (`/etc/passwd` for passwd, and so on) onto a freshly written cache file.
/// Falls back to 0644 when the system file is absent, 0444 for sshkey which
/// has no `/etc` counterpart. Ownership copying is best-effort: it needs
/// root, and a cache that is readable but root-owned is still servable.
pub(crate) fn copy_compat_permissions(kind: MapKind, target: &Path, etc_dir: &Path) -> Result<()> {
    let compat = etc_dir.join(kind.name());
    match fs::metadata(&compat) {
        Ok(meta) => {
            fs::set_permissions(target, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
            let uid = meta.uid();
            let gid = meta.gid();
            if let Err(err) = chown(target, uid, gid) {
                tracing::warn!(target = %target.display(), uid, gid, %err,
                    "could not copy cache file ownership");
            }
        }
        Err(_) => {
            let mode = if kind == MapKind::Sshkey { 0o444 } else { 0o644 };
            fs::set_permissions(target, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

#[allow(unsafe_code)]
fn chown(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::other("path contains a NUL byte"))?;
    // Safety: cpath is a valid NUL-terminated string for the duration of the
    // call.
    let rc = unsafe { libc::chown(cpath.as_ptr(), uid, gid) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
