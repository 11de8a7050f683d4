//! The per-map timestamp files driving incremental updates.
//!
//! Two files per (map, mountpoint): `timestamp-<map>-modify` holds the
//! newest entry modification committed to the cache, `timestamp-<map>-update`
//! the wall clock of the last successful refresh. Format is exactly one
//! ASCII line of `YYYY-MM-DDThh:mm:ssZ` (UTC, second resolution) plus a
//! newline, mode 0644.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, TimeZone, Utc};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Seconds a stored timestamp may run ahead of the clock before a read
/// returns now instead. Protects forward progress against clock jumps and
/// bad source data.
const MAX_FUTURE_SECS: i64 = 3600;

/// Pathnames of the modify/update pair for one map, with the automount
/// mountpoint folded into the name (`/usr/local` becomes `usr_local`).
#[derive(Debug, Clone)]
pub struct TimestampPair {
    modify_file: PathBuf,
    update_file: PathBuf,
}

impl TimestampPair {
    #[must_use]
    pub fn new(timestamp_dir: &Path, map_name: &str, mountpoint: Option<&str>) -> Self {
        let prefix = match mountpoint {
            None => format!("timestamp-{map_name}"),
            Some(mountpoint) => {
                let sanitized = mountpoint.trim_start_matches('/').replace('/', "_");
                format!("timestamp-{map_name}-{sanitized}")
            }
        };
        Self {
            modify_file: timestamp_dir.join(format!("{prefix}-modify")),
            update_file: timestamp_dir.join(format!("{prefix}-update")),
        }
    }

    #[must_use]
    pub fn read_modify(&self) -> Option<i64> {
        read_timestamp(&self.modify_file)
    }

    #[must_use]
    pub fn read_update(&self) -> Option<i64> {
        read_timestamp(&self.update_file)
    }

    pub fn write_modify(&self, ts: Option<i64>) -> Result<()> {
        write_timestamp(&self.modify_file, ts)
    }

    pub fn write_update(&self, ts: Option<i64>) -> Result<()> {
        write_timestamp(&self.update_file, ts)
    }
}

/// Read a timestamp file, returning `None` when absent, unreadable, or
/// unparsable. A value at least an hour in the future reads as now.
#[must_use]
pub fn read_timestamp(path: &Path) -> Option<i64> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), %err, "error reading timestamp file");
            }
            return None;
        }
    };

    let trimmed = content.trim();
    let parsed = match NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_FORMAT) {
        Ok(naive) => naive.and_utc().timestamp(),
        Err(err) => {
            tracing::error!(path = %path.display(), value = trimmed, %err,
                "cannot parse timestamp file");
            return None;
        }
    };

    let now = Utc::now().timestamp();
    if parsed > now {
        tracing::warn!(path = %path.display(), value = trimmed, "timestamp is in the future");
        if parsed - now >= MAX_FUTURE_SECS {
            tracing::info!("resetting timestamp to now");
            return Some(now);
        }
    }
    Some(parsed)
}

/// Write a timestamp file transactionally: temp file in the same directory,
/// fsync, chmod 0644, atomic rename. An unset timestamp writes nothing.
pub fn write_timestamp(path: &Path, ts: Option<i64>) -> Result<()> {
    let Some(ts) = ts else {
        return Ok(());
    };

    let dir = path.parent().ok_or_else(|| {
        Error::Configuration(format!("timestamp path {} has no parent", path.display()))
    })?;
    let when = Utc
        .timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| Error::InvalidMap(format!("timestamp {ts} out of range")))?;

    let mut temp = NamedTempFile::with_prefix_in("nsscache-update-", dir)
        .map_err(|err| Error::from_io(err, "creating timestamp temp file"))?;
    writeln!(temp, "{}", when.format(TIMESTAMP_FORMAT))?;
    temp.as_file().sync_all()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o644))?;
    temp.persist(path)
        .map_err(|err| Error::from_io(err.error, "renaming timestamp file"))?;

    tracing::debug!(path = %path.display(), ts, "wrote timestamp");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timestamp-passwd-modify");
        write_timestamp(&path, Some(2)).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "1970-01-01T00:00:02Z\n"
        );
        assert_eq!(read_timestamp(&path), Some(2));

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn missing_file_reads_as_unset() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_timestamp(&dir.path().join("nope")), None);
    }

    #[test]
    fn garbage_reads_as_unset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timestamp-passwd-modify");
        fs::write(&path, "not a timestamp\n").unwrap();
        assert_eq!(read_timestamp(&path), None);
    }

    #[test]
    fn far_future_reads_as_now() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timestamp-passwd-modify");
        let now = Utc::now().timestamp();
        write_timestamp(&path, Some(now + 7200)).unwrap();
        let read = read_timestamp(&path).unwrap();
        assert!(read >= now && read < now + 60);
    }

    #[test]
    fn near_future_is_returned_as_is() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timestamp-passwd-modify");
        let soon = Utc::now().timestamp() + 60;
        write_timestamp(&path, Some(soon)).unwrap();
        assert_eq!(read_timestamp(&path), Some(soon));
    }

    #[test]
    fn unset_timestamp_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timestamp-passwd-modify");
        write_timestamp(&path, None).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn mountpoint_is_sanitized_into_the_name() {
        let dir = TempDir::new().unwrap();
        let pair = TimestampPair::new(dir.path(), "automount", Some("/usr/local"));
        pair.write_modify(Some(5)).unwrap();
        assert!(
            dir.path()
                .join("timestamp-automount-usr_local-modify")
                .exists()
        );
    }
}
