//! Updaters for file-level sources, which deliver a complete serialized
//! map file instead of parsed entries.
//!
//! The fetched file lands in a temp path next to the cache, is re-parsed
//! through the shared format readers so every record is validated, and then
//! goes through the normal cache transaction. The modify timestamp comes
//! from the committed file's mtime.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::Utc;

use crate::caches::{self, Cache};
use crate::config::Options;
use crate::error::{Error, Result};
use crate::maps::{Map, MapEntry, MapKind};
use crate::sources::FileSource;
use crate::update::timestamps::TimestampPair;
use crate::util::file_formats;

pub struct FileMapUpdater {
    kind: MapKind,
    timestamps: TimestampPair,
}

impl FileMapUpdater {
    #[must_use]
    pub fn new(kind: MapKind, timestamp_dir: &Path, mountpoint: Option<&str>) -> Self {
        Self {
            kind,
            timestamps: TimestampPair::new(timestamp_dir, kind.name(), mountpoint),
        }
    }

    pub fn update_cache_from_source(
        &self,
        cache: &mut dyn Cache,
        source: &mut dyn FileSource,
        force_write: bool,
        location: Option<&str>,
    ) -> Result<()> {
        let cache_path = cache.cache_path();
        let dir = cache_path.parent().ok_or_else(|| {
            Error::CacheInvalid(format!("cache path {} has no parent", cache_path.display()))
        })?;
        let prefix = cache_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".nsscache.tmp")
            .tempfile_in(dir)
            .map_err(|err| Error::from_io(err, "creating source temp file"))?;
        tracing::debug!(temp = %temp.path().display(), "temp source filename");

        source.get_file(self.kind, temp.path(), Some(&cache_path), location)?;
        let map = self.parse_file(temp.path())?;
        self.full_update_from_file(cache, map, force_write)
    }

    /// Parse and validate the fetched file. Any malformed record aborts.
    fn parse_file(&self, path: &Path) -> Result<Map> {
        let file = std::fs::File::open(path)?;
        file_formats::parse_map(self.kind, std::io::BufReader::new(file))
    }

    fn full_update_from_file(
        &self,
        cache: &mut dyn Cache,
        map: Map,
        force_write: bool,
    ) -> Result<()> {
        if map.is_empty() && !force_write {
            return Err(Error::EmptyMap(format!(
                "source file empty during full update of {}, aborting; use --force-write to override",
                self.kind
            )));
        }

        cache.write_map(map, force_write)?;

        // The file's own modification time is the best "newest change"
        // stand-in a whole-file transport can offer.
        let mtime = std::fs::metadata(cache.cache_path())?
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map_err(|_| Error::CacheInvalid("cache mtime predates the epoch".to_string()))?;
        self.timestamps
            .write_modify(Some(i64::try_from(mtime.as_secs()).unwrap_or(i64::MAX)))?;
        self.timestamps.write_update(Some(Utc::now().timestamp()))
    }
}

/// Automount over a file-level source: fetch the master file, refresh each
/// submap it names, then write the master with its locations rewritten
/// from the source's addressing to the local cache pathnames, so the
/// name-service layer resolves mountpoints against the caches.
pub struct FileAutomountUpdater {
    timestamp_dir: PathBuf,
    cache_options: Options,
    local_master: bool,
}

impl FileAutomountUpdater {
    #[must_use]
    pub fn new(timestamp_dir: &Path, cache_options: &Options) -> Self {
        Self {
            timestamp_dir: timestamp_dir.to_path_buf(),
            cache_options: cache_options.clone(),
            local_master: cache_options.get_bool("local_automount_master"),
        }
    }

    /// Fetch the master file into a temp path next to its cache and parse
    /// it; the cache itself is only written after the submaps succeed.
    fn fetch_master(
        &self,
        source: &mut dyn FileSource,
        master_cache: &dyn Cache,
    ) -> Result<Map> {
        tracing::info!("retrieving automount master map");
        let cache_path = master_cache.cache_path();
        let dir = cache_path.parent().ok_or_else(|| {
            Error::CacheInvalid(format!("cache path {} has no parent", cache_path.display()))
        })?;
        let temp = tempfile::Builder::new()
            .prefix("auto.master")
            .suffix(".nsscache.tmp")
            .tempfile_in(dir)
            .map_err(|err| Error::from_io(err, "creating source temp file"))?;

        source.get_file(MapKind::Automount, temp.path(), Some(&cache_path), None)?;
        let file = std::fs::File::open(temp.path())?;
        file_formats::parse_map(MapKind::Automount, std::io::BufReader::new(file))
    }

    pub fn update_from_source(
        &self,
        source: &mut dyn FileSource,
        force_write: bool,
    ) -> Result<usize> {
        let mut master_cache = caches::create(&self.cache_options, MapKind::Automount, None)?;

        // The administrator can pin the set of synchronized mountpoints by
        // managing the master map locally.
        let master = if self.local_master {
            tracing::info!("using local master map to determine maps to update");
            match master_cache.read() {
                Ok(map) => map,
                Err(Error::CacheNotFound(_)) => {
                    tracing::warn!(
                        "local master map specified but no map found, no maps will update"
                    );
                    return Ok(1);
                }
                Err(err) => return Err(err),
            }
        } else {
            self.fetch_master(source, master_cache.as_ref())?
        };

        let mut failures = 0;
        let mut rewritten = Map::new(MapKind::Automount);
        for entry in master.into_entries() {
            let MapEntry::Automount(mut entry) = entry else {
                continue;
            };
            // The master names submaps by pathname; the source publishes
            // them under the corresponding basename.
            let location = entry
                .location
                .rsplit('/')
                .next()
                .unwrap_or(&entry.location)
                .to_string();
            let mountpoint = entry.key.clone();
            tracing::debug!(%mountpoint, %location, "looking at mountpoint");

            let mut cache =
                caches::create(&self.cache_options, MapKind::Automount, Some(&mountpoint))?;
            // The written master must point at the cache file, not at
            // wherever the source publishes the submap.
            entry.location = cache.map_location()?.display().to_string();
            rewritten.add(MapEntry::Automount(entry))?;

            let updater =
                FileMapUpdater::new(MapKind::Automount, &self.timestamp_dir, Some(&mountpoint));
            if let Err(err) = updater.update_cache_from_source(
                cache.as_mut(),
                source,
                force_write,
                Some(&location),
            ) {
                tracing::warn!(%mountpoint, %err, "could not update automount map");
                failures += 1;
            }
        }

        if !self.local_master {
            let updater = FileMapUpdater::new(MapKind::Automount, &self.timestamp_dir, None);
            if let Err(err) =
                updater.full_update_from_file(master_cache.as_mut(), rewritten, force_write)
            {
                tracing::warn!(%err, "could not update automount master map");
                failures += 1;
            }
        }
        Ok(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Value;
    use std::fs;
    use tempfile::TempDir;

    /// A file source serving canned bytes per map kind / location.
    struct FakeFileSource {
        payloads: Vec<(Option<String>, Vec<u8>)>,
    }

    impl FileSource for FakeFileSource {
        fn name(&self) -> &'static str {
            "fake-files"
        }

        fn get_file(
            &mut self,
            _kind: MapKind,
            dst: &Path,
            _current: Option<&Path>,
            location: Option<&str>,
        ) -> Result<()> {
            let at = self
                .payloads
                .iter()
                .position(|(l, _)| l.as_deref() == location)
                .ok_or_else(|| {
                    Error::SourceUnavailable(format!("no payload for {location:?}"))
                })?;
            fs::write(dst, &self.payloads.remove(at).1)?;
            Ok(())
        }
    }

    fn files_options(dir: &Path) -> Options {
        let mut options = Options::new();
        options.set_str("name", "files");
        options.insert("dir", Value::Str(dir.display().to_string()));
        options
    }

    #[test]
    fn file_update_validates_and_commits() {
        let dir = TempDir::new().unwrap();
        let ts_dir = TempDir::new().unwrap();
        let mut cache =
            caches::create(&files_options(dir.path()), MapKind::Passwd, None).unwrap();
        let mut source = FakeFileSource {
            payloads: vec![(None, b"root:x:0:0::/root:/bin/bash\n".to_vec())],
        };

        let updater = FileMapUpdater::new(MapKind::Passwd, ts_dir.path(), None);
        updater
            .update_cache_from_source(cache.as_mut(), &mut source, false, None)
            .unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("passwd.cache")).unwrap(),
            "root:x:0:0::/root:/bin/bash\n"
        );
        assert!(ts_dir.path().join("timestamp-passwd-modify").exists());
        assert!(ts_dir.path().join("timestamp-passwd-update").exists());
    }

    #[test]
    fn malformed_records_abort_before_any_write() {
        let dir = TempDir::new().unwrap();
        let ts_dir = TempDir::new().unwrap();
        let mut cache =
            caches::create(&files_options(dir.path()), MapKind::Passwd, None).unwrap();
        let mut source = FakeFileSource {
            payloads: vec![(None, b"root:x:0:0::/root:/bin/bash\nbroken line\n".to_vec())],
        };

        let updater = FileMapUpdater::new(MapKind::Passwd, ts_dir.path(), None);
        assert!(matches!(
            updater.update_cache_from_source(cache.as_mut(), &mut source, false, None),
            Err(Error::InvalidMap(_))
        ));
        assert!(!dir.path().join("passwd.cache").exists());
        assert!(!ts_dir.path().join("timestamp-passwd-modify").exists());
    }

    #[test]
    fn empty_file_is_rejected_without_force_write() {
        let dir = TempDir::new().unwrap();
        let ts_dir = TempDir::new().unwrap();
        let mut cache =
            caches::create(&files_options(dir.path()), MapKind::Passwd, None).unwrap();
        let mut source = FakeFileSource {
            payloads: vec![(None, Vec::new())],
        };

        let updater = FileMapUpdater::new(MapKind::Passwd, ts_dir.path(), None);
        assert!(matches!(
            updater.update_cache_from_source(cache.as_mut(), &mut source, false, None),
            Err(Error::EmptyMap(_))
        ));
    }

    #[test]
    fn automount_master_drives_submap_fetches_and_is_rewritten() {
        let dir = TempDir::new().unwrap();
        let ts_dir = TempDir::new().unwrap();

        let master_body = b"/home /exports/auto.home\n".to_vec();
        let home_body = b"alice -tcp server:/export/alice\n".to_vec();
        let mut source = FakeFileSource {
            payloads: vec![
                (None, master_body),
                (Some("auto.home".to_string()), home_body),
            ],
        };

        let updater = FileAutomountUpdater::new(ts_dir.path(), &files_options(dir.path()));
        let failures = updater.update_from_source(&mut source, false).unwrap();
        assert_eq!(failures, 0);

        // The written master points at the submap cache, not at the
        // source's path for it.
        let home_path = dir.path().join("auto.home.cache");
        assert_eq!(
            fs::read_to_string(dir.path().join("auto.master.cache")).unwrap(),
            format!("/home {}\n", home_path.display())
        );
        assert_eq!(
            fs::read_to_string(&home_path).unwrap(),
            "alice -tcp server:/export/alice\n"
        );
        assert!(ts_dir.path().join("timestamp-automount-modify").exists());
        assert!(
            ts_dir
                .path()
                .join("timestamp-automount-home-modify")
                .exists()
        );
    }

    #[test]
    fn automount_local_master_is_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let ts_dir = TempDir::new().unwrap();

        let home_path = dir.path().join("auto.home.cache");
        let master_line = format!("/home {}\n", home_path.display());
        fs::write(dir.path().join("auto.master.cache"), &master_line).unwrap();

        let mut source = FakeFileSource {
            payloads: vec![(
                Some("auto.home.cache".to_string()),
                b"alice server:/export/alice\n".to_vec(),
            )],
        };

        let mut cache_options = files_options(dir.path());
        cache_options.set_str("local_automount_master", "yes");
        let updater = FileAutomountUpdater::new(ts_dir.path(), &cache_options);
        let failures = updater.update_from_source(&mut source, false).unwrap();
        assert_eq!(failures, 0);

        assert_eq!(
            fs::read_to_string(&home_path).unwrap(),
            "alice server:/export/alice\n"
        );
        // The administrator manages the master; it must stay as written.
        assert_eq!(
            fs::read_to_string(dir.path().join("auto.master.cache")).unwrap(),
            master_line
        );
    }
}
