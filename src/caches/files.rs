//! The `files` backend: one POSIX text file per map, as consumed by the
//! name-service `files`-style cache module.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::caches::{Cache, copy_compat_permissions};
use crate::config::Options;
use crate::error::{Error, Result};
use crate::maps::{Map, MapKind};
use crate::util::file_formats;

const DEFAULT_SUFFIX: &str = "cache";

pub struct FilesCache {
    kind: MapKind,
    output_dir: PathBuf,
    filename: String,
    mountpoint: Option<String>,
    etc_dir: PathBuf,
    temp: Option<NamedTempFile>,
}

impl FilesCache {
    #[must_use]
    pub fn new(options: &Options, kind: MapKind, mountpoint: Option<&str>) -> Self {
        let output_dir = PathBuf::from(options.get_str("dir").unwrap_or_else(|| ".".to_string()));
        let suffix = options
            .get_str("cache_filename_suffix")
            .unwrap_or_else(|| DEFAULT_SUFFIX.to_string());

        // Automount uses one file per mountpoint: the master map is
        // auto.master, /usr/local becomes auto.usr_local.
        let base = if kind == MapKind::Automount {
            match mountpoint {
                None => "auto.master".to_string(),
                Some(mountpoint) => format!(
                    "auto.{}",
                    mountpoint.trim_start_matches('/').replace('/', "_")
                ),
            }
        } else {
            kind.name().to_string()
        };
        let filename = if suffix.is_empty() {
            base
        } else {
            format!("{base}.{suffix}")
        };

        Self {
            kind,
            output_dir,
            filename,
            mountpoint: mountpoint.map(str::to_string),
            etc_dir: PathBuf::from("/etc"),
            temp: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_etc_dir(mut self, etc_dir: &Path) -> Self {
        self.etc_dir = etc_dir.to_path_buf();
        self
    }

    fn temp_mut(&mut self) -> Result<&mut NamedTempFile> {
        self.temp.as_mut().ok_or_else(|| {
            Error::Io(std::io::Error::other("no write transaction in progress"))
        })
    }

    fn read_file(&self, path: &Path) -> Result<Map> {
        let file = File::open(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::CacheNotFound(path.display().to_string())
            } else {
                Error::from_io(err, "opening cache file")
            }
        })?;
        let mut map =
            file_formats::parse_map(self.kind, BufReader::new(file)).map_err(|err| match err {
                Error::InvalidMap(msg) => {
                    Error::CacheInvalid(format!("{}: {msg}", path.display()))
                }
                other => other,
            })?;
        map.set_mountpoint(self.mountpoint.clone());
        Ok(map)
    }
}

impl Cache for FilesCache {
    fn kind(&self) -> MapKind {
        self.kind
    }

    fn cache_path(&self) -> PathBuf {
        self.output_dir.join(&self.filename)
    }

    fn read(&self) -> Result<Map> {
        self.read_file(&self.cache_path())
    }

    fn begin(&mut self) -> Result<()> {
        let temp = NamedTempFile::with_prefix_in("nsscache-cache-file-", &self.output_dir)
            .map_err(|err| Error::from_io(err, "creating cache temp file"))?;
        tracing::debug!(temp = %temp.path().display(), "opened temporary cache file");
        self.temp = Some(temp);
        Ok(())
    }

    fn write(&mut self, map: &mut Map) -> Result<BTreeSet<String>> {
        let temp = self.temp_mut()?;
        let mut written = BTreeSet::new();
        while let Some(entry) = map.pop() {
            writeln!(temp, "{}", file_formats::serialize_entry(&entry))?;
            written.insert(entry.key().to_string());
        }
        temp.flush()?;
        Ok(written)
    }

    fn verify(&mut self, written: &BTreeSet<String>) -> Result<()> {
        let temp_path = self.temp_mut()?.path().to_path_buf();
        tracing::debug!(temp = %temp_path.display(), "verification starting");

        let reread = match self.read_file(&temp_path) {
            Ok(map) => map,
            Err(err) => {
                self.rollback()?;
                return Err(err);
            }
        };
        if reread.is_empty() {
            self.rollback()?;
            return Err(Error::EmptyMap(format!(
                "{} cache came back empty on verification",
                self.kind
            )));
        }

        let cache_keys: BTreeSet<String> =
            reread.iter().map(|entry| entry.key().to_string()).collect();
        let missing: Vec<&String> = written.difference(&cache_keys).collect();
        let unexpected: Vec<&String> = cache_keys.difference(written).collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            tracing::warn!(
                missing = missing.len(),
                unexpected = unexpected.len(),
                "verification failed"
            );
            self.rollback()?;
            return Err(Error::InvalidMap(format!(
                "verification failed for {}: {} keys missing, {} unexpected",
                self.kind,
                missing.len(),
                unexpected.len()
            )));
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let temp = self.temp.take().ok_or_else(|| {
            Error::Io(std::io::Error::other("no write transaction to commit"))
        })?;
        temp.as_file().sync_all()?;
        copy_compat_permissions(self.kind, temp.path(), &self.etc_dir)?;

        let target = self.cache_path();
        tracing::debug!(temp = %temp.path().display(), target = %target.display(),
            "committing cache file");
        temp.persist(&target)
            .map_err(|err| Error::from_io(err.error, "renaming cache file"))?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some(temp) = self.temp.take() {
            tracing::debug!(temp = %temp.path().display(), "rolling back cache write");
            drop(temp);
        }
        Ok(())
    }

    fn map_location(&self) -> Result<PathBuf> {
        Ok(self.cache_path())
    }
}
