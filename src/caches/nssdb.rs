//! The `nssdb` backend: one indexed database per map, built by streaming
//! records into the system's `makedb` index builder.
//!
//! Each logical record is stored under up to three keys so the name-service
//! layer can look up by name (`.` prefix), by numeric id (`=` prefix), and
//! by enumeration index (`0` prefix). Shadow has no numeric id, so it gets
//! only the name and enumeration keys. Because `makedb` may synthesize
//! auxiliary keys of its own, verification checks that the written keys are
//! a subset of the stored keys rather than an exact match.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tempfile::{NamedTempFile, TempPath};

use crate::caches::{Cache, copy_compat_permissions};
use crate::config::Options;
use crate::error::{Error, Result};
use crate::maps::{Map, MapEntry, MapKind};
use crate::util::file_formats;

const DEFAULT_MAKEDB: &str = "/usr/bin/makedb";

pub struct NssDbCache {
    kind: MapKind,
    output_dir: PathBuf,
    makedb: PathBuf,
    etc_dir: PathBuf,
    temp: Option<TempPath>,
}

impl NssDbCache {
    pub fn new(options: &Options, kind: MapKind) -> Result<Self> {
        if !matches!(kind, MapKind::Passwd | MapKind::Group | MapKind::Shadow) {
            return Err(Error::UnsupportedMap(format!(
                "nssdb cache does not serve {kind} maps"
            )));
        }
        Ok(Self {
            kind,
            output_dir: PathBuf::from(options.get_str("dir").unwrap_or_else(|| ".".to_string())),
            makedb: PathBuf::from(
                options
                    .get_str("makedb")
                    .unwrap_or_else(|| DEFAULT_MAKEDB.to_string()),
            ),
            etc_dir: PathBuf::from("/etc"),
            temp: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_etc_dir(mut self, etc_dir: &Path) -> Self {
        self.etc_dir = etc_dir.to_path_buf();
        self
    }

    /// The db keys one record is stored under.
    fn db_keys(entry: &MapEntry, index: usize) -> Vec<String> {
        let mut keys = vec![format!(".{}", entry.key()), format!("0{index}")];
        match entry {
            MapEntry::Passwd(e) => keys.insert(1, format!("={}", e.uid)),
            MapEntry::Group(e) => keys.insert(1, format!("={}", e.gid)),
            _ => {}
        }
        keys
    }

    /// Dump all keys (and values) of a database via `makedb -u`.
    fn unload(&self, db_path: &Path) -> Result<Vec<(String, String)>> {
        let output = Command::new(&self.makedb)
            .arg("-u")
            .arg(db_path)
            .output()
            .map_err(|err| Error::from_io(err, "spawning makedb"))?;
        if !output.status.success() {
            return Err(Error::CacheInvalid(format!(
                "makedb -u {} failed: {}",
                db_path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut records = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if line.is_empty() {
                continue;
            }
            match line.split_once(' ') {
                Some((key, value)) => records.push((key.to_string(), value.to_string())),
                None => records.push((line.to_string(), String::new())),
            }
        }
        Ok(records)
    }

    fn temp_path(&self) -> Result<&Path> {
        self.temp.as_deref().ok_or_else(|| {
            Error::Io(std::io::Error::other("no write transaction in progress"))
        })
    }
}

impl Cache for NssDbCache {
    fn kind(&self) -> MapKind {
        self.kind
    }

    fn cache_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.db", self.kind.name()))
    }

    fn read(&self) -> Result<Map> {
        let db_path = self.cache_path();
        if !db_path.exists() {
            return Err(Error::CacheNotFound(db_path.display().to_string()));
        }

        let mut map = Map::new(self.kind);
        for (key, value) in self.unload(&db_path)? {
            // Every record appears under several keys; the name-keyed copy
            // is the canonical one.
            if !key.starts_with('.') {
                continue;
            }
            let entry = file_formats::parse_entry(self.kind, &value).map_err(|err| {
                Error::CacheInvalid(format!("{}: {err}", db_path.display()))
            })?;
            map.add(entry)?;
        }
        Ok(map)
    }

    fn begin(&mut self) -> Result<()> {
        let temp = NamedTempFile::with_prefix_in("nsscache-db-", &self.output_dir)
            .map_err(|err| Error::from_io(err, "creating database temp file"))?;
        self.temp = Some(temp.into_temp_path());
        Ok(())
    }

    fn write(&mut self, map: &mut Map) -> Result<BTreeSet<String>> {
        let temp_path = self.temp_path()?.to_path_buf();
        tracing::debug!(makedb = %self.makedb.display(), db = %temp_path.display(),
            "streaming records into makedb");

        let mut child = Command::new(&self.makedb)
            .arg("-")
            .arg(&temp_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| Error::from_io(err, "spawning makedb"))?;

        let mut written = BTreeSet::new();
        {
            let mut stdin = child.stdin.take().ok_or_else(|| {
                Error::Io(std::io::Error::other("makedb stdin unavailable"))
            })?;
            let mut index = 0usize;
            while let Some(entry) = map.pop() {
                let record = file_formats::serialize_entry(&entry);
                for key in Self::db_keys(&entry, index) {
                    writeln!(stdin, "{key} {record}")?;
                    written.insert(key);
                }
                index += 1;
            }
            tracing::debug!(records = index, keys = written.len(), "records written");
        }

        let output = child
            .wait_with_output()
            .map_err(|err| Error::from_io(err, "waiting for makedb"))?;
        if !output.status.success() {
            return Err(Error::CacheInvalid(format!(
                "makedb exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(written)
    }

    fn verify(&mut self, written: &BTreeSet<String>) -> Result<()> {
        let temp_path = self.temp_path()?.to_path_buf();
        let stored: BTreeSet<String> = self
            .unload(&temp_path)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        if stored.is_empty() && !written.is_empty() {
            self.rollback()?;
            return Err(Error::EmptyMap(format!(
                "{} database came back empty on verification",
                self.kind
            )));
        }
        if !written.is_subset(&stored) {
            let missing = written.difference(&stored).count();
            tracing::warn!(missing, "written keys missing from the on-disk database");
            self.rollback()?;
            return Err(Error::InvalidMap(format!(
                "verification failed for {}: {missing} keys missing from the database",
                self.kind
            )));
        }
        tracing::info!(map = %self.kind, "verify passed");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let temp = self.temp.take().ok_or_else(|| {
            Error::Io(std::io::Error::other("no write transaction to commit"))
        })?;
        copy_compat_permissions(self.kind, &temp, &self.etc_dir)?;
        temp.persist(self.cache_path())
            .map_err(|err| Error::from_io(err.error, "renaming database file"))?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some(temp) = self.temp.take() {
            drop(temp);
        }
        Ok(())
    }
}
