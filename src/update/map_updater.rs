use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::caches::{self, Cache};
use crate::config::Options;
use crate::error::{Error, Result};
use crate::maps::{Map, MapEntry, MapKind};
use crate::sources::Source;
use crate::update::timestamps::TimestampPair;

/// Updater for the simple maps (passwd, group, shadow, netgroup, sshkey)
/// and for individual automount submaps.
pub struct MapUpdater {
    kind: MapKind,
    timestamps: TimestampPair,
}

impl MapUpdater {
    #[must_use]
    pub fn new(kind: MapKind, timestamp_dir: &Path, mountpoint: Option<&str>) -> Self {
        Self {
            kind,
            timestamps: TimestampPair::new(timestamp_dir, kind.name(), mountpoint),
        }
    }

    #[must_use]
    pub fn modify_timestamp(&self) -> Option<i64> {
        self.timestamps.read_modify()
    }

    #[must_use]
    pub fn update_timestamp(&self) -> Option<i64> {
        self.timestamps.read_update()
    }

    /// Run one refresh of `cache` from `source`.
    ///
    /// An incremental refresh falls through to a full one when there is no
    /// previous timestamp to fetch against, or when the local cache turns
    /// out to be missing, invalid, or empty.
    pub fn update_cache_from_source(
        &self,
        cache: &mut dyn Cache,
        source: &mut dyn Source,
        incremental: bool,
        force_write: bool,
        location: Option<&str>,
    ) -> Result<()> {
        let since = self.timestamps.read_modify();
        let mut incremental = incremental;
        if incremental && since.is_none() {
            tracing::info!(map = %self.kind, "missing previous timestamp, defaulting to a full sync");
            incremental = false;
        }

        if incremental {
            let new_map = fetch(source, self.kind, since, location)?;
            match self.incremental_update(cache, new_map) {
                Ok(()) => return Ok(()),
                Err(Error::CacheNotFound(_) | Error::CacheInvalid(_) | Error::EmptyMap(_)) => {
                    tracing::warn!(map = %self.kind, "local cache is invalid, faulting to a full sync");
                }
                Err(err) => return Err(err),
            }
        }

        let new_map = fetch(source, self.kind, None, location)?;
        self.full_update(cache, new_map, force_write)
    }

    /// Merge a conditionally fetched map into the existing cache.
    fn incremental_update(&self, cache: &mut dyn Cache, mut new_map: Map) -> Result<()> {
        let now = Utc::now().timestamp();

        if new_map.is_empty() {
            // Nothing changed upstream; record that the refresh ran.
            tracing::info!(map = %self.kind, "empty map on incremental update, skipping");
            return self.timestamps.write_update(Some(now));
        }

        tracing::debug!(map = %self.kind, "loading cache map, may be slow for large maps");
        let mut cache_map = cache.read()?;
        if cache_map.is_empty() {
            return Err(Error::EmptyMap(format!("{} cache is empty", self.kind)));
        }

        // The on-disk formats carry no timestamps; the stored pair is the
        // cache map's provenance, and is what protects against merging an
        // older snapshot over a newer cache.
        cache_map.set_modify_time(self.timestamps.read_modify());
        cache_map.set_update_time(self.timestamps.read_update());
        new_map.set_update_time(Some(now));

        let new_modify = new_map.modify_time();
        if cache_map.merge(new_map)? {
            cache.write_map(cache_map, false)?;
        } else {
            tracing::info!(map = %self.kind, "nothing new merged, returning");
        }
        self.timestamps.write_modify(new_modify)?;
        self.timestamps.write_update(Some(now))
    }

    /// Replace the cache wholesale with a freshly fetched map.
    pub fn full_update(
        &self,
        cache: &mut dyn Cache,
        new_map: Map,
        force_write: bool,
    ) -> Result<()> {
        if new_map.is_empty() && !force_write {
            return Err(Error::EmptyMap(format!(
                "source map empty during full update of {}, aborting; use --force-write to override",
                self.kind
            )));
        }

        let new_modify = new_map.modify_time();
        cache.write_map(new_map, force_write)?;
        self.timestamps.write_modify(new_modify)?;
        self.timestamps.write_update(Some(Utc::now().timestamp()))
    }
}

fn fetch(
    source: &mut dyn Source,
    kind: MapKind,
    since: Option<i64>,
    location: Option<&str>,
) -> Result<Map> {
    match location {
        Some(location) => source.get_automount_map(location, since),
        None => source.get_map(kind, since),
    }
}

/// Updater for the two-level automount hierarchy: fetch the master map,
/// refresh every submap it points to, then write the master itself with
/// its locations rewritten from source addresses to cache pathnames.
pub struct AutomountUpdater {
    timestamp_dir: PathBuf,
    cache_options: Options,
    local_master: bool,
}

impl AutomountUpdater {
    #[must_use]
    pub fn new(timestamp_dir: &Path, cache_options: &Options) -> Self {
        Self {
            timestamp_dir: timestamp_dir.to_path_buf(),
            cache_options: cache_options.clone(),
            local_master: cache_options.get_bool("local_automount_master"),
        }
    }

    /// Refresh every automount map. Submap failures are counted rather than
    /// fatal: each submap's own cache stays consistent, so the master is
    /// still written afterwards.
    pub fn update_from_source(
        &self,
        source: &mut dyn Source,
        incremental: bool,
        force_write: bool,
    ) -> Result<usize> {
        tracing::info!("retrieving automount master map");
        let master = source.get_automount_master_map()?;
        let master_modify = master.modify_time();

        // The administrator can pin the set of synchronized mountpoints by
        // managing the master map locally.
        let local_master = if self.local_master {
            tracing::info!("using local master map to determine maps to update");
            let cache = caches::create(&self.cache_options, MapKind::Automount, None)?;
            match cache.read() {
                Ok(map) => Some(map),
                Err(Error::CacheNotFound(_)) => {
                    tracing::warn!(
                        "local master map specified but no map found, no maps will update"
                    );
                    return Ok(1);
                }
                Err(err) => return Err(err),
            }
        } else {
            None
        };

        let mut failures = 0;
        let mut rewritten = Map::new(MapKind::Automount);
        rewritten.set_modify_time(master_modify);

        for entry in master.into_entries() {
            let MapEntry::Automount(mut entry) = entry else {
                continue;
            };
            let source_location = entry.location.clone();
            let mountpoint = entry.key.clone();
            tracing::debug!(%mountpoint, "looking at mount");

            let mut cache =
                caches::create(&self.cache_options, MapKind::Automount, Some(&mountpoint))?;
            // The written master must point at the cache file, not at the
            // source's own addressing (an LDAP DN, a URL path).
            entry.location = cache.map_location()?.display().to_string();

            let entry = MapEntry::Automount(entry);
            if let Some(local) = &local_master {
                if !local.contains(&entry) {
                    tracing::debug!(%mountpoint, "skipping, not in local master map");
                    continue;
                }
            }
            rewritten.add(entry)?;

            tracing::info!(%mountpoint, "updating mount");
            let updater =
                MapUpdater::new(MapKind::Automount, &self.timestamp_dir, Some(&mountpoint));
            if let Err(err) = updater.update_cache_from_source(
                cache.as_mut(),
                source,
                incremental,
                force_write,
                Some(&source_location),
            ) {
                tracing::warn!(%mountpoint, %err, "could not update automount map");
                failures += 1;
            }
        }

        if !self.local_master {
            let mut cache = caches::create(&self.cache_options, MapKind::Automount, None)?;
            let updater = MapUpdater::new(MapKind::Automount, &self.timestamp_dir, None);
            if let Err(err) = updater.full_update(cache.as_mut(), rewritten, force_write) {
                tracing::warn!(%err, "could not update automount master map");
                failures += 1;
            }
        }
        Ok(failures)
    }
}
