use std::thread;
use std::time::Duration;

use crate::caches;
use crate::cli::{GlobalArgs, RepairArgs, UpdateArgs};
use crate::commands::{
    ERR_LOCK, configuration_failed, failures_to_exit_code, load_config,
};
use crate::config::{Config, MapConfig};
use crate::error::Result;
use crate::lock::PidFile;
use crate::maps::MapKind;
use crate::sources::{self, AnySource};
use crate::update::{AutomountUpdater, FileAutomountUpdater, FileMapUpdater, MapUpdater};

pub fn cmd_update(args: &UpdateArgs, global: &GlobalArgs) -> i32 {
    let config = match load_config(global, &args.maps) {
        Ok(config) => config,
        Err(err) => return configuration_failed(&err),
    };

    if args.full {
        tracing::debug!("performing FULL update of caches");
    } else {
        tracing::debug!("performing INCREMENTAL update of caches");
    }

    if let Some(delay) = args.sleep {
        tracing::info!(delay, "delaying before executing");
        thread::sleep(Duration::from_secs(delay));
    }

    update_maps(&config, !args.full, args.force_write, args.force_lock)
}

pub fn cmd_repair(args: &RepairArgs, global: &GlobalArgs) -> i32 {
    let config = match load_config(global, &args.maps) {
        Ok(config) => config,
        Err(err) => return configuration_failed(&err),
    };

    // Sanity-check the configuration the way verify does, then rebuild
    // everything from scratch.
    let (warnings, errors) =
        crate::config::verify_configuration(&config, std::path::Path::new("/etc/nsswitch.conf"));
    tracing::info!(warnings, errors, "verification result");
    if errors > 0 {
        return failures_to_exit_code(errors);
    }

    update_maps(&config, false, false, false)
}

/// Refresh every configured map under the system-wide lock, accumulating
/// per-map failures into the exit code.
pub(crate) fn update_maps(
    config: &Config,
    incremental: bool,
    force_write: bool,
    force_lock: bool,
) -> i32 {
    let mut lock = PidFile::new(config.lockfile.clone());
    match lock.lock(force_lock) {
        Ok(true) => {}
        Ok(false) => {
            tracing::error!("failed to acquire lock, aborting");
            return ERR_LOCK;
        }
        Err(err) => {
            tracing::error!(%err, "failed to acquire lock, aborting");
            return ERR_LOCK;
        }
    }

    let mut failures = 0usize;
    for &kind in &config.maps {
        let Some(map_config) = config.map_config(kind) else {
            tracing::error!(map = %kind, "no such map name defined in config");
            failures += 1;
            continue;
        };

        if incremental {
            tracing::info!(map = %kind, "updating and verifying cache");
        } else {
            tracing::info!(map = %kind, "rebuilding and verifying cache");
        }

        match refresh_map(config, kind, map_config, incremental, force_write) {
            Ok(sub_failures) => failures += sub_failures,
            Err(err) => {
                tracing::error!(map = %kind, %err, "could not update map, skipping");
                failures += 1;
            }
        }
    }

    lock.release();
    failures_to_exit_code(failures)
}

/// One map's refresh: build the source and cache from this map's options
/// and hand them to the updater variant the source calls for.
fn refresh_map(
    config: &Config,
    kind: MapKind,
    map_config: &MapConfig,
    incremental: bool,
    force_write: bool,
) -> Result<usize> {
    match sources::create(&map_config.source)? {
        AnySource::Maps(mut source) => {
            if kind == MapKind::Automount {
                let updater = AutomountUpdater::new(&config.timestamp_dir, &map_config.cache);
                updater.update_from_source(source.as_mut(), incremental, force_write)
            } else {
                let mut cache = caches::create(&map_config.cache, kind, None)?;
                let updater = MapUpdater::new(kind, &config.timestamp_dir, None);
                updater.update_cache_from_source(
                    cache.as_mut(),
                    source.as_mut(),
                    incremental,
                    force_write,
                    None,
                )?;
                Ok(0)
            }
        }
        AnySource::Files(mut source) => {
            if kind == MapKind::Automount {
                let updater = FileAutomountUpdater::new(&config.timestamp_dir, &map_config.cache);
                updater.update_from_source(source.as_mut(), force_write)
            } else {
                let mut cache = caches::create(&map_config.cache, kind, None)?;
                let updater = FileMapUpdater::new(kind, &config.timestamp_dir, None);
                updater.update_cache_from_source(
                    cache.as_mut(),
                    source.as_mut(),
                    force_write,
                    None,
                )?;
                Ok(0)
            }
        }
    }
}
