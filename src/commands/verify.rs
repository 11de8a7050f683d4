use std::path::Path;

use crate::caches::{self, Cache};
use crate::cli::{GlobalArgs, VerifyArgs};
use crate::commands::{configuration_failed, failures_to_exit_code, load_config};
use crate::config::{self, Config};
use crate::error::Error;
use crate::maps::MapKind;
use crate::nss;
use crate::sources::{self, AnySource};

const NSSWITCH: &str = "/etc/nsswitch.conf";

pub fn cmd_verify(args: &VerifyArgs, global: &GlobalArgs) -> i32 {
    let config = match load_config(global, &args.maps) {
        Ok(config) => config,
        Err(err) => return configuration_failed(&err),
    };

    tracing::info!("verifying program and system configuration");
    let (mut warnings, mut errors) =
        config::verify_configuration(&config, Path::new(NSSWITCH));

    tracing::info!("verifying data sources");
    errors += verify_sources(&config);

    tracing::info!("verifying data caches");
    let (cache_warnings, cache_errors) = verify_maps(&config);
    warnings += cache_warnings;
    errors += cache_errors;

    tracing::info!(warnings, errors, "verification result");
    if warnings + errors > 0 {
        tracing::info!("verification failed!");
    } else {
        tracing::info!("verification passed!");
    }
    failures_to_exit_code(warnings + errors)
}

/// Each configured source must be constructible and reachable. A
/// conditional fetch dated in the future should come back empty; entries
/// in that response mean the source's clock or filtering is broken.
fn verify_sources(config: &Config) -> usize {
    let mut errors = 0;
    for &kind in &config.maps {
        let Some(map_config) = config.map_config(kind) else {
            errors += 1;
            continue;
        };
        match sources::create(&map_config.source) {
            Ok(AnySource::Maps(mut source)) => match source.verify() {
                Ok(0) => {}
                Ok(entries) => {
                    tracing::error!(map = %kind, entries,
                        "source returned entries for a future-dated fetch");
                    errors += 1;
                }
                Err(err) => {
                    tracing::error!(map = %kind, %err, "source is unavailable");
                    errors += 1;
                }
            },
            // File-level sources are exercised only by a real transfer.
            Ok(AnySource::Files(_)) => {}
            Err(err) => {
                tracing::error!(map = %kind, %err, "cannot create source");
                errors += 1;
            }
        }
    }
    errors
}

/// Every cache entry should be resolvable through the OS name-service
/// view; the cache is expected to be a subset of it (other NSS backends
/// may add entries, never hide ours).
fn verify_maps(config: &Config) -> (usize, usize) {
    let mut warnings = 0;
    let mut errors = 0;

    for &kind in &config.maps {
        tracing::info!(map = %kind, "verifying map");
        if matches!(kind, MapKind::Netgroup | MapKind::Automount) {
            tracing::info!(map = %kind, "map does not support enumeration, skipping");
            continue;
        }

        let nss_map = match nss::get_map(kind) {
            Ok(map) => map,
            Err(Error::UnsupportedMap(_)) => {
                tracing::warn!(map = %kind, "verification of this map is unsupported");
                warnings += 1;
                continue;
            }
            Err(err) => {
                tracing::error!(map = %kind, %err, "cannot enumerate nss map");
                errors += 1;
                continue;
            }
        };
        tracing::debug!(entries = nss_map.len(), "built NSS map");

        let Some(map_config) = config.map_config(kind) else {
            errors += 1;
            continue;
        };
        let cache_map = match caches::create(&map_config.cache, kind, None)
            .and_then(|cache| cache.read())
        {
            Ok(map) => map,
            Err(err) => {
                tracing::error!(map = %kind, %err, "cache missing or unreadable");
                errors += 1;
                continue;
            }
        };
        tracing::debug!(entries = cache_map.len(), "built cache map");

        let missing = nss::missing_entries(&cache_map, &nss_map);
        if !missing.is_empty() {
            for name in &missing {
                tracing::info!(map = %kind, %name,
                    "entry is present in the cache but not available via NSS");
            }
            tracing::warn!(map = %kind, missing = missing.len(), "missing entries in map");
            errors += 1;
        }
    }
    (warnings, errors)
}
