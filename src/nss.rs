//! The operating system's own view of the account maps, for the `verify`
//! command: every cache entry is expected to be resolvable through NSS.
//!
//! Enumeration shells out to `getent`, which walks whatever backends
//! nsswitch.conf configures, and parses the output with the same readers
//! the caches use.

use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};
use crate::maps::{Map, MapEntry, MapKind};
use crate::util::file_formats;

const GETENT: &str = "/usr/bin/getent";

/// Enumerate one map through the name-service layer.
pub fn get_map(kind: MapKind) -> Result<Map> {
    get_map_with_getent(Path::new(GETENT), kind)
}

pub fn get_map_with_getent(getent: &Path, kind: MapKind) -> Result<Map> {
    if !matches!(kind, MapKind::Passwd | MapKind::Group | MapKind::Shadow) {
        return Err(Error::UnsupportedMap(format!(
            "{kind} cannot be enumerated through nss"
        )));
    }

    let output = Command::new(getent)
        .arg(kind.name())
        .output()
        .map_err(|err| Error::from_io(err, "spawning getent"))?;
    // getent exits 2 on an empty enumeration, which is not an error here.
    let empty_enumeration = output.status.code() == Some(2) && output.stdout.is_empty();
    if !output.status.success() && !empty_enumeration {
        return Err(Error::SourceUnavailable(format!(
            "getent {} failed: {}",
            kind.name(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    file_formats::parse_map(kind, output.stdout.as_slice())
}

/// Count cache entries not visible through NSS.
#[must_use]
pub fn missing_entries(cache_map: &Map, nss_map: &Map) -> Vec<String> {
    cache_map
        .iter()
        .filter(|entry| !nss_map.contains(entry))
        .map(|entry| entry.key().to_string())
        .collect()
}
