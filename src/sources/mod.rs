//! Sources fetch maps (or whole files) from the authoritative directory.
//!
//! A map source normalizes pagination, conditional fetches, schema mapping,
//! and retry behavior for one wire protocol, and hands the updater a
//! populated [`Map`]. A file source retrieves a complete serialized map
//! file instead; those feed the file-level updater.

mod consul;
mod gcs;
mod http;
mod ldap;
mod s3;
mod scim;
mod zsync;

use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::maps::{Map, MapKind};

pub use consul::ConsulSource;
pub use gcs::GcsSource;
pub use http::HttpFilesSource;
pub use ldap::LdapSource;
pub use s3::S3Source;
pub use scim::ScimSource;
pub use zsync::ZsyncSource;

pub const DEFAULT_RETRY_DELAY: u64 = 5;
pub const DEFAULT_RETRY_MAX: u32 = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// A source of parsed maps.
pub trait Source {
    fn name(&self) -> &'static str;

    /// Fetch one map. With `since`, only entries modified strictly after
    /// that time are wanted; a source whose protocol cannot express that
    /// returns the full map instead. A source that knows nothing changed
    /// returns an empty map.
    fn get_map(&mut self, kind: MapKind, since: Option<i64>) -> Result<Map>;

    /// Fetch one automount submap from `location` (a URL path, LDAP DN, or
    /// other source-specific address).
    fn get_automount_map(&mut self, location: &str, since: Option<i64>) -> Result<Map> {
        let _ = (location, since);
        Err(Error::UnsupportedMap(format!(
            "{} source does not serve automount maps",
            self.name()
        )))
    }

    /// Fetch the automount master map (mountpoint → source location).
    fn get_automount_master_map(&mut self) -> Result<Map> {
        Err(Error::UnsupportedMap(format!(
            "{} source does not serve automount maps",
            self.name()
        )))
    }

    /// Probe the source for reachability; returns the number of entries a
    /// one-minute-in-the-future conditional passwd fetch came back with
    /// (anything nonzero is suspicious and counted by `verify`).
    fn verify(&mut self) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        Ok(self.get_map(MapKind::Passwd, Some(now + 60))?.len())
    }
}

/// A source of complete map files (the zsync transport).
pub trait FileSource {
    fn name(&self) -> &'static str;

    /// Retrieve the file for `kind` into `dst`. `current` points at the
    /// present cache file so unchanged blocks can be reused. Contract: on
    /// error, `dst` may hold partial data but the current cache file is
    /// never touched; only the cache writer's commit replaces it.
    fn get_file(
        &mut self,
        kind: MapKind,
        dst: &Path,
        current: Option<&Path>,
        location: Option<&str>,
    ) -> Result<()>;
}

/// Either flavor of source, as configured.
pub enum AnySource {
    Maps(Box<dyn Source>),
    Files(Box<dyn FileSource>),
}

/// Explicit source table, consulted at startup instead of an import-time
/// registry.
pub fn create(options: &Options) -> Result<AnySource> {
    match options.name() {
        "ldap" => Ok(AnySource::Maps(Box::new(LdapSource::new(options)?))),
        "http" => Ok(AnySource::Maps(Box::new(HttpFilesSource::new(options)?))),
        "consul" => Ok(AnySource::Maps(Box::new(ConsulSource::new(options)?))),
        "scim" => Ok(AnySource::Maps(Box::new(ScimSource::new(options)?))),
        "s3" => Ok(AnySource::Maps(Box::new(S3Source::new(options)?))),
        "gcs" => Ok(AnySource::Maps(Box::new(GcsSource::new(options)?))),
        "zsync" => Ok(AnySource::Files(Box::new(ZsyncSource::new(options)?))),
        other => Err(Error::Configuration(format!("unknown source {other:?}"))),
    }
}

/// Run `op` until it succeeds or the retry budget is spent. Only
/// `SourceUnavailable` is retried; every other error is permanent.
pub(crate) fn with_retries<T>(
    retry_max: u32,
    retry_delay: u64,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(Error::SourceUnavailable(why)) => {
                attempt += 1;
                tracing::warn!(attempt, %why, "failed connection");
                if attempt >= retry_max {
                    tracing::debug!("max retries hit");
                    return Err(Error::SourceUnavailable(why));
                }
                thread::sleep(Duration::from_secs(retry_delay));
            }
            other => return other,
        }
    }
}

pub(crate) fn retry_max(options: &Options) -> u32 {
    options
        .get_int("retry_max")
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(DEFAULT_RETRY_MAX)
}

pub(crate) fn retry_delay(options: &Options) -> u64 {
    options
        .get_int("retry_delay")
        .and_then(|v| u64::try_from(v).ok())
        .unwrap_or(DEFAULT_RETRY_DELAY)
}

pub(crate) fn timeout_secs(options: &Options) -> u64 {
    options
        .get_int("timeout")
        .and_then(|v| u64::try_from(v).ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_rejects_unknown_source() {
        let mut options = Options::new();
        options.set_str("name", "avian-carrier");
        assert!(matches!(create(&options), Err(Error::Configuration(_))));
    }

    #[test]
    fn retries_are_bounded() {
        let mut attempts = 0;
        let result: Result<()> = with_retries(3, 0, || {
            attempts += 1;
            Err(Error::SourceUnavailable("down".to_string()))
        });
        assert!(matches!(result, Err(Error::SourceUnavailable(_))));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let mut attempts = 0;
        let result: Result<()> = with_retries(3, 0, || {
            attempts += 1;
            Err(Error::Configuration("bad url".to_string()))
        });
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(attempts, 1);
    }
}
