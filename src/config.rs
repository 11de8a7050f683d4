//! INI configuration loading.
//!
//! A `[DEFAULT]` section names the default `source`, `cache`, and the
//! comma-separated `maps` list; per-map sections may override the source or
//! cache and contribute extra options. Any `foo_bar = value` key is routed
//! into the option set of the component named `foo`, so `ldap_uri` lands in
//! the LDAP source's options as `uri` and `files_dir` in the files cache's
//! options as `dir`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use configparser::ini::Ini;

use crate::error::{Error, Result};
use crate::maps::MapKind;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/nsscache.conf";
pub const ENV_CONFIG_OVERRIDE: &str = "NSSCACHE_CONFIG";

const DEFAULT_TIMESTAMP_DIR: &str = "/var/lib/nsscache";
const DEFAULT_SECTION: &str = "default";

/// A configuration value, coerced from its INI string form.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
}

impl Value {
    /// Unquote and coerce a raw INI string the way admins expect: matching
    /// surrounding quotes are stripped, numeric-looking values become
    /// numbers, everything else stays a string.
    #[must_use]
    pub fn coerce(raw: &str) -> Self {
        let trimmed = raw.trim();
        for quote in ['"', '\''] {
            if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
                return Self::Str(trimmed[1..trimmed.len() - 1].to_string());
            }
        }
        if let Ok(int) = trimmed.parse::<i64>() {
            return Self::Int(int);
        }
        if let Ok(float) = trimmed.parse::<f64>() {
            return Self::Float(float);
        }
        Self::Str(trimmed.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

/// Options for one component (a source or a cache), keyed without the
/// component-name prefix. The component's own name is stored under `name`.
#[derive(Debug, Clone, Default)]
pub struct Options(HashMap<String, Value>);

impl Options {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.insert(key, Value::Str(value.to_string()));
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String view of an option; numeric values format back to text.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.0.get(key).map(ToString::to_string)
    }

    #[must_use]
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(Value::Int(i)) => Some(*i),
            Some(Value::Str(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// `yes`/`true`/`1` (case-insensitive) read as true.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Str(s)) => {
                matches!(s.to_lowercase().as_str(), "yes" | "true" | "1")
            }
            Some(Value::Int(i)) => *i != 0,
            _ => false,
        }
    }

    /// The component name this option set belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        match self.0.get("name") {
            Some(Value::Str(s)) => s,
            _ => "",
        }
    }

    /// A required option, as a configuration error when missing.
    pub fn require_str(&self, key: &str) -> Result<String> {
        self.get_str(key)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "{} requires the {key} option",
                    if self.name().is_empty() { "component" } else { self.name() }
                ))
            })
    }
}

/// Per-map source and cache option sets.
#[derive(Debug, Clone)]
pub struct MapConfig {
    pub source: Options,
    pub cache: Options,
}

/// Parsed runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub maps: Vec<MapKind>,
    pub options: HashMap<MapKind, MapConfig>,
    pub lockfile: Option<PathBuf>,
    pub timestamp_dir: PathBuf,
}

impl Config {
    /// Load and validate a configuration file. `map_filter` (from `-m`)
    /// restricts which of the configured maps are acted on.
    pub fn load(path: &Path, map_filter: &[String]) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NoConfigFound);
        }

        let mut ini = Ini::new();
        let sections = ini
            .load(path)
            .map_err(|err| Error::Configuration(format!("{}: {err}", path.display())))?;

        let default = sections
            .get(DEFAULT_SECTION)
            .ok_or_else(|| Error::Configuration("missing [DEFAULT] section".to_string()))?;

        let default_source = required(default, "source")?;
        let default_cache = required(default, "cache")?;
        let lockfile = plain(default, "lockfile").map(PathBuf::from);
        let timestamp_dir = plain(default, "timestamp_dir")
            .unwrap_or_else(|| DEFAULT_TIMESTAMP_DIR.to_string())
            .into();

        let configured: Vec<String> = required(default, "maps")?
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        if configured.is_empty() {
            return Err(Error::Configuration("no maps configured".to_string()));
        }

        let selected: Vec<String> = if map_filter.is_empty() {
            configured
        } else {
            for name in map_filter {
                if !configured.contains(name) {
                    return Err(Error::Configuration(format!(
                        "map {name} is not in the configured maps list"
                    )));
                }
            }
            map_filter.to_vec()
        };

        let mut maps = Vec::new();
        let mut options = HashMap::new();
        for map_name in &selected {
            let kind = MapKind::parse(map_name)?;
            let section = sections.get(map_name.as_str());

            let source_name = section
                .and_then(|s| plain(s, "source"))
                .unwrap_or_else(|| default_source.clone());
            let cache_name = section
                .and_then(|s| plain(s, "cache"))
                .unwrap_or_else(|| default_cache.clone());

            let mut source = routed(default, &source_name);
            let mut cache = routed(default, &cache_name);
            if let Some(section) = section {
                merge(&mut source, routed(section, &source_name));
                merge(&mut cache, routed(section, &cache_name));
            }
            source.set_str("name", &source_name);
            cache.set_str("name", &cache_name);

            maps.push(kind);
            options.insert(kind, MapConfig { source, cache });
        }

        tracing::info!(maps = %selected.join(", "), "configured maps");
        Ok(Self {
            maps,
            options,
            lockfile,
            timestamp_dir,
        })
    }

    #[must_use]
    pub fn map_config(&self, kind: MapKind) -> Option<&MapConfig> {
        self.options.get(&kind)
    }
}

type Section = HashMap<String, Option<String>>;

fn plain(section: &Section, key: &str) -> Option<String> {
    section
        .get(key)
        .and_then(Clone::clone)
        .map(|raw| Value::coerce(&raw).to_string())
}

fn required(section: &Section, key: &str) -> Result<String> {
    plain(section, key)
        .ok_or_else(|| Error::Configuration(format!("missing required option {key}")))
}

/// Pull the options belonging to the component `name` out of a section:
/// every `name_foo` key contributes `foo`.
fn routed(section: &Section, name: &str) -> Options {
    let prefix = format!("{name}_");
    let mut options = Options::new();
    for (key, value) in section {
        if let (Some(stripped), Some(raw)) = (key.strip_prefix(&prefix), value) {
            options.insert(stripped, Value::coerce(raw));
        }
    }
    options
}

fn merge(base: &mut Options, overrides: Options) {
    for (key, value) in overrides.0 {
        base.0.insert(key, value);
    }
}

/// Static configuration checks for the `verify` command. Returns
/// (warnings, errors).
#[must_use]
pub fn verify_configuration(config: &Config, nsswitch_path: &Path) -> (usize, usize) {
    let mut warnings = 0;
    let mut errors = 0;

    if config.maps.is_empty() {
        tracing::error!("no maps configured");
        errors += 1;
    }

    let nsswitch = std::fs::read_to_string(nsswitch_path).unwrap_or_default();
    for &kind in &config.maps {
        let Some(map_config) = config.map_config(kind) else {
            errors += 1;
            continue;
        };
        if map_config.source.name().is_empty() || map_config.cache.name().is_empty() {
            tracing::error!(map = %kind, "map has no source or cache configured");
            errors += 1;
        }

        // The nss module name this backend is served by.
        let module = match map_config.cache.name() {
            "nssdb" => "db",
            _ => "cache",
        };
        let line_ok = nsswitch.lines().any(|line| {
            let line = line.trim();
            line.starts_with(&format!("{kind}:")) && line.contains(module)
        });
        if !line_ok && kind != MapKind::Automount && kind != MapKind::Sshkey {
            tracing::warn!(map = %kind, module,
                "nsswitch.conf does not list the cache module for this map");
            warnings += 1;
        }
    }

    (warnings, errors)
}
