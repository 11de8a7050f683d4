//! Source for maps stored in Consul's key/value tree.
//!
//! A recursive listing of `<base>/<map>/` yields one key per attribute:
//! `…/passwd/alice/uid`, `…/passwd/alice/shell`, and so on. Keys are
//! grouped by the entry name (the next-to-last segment) and materialized
//! into one entry per group. Values arrive base64-encoded.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::blocking::Client;
use serde::Deserialize;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::maps::{GroupEntry, Map, MapEntry, MapKind, PasswdEntry, ShadowEntry};
use crate::sources::http::{Fetched, build_client, fetch_url};
use crate::sources::{Source, retry_delay, retry_max};

const DEFAULT_DATACENTER: &str = "dc1";

pub struct ConsulSource {
    client: Client,
    options: Options,
    retry_max: u32,
    retry_delay: u64,
}

impl ConsulSource {
    pub fn new(options: &Options) -> Result<Self> {
        Ok(Self {
            client: build_client(options)?,
            retry_max: retry_max(options),
            retry_delay: retry_delay(options),
            options: options.clone(),
        })
    }

    fn url_for(&self, kind: MapKind) -> Result<String> {
        let key = match kind {
            MapKind::Passwd => "passwd_url",
            MapKind::Group => "group_url",
            MapKind::Shadow => "shadow_url",
            other => {
                return Err(Error::UnsupportedMap(format!(
                    "consul source does not serve {other} maps"
                )));
            }
        };
        let base = self.options.require_str(key)?;
        let token = self.options.get_str("token").unwrap_or_default();
        let datacenter = self
            .options
            .get_str("datacenter")
            .unwrap_or_else(|| DEFAULT_DATACENTER.to_string());
        Ok(format!("{base}?recurse&token={token}&dc={datacenter}"))
    }
}

impl Source for ConsulSource {
    fn name(&self) -> &'static str {
        "consul"
    }

    fn get_map(&mut self, kind: MapKind, since: Option<i64>) -> Result<Map> {
        // The KV API has no if-modified-since; incremental requests get the
        // full map back.
        let _ = since;
        let url = self.url_for(kind)?;
        match fetch_url(&self.client, &url, None, self.retry_max, self.retry_delay)? {
            Fetched::NotModified => Ok(Map::new(kind)),
            Fetched::Document { body, .. } => {
                let mut map = parse_kv_listing(kind, &body)?;
                map.set_modify_time(Some(chrono::Utc::now().timestamp()));
                Ok(map)
            }
        }
    }
}

/// One row of a `?recurse` listing. Values are base64-encoded.
#[derive(Debug, Deserialize)]
struct KvItem {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

/// Group the flat KV listing into per-entry attribute sets, then build one
/// entry per group. Unusable groups (missing ids) are skipped with a
/// warning, matching how sparse trees show up in practice.
fn parse_kv_listing(kind: MapKind, body: &[u8]) -> Result<Map> {
    let listing: Vec<KvItem> = serde_json::from_slice(body)
        .map_err(|err| Error::InvalidMap(format!("bad consul listing: {err}")))?;

    let mut groups: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for item in &listing {
        let key = item.key.as_str();
        let Some(value) = item.value.as_deref() else {
            continue;
        };
        let decoded = BASE64
            .decode(value)
            .map_err(|err| Error::InvalidMap(format!("bad consul value for {key:?}: {err}")))?;
        let decoded = String::from_utf8_lossy(&decoded).into_owned();

        let mut segments = key.rsplit('/');
        let (Some(attribute), Some(name)) = (segments.next(), segments.next()) else {
            continue;
        };
        if name.is_empty() || attribute.is_empty() {
            continue;
        }
        groups
            .entry(name.to_string())
            .or_default()
            .insert(attribute.to_string(), decoded);
    }

    let mut map = Map::new(kind);
    for (name, attrs) in groups {
        match build_entry(kind, &name, &attrs) {
            Some(entry) => map.add(entry)?,
            None => {
                tracing::warn!(%name, "could not create entry from consul data, skipping");
            }
        }
    }
    Ok(map)
}

fn build_entry(
    kind: MapKind,
    name: &str,
    attrs: &BTreeMap<String, String>,
) -> Option<MapEntry> {
    match kind {
        MapKind::Passwd => Some(MapEntry::Passwd(PasswdEntry {
            name: name.to_string(),
            passwd: attrs.get("passwd").cloned().unwrap_or_else(|| "x".to_string()),
            uid: attrs.get("uid")?.parse().ok()?,
            gid: attrs.get("gid")?.parse().ok()?,
            gecos: attrs.get("comment").cloned().unwrap_or_default(),
            dir: attrs
                .get("home")
                .cloned()
                .unwrap_or_else(|| format!("/home/{name}")),
            shell: attrs
                .get("shell")
                .cloned()
                .unwrap_or_else(|| "/bin/bash".to_string()),
        })),
        MapKind::Group => Some(MapEntry::Group(GroupEntry {
            name: name.to_string(),
            passwd: attrs.get("passwd").cloned().unwrap_or_else(|| "x".to_string()),
            gid: attrs.get("gid")?.parse().ok()?,
            members: attrs
                .get("members")
                .map(|m| m.lines().map(str::to_string).collect())
                .unwrap_or_default(),
        })),
        MapKind::Shadow => {
            let int = |key: &str| attrs.get(key).and_then(|v| v.parse().ok());
            Some(MapEntry::Shadow(ShadowEntry {
                name: name.to_string(),
                passwd: attrs.get("passwd").cloned().unwrap_or_else(|| "*".to_string()),
                lstchg: int("lstchg"),
                min: int("min"),
                max: int("max"),
                warn: int("warn"),
                inact: int("inact"),
                expire: int("expire"),
                flag: None,
            }))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(key: &str, value: &str) -> serde_json::Value {
        serde_json::json!({"Key": key, "Value": BASE64.encode(value)})
    }

    #[test]
    fn groups_keys_into_passwd_entries() {
        let listing = serde_json::Value::Array(vec![
            kv("org/users/alice/uid", "1000"),
            kv("org/users/alice/gid", "1000"),
            kv("org/users/alice/home", "/home/alice"),
            kv("org/users/alice/shell", "/bin/zsh"),
            kv("org/users/bob/uid", "1001"),
            kv("org/users/bob/gid", "1001"),
        ]);
        let map =
            parse_kv_listing(MapKind::Passwd, listing.to_string().as_bytes()).unwrap();
        assert_eq!(map.len(), 2);
        match map.get("alice") {
            Some(MapEntry::Passwd(e)) => {
                assert_eq!(e.uid, 1000);
                assert_eq!(e.shell, "/bin/zsh");
            }
            other => panic!("unexpected entry: {other:?}"),
        }
        // bob had no home or shell configured; defaults apply.
        match map.get("bob") {
            Some(MapEntry::Passwd(e)) => {
                assert_eq!(e.dir, "/home/bob");
                assert_eq!(e.shell, "/bin/bash");
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn entries_without_ids_are_skipped() {
        let listing = serde_json::Value::Array(vec![kv("org/users/alice/shell", "/bin/sh")]);
        let map =
            parse_kv_listing(MapKind::Passwd, listing.to_string().as_bytes()).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn group_members_split_on_newlines() {
        let listing = serde_json::Value::Array(vec![
            kv("org/groups/staff/gid", "50"),
            kv("org/groups/staff/members", "alice\nbob"),
        ]);
        let map = parse_kv_listing(MapKind::Group, listing.to_string().as_bytes()).unwrap();
        match map.get("staff") {
            Some(MapEntry::Group(e)) => {
                assert_eq!(e.members, vec!["alice".to_string(), "bob".to_string()]);
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn shadow_defaults_to_star_password() {
        let listing = serde_json::Value::Array(vec![kv("org/shadow/alice/lstchg", "17000")]);
        let map =
            parse_kv_listing(MapKind::Shadow, listing.to_string().as_bytes()).unwrap();
        match map.get("alice") {
            Some(MapEntry::Shadow(e)) => {
                assert_eq!(e.passwd, "*");
                assert_eq!(e.lstchg, Some(17000));
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn netgroup_is_unsupported() {
        let mut options = Options::new();
        options.set_str("name", "consul");
        let mut source = ConsulSource::new(&options).unwrap();
        assert!(matches!(
            source.get_map(MapKind::Netgroup, None),
            Err(Error::UnsupportedMap(_))
        ));
    }
}
