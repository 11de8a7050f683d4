//! SCIM 2.0 source.
//!
//! Users and Groups arrive as paginated JSON; the mapping from SCIM
//! attributes to entry fields is driven entirely by configured extraction
//! paths (`scim_path_uid = urn:…:User/employeeNumber` and friends) so
//! deployments can adapt to provider schema variations without code
//! changes.

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::maps::{GroupEntry, Map, MapEntry, MapKind, PasswdEntry, SshkeyEntry};
use crate::sources::http::build_client;
use crate::sources::{Source, retry_delay, retry_max, with_retries};

const DEFAULT_USERS_ENDPOINT: &str = "Users";
const DEFAULT_GROUPS_ENDPOINT: &str = "Groups";
const DEFAULT_SHELL: &str = "/bin/bash";
const SCIM_MEDIA_TYPE: &str = "application/scim+json";
const ENTERPRISE_USER_SCHEMA: &str =
    "urn:ietf:params:scim:schemas:extension:enterprise:2.0:User";

/// One page of a SCIM list response.
#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(rename = "totalResults", default)]
    total_results: u64,
    #[serde(rename = "Resources", default)]
    resources: Vec<Value>,
}

pub struct ScimSource {
    client: Client,
    base_url: String,
    auth_token: String,
    options: Options,
    retry_max: u32,
    retry_delay: u64,
}

impl ScimSource {
    pub fn new(options: &Options) -> Result<Self> {
        let base_url = options
            .get_str("base_url")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::Configuration("scim base_url and auth_token are required".to_string())
            })?;
        let auth_token = options
            .get_str("auth_token")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::Configuration("scim base_url and auth_token are required".to_string())
            })?;
        Ok(Self {
            client: build_client(options)?,
            base_url,
            auth_token,
            retry_max: retry_max(options),
            retry_delay: retry_delay(options),
            options: options.clone(),
        })
    }

    fn endpoint(&self, kind: MapKind) -> Result<String> {
        let default = match kind {
            MapKind::Passwd | MapKind::Sshkey => DEFAULT_USERS_ENDPOINT,
            MapKind::Group => DEFAULT_GROUPS_ENDPOINT,
            other => {
                return Err(Error::UnsupportedMap(format!(
                    "scim source does not serve {other} maps"
                )));
            }
        };
        let key = match kind {
            MapKind::Group => "groups_endpoint",
            _ => "users_endpoint",
        };
        let endpoint = self
            .options
            .get_str(key)
            .unwrap_or_else(|| default.to_string());
        Ok(format!("{}/{endpoint}", self.base_url.trim_end_matches('/')))
    }

    fn require_paths(&self, kind: MapKind) -> Result<()> {
        let required: &[&str] = match kind {
            MapKind::Passwd => &[
                "path_username",
                "path_uid",
                "path_gid",
                "path_home_directory",
                "path_login_shell",
            ],
            MapKind::Group => &["path_gid"],
            MapKind::Sshkey => &["path_ssh_keys"],
            _ => &[],
        };
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|key| self.options.get_str(key).unwrap_or_default().is_empty())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(format!(
                "scim {kind} map requires the {} option(s)",
                missing.join(", ")
            )))
        }
    }

    fn fetch_page(&self, url: &str, start_index: u64) -> Result<ListResponse> {
        with_retries(self.retry_max, self.retry_delay, || {
            tracing::debug!(url, start_index, "fetching scim page");
            let response = self
                .client
                .get(url)
                .query(&[("startIndex", start_index.to_string())])
                .header(AUTHORIZATION, format!("Bearer {}", self.auth_token))
                .header(ACCEPT, SCIM_MEDIA_TYPE)
                .header(CONTENT_TYPE, SCIM_MEDIA_TYPE)
                .send()
                .map_err(|err| Error::SourceUnavailable(format!("{url}: {err}")))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(Error::Configuration(format!(
                    "{url}: authentication rejected (HTTP {})",
                    status.as_u16()
                )));
            }
            if !status.is_success() {
                return Err(Error::SourceUnavailable(format!(
                    "{url}: HTTP {}",
                    status.as_u16()
                )));
            }
            response
                .json()
                .map_err(|err| Error::InvalidMap(format!("bad scim response: {err}")))
        })
    }

    /// Walk every page of a listing, collecting `Resources` until
    /// `totalResults` is reached.
    fn fetch_resources(&self, url: &str) -> Result<Vec<Value>> {
        let mut resources = Vec::new();
        let mut start_index = 1u64;
        loop {
            let page = self.fetch_page(url, start_index)?;
            if page.resources.is_empty() {
                break;
            }
            start_index += page.resources.len() as u64;
            resources.extend(page.resources);
            if resources.len() as u64 >= page.total_results {
                break;
            }
        }
        Ok(resources)
    }

    fn path(&self, key: &str) -> Option<String> {
        self.options.get_str(key).filter(|v| !v.is_empty())
    }

    fn build_passwd(&self, user: &Value) -> Option<MapEntry> {
        let name = self.extract_username(user)?;
        let Some(uid) = self.extract_int(user, "path_uid") else {
            tracing::warn!(%name, "scim user has no usable uid, skipping");
            return None;
        };
        let gid = self.extract_int(user, "path_gid").unwrap_or(uid);

        let dir = self
            .path("path_home_directory")
            .and_then(|path| extract_string(user, &path))
            .or_else(|| {
                extract_string(user, &format!("{ENTERPRISE_USER_SCHEMA}/homeDirectory"))
            })
            .unwrap_or_else(|| format!("/home/{name}"));
        let shell = self
            .path("path_login_shell")
            .and_then(|path| extract_string(user, &path))
            .or_else(|| extract_string(user, &format!("{ENTERPRISE_USER_SCHEMA}/loginShell")))
            .unwrap_or_else(|| {
                self.options
                    .get_str("default_shell")
                    .unwrap_or_else(|| DEFAULT_SHELL.to_string())
            });

        Some(MapEntry::Passwd(PasswdEntry {
            name,
            passwd: "x".to_string(),
            uid,
            gid,
            gecos: extract_gecos(user),
            dir,
            shell,
        }))
    }

    fn build_group(&self, group: &Value) -> Option<MapEntry> {
        let name = ["displayName", "name", "id"]
            .iter()
            .find_map(|key| extract_string(group, key))?;
        let Some(gid) = self.extract_int(group, "path_gid") else {
            tracing::warn!(%name, "scim group has no usable gid, skipping");
            return None;
        };
        let members = group
            .get("members")
            .and_then(Value::as_array)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|member| {
                        extract_string(member, "display").or_else(|| extract_string(member, "value"))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(MapEntry::Group(GroupEntry {
            name,
            passwd: "x".to_string(),
            gid,
            members,
        }))
    }

    fn build_sshkeys(&self, user: &Value) -> Vec<MapEntry> {
        let Some(name) = self.extract_username(user) else {
            return Vec::new();
        };
        let Some(path) = self.path("path_ssh_keys") else {
            return Vec::new();
        };
        let keys = match extract(user, &path) {
            Some(Value::String(key)) => vec![key.clone()],
            Some(Value::Array(keys)) => keys
                .iter()
                .filter_map(|key| key.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        keys.into_iter()
            .filter(|key| !key.trim().is_empty())
            .map(|key| {
                MapEntry::Sshkey(SshkeyEntry {
                    name: name.clone(),
                    sshkey: key.trim().to_string(),
                })
            })
            .collect()
    }

    fn extract_username(&self, user: &Value) -> Option<String> {
        self.path("path_username")
            .and_then(|path| extract_string(user, &path))
            .or_else(|| extract_string(user, "userName"))
    }

    fn extract_int(&self, resource: &Value, path_key: &str) -> Option<u32> {
        let path = self.path(path_key)?;
        match extract(resource, &path)? {
            Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl Source for ScimSource {
    fn name(&self) -> &'static str {
        "scim"
    }

    fn get_map(&mut self, kind: MapKind, since: Option<i64>) -> Result<Map> {
        // SCIM listings cannot express "changed since"; incremental
        // requests get the full map back.
        let _ = since;
        self.require_paths(kind)?;
        let url = self.endpoint(kind)?;
        let resources = self.fetch_resources(&url)?;

        let mut map = Map::new(kind);
        for resource in &resources {
            let entries = match kind {
                MapKind::Passwd => self.build_passwd(resource).into_iter().collect(),
                MapKind::Group => self.build_group(resource).into_iter().collect(),
                MapKind::Sshkey => self.build_sshkeys(resource),
                _ => Vec::new(),
            };
            for entry in entries {
                map.add(entry)?;
            }
        }
        tracing::info!(map = %kind, entries = map.len(), "scim map built");
        map.set_modify_time(Some(chrono::Utc::now().timestamp()));
        Ok(map)
    }
}

/// Walk a slash-separated path through nested JSON objects. Path segments
/// may themselves be schema URNs, which is why the separator is `/` and not
/// `.`.
fn extract<'a>(resource: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = resource;
    for segment in path.split('/') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn extract_string(resource: &Value, path: &str) -> Option<String> {
    match extract(resource, path)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Full name from the standard SCIM name structure, best effort.
fn extract_gecos(user: &Value) -> String {
    if let Some(formatted) = extract_string(user, "name/formatted") {
        return formatted;
    }
    let given = extract_string(user, "name/givenName");
    let family = extract_string(user, "name/familyName");
    let parts: Vec<String> = [given, family].into_iter().flatten().collect();
    if !parts.is_empty() {
        return parts.join(" ");
    }
    extract_string(user, "displayName").unwrap_or_default()
}
