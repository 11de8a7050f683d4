//! LDAP source.
//!
//! Each map kind is a search: a DN base, a scope, and an object-class
//! filter, with results streamed and transformed through a fixed attribute
//! mapping. Incremental fetches append a `modifyTimestamp` clause; the
//! server only offers `>=`, so the filter asks for `since + 1s`.

use std::time::Duration;

use chrono::{NaiveDateTime, TimeZone, Utc};
use ldap3::{LdapConn, LdapConnSettings, Scope, SearchEntry};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::maps::{
    AutomountEntry, GroupEntry, Map, MapEntry, MapKind, NetgroupEntry, PasswdEntry, ShadowEntry,
};
use crate::sources::{Source, retry_delay, retry_max, timeout_secs, with_retries};

const LDAP_TIME_FORMAT: &str = "%Y%m%d%H%M%SZ";

pub struct LdapSource {
    uri: String,
    bind_dn: String,
    bind_password: String,
    base: String,
    filter: Option<String>,
    scope: Scope,
    timeout: Duration,
    retry_max: u32,
    retry_delay: u64,
    conn: Option<LdapConn>,
}

impl LdapSource {
    pub fn new(options: &Options) -> Result<Self> {
        let scope = parse_scope(
            &options
                .get_str("scope")
                .unwrap_or_else(|| "one".to_string()),
        )?;
        Ok(Self {
            uri: options.require_str("uri")?,
            bind_dn: options.get_str("bind_dn").unwrap_or_default(),
            bind_password: options.get_str("bind_password").unwrap_or_default(),
            base: options.require_str("base")?,
            filter: options.get_str("filter").filter(|f| !f.is_empty()),
            scope,
            timeout: Duration::from_secs(timeout_secs(options)),
            retry_max: retry_max(options),
            retry_delay: retry_delay(options),
            conn: None,
        })
    }

    /// Connect and bind, retrying while the server is down.
    fn connect(&mut self) -> Result<&mut LdapConn> {
        if self.conn.is_none() {
            let uri = self.uri.clone();
            let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
            let conn = with_retries(self.retry_max, self.retry_delay, || {
                tracing::debug!(uri = %uri, "opening ldap connection and binding");
                let mut conn = LdapConn::with_settings(settings.clone(), &uri)
                    .map_err(|err| Error::SourceUnavailable(format!("{uri}: {err}")))?;
                conn.simple_bind(&self.bind_dn, &self.bind_password)
                    .and_then(ldap3::LdapResult::success)
                    .map_err(|err| Error::SourceUnavailable(format!("{uri}: bind: {err}")))?;
                Ok(conn)
            })?;
            self.conn = Some(conn);
        }
        Ok(self.conn.as_mut().expect("connection was just established"))
    }

    fn filter_for(&self, kind: MapKind) -> String {
        self.filter.clone().unwrap_or_else(|| {
            let objectclass = match kind {
                MapKind::Passwd => "posixAccount",
                MapKind::Group => "posixGroup",
                MapKind::Shadow => "shadowAccount",
                MapKind::Netgroup => "nisNetgroup",
                MapKind::Automount => "automount",
                MapKind::Sshkey => "posixAccount",
            };
            format!("(objectClass={objectclass})")
        })
    }

    fn search(
        &mut self,
        kind: MapKind,
        base: &str,
        scope: Scope,
        since: Option<i64>,
    ) -> Result<Map> {
        let mut filter = self.filter_for(kind);
        if let Some(since) = since {
            // modifyTimestamp only supports >=, hence the one second bump.
            filter = format!(
                "(&{filter}(modifyTimestamp>={}))",
                to_ldap_time(since + 1)
            );
        }
        let mut attrs = attrs_for(kind);
        attrs.push("modifyTimestamp");
        tracing::debug!(base, %filter, ?attrs, "searching");

        let retry_max = self.retry_max;
        let retry_delay = self.retry_delay;
        let base = base.to_string();
        with_retries(retry_max, retry_delay, || {
            let conn = self.connect()?;
            let result = run_search(conn, kind, &base, scope, &filter, &attrs);
            if result.is_err() {
                // Force a fresh bind on the next attempt.
                self.conn = None;
            }
            result
        })
    }
}

fn run_search(
    conn: &mut LdapConn,
    kind: MapKind,
    base: &str,
    scope: Scope,
    filter: &str,
    attrs: &[&str],
) -> Result<Map> {
    let (results, _res) = conn
        .search(base, scope, filter, attrs)
        .and_then(ldap3::SearchResult::success)
        .map_err(|err| Error::SourceUnavailable(format!("search: {err}")))?;

    // Track the newest modifyTimestamp actually seen rather than trusting
    // the caller's `since`; that value becomes the map's modify time.
    let mut max_ts: Option<i64> = None;
    let mut map = Map::new(kind);

    for entry in results {
        let entry = SearchEntry::construct(entry);

        if let Some(ts) = first(&entry, "modifyTimestamp").and_then(from_ldap_time) {
            if max_ts.is_none_or(|max| ts > max) {
                max_ts = Some(ts);
            }
        }

        match transform(kind, &entry)? {
            Some(map_entry) => {
                if let Err(err) = map.add(map_entry) {
                    tracing::warn!(dn = %entry.dn, %err, "discarding malformed object");
                }
            }
            None => tracing::warn!(dn = %entry.dn, "object skipped"),
        }
    }

    map.set_modify_time(max_ts);
    Ok(map)
}

impl Source for LdapSource {
    fn name(&self) -> &'static str {
        "ldap"
    }

    fn get_map(&mut self, kind: MapKind, since: Option<i64>) -> Result<Map> {
        if kind == MapKind::Automount {
            return Err(Error::UnsupportedMap(
                "automount maps are fetched by location".to_string(),
            ));
        }
        if kind == MapKind::Sshkey {
            return Err(Error::UnsupportedMap(
                "ldap source does not serve sshkey maps".to_string(),
            ));
        }
        let base = self.base.clone();
        let scope = self.scope;
        self.search(kind, &base, scope, since)
    }

    fn get_automount_map(&mut self, location: &str, since: Option<i64>) -> Result<Map> {
        // The automount spec fixes submap searches at one level below the
        // map's own DN.
        let mut map = self.search(MapKind::Automount, location, Scope::OneLevel, since)?;
        map.set_filesystem_location(Some(location.to_string()));
        Ok(map)
    }

    fn get_automount_master_map(&mut self) -> Result<Map> {
        let base = self.base.clone();
        self.get_automount_map(&base, None)
    }
}

fn parse_scope(value: &str) -> Result<Scope> {
    match value {
        "base" => Ok(Scope::Base),
        "one" => Ok(Scope::OneLevel),
        "sub" => Ok(Scope::Subtree),
        other => Err(Error::Configuration(format!("invalid scope: {other}"))),
    }
}

fn attrs_for(kind: MapKind) -> Vec<&'static str> {
    match kind {
        MapKind::Passwd => vec![
            "uid",
            "uidNumber",
            "gidNumber",
            "gecos",
            "cn",
            "homeDirectory",
            "loginShell",
        ],
        MapKind::Group => vec!["cn", "gidNumber", "memberUid"],
        MapKind::Shadow => vec![
            "uid",
            "shadowLastChange",
            "shadowMin",
            "shadowMax",
            "shadowWarning",
            "shadowInactive",
            "shadowExpire",
            "shadowFlag",
            "userPassword",
        ],
        MapKind::Netgroup => vec!["cn", "memberNisNetgroup", "nisNetgroupTriple"],
        MapKind::Automount => vec!["cn", "automountInformation"],
        MapKind::Sshkey => vec![],
    }
}

/// Turn one LDAP object into a map entry. `Ok(None)` skips the object;
/// a missing essential attribute aborts the whole map.
fn transform(kind: MapKind, entry: &SearchEntry) -> Result<Option<MapEntry>> {
    match kind {
        MapKind::Passwd => transform_passwd(entry).map(Some),
        MapKind::Group => transform_group(entry).map(Some),
        MapKind::Shadow => transform_shadow(entry).map(Some),
        MapKind::Netgroup => transform_netgroup(entry).map(Some),
        MapKind::Automount => transform_automount(entry).map(Some),
        MapKind::Sshkey => Ok(None),
    }
}

fn transform_passwd(entry: &SearchEntry) -> Result<MapEntry> {
    let gecos = first(entry, "gecos")
        .or_else(|| first(entry, "cn"))
        .ok_or_else(|| invalid(entry, "neither gecos nor cn found"))?
        .to_string();
    Ok(MapEntry::Passwd(PasswdEntry {
        name: required(entry, "uid")?.to_string(),
        passwd: "x".to_string(),
        uid: required_int(entry, "uidNumber")?,
        gid: required_int(entry, "gidNumber")?,
        gecos,
        dir: required(entry, "homeDirectory")?.to_string(),
        shell: first(entry, "loginShell").unwrap_or_default().to_string(),
    }))
}

fn transform_group(entry: &SearchEntry) -> Result<MapEntry> {
    // Group passwords are deferred to gshadow.
    let mut members: Vec<String> = entry
        .attrs
        .get("memberUid")
        .map(|values| values.iter().map(Clone::clone).collect())
        .unwrap_or_default();
    members.sort();
    Ok(MapEntry::Group(GroupEntry {
        name: required(entry, "cn")?.to_string(),
        passwd: "*".to_string(),
        gid: required_int(entry, "gidNumber")?,
        members,
    }))
}

fn transform_shadow(entry: &SearchEntry) -> Result<MapEntry> {
    let passwd = match first(entry, "userPassword") {
        Some(value) => value.strip_prefix("{CRYPT}").map_or_else(
            || {
                tracing::info!("ignored password that was not in crypt format");
                "!!".to_string()
            },
            str::to_string,
        ),
        None => "!!".to_string(),
    };
    Ok(MapEntry::Shadow(ShadowEntry {
        name: required(entry, "uid")?.to_string(),
        passwd,
        lstchg: first_int(entry, "shadowLastChange"),
        min: first_int(entry, "shadowMin"),
        max: first_int(entry, "shadowMax"),
        warn: first_int(entry, "shadowWarning"),
        inact: first_int(entry, "shadowInactive"),
        expire: first_int(entry, "shadowExpire"),
        flag: Some(first_int(entry, "shadowFlag").unwrap_or(0)),
    }))
}

fn transform_netgroup(entry: &SearchEntry) -> Result<MapEntry> {
    let mut members: Vec<&str> = Vec::new();
    if let Some(groups) = entry.attrs.get("memberNisNetgroup") {
        members.extend(groups.iter().map(String::as_str));
    }
    if let Some(triples) = entry.attrs.get("nisNetgroupTriple") {
        members.extend(triples.iter().map(String::as_str));
    }
    let entries = if members.is_empty() {
        None
    } else {
        Some(members.join(" "))
    };
    Ok(MapEntry::Netgroup(NetgroupEntry {
        name: required(entry, "cn")?.to_string(),
        entries,
    }))
}

fn transform_automount(entry: &SearchEntry) -> Result<MapEntry> {
    let info = required(entry, "automountInformation")?;
    let (options, location) = if info.starts_with('-') {
        match info.split_once(char::is_whitespace) {
            Some((options, location)) => (Some(options.to_string()), location.to_string()),
            None => (None, info.to_string()),
        }
    } else {
        (None, info.to_string())
    };
    Ok(MapEntry::Automount(AutomountEntry {
        key: required(entry, "cn")?.to_string(),
        location,
        options,
    }))
}

fn first<'a>(entry: &'a SearchEntry, attr: &str) -> Option<&'a str> {
    entry
        .attrs
        .get(attr)
        .and_then(|values| values.first())
        .map(String::as_str)
}

fn required<'a>(entry: &'a SearchEntry, attr: &str) -> Result<&'a str> {
    first(entry, attr).ok_or_else(|| invalid(entry, &format!("missing {attr}")))
}

fn required_int<T: std::str::FromStr>(entry: &SearchEntry, attr: &str) -> Result<T> {
    required(entry, attr)?
        .parse()
        .map_err(|_| invalid(entry, &format!("non-numeric {attr}")))
}

fn first_int(entry: &SearchEntry, attr: &str) -> Option<i64> {
    first(entry, attr).and_then(|value| value.parse().ok())
}

fn invalid(entry: &SearchEntry, why: &str) -> Error {
    Error::InvalidMap(format!("invalid object {}: {why}", entry.dn))
}

fn to_ldap_time(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or_default()
        .format(LDAP_TIME_FORMAT)
        .to_string()
}

fn from_ldap_time(value: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(value, LDAP_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn search_entry(attrs: &[(&str, &[&str])]) -> SearchEntry {
        SearchEntry {
            dn: "cn=test,dc=example,dc=com".to_string(),
            attrs: attrs
                .iter()
                .map(|(k, vs)| ((*k).to_string(), vs.iter().map(|v| (*v).to_string()).collect()))
                .collect(),
            bin_attrs: HashMap::new(),
        }
    }

    #[test]
    fn scope_parsing() {
        assert!(matches!(parse_scope("one"), Ok(Scope::OneLevel)));
        assert!(matches!(parse_scope("sub"), Ok(Scope::Subtree)));
        assert!(matches!(
            parse_scope("recursive"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn ldap_time_round_trip() {
        let ts = 1_700_000_000;
        assert_eq!(from_ldap_time(&to_ldap_time(ts)), Some(ts));
        assert_eq!(to_ldap_time(2), "19700101000002Z");
    }

    #[test]
    fn passwd_transform_prefers_gecos_over_cn() {
        let entry = search_entry(&[
            ("uid", &["alice"]),
            ("uidNumber", &["1000"]),
            ("gidNumber", &["1000"]),
            ("cn", &["Alice Common-Name"]),
            ("gecos", &["Alice Gecos"]),
            ("homeDirectory", &["/home/alice"]),
        ]);
        match transform_passwd(&entry).unwrap() {
            MapEntry::Passwd(e) => {
                assert_eq!(e.gecos, "Alice Gecos");
                assert_eq!(e.passwd, "x");
                assert_eq!(e.shell, "");
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn passwd_transform_requires_home_directory() {
        let entry = search_entry(&[
            ("uid", &["alice"]),
            ("uidNumber", &["1000"]),
            ("gidNumber", &["1000"]),
            ("cn", &["Alice"]),
        ]);
        assert!(matches!(
            transform_passwd(&entry),
            Err(Error::InvalidMap(_))
        ));
    }

    #[test]
    fn group_members_are_sorted() {
        let entry = search_entry(&[
            ("cn", &["staff"]),
            ("gidNumber", &["50"]),
            ("memberUid", &["zoe", "alice", "mike"]),
        ]);
        match transform_group(&entry).unwrap() {
            MapEntry::Group(e) => {
                assert_eq!(e.members, vec!["alice", "mike", "zoe"]);
                assert_eq!(e.passwd, "*");
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn shadow_crypt_prefix_is_stripped() {
        let entry = search_entry(&[
            ("uid", &["alice"]),
            ("userPassword", &["{CRYPT}$6$salt$hash"]),
            ("shadowLastChange", &["17000"]),
        ]);
        match transform_shadow(&entry).unwrap() {
            MapEntry::Shadow(e) => {
                assert_eq!(e.passwd, "$6$salt$hash");
                assert_eq!(e.lstchg, Some(17000));
                assert_eq!(e.flag, Some(0));
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn shadow_non_crypt_password_is_locked() {
        let entry = search_entry(&[("uid", &["alice"]), ("userPassword", &["{SSHA}xyz"])]);
        match transform_shadow(&entry).unwrap() {
            MapEntry::Shadow(e) => assert_eq!(e.passwd, "!!"),
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn netgroup_joins_members_and_triples() {
        let entry = search_entry(&[
            ("cn", &["admins"]),
            ("memberNisNetgroup", &["unix-admins"]),
            ("nisNetgroupTriple", &["(host1,alice,)", "(host2,bob,)"]),
        ]);
        match transform_netgroup(&entry).unwrap() {
            MapEntry::Netgroup(e) => {
                assert_eq!(
                    e.entries.as_deref(),
                    Some("unix-admins (host1,alice,) (host2,bob,)")
                );
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn automount_information_splits_options() {
        let entry = search_entry(&[
            ("cn", &["home"]),
            ("automountInformation", &["-tcp,rw server:/export/home"]),
        ]);
        match transform_automount(&entry).unwrap() {
            MapEntry::Automount(e) => {
                assert_eq!(e.options.as_deref(), Some("-tcp,rw"));
                assert_eq!(e.location, "server:/export/home");
            }
            other => panic!("unexpected entry: {other:?}"),
        }

        let entry = search_entry(&[
            ("cn", &["home"]),
            ("automountInformation", &["server:/export/home"]),
        ]);
        match transform_automount(&entry).unwrap() {
            MapEntry::Automount(e) => assert_eq!(e.options, None),
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn incremental_filter_bumps_one_second() {
        let mut options = Options::new();
        options.set_str("name", "ldap");
        options.set_str("uri", "ldap://ldap.example.com");
        options.set_str("base", "ou=people,dc=example,dc=com");
        let source = LdapSource::new(&options).unwrap();
        assert_eq!(source.filter_for(MapKind::Passwd), "(objectClass=posixAccount)");

        // The filter construction used for since=1 must ask for >= 2s.
        let since = 1i64;
        let filter = format!(
            "(&{}(modifyTimestamp>={}))",
            source.filter_for(MapKind::Passwd),
            to_ldap_time(since + 1)
        );
        assert_eq!(
            filter,
            "(&(objectClass=posixAccount)(modifyTimestamp>=19700101000002Z))"
        );
    }

    #[test]
    fn missing_uri_is_a_configuration_error() {
        let mut options = Options::new();
        options.set_str("name", "ldap");
        options.set_str("base", "dc=example,dc=com");
        assert!(matches!(
            LdapSource::new(&options),
            Err(Error::Configuration(_))
        ));
    }
}
