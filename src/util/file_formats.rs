//! Serializers and parsers for the native POSIX text formats.
//!
//! The `files` cache backend and the HTTP-family sources share these, which
//! is what keeps a fetched snapshot bit-compatible with the on-disk cache.

use std::io::BufRead;

use crate::error::{Error, Result};
use crate::maps::{
    AutomountEntry, GroupEntry, Map, MapEntry, MapKind, NetgroupEntry, PasswdEntry, ShadowEntry,
    SshkeyEntry,
};

/// Serialize one entry as its cache line, without the trailing newline.
#[must_use]
pub fn serialize_entry(entry: &MapEntry) -> String {
    match entry {
        MapEntry::Passwd(e) => format!(
            "{}:{}:{}:{}:{}:{}:{}",
            e.name, e.passwd, e.uid, e.gid, e.gecos, e.dir, e.shell
        ),
        MapEntry::Group(e) => {
            format!("{}:{}:{}:{}", e.name, e.passwd, e.gid, e.members.join(","))
        }
        MapEntry::Shadow(e) => format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}",
            e.name,
            e.passwd,
            opt(e.lstchg),
            opt(e.min),
            opt(e.max),
            opt(e.warn),
            opt(e.inact),
            opt(e.expire),
            opt(e.flag)
        ),
        MapEntry::Netgroup(e) => match &e.entries {
            Some(entries) if !entries.is_empty() => format!("{} {}", e.name, entries),
            _ => e.name.clone(),
        },
        MapEntry::Automount(e) => match &e.options {
            Some(options) => format!("{} {} {}", e.key, options, e.location),
            None => format!("{} {}", e.key, e.location),
        },
        MapEntry::Sshkey(e) => format!("{}:{}", e.name, e.sshkey),
    }
}

fn opt(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Parse one cache line into an entry of the given kind.
pub fn parse_entry(kind: MapKind, line: &str) -> Result<MapEntry> {
    match kind {
        MapKind::Passwd => parse_passwd(line),
        MapKind::Group => parse_group(line),
        MapKind::Shadow => parse_shadow(line),
        MapKind::Netgroup => parse_netgroup(line),
        MapKind::Automount => parse_automount(line),
        MapKind::Sshkey => parse_sshkey(line),
    }
}

/// Parse a whole map body. Blank lines and `#` comments are skipped; any
/// other malformed line aborts the map.
pub fn parse_map<R: BufRead>(kind: MapKind, reader: R) -> Result<Map> {
    let mut map = Map::new(kind);
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        map.add(parse_entry(kind, &line)?)?;
    }
    Ok(map)
}

fn bad_line(kind: MapKind, line: &str, why: &str) -> Error {
    Error::InvalidMap(format!("bad {kind} record {line:?}: {why}"))
}

fn parse_passwd(line: &str) -> Result<MapEntry> {
    let fields: Vec<&str> = line.split(':').collect();
    let [name, passwd, uid, gid, gecos, dir, shell] = fields[..] else {
        return Err(bad_line(MapKind::Passwd, line, "expected 7 fields"));
    };
    Ok(MapEntry::Passwd(PasswdEntry {
        name: name.to_string(),
        passwd: passwd.to_string(),
        uid: parse_id(MapKind::Passwd, line, uid)?,
        gid: parse_id(MapKind::Passwd, line, gid)?,
        gecos: gecos.to_string(),
        dir: dir.to_string(),
        shell: shell.to_string(),
    }))
}

fn parse_group(line: &str) -> Result<MapEntry> {
    let fields: Vec<&str> = line.split(':').collect();
    let [name, passwd, gid, members] = fields[..] else {
        return Err(bad_line(MapKind::Group, line, "expected 4 fields"));
    };
    let members = if members.is_empty() {
        Vec::new()
    } else {
        members.split(',').map(str::to_string).collect()
    };
    Ok(MapEntry::Group(GroupEntry {
        name: name.to_string(),
        passwd: passwd.to_string(),
        gid: parse_id(MapKind::Group, line, gid)?,
        members,
    }))
}

fn parse_shadow(line: &str) -> Result<MapEntry> {
    let fields: Vec<&str> = line.split(':').collect();
    let [name, passwd, lstchg, min, max, warn, inact, expire, flag] = fields[..] else {
        return Err(bad_line(MapKind::Shadow, line, "expected 9 fields"));
    };
    Ok(MapEntry::Shadow(ShadowEntry {
        name: name.to_string(),
        passwd: passwd.to_string(),
        lstchg: parse_opt_int(line, lstchg)?,
        min: parse_opt_int(line, min)?,
        max: parse_opt_int(line, max)?,
        warn: parse_opt_int(line, warn)?,
        inact: parse_opt_int(line, inact)?,
        expire: parse_opt_int(line, expire)?,
        flag: parse_opt_int(line, flag)?,
    }))
}

fn parse_netgroup(line: &str) -> Result<MapEntry> {
    // The first word is the group name; everything after the first space is
    // the member list, kept verbatim (groups can have thousands of members
    // and the format tolerates repeated spacing).
    match line.find(' ') {
        None => Ok(MapEntry::Netgroup(NetgroupEntry {
            name: line.to_string(),
            entries: None,
        })),
        Some(index) => Ok(MapEntry::Netgroup(NetgroupEntry {
            name: line[..index].to_string(),
            entries: Some(line[index + 1..].to_string()),
        })),
    }
}

fn parse_automount(line: &str) -> Result<MapEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields[..] {
        [key, location] => Ok(MapEntry::Automount(AutomountEntry {
            key: key.to_string(),
            location: location.to_string(),
            options: None,
        })),
        [key, options, location, ..] => Ok(MapEntry::Automount(AutomountEntry {
            key: key.to_string(),
            location: location.to_string(),
            options: Some(options.to_string()),
        })),
        _ => Err(bad_line(MapKind::Automount, line, "expected key and location")),
    }
}

fn parse_sshkey(line: &str) -> Result<MapEntry> {
    match line.split_once(':') {
        Some((name, sshkey)) => Ok(MapEntry::Sshkey(SshkeyEntry {
            name: name.to_string(),
            sshkey: sshkey.to_string(),
        })),
        None => Err(bad_line(MapKind::Sshkey, line, "expected 2 fields")),
    }
}

fn parse_id(kind: MapKind, line: &str, field: &str) -> Result<u32> {
    field
        .parse()
        .map_err(|_| bad_line(kind, line, "non-numeric id"))
}

fn parse_opt_int(line: &str, field: &str) -> Result<Option<i64>> {
    if field.is_empty() {
        return Ok(None);
    }
    field
        .parse()
        .map(Some)
        .map_err(|_| bad_line(MapKind::Shadow, line, "non-numeric field"))
}
