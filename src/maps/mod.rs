//! In-memory model of NSS maps.
//!
//! A [`Map`] is a kind-tagged, insertion-ordered collection of [`MapEntry`]
//! records indexed by primary key, plus two optional timestamps: the modify
//! time (newest entry modification seen) and the update time (wall clock of
//! the last successful refresh). Both drive the incremental update protocol.

mod entries;

use std::collections::HashMap;

use chrono::Utc;

use crate::error::{Error, Result};

pub use entries::{
    AutomountEntry, GroupEntry, MapEntry, NetgroupEntry, PasswdEntry, ShadowEntry, SshkeyEntry,
};

/// How far in the future a modify time may point before it is clamped.
const MAX_CLOCK_SKEW_SECS: i64 = 3600;

/// The map kinds served to the name-service layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    Passwd,
    Group,
    Shadow,
    Netgroup,
    Automount,
    Sshkey,
}

impl MapKind {
    pub const ALL: [Self; 6] = [
        Self::Passwd,
        Self::Group,
        Self::Shadow,
        Self::Netgroup,
        Self::Automount,
        Self::Sshkey,
    ];

    /// The map name as used in configuration files and `/etc`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Passwd => "passwd",
            Self::Group => "group",
            Self::Shadow => "shadow",
            Self::Netgroup => "netgroup",
            Self::Automount => "automount",
            Self::Sshkey => "sshkey",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| Error::UnsupportedMap(name.to_string()))
    }
}

impl std::fmt::Display for MapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A collection of entries of one kind, unique by primary key.
///
/// Entries keep insertion order: `add` of an existing key overwrites in
/// place, and [`Map::pop`] drains from the front, so a pop-driven writer
/// emits entries in the order they were added. Popping is how the cache
/// writers consume a map destructively, halving peak memory on large maps.
#[derive(Debug)]
pub struct Map {
    kind: MapKind,
    slots: Vec<Option<MapEntry>>,
    index: HashMap<String, usize>,
    head: usize,
    len: usize,
    modify_time: Option<i64>,
    update_time: Option<i64>,
    mountpoint: Option<String>,
    filesystem_location: Option<String>,
}

impl Map {
    #[must_use]
    pub fn new(kind: MapKind) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            index: HashMap::new(),
            head: 0,
            len: 0,
            modify_time: None,
            update_time: None,
            mountpoint: None,
            filesystem_location: None,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MapKind {
        self.kind
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add an entry, verifying it first. Overwrites on key collision,
    /// keeping the original position.
    pub fn add(&mut self, entry: MapEntry) -> Result<()> {
        if entry.kind() != self.kind() {
            return Err(Error::InvalidMap(format!(
                "cannot add a {} entry to a {} map",
                entry.kind(),
                self.kind()
            )));
        }
        entry.verify()?;

        if let Some(&slot) = self.index.get(entry.key()) {
            self.slots[slot] = Some(entry);
        } else {
            self.index.insert(entry.key().to_string(), self.slots.len());
            self.slots.push(Some(entry));
            self.len += 1;
        }
        Ok(())
    }

    /// Deep-equality membership test: true when an entry with the same key
    /// exists and every field matches.
    #[must_use]
    pub fn contains(&self, entry: &MapEntry) -> bool {
        self.get(entry.key()) == Some(entry)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&MapEntry> {
        self.index
            .get(key)
            .and_then(|&slot| self.slots[slot].as_ref())
    }

    /// Remove and return the oldest remaining entry, or `None` when drained.
    pub fn pop(&mut self) -> Option<MapEntry> {
        while self.head < self.slots.len() {
            let slot = self.head;
            self.head += 1;
            if let Some(entry) = self.slots[slot].take() {
                self.index.remove(entry.key());
                self.len -= 1;
                return Some(entry);
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = &MapEntry> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    #[must_use]
    pub fn into_entries(self) -> impl Iterator<Item = MapEntry> {
        self.slots.into_iter().flatten()
    }

    /// Fold another map of the same kind into this one.
    ///
    /// Refuses to merge when `other` carries an older modify or update time,
    /// which is what stops a stale snapshot from overwriting a newer cache.
    /// Entries of `other` not already present (deep-equal) are added, which
    /// also overwrites changed entries under the same key. On any change the
    /// modify time advances to `other`'s; the update time always does.
    ///
    /// Returns whether anything was added or overwritten.
    pub fn merge(&mut self, other: Map) -> Result<bool> {
        if other.kind() != self.kind() {
            return Err(Error::InvalidMap(format!(
                "cannot merge a {} map into a {} map",
                other.kind(),
                self.kind()
            )));
        }
        if timestamp_lt(other.modify_time, self.modify_time) {
            return Err(Error::InvalidMerge(format!(
                "modify time went backwards: {:?} < {:?}",
                other.modify_time, self.modify_time
            )));
        }
        if timestamp_lt(other.update_time, self.update_time) {
            return Err(Error::InvalidMerge(format!(
                "update time went backwards: {:?} < {:?}",
                other.update_time, self.update_time
            )));
        }

        tracing::info!(incoming = other.len(), "merging maps");

        let other_modify = other.modify_time;
        let other_update = other.update_time;
        let mut merged = 0usize;
        for entry in other.into_entries() {
            if !self.contains(&entry) {
                self.add(entry)?;
                merged += 1;
            }
        }
        tracing::info!(merged, "entries new or modified");

        if merged > 0 {
            self.set_modify_time(other_modify);
        }
        self.set_update_time(other_update);
        Ok(merged > 0)
    }

    #[must_use]
    pub const fn modify_time(&self) -> Option<i64> {
        self.modify_time
    }

    /// Set the modify time, clamping values more than an hour in the future
    /// back to now. Bad source clocks must not wedge incremental updates.
    pub fn set_modify_time(&mut self, value: Option<i64>) {
        self.modify_time = value.map(|ts| {
            let now = Utc::now().timestamp();
            if ts > now + MAX_CLOCK_SKEW_SECS {
                tracing::warn!(ts, now, "modify time is in the future, clamping to now");
                now
            } else {
                ts
            }
        });
    }

    #[must_use]
    pub const fn update_time(&self) -> Option<i64> {
        self.update_time
    }

    pub const fn set_update_time(&mut self, value: Option<i64>) {
        self.update_time = value;
    }

    /// The mountpoint this map serves (automount submaps only).
    #[must_use]
    pub fn mountpoint(&self) -> Option<&str> {
        self.mountpoint.as_deref()
    }

    pub fn set_mountpoint(&mut self, value: Option<String>) {
        self.mountpoint = value;
    }

    /// Where in the source this map was fetched from (automount only).
    #[must_use]
    pub fn filesystem_location(&self) -> Option<&str> {
        self.filesystem_location.as_deref()
    }

    pub fn set_filesystem_location(&mut self, value: Option<String>) {
        self.filesystem_location = value;
    }
}

/// `a < b` where unset sorts below every set value.
const fn timestamp_lt(a: Option<i64>, b: Option<i64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a < b,
        (None, Some(_)) => true,
        _ => false,
    }
}
