use crate::error::{Error, Result};
use crate::maps::MapKind;

/// One `passwd(5)` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub passwd: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub dir: String,
    pub shell: String,
}

impl Default for PasswdEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            passwd: "x".to_string(),
            uid: 0,
            gid: 0,
            gecos: String::new(),
            dir: String::new(),
            shell: String::new(),
        }
    }
}

/// One `group(5)` record. Members keep source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub passwd: String,
    pub gid: u32,
    pub members: Vec<String>,
}

impl Default for GroupEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            passwd: "x".to_string(),
            gid: 0,
            members: Vec::new(),
        }
    }
}

/// One `shadow(5)` record. Unset integer fields serialize as empty columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowEntry {
    pub name: String,
    pub passwd: String,
    pub lstchg: Option<i64>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub warn: Option<i64>,
    pub inact: Option<i64>,
    pub expire: Option<i64>,
    pub flag: Option<i64>,
}

impl Default for ShadowEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            passwd: "!!".to_string(),
            lstchg: None,
            min: None,
            max: None,
            warn: None,
            inact: None,
            expire: None,
            flag: None,
        }
    }
}

/// One `netgroup(5)` record.
///
/// `entries` is the raw remainder of the line after the group name: a
/// space-delimited mix of member group names and `(host,user,domain)`
/// triples. It is kept as a single string, extra spacing included, because
/// the on-disk format tolerates anything getnetgrent() tolerates and we
/// never dereference members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetgroupEntry {
    pub name: String,
    pub entries: Option<String>,
}

/// One record in an `auto.*` map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutomountEntry {
    pub key: String,
    pub location: String,
    pub options: Option<String>,
}

/// One public-key record for the sshkey map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshkeyEntry {
    pub name: String,
    pub sshkey: String,
}

/// A record of any map kind. The variant fixes the schema; there is no
/// dynamic attribute access and no unknown-attribute path.
///
/// The primary key of a stored entry is immutable by construction: `Map`
/// takes entries by value and hands out shared references only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapEntry {
    Passwd(PasswdEntry),
    Group(GroupEntry),
    Shadow(ShadowEntry),
    Netgroup(NetgroupEntry),
    Automount(AutomountEntry),
    Sshkey(SshkeyEntry),
}

impl MapEntry {
    #[must_use]
    pub const fn kind(&self) -> MapKind {
        match self {
            Self::Passwd(_) => MapKind::Passwd,
            Self::Group(_) => MapKind::Group,
            Self::Shadow(_) => MapKind::Shadow,
            Self::Netgroup(_) => MapKind::Netgroup,
            Self::Automount(_) => MapKind::Automount,
            Self::Sshkey(_) => MapKind::Sshkey,
        }
    }

    /// The unique key this entry is indexed under.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Passwd(e) => &e.name,
            Self::Group(e) => &e.name,
            Self::Shadow(e) => &e.name,
            Self::Netgroup(e) => &e.name,
            Self::Automount(e) => &e.key,
            Self::Sshkey(e) => &e.name,
        }
    }

    /// Validate the entry against its schema.
    ///
    /// Colon-delimited kinds reject `:` inside any string field, since a
    /// colon would shift every later column of the serialized record.
    pub fn verify(&self) -> Result<()> {
        match self {
            Self::Passwd(e) => {
                require_key(&e.name)?;
                no_colon(&[&e.name, &e.passwd, &e.gecos, &e.dir, &e.shell])
            }
            Self::Group(e) => {
                require_key(&e.name)?;
                no_colon(&[&e.name, &e.passwd])?;
                let members: Vec<&str> = e.members.iter().map(String::as_str).collect();
                no_colon(&members)?;
                // The member list is comma-joined on disk; a comma inside a
                // member would split it into two on the next read.
                no_comma(&members)
            }
            Self::Shadow(e) => {
                require_key(&e.name)?;
                no_colon(&[&e.name, &e.passwd])
            }
            Self::Netgroup(e) => require_key(&e.name),
            Self::Automount(e) => {
                require_key(&e.key)?;
                if e.location.is_empty() {
                    return Err(Error::InvalidMap(format!(
                        "automount entry {:?} has no location",
                        e.key
                    )));
                }
                Ok(())
            }
            Self::Sshkey(e) => {
                require_key(&e.name)?;
                no_colon(&[&e.name, &e.sshkey])
            }
        }
    }
}

fn require_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidMap("entry has an empty key".to_string()));
    }
    Ok(())
}

fn no_colon<S: AsRef<str>>(values: &[S]) -> Result<()> {
    for value in values {
        if value.as_ref().contains(':') {
            return Err(Error::InvalidMap(format!(
                "colon in string value {:?}",
                value.as_ref()
            )));
        }
    }
    Ok(())
}

fn no_comma<S: AsRef<str>>(values: &[S]) -> Result<()> {
    for value in values {
        if value.as_ref().contains(',') {
            return Err(Error::InvalidMap(format!(
                "comma in string value {:?}",
                value.as_ref()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwd_defaults() {
        let entry = PasswdEntry::default();
        assert_eq!(entry.passwd, "x");
        assert_eq!(entry.gecos, "");
    }

    #[test]
    fn shadow_defaults_to_locked_password() {
        let entry = ShadowEntry::default();
        assert_eq!(entry.passwd, "!!");
        assert_eq!(entry.lstchg, None);
    }

    #[test]
    fn verify_rejects_empty_key() {
        let entry = MapEntry::Passwd(PasswdEntry::default());
        assert!(entry.verify().is_err());
    }

    #[test]
    fn verify_rejects_colon_in_strings() {
        let entry = MapEntry::Passwd(PasswdEntry {
            name: "foo".to_string(),
            gecos: "evil:gecos".to_string(),
            ..PasswdEntry::default()
        });
        assert!(matches!(entry.verify(), Err(Error::InvalidMap(_))));

        let entry = MapEntry::Group(GroupEntry {
            name: "grp".to_string(),
            gid: 10,
            members: vec!["ok".to_string(), "not:ok".to_string()],
            ..GroupEntry::default()
        });
        assert!(entry.verify().is_err());

        let entry = MapEntry::Shadow(ShadowEntry {
            name: "na:me".to_string(),
            ..ShadowEntry::default()
        });
        assert!(entry.verify().is_err());
    }

    #[test]
    fn verify_rejects_comma_in_group_members() {
        let entry = MapEntry::Group(GroupEntry {
            name: "grp".to_string(),
            gid: 10,
            members: vec!["alice,bob".to_string()],
            ..GroupEntry::default()
        });
        assert!(matches!(entry.verify(), Err(Error::InvalidMap(_))));
    }

    #[test]
    fn verify_allows_colon_in_automount_location() {
        let entry = MapEntry::Automount(AutomountEntry {
            key: "home".to_string(),
            location: "fileserver:/export/home".to_string(),
            options: Some("-tcp".to_string()),
        });
        assert!(entry.verify().is_ok());
    }

    #[test]
    fn verify_requires_automount_location() {
        let entry = MapEntry::Automount(AutomountEntry {
            key: "home".to_string(),
            ..AutomountEntry::default()
        });
        assert!(entry.verify().is_err());
    }

    #[test]
    fn netgroup_name_only_is_valid() {
        let entry = MapEntry::Netgroup(NetgroupEntry {
            name: "admins".to_string(),
            entries: None,
        });
        assert!(entry.verify().is_ok());
    }
}
