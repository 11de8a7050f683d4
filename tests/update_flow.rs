//! End-to-end refresh cycles over a temp directory: a canned source, the
//! files cache writer, and the map updater, asserting the exact on-disk
//! artifacts (cache bytes, timestamp files) after each cycle.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use nsscache::caches::{self, Cache};
use nsscache::config::{Options, Value};
use nsscache::error::Result;
use nsscache::maps::{Map, MapEntry, MapKind, PasswdEntry};
use nsscache::sources::Source;
use nsscache::update::MapUpdater;

struct CannedSource {
    responses: Vec<Map>,
}

impl Source for CannedSource {
    fn name(&self) -> &'static str {
        "canned"
    }

    fn get_map(&mut self, kind: MapKind, _since: Option<i64>) -> Result<Map> {
        if self.responses.is_empty() {
            return Ok(Map::new(kind));
        }
        Ok(self.responses.remove(0))
    }
}

fn passwd_entry(name: &str, uid: u32) -> MapEntry {
    MapEntry::Passwd(PasswdEntry {
        name: name.to_string(),
        uid,
        gid: uid,
        dir: format!("/home/{name}"),
        shell: "/bin/bash".to_string(),
        ..PasswdEntry::default()
    })
}

fn passwd_map(entries: &[(&str, u32)], modify: Option<i64>) -> Map {
    let mut map = Map::new(MapKind::Passwd);
    for &(name, uid) in entries {
        map.add(passwd_entry(name, uid)).unwrap();
    }
    map.set_modify_time(modify);
    map
}

struct Runtime {
    _root: TempDir,
    cache_dir: PathBuf,
    timestamp_dir: PathBuf,
}

impl Runtime {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let cache_dir = root.path().join("cache");
        let timestamp_dir = root.path().join("timestamps");
        fs::create_dir_all(&cache_dir).unwrap();
        fs::create_dir_all(&timestamp_dir).unwrap();
        Self {
            _root: root,
            cache_dir,
            timestamp_dir,
        }
    }

    fn cache(&self) -> Box<dyn Cache> {
        let mut options = Options::new();
        options.set_str("name", "files");
        options.insert("dir", Value::Str(self.cache_dir.display().to_string()));
        caches::create(&options, MapKind::Passwd, None).unwrap()
    }

    fn updater(&self) -> MapUpdater {
        MapUpdater::new(MapKind::Passwd, &self.timestamp_dir, None)
    }

    fn cache_file(&self) -> PathBuf {
        self.cache_dir.join("passwd.cache")
    }

    fn timestamp(&self, which: &str) -> String {
        fs::read_to_string(
            self.timestamp_dir
                .join(format!("timestamp-passwd-{which}")),
        )
        .unwrap()
    }
}

fn run_update(
    runtime: &Runtime,
    source: &mut CannedSource,
    incremental: bool,
) -> Result<()> {
    let mut cache = runtime.cache();
    runtime.updater().update_cache_from_source(
        cache.as_mut(),
        source,
        incremental,
        false,
        None,
    )
}

#[test]
fn full_update_writes_exact_artifacts() {
    let runtime = Runtime::new();
    let mut source = CannedSource {
        responses: vec![passwd_map(&[("root", 0), ("alice", 1000)], Some(2))],
    };

    run_update(&runtime, &mut source, false).unwrap();

    assert_eq!(
        fs::read_to_string(runtime.cache_file()).unwrap(),
        "root:x:0:0::/home/root:/bin/bash\nalice:x:1000:1000::/home/alice:/bin/bash\n"
    );
    assert_eq!(runtime.timestamp("modify"), "1970-01-01T00:00:02Z\n");
    // The update timestamp is the commit wall clock, not the source's.
    assert_ne!(runtime.timestamp("update"), "1970-01-01T00:00:02Z\n");
}

#[test]
fn incremental_update_merges_new_entries() {
    let runtime = Runtime::new();
    let mut seed = CannedSource {
        responses: vec![passwd_map(&[("bar", 20)], Some(1))],
    };
    run_update(&runtime, &mut seed, false).unwrap();

    let mut source = CannedSource {
        responses: vec![passwd_map(&[("foo", 10)], Some(2))],
    };
    run_update(&runtime, &mut source, true).unwrap();

    assert_eq!(
        fs::read_to_string(runtime.cache_file()).unwrap(),
        "bar:x:20:20::/home/bar:/bin/bash\nfoo:x:10:10::/home/foo:/bin/bash\n"
    );
    assert_eq!(runtime.timestamp("modify"), "1970-01-01T00:00:02Z\n");
}

#[test]
fn unchanged_source_leaves_cache_bytes_alone() {
    let runtime = Runtime::new();
    let mut seed = CannedSource {
        responses: vec![passwd_map(&[("alice", 1000)], Some(5))],
    };
    run_update(&runtime, &mut seed, false).unwrap();
    let bytes = fs::read(runtime.cache_file()).unwrap();
    let modify = runtime.timestamp("modify");
    let mtime = fs::metadata(runtime.cache_file()).unwrap().modified().unwrap();

    // Incremental run against a source with nothing new: the canned
    // source answers with an empty map, like a 304 would produce.
    let mut source = CannedSource { responses: vec![] };
    run_update(&runtime, &mut source, true).unwrap();

    assert_eq!(fs::read(runtime.cache_file()).unwrap(), bytes);
    assert_eq!(
        fs::metadata(runtime.cache_file()).unwrap().modified().unwrap(),
        mtime
    );
    assert_eq!(runtime.timestamp("modify"), modify);
    assert!(!runtime.timestamp("update").is_empty());
}

#[test]
fn reading_back_a_committed_cache_round_trips() {
    let runtime = Runtime::new();
    let mut source = CannedSource {
        responses: vec![passwd_map(&[("root", 0), ("alice", 1000)], Some(2))],
    };
    run_update(&runtime, &mut source, false).unwrap();

    let reread = runtime.cache().read().unwrap();
    assert_eq!(reread.len(), 2);
    assert!(reread.contains(&passwd_entry("root", 0)));
    assert!(reread.contains(&passwd_entry("alice", 1000)));
}

#[test]
fn no_temp_files_survive_a_refresh() {
    let runtime = Runtime::new();
    let mut source = CannedSource {
        responses: vec![passwd_map(&[("root", 0)], Some(1))],
    };
    run_update(&runtime, &mut source, false).unwrap();

    let stray: Vec<String> = fs::read_dir(&runtime.cache_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "passwd.cache")
        .collect();
    assert!(stray.is_empty(), "unexpected leftovers: {stray:?}");
    assert_no_strays(&runtime.timestamp_dir);
}

fn assert_no_strays(dir: &Path) {
    let strays: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with("timestamp-"))
        .collect();
    assert!(strays.is_empty(), "unexpected leftovers: {strays:?}");
}
