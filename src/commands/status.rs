use chrono::{Local, TimeZone};

use crate::caches::{self, Cache};
use crate::cli::{GlobalArgs, StatusArgs};
use crate::commands::{configuration_failed, load_config};
use crate::config::Config;
use crate::error::Result;
use crate::maps::{Map, MapEntry, MapKind};
use crate::update::MapUpdater;

/// One templated line pair per map: the last-modify and last-update
/// timestamps, human-readable by default, raw epoch with `--epoch`.
pub fn cmd_status(args: &StatusArgs, global: &GlobalArgs) -> i32 {
    let config = match load_config(global, &args.maps) {
        Ok(config) => config,
        Err(err) => return configuration_failed(&err),
    };

    for &kind in &config.maps {
        let stanzas = if kind == MapKind::Automount {
            match automount_metadata(&config, args.epoch) {
                Ok(stanzas) => stanzas,
                Err(err) => {
                    tracing::error!(%err, "cannot collect automount status");
                    return 1;
                }
            }
        } else {
            single_map_metadata(&config, kind, None, args.epoch)
        };

        for stanza in stanzas {
            let template = if stanza.automount.is_some() {
                &args.automount_template
            } else {
                &args.template
            };
            println!("{}", stanza.render(template));
        }
    }
    0
}

struct Stanza {
    map: MapKind,
    automount: Option<String>,
    key: &'static str,
    value: String,
}

impl Stanza {
    fn render(&self, template: &str) -> String {
        template
            .replace("%(map)s", self.map.name())
            .replace("%(automount)s", self.automount.as_deref().unwrap_or(""))
            .replace("%(key)s", self.key)
            .replace("%(value)s", &self.value)
    }
}

fn single_map_metadata(
    config: &Config,
    kind: MapKind,
    mountpoint: Option<&str>,
    epoch: bool,
) -> Vec<Stanza> {
    let updater = MapUpdater::new(kind, &config.timestamp_dir, mountpoint);
    let automount = mountpoint.map(str::to_string);
    vec![
        Stanza {
            map: kind,
            automount: automount.clone(),
            key: "last-modify-timestamp",
            value: format_timestamp(updater.modify_timestamp(), epoch),
        },
        Stanza {
            map: kind,
            automount,
            key: "last-update-timestamp",
            value: format_timestamp(updater.update_timestamp(), epoch),
        },
    ]
}

/// Automount expands into the master map plus one stanza pair per
/// mountpoint listed in the local master cache.
fn automount_metadata(config: &Config, epoch: bool) -> Result<Vec<Stanza>> {
    let map_config = config
        .map_config(MapKind::Automount)
        .expect("selected maps always carry options");

    let master_cache = caches::create(&map_config.cache, MapKind::Automount, None)?;
    let mut stanzas: Vec<Stanza> = single_map_metadata(config, MapKind::Automount, None, epoch)
        .into_iter()
        .map(|stanza| Stanza {
            automount: Some(master_cache.cache_path().display().to_string()),
            ..stanza
        })
        .collect();

    let master = match master_cache.read() {
        Ok(master) => master,
        Err(err) => {
            tracing::warn!(%err, "no local automount master map");
            Map::new(MapKind::Automount)
        }
    };
    for entry in master.iter() {
        let MapEntry::Automount(entry) = entry else {
            continue;
        };
        stanzas.extend(single_map_metadata(
            config,
            MapKind::Automount,
            Some(&entry.key),
            epoch,
        ));
    }
    Ok(stanzas)
}

fn format_timestamp(ts: Option<i64>, epoch: bool) -> String {
    if epoch {
        return ts.unwrap_or(0).to_string();
    }
    match ts {
        Some(ts) => Local
            .timestamp_opt(ts, 0)
            .single()
            .map_or_else(|| "Unknown".to_string(), |when| when.format("%c").to_string()),
        None => "Unknown".to_string(),
    }
}
