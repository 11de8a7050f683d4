use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

const ROOT_HELP: &str =
    "Run `nsscache <command> --help` for command-specific usage. The configuration file \
     defaults to /etc/nsscache.conf and can also be set via NSSCACHE_CONFIG.";

#[derive(Debug, Clone, Parser)]
#[command(
    name = "nsscache",
    about = "Synchronise a local NSS cache against a remote data source",
    version,
    arg_required_else_help = true,
    after_long_help = ROOT_HELP
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    pub command: CommandKind,
}

#[derive(Debug, Clone, Args, Default)]
pub struct GlobalArgs {
    #[arg(long, short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,
    #[arg(long, short = 'd', global = true, help = "Enable debugging output")]
    pub debug: bool,
    #[arg(
        long = "config-file",
        short = 'c',
        global = true,
        value_name = "FILE",
        help = "Read configuration from FILE"
    )]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CommandKind {
    #[command(about = "Update the configured caches from the configured sources")]
    Update(UpdateArgs),
    #[command(about = "Verify the cache and configuration")]
    Verify(VerifyArgs),
    #[command(about = "Repair the cache: verify, then force a full refresh")]
    Repair(RepairArgs),
    #[command(about = "Show per-map cache status")]
    Status(StatusArgs),
}

#[derive(Debug, Clone, Parser, Default)]
pub struct UpdateArgs {
    #[arg(
        short = 'f',
        long = "full",
        help = "Force a full update from the data source"
    )]
    pub full: bool,
    #[arg(
        short = 'm',
        long = "map",
        value_name = "MAP",
        help = "Map to operate on, can be supplied multiple times"
    )]
    pub maps: Vec<String>,
    #[arg(
        long,
        help = "Force writing new maps, overriding safety checks such as refusing to write empty maps"
    )]
    pub force_write: bool,
    #[arg(
        long,
        help = "Forcibly acquire the lock, sending SIGTERM to any holder"
    )]
    pub force_lock: bool,
    #[arg(
        short = 's',
        long = "sleep",
        value_name = "SECONDS",
        help = "Number of seconds to sleep before executing"
    )]
    pub sleep: Option<u64>,
}

#[derive(Debug, Clone, Parser, Default)]
pub struct VerifyArgs {
    #[arg(
        short = 'm',
        long = "map",
        value_name = "MAP",
        help = "Map to operate on, can be supplied multiple times"
    )]
    pub maps: Vec<String>,
}

#[derive(Debug, Clone, Parser, Default)]
pub struct RepairArgs {
    #[arg(
        short = 'm',
        long = "map",
        value_name = "MAP",
        help = "Map to operate on, can be supplied multiple times"
    )]
    pub maps: Vec<String>,
}

#[derive(Debug, Clone, Parser)]
pub struct StatusArgs {
    #[arg(
        short = 'm',
        long = "map",
        value_name = "MAP",
        help = "Map to operate on, can be supplied multiple times"
    )]
    pub maps: Vec<String>,
    #[arg(long, help = "Show timestamps in UNIX epoch time")]
    pub epoch: bool,
    #[arg(
        long,
        value_name = "FORMAT",
        default_value = "NSS map: %(map)s\n%(key)s: %(value)s",
        help = "Set format for output"
    )]
    pub template: String,
    #[arg(
        long = "automount-template",
        value_name = "FORMAT",
        default_value = "NSS map: %(map)s\nAutomount map: %(automount)s\n%(key)s: %(value)s",
        help = "Set format for automount output"
    )]
    pub automount_template: String,
}

impl Default for StatusArgs {
    fn default() -> Self {
        Self {
            maps: Vec::new(),
            epoch: false,
            template: "NSS map: %(map)s\n%(key)s: %(value)s".to_string(),
            automount_template:
                "NSS map: %(map)s\nAutomount map: %(automount)s\n%(key)s: %(value)s".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn update_flags() {
        let cli = parse(&[
            "nsscache",
            "update",
            "-f",
            "-m",
            "passwd",
            "-m",
            "group",
            "--force-write",
            "--force-lock",
            "-s",
            "30",
        ]);
        match cli.command {
            CommandKind::Update(args) => {
                assert!(args.full);
                assert_eq!(args.maps, vec!["passwd", "group"]);
                assert!(args.force_write);
                assert!(args.force_lock);
                assert_eq!(args.sleep, Some(30));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_are_accepted_after_the_subcommand() {
        let cli = parse(&["nsscache", "status", "-v", "-c", "/tmp/nsscache.conf"]);
        assert!(cli.global.verbose);
        assert_eq!(
            cli.global.config_file,
            Some(PathBuf::from("/tmp/nsscache.conf"))
        );
    }

    #[test]
    fn status_defaults() {
        let cli = parse(&["nsscache", "status"]);
        match cli.command {
            CommandKind::Status(args) => {
                assert!(!args.epoch);
                assert!(args.template.contains("%(value)s"));
                assert!(args.automount_template.contains("%(automount)s"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["nsscache", "refresh"]).is_err());
    }
}
