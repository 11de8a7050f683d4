use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, CommandKind};
use crate::commands::{cmd_repair, cmd_status, cmd_update, cmd_verify};

pub fn execute(cli: Cli) -> i32 {
    init_logging(&cli);

    match &cli.command {
        CommandKind::Update(args) => cmd_update(args, &cli.global),
        CommandKind::Verify(args) => cmd_verify(args, &cli.global),
        CommandKind::Repair(args) => cmd_repair(args, &cli.global),
        CommandKind::Status(args) => cmd_status(args, &cli.global),
    }
}

/// Logging goes to stderr: warnings by default, `-v` for progress, `-d`
/// for the chatty implementation details. `RUST_LOG` still wins when set.
fn init_logging(cli: &Cli) {
    let default_level = if cli.global.debug {
        "debug"
    } else if cli.global.verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    // A second init (e.g. tests driving run_from repeatedly) is fine.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
