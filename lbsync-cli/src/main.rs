//! lbsync: turn cluster resource manifests into a load-balancer config.
//!
//! # Usage
//!
//! ```text
//! lbsync sync [--manifests <dir>] [--config <file>] [--json]
//! lbsync show [--json]
//! lbsync daemon start|stop|status|sync
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{daemon::DaemonCommand, show::ShowArgs, sync::SyncArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "lbsync",
    version,
    about = "Convert ingress and gateway manifests into proxy configuration",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one full pass over a manifest directory and print the result.
    Sync(SyncArgs),

    /// Print the configuration currently held by the running daemon.
    Show(ShowArgs),

    /// Manage the background watcher.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Sync(args) => {
            init_logging();
            args.run()
        }
        Commands::Show(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}

/// Converter warnings go to stderr; `RUST_LOG` overrides the `warn` default.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
