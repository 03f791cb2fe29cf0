//! `lbsync show`: the running daemon's current proxy configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use lbsync_daemon::{request_config, DaemonError};
use lbsync_sync::ProxyConfig;

use super::render;

/// Arguments for `lbsync show`.
#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl ShowArgs {
    pub fn run(self) -> Result<()> {
        let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;

        let value = match request_config(&home) {
            Ok(value) => value,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                anyhow::bail!("daemon is not running; start it with `lbsync daemon start`")
            }
            Err(err) => return Err(err).context("failed to query daemon configuration"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&value).context("failed to render config JSON")?
            );
            return Ok(());
        }

        let config: ProxyConfig =
            serde_json::from_value(value).context("daemon returned malformed configuration")?;
        render::print_config(&config);
        Ok(())
    }
}
