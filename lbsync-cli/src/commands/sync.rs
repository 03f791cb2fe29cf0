//! `lbsync sync`: one full pass over a manifest directory, no daemon needed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;

use lbsync_core::config;
use lbsync_sync::timer::StageTick;
use lbsync_sync::{ClusterCache, Orchestrator, PassReport, ProxyConfig, StageTimer};

use super::render;

/// Arguments for `lbsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Directory of resource manifests (defaults to ~/.lbsync/manifests).
    #[arg(long)]
    pub manifests: Option<PathBuf>,

    /// Controller configuration file (defaults to ~/.lbsync/config.yaml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct SyncOutput<'a> {
    report: &'a PassReport,
    timings: &'a [StageTick],
    fingerprint: String,
    config: &'a ProxyConfig,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;

        let options = match &self.config {
            Some(path) => config::load_file_at(path),
            None => config::load_at(&home),
        }
        .context("failed to load controller configuration")?;
        let dir = self
            .manifests
            .clone()
            .unwrap_or_else(|| config::manifests_dir_at(&home));

        let cache = Arc::new(ClusterCache::new(&options));
        let objects = cache
            .load_dir(&dir)
            .with_context(|| format!("failed to load manifests from {}", dir.display()))?;
        let orchestrator = Orchestrator::new(cache, Arc::new(options));

        let mut timer = StageTimer::new();
        let report = orchestrator.sync(&mut timer).context("sync pass failed")?;
        let proxy = orchestrator.with_target(ProxyConfig::clone);
        let fingerprint = proxy
            .fingerprint()
            .context("failed to fingerprint proxy configuration")?;

        if self.json {
            let payload = SyncOutput {
                report: &report,
                timings: timer.ticks(),
                fingerprint,
                config: &proxy,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize sync JSON")?
            );
            return Ok(());
        }

        println!(
            "{} {} objects from {} | stages: {}",
            "synced".green().bold(),
            objects,
            dir.display(),
            timer.summary(),
        );
        render::print_config(&proxy);
        println!("fingerprint: {}", fingerprint.bright_black());
        Ok(())
    }
}
