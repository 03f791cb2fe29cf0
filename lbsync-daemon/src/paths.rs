use std::path::{Path, PathBuf};
use std::time::Duration;

use lbsync_core::config;

/// Quiet period after the last manifest change before a pass is triggered.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
/// A pass runs at least this often even without manifest changes.
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn lbsync_root(home: &Path) -> PathBuf {
    config::lbsync_root(home)
}

pub fn manifests_dir(home: &Path) -> PathBuf {
    config::manifests_dir_at(home)
}

pub fn socket_path(home: &Path) -> PathBuf {
    lbsync_root(home).join(DAEMON_SOCKET)
}
