//! Governing controller configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.lbsync/
//!   config.yaml     (optional: defaults apply when absent)
//!   manifests/      (watched resource manifests, *.yaml)
//! ```
//!
//! # API pattern
//!
//! Every function that touches the filesystem has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::types::{NamespacedName, ServiceRef};

/// Upper bound of the "listed" logging tier unless configured otherwise.
pub const DEFAULT_MAX_LISTED_NOTIFICATIONS: usize = 100;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Read-only configuration shared by every converter of every pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Enables the gateway/route domain.
    pub has_gateway: bool,
    /// Only ingresses with this class are converted when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress_class: Option<String>,
    /// Configmap whose change invalidates every generated entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_config_map: Option<NamespacedName>,
    /// Configmap mapping listening ports to TCP services.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_services_config_map: Option<NamespacedName>,
    /// Backend used for requests no rule matches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<ServiceRef>,
    pub logging: LoggingConfig,
}

/// Bounded-cost pass logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Passes with more notifications than this log the count only.
    pub max_listed_notifications: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_listed_notifications: DEFAULT_MAX_LISTED_NOTIFICATIONS,
        }
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<home>/.lbsync/`
pub fn lbsync_root(home: &Path) -> PathBuf {
    home.join(".lbsync")
}

/// `<home>/.lbsync/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    lbsync_root(home).join("config.yaml")
}

/// `<home>/.lbsync/manifests/`: pure, no I/O.
pub fn manifests_dir_at(home: &Path) -> PathBuf {
    lbsync_root(home).join("manifests")
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load `<home>/.lbsync/config.yaml`, falling back to defaults when absent.
pub fn load_at(home: &Path) -> Result<ControllerConfig, CoreError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(ControllerConfig::default());
    }
    load_file_at(&path)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<ControllerConfig, CoreError> {
    load_at(&home()?)
}

/// Load an explicitly named configuration file.
///
/// Unlike [`load_at`], a missing file is an error: the caller asked for it.
pub fn load_file_at(path: &Path) -> Result<ControllerConfig, CoreError> {
    if !path.exists() {
        return Err(CoreError::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    if contents.trim().is_empty() {
        return Ok(ControllerConfig::default());
    }
    serde_yaml::from_str(&contents).map_err(|source| CoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn home() -> Result<PathBuf, CoreError> {
    dirs::home_dir().ok_or(CoreError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
