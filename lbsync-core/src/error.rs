//! Error types for lbsync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from loading configuration and manifests.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.lbsync/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// An explicitly requested configuration file did not exist.
    #[error("configuration not found at {path}")]
    ConfigNotFound { path: PathBuf },

    /// A `namespace/name` or `namespace/name:port` reference could not be parsed.
    #[error("invalid object reference '{0}'")]
    InvalidObjectRef(String),
}

/// Convenience constructor for [`CoreError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}
