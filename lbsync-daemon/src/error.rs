use std::path::PathBuf;

use thiserror::Error;

/// Everything that can stop the daemon or fail a control request.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest directory could not be watched.
    #[error("manifest watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// Configuration or manifests failed to load at startup.
    #[error("load error: {0}")]
    Load(#[from] lbsync_core::CoreError),

    #[error("sync pass failed: {0}")]
    Pass(#[from] lbsync_sync::SyncError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A runtime task panicked or was cancelled.
    #[error("{task} task failed: {message}")]
    Task {
        task: &'static str,
        message: String,
    },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Malformed exchange on the control socket.
    #[error("daemon protocol error: {0}")]
    Protocol(String),

    /// The daemon answered a request with an error.
    #[error("daemon replied: {0}")]
    Remote(String),

    #[error("daemon already running (socket in use: {socket})")]
    AlreadyRunning { socket: PathBuf },

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn task_err(task: &'static str, err: impl std::fmt::Display) -> DaemonError {
    DaemonError::Task {
        task,
        message: err.to_string(),
    }
}
