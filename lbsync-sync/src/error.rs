//! Error types for lbsync-sync.

use thiserror::Error;

use lbsync_core::CoreError;

/// Errors that abort a reconciliation pass.
///
/// Per-object translation problems are logged and skipped by the converters;
/// only faults that leave no safe way to continue the pass surface here.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Loading configuration or manifests failed.
    #[error("{0}")]
    Core(#[from] CoreError),

    /// A converter stage could not complete.
    #[error("stage {stage} failed: {message}")]
    Convert {
        stage: &'static str,
        message: String,
    },

    /// JSON serialization of the proxy model failed.
    #[error("proxy model JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience constructor for [`SyncError::Convert`].
pub fn convert_err(stage: &'static str, message: impl Into<String>) -> SyncError {
    SyncError::Convert {
        stage,
        message: message.into(),
    }
}
