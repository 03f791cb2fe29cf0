//! lbsync core library: object references, change notifications, resource
//! manifests and the governing configuration.
//!
//! - [`types`]: object references
//! - [`change`]: [`ChangeNotification`], [`ChangeHints`], [`ChangeSet`]
//! - [`manifest`]: resource manifests and their YAML loader
//! - [`config`]: [`ControllerConfig`] load
//! - [`error`]: [`CoreError`]

pub mod change;
pub mod config;
pub mod error;
pub mod manifest;
pub mod types;

pub use change::{
    ChangeHint, ChangeHints, ChangeNotification, ChangeOp, ChangeSet, NotificationList,
};
pub use config::{ControllerConfig, LoggingConfig};
pub use error::CoreError;
pub use manifest::Manifest;
pub use types::{NamespacedName, ObjectKind, ObjectRef, ServiceRef};
