//! The converter contract shared by every resource domain.

use lbsync_core::{ChangeSet, ControllerConfig};

use crate::cache::ResourceStore;
use crate::error::SyncError;

/// Everything a converter is bound to for one pass.
///
/// All three references are immutable for the whole pass; the mutable target
/// is handed to each converter call instead of being captured, so converters
/// never hold it between calls.
#[derive(Debug, Clone, Copy)]
pub struct PassContext<'a> {
    pub options: &'a ControllerConfig,
    pub store: &'a ResourceStore,
    pub changes: &'a ChangeSet,
}

/// One resource domain's share of a reconciliation pass.
///
/// Instances are constructed per pass and dropped at its end.
pub trait Converter<T> {
    /// Whether an incremental patch is insufficient for this domain.
    ///
    /// Called before any mutation of the target; must not have side effects.
    fn need_full_sync(&self, target: &T) -> bool;

    /// Apply this domain's share of the change set.
    ///
    /// With `full_sync` the target has already been wiped and the converter
    /// rebuilds its domain from scratch; otherwise it patches incrementally.
    fn sync(&mut self, target: &mut T, full_sync: bool) -> Result<(), SyncError>;
}
