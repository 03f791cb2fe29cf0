//! Change accumulator: the concurrently written buffer of pending change
//! notifications, swapped out once per reconciliation pass.
//!
//! ## Swap discipline
//!
//! All state lives behind one mutex. Producers hold it only for a `Vec::push`
//! and the consumer only for a `mem::take`, so a swap never waits on a pass
//! and a producer never waits on more than another O(1) critical section.
//! Every call that completes before `swap` starts is in the returned
//! [`ChangeSet`]; every call that starts after it returns lands in the next
//! one; a call racing with the swap is serialized by the mutex onto exactly
//! one side.
//!
//! A poisoned mutex is recovered rather than propagated: the protected data is
//! a plain `ChangeSet` that cannot be left half-written by a panicking push.

use std::sync::{Mutex, MutexGuard, PoisonError};

use lbsync_core::{ChangeHint, ChangeNotification, ChangeSet};

#[derive(Debug, Default)]
pub struct ChangeAccumulator {
    pending: Mutex<ChangeSet>,
}

impl ChangeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// An accumulator whose first swap demands a full sync.
    pub fn with_full_sync() -> Self {
        let acc = Self::new();
        acc.mark_full_sync_required();
        acc
    }

    /// Append one notification.
    pub fn record(&self, notification: ChangeNotification) {
        self.lock().objects.push(notification);
    }

    /// Append several notifications; they land in the same change set.
    pub fn record_all(&self, notifications: impl IntoIterator<Item = ChangeNotification>) {
        let mut pending = self.lock();
        pending.objects.extend(notifications);
    }

    /// Append a notification together with the hint it implies, so a swap can
    /// never separate the two.
    pub fn record_with_hint(&self, notification: ChangeNotification, hint: ChangeHint) {
        let mut pending = self.lock();
        pending.objects.push(notification);
        pending.hints.apply(hint);
    }

    /// Set the sticky full-sync flag. Idempotent.
    pub fn mark_full_sync_required(&self) {
        self.lock().need_full_sync = true;
    }

    /// Take everything accumulated since the previous swap and reset to empty.
    pub fn swap(&self) -> ChangeSet {
        std::mem::take(&mut *self.lock())
    }

    /// Number of notifications waiting for the next swap.
    pub fn pending_len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn full_sync_pending(&self) -> bool {
        self.lock().need_full_sync
    }

    fn lock(&self) -> MutexGuard<'_, ChangeSet> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
