//! Single-slot gate serializing explicit syncs.

use parking_lot::{Mutex, MutexGuard};

use crate::error::SyncError;

/// Held for the duration of one explicit sync. Dropping it reopens the gate.
pub struct SyncPermit<'a> {
    _slot: MutexGuard<'a, ()>,
}

/// At most one explicit sync runs at a time. A second caller is turned
/// away immediately instead of queueing behind the first.
#[derive(Default)]
pub struct SyncGate {
    slot: Mutex<()>,
}

impl SyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Result<SyncPermit<'_>, SyncError> {
        self.slot
            .try_lock()
            .map(|slot| SyncPermit { _slot: slot })
            .ok_or(SyncError::SyncAlreadyRunning)
    }

    pub fn is_held(&self) -> bool {
        self.slot.is_locked()
    }
}
