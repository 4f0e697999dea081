//! Running synchronization counters and their human-readable summary.
//!
//! Counters are shared by every worker thread, so they are plain atomics;
//! readers take a [`StatsSnapshot`], which may be a few updates behind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

/// Aggregated counters for the lifetime of one engine.
pub struct SyncStats {
    sweeps: AtomicU64,
    files_updated: AtomicU64,
    files_failed: AtomicU64,
    files_rejected: AtomicU64,
    bytes_uploaded: AtomicU64,
    started: Instant,
}

impl Default for SyncStats {
    fn default() -> Self {
        Self {
            sweeps: AtomicU64::new(0),
            files_updated: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            files_rejected: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl SyncStats {
    pub fn add_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a file whose update finished without error.
    pub fn add_updated(&self) {
        self.files_updated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a file whose update was abandoned.
    pub fn add_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a file rejected before upload (size limits).
    pub fn add_rejected(&self) {
        self.files_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record part bytes accepted by the remote store.
    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            files_updated: self.files_updated.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            files_rejected: self.files_rejected.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Point-in-time copy of [`SyncStats`], also the payload of the `stats`
/// command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub sweeps: u64,
    pub files_updated: u64,
    pub files_failed: u64,
    pub files_rejected: u64,
    pub bytes_uploaded: u64,
    pub uptime_secs: u64,
}

impl StatsSnapshot {
    /// One-line summary, e.g.
    /// ```text
    /// 12 sweeps | 42 files updated (1.2 GB) | 1 failed, 0 rejected | up 3600s
    /// ```
    pub fn summary(&self) -> String {
        format!(
            "{} sweeps | {} files updated ({}) | {} failed, {} rejected | up {}s",
            self.sweeps,
            self.files_updated,
            ByteSize(self.bytes_uploaded),
            self.files_failed,
            self.files_rejected,
            self.uptime_secs,
        )
    }
}
