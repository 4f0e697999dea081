//! Dirty-set sweeps and the background loop that runs them periodically.

use std::collections::HashMap;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::store::{DirtyScope, SharedMetadata, UploadParameters};
use crate::transfer::part_size::plan_part_size;
use crate::transfer::stats::SyncStats;

use super::upload::{FileUpdateRequest, RequestSender};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Dirty files collected (and cleared) from the metadata store.
    pub collected: usize,
    /// Files handed to the update pool.
    pub enqueued: usize,
    /// Files whose size no valid part size can accommodate.
    pub rejected: usize,
}

/// Collect the dirty files in `scope` and hand each to the update pool.
///
/// The metadata lock is held only while collecting. Each send blocks until a
/// file worker takes the request. A file that fails size validation is
/// logged and skipped; its dirty flags are already cleared.
///
/// # Panics
/// If a dirty file belongs to a project with no cached upload parameters.
pub fn sweep(
    metadata: &SharedMetadata,
    params: &HashMap<String, UploadParameters>,
    requests: &RequestSender,
    scope: DirtyScope,
    stats: &SyncStats,
) -> Result<SweepReport, SyncError> {
    let files = metadata
        .lock()
        .take_dirty_files(scope)
        .map_err(|e| SyncError::Metadata(e.to_string()))?;
    stats.add_sweep();

    let mut report = SweepReport {
        collected: files.len(),
        ..SweepReport::default()
    };
    tracing::debug!(?scope, dirty = files.len(), "Collected dirty files");

    for file in files {
        let project_params = params.get(&file.project_id).copied().unwrap_or_else(|| {
            panic!(
                "no upload parameters cached for project {}",
                file.project_id
            )
        });

        let part_size = match plan_part_size(&project_params, file.file_size) {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(
                    inode = file.inode,
                    name = %file.name,
                    error = %e,
                    "File cannot be uploaded"
                );
                stats.add_rejected();
                report.rejected += 1;
                continue;
            }
        };

        let request = FileUpdateRequest {
            file,
            part_size,
            params: project_params,
        };
        if requests.send(request).is_err() {
            tracing::warn!(
                discarded = report.collected - report.enqueued - report.rejected,
                "Update queue closed during sweep"
            );
            return Err(SyncError::QueueClosed);
        }
        report.enqueued += 1;
    }

    Ok(report)
}

/// Background thread calling a sweep routine at a fixed period.
///
/// The thread wakes every `wake_interval` to check for a stop signal, so
/// stopping takes at most one wake interval plus any sweep in progress.
pub struct PeriodicSweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicSweeper {
    pub fn start<F>(
        sweep_interval: Duration,
        wake_interval: Duration,
        mut on_sweep: F,
    ) -> Result<Self, SyncError>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("sweeper".to_string())
            .spawn(move || {
                tracing::debug!(?sweep_interval, "Sweeper started");
                let mut last_sweep = Instant::now();
                loop {
                    match stop_rx.recv_timeout(wake_interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        // Stop signal, or the sweeper handle was dropped.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if last_sweep.elapsed() < sweep_interval {
                        continue;
                    }
                    last_sweep = Instant::now();
                    on_sweep();
                }
                tracing::debug!("Sweeper stopped");
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Signal the loop and wait for it to exit.
    pub fn stop(self) {
        drop(self);
    }

    fn halt(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Sweeper thread panicked");
            }
        }
    }
}

impl Drop for PeriodicSweeper {
    fn drop(&mut self) {
        self.halt();
    }
}
