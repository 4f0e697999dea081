//! The sync engine: owns the worker pools and the sweeper, and exposes the
//! lifecycle and the explicit sync trigger.
//!
//! Shutdown runs upstream to downstream: the sweeper stops producing file
//! requests, the file pool drains and stops producing parts, and only then
//! is the chunk queue closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::store::{fetch_upload_parameters, DirtyScope, ObjectStore, SharedMetadata, UploadParameters};
use crate::transfer::pool::ChunkUploadPool;
use crate::transfer::stats::{StatsSnapshot, SyncStats};

use super::gate::SyncGate;
use super::sweep::{sweep, PeriodicSweeper, SweepReport};
use super::upload::{FileUpdateWorkerPool, FileUploader};

/// Result of an explicit sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub sweep: SweepReport,
    /// File updates that finished during the flush.
    pub files_updated: u64,
    /// File updates abandoned during the flush.
    pub files_failed: u64,
}

/// Pools and sweeper of a started engine.
struct Running {
    chunk_pool: ChunkUploadPool,
    uploader: Arc<FileUploader>,
    file_pool: Option<FileUpdateWorkerPool>,
    sweeper: Option<PeriodicSweeper>,
}

impl Running {
    fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
        if let Some(file_pool) = self.file_pool.take() {
            file_pool.shutdown();
        }
        // The uploader holds the last chunk sender outside the pool.
        drop(self.uploader);
        self.chunk_pool.shutdown();
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn ObjectStore>,
    metadata: SharedMetadata,
    params: Arc<HashMap<String, UploadParameters>>,
    stats: Arc<SyncStats>,
    gate: SyncGate,
    /// Held by lifecycle changes and for the whole of an explicit sync.
    running: Mutex<Option<Running>>,
    started: AtomicBool,
}

impl SyncEngine {
    /// Build an engine from already-fetched upload parameters.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn ObjectStore>,
        metadata: SharedMetadata,
        params: HashMap<String, UploadParameters>,
    ) -> Self {
        Self {
            config,
            store,
            metadata,
            params: Arc::new(params),
            stats: Arc::new(SyncStats::default()),
            gate: SyncGate::new(),
            running: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Build an engine for `project_ids`, fetching their upload parameters
    /// from the store.
    pub fn connect(
        config: SyncConfig,
        store: Arc<dyn ObjectStore>,
        metadata: SharedMetadata,
        project_ids: &[String],
    ) -> Result<Self, SyncError> {
        let params = fetch_upload_parameters(store.as_ref(), project_ids)?;
        Ok(Self::new(config, store, metadata, params))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Whether the engine has been started and not yet shut down. Never
    /// waits, even while an explicit sync is draining.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Start the chunk pool, the file pool, and the periodic sweeper.
    pub fn start(&self) -> Result<(), SyncError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(SyncError::AlreadyStarted);
        }

        let chunk_pool = ChunkUploadPool::start(
            Arc::clone(&self.store),
            Arc::clone(&self.stats),
            self.config.chunk_workers(),
            self.config.chunk_queue_capacity(),
        );
        let chunks = chunk_pool.sender().ok_or(SyncError::QueueClosed)?;
        let uploader = Arc::new(FileUploader::new(
            Arc::clone(&self.store),
            Arc::clone(&self.metadata),
            chunks,
            Arc::clone(&self.stats),
        ));
        let file_pool = FileUpdateWorkerPool::start(Arc::clone(&uploader), self.config.file_workers());

        let mut pools = Running {
            chunk_pool,
            uploader,
            file_pool: Some(file_pool),
            sweeper: None,
        };
        match self.start_sweeper(&pools) {
            Ok(sweeper) => pools.sweeper = Some(sweeper),
            Err(e) => {
                pools.shutdown();
                return Err(e);
            }
        }
        *running = Some(pools);
        self.started.store(true, Ordering::SeqCst);

        tracing::info!(
            file_workers = self.config.file_workers(),
            chunk_workers = self.config.chunk_workers(),
            sweep_interval = ?self.config.sweep_interval(),
            "Sync engine started"
        );
        Ok(())
    }

    /// Stop everything, waiting for queued work to drain. Does nothing if
    /// the engine is not running.
    ///
    /// Called during an explicit sync, this waits until the sync has
    /// finished before stopping.
    pub fn shutdown(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            self.started.store(false, Ordering::SeqCst);
            running.shutdown();
            tracing::info!(stats = %self.stats().summary(), "Sync engine stopped");
        }
    }

    /// Flush every dirty file, active or not, and wait until all of them
    /// have been processed.
    ///
    /// Fails immediately with [`SyncError::SyncAlreadyRunning`] if another
    /// explicit sync holds the gate. The file pool and the sweeper are
    /// restarted afterwards, even when the flush failed.
    pub fn trigger_explicit_sync(&self) -> Result<SyncReport, SyncError> {
        let _permit = self.gate.try_acquire()?;
        let mut guard = self.running.lock();
        let running = guard.as_mut().ok_or(SyncError::NotRunning)?;
        tracing::info!("Explicit sync started");

        if let Some(sweeper) = running.sweeper.take() {
            sweeper.stop();
        }

        let before = self.stats.snapshot();
        let swept = match running.file_pool.as_ref().and_then(|pool| pool.sender()) {
            Some(requests) => sweep(
                &self.metadata,
                &self.params,
                &requests,
                DirtyScope::All,
                &self.stats,
            ),
            None => Err(SyncError::QueueClosed),
        };

        // Closing the request queue and joining the workers waits for every
        // request, and every part of it, to finish.
        if let Some(file_pool) = running.file_pool.take() {
            file_pool.shutdown();
        }
        let after = self.stats.snapshot();

        running.file_pool = Some(FileUpdateWorkerPool::start(
            Arc::clone(&running.uploader),
            self.config.file_workers(),
        ));
        let sweeper = self.start_sweeper(running)?;
        running.sweeper = Some(sweeper);

        let report = SyncReport {
            sweep: swept?,
            files_updated: after.files_updated - before.files_updated,
            files_failed: after.files_failed - before.files_failed,
        };
        tracing::info!(
            collected = report.sweep.collected,
            rejected = report.sweep.rejected,
            updated = report.files_updated,
            failed = report.files_failed,
            "Explicit sync finished"
        );
        Ok(report)
    }

    fn start_sweeper(&self, running: &Running) -> Result<PeriodicSweeper, SyncError> {
        let requests = running
            .file_pool
            .as_ref()
            .and_then(|pool| pool.sender())
            .ok_or(SyncError::QueueClosed)?;
        let metadata = Arc::clone(&self.metadata);
        let params = Arc::clone(&self.params);
        let stats = Arc::clone(&self.stats);

        PeriodicSweeper::start(
            self.config.sweep_interval(),
            self.config.wake_interval(),
            move || match sweep(&metadata, &params, &requests, DirtyScope::InactiveOnly, &stats) {
                Ok(report) if report.collected > 0 => {
                    tracing::info!(
                        collected = report.collected,
                        enqueued = report.enqueued,
                        rejected = report.rejected,
                        "Periodic sweep"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Periodic sweep failed: {}", e),
            },
        )
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{small_part_parameters, MemoryMetadataStore, MemoryObjectStore};
    use crate::store::DirtyFileInfo;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn engine() -> (SyncEngine, Arc<MemoryObjectStore>, Arc<Mutex<MemoryMetadataStore>>) {
        let store = Arc::new(MemoryObjectStore::new());
        store.add_project("project-a", small_part_parameters());
        let metadata = MemoryMetadataStore::new(Duration::from_secs(3600)).into_shared();
        let config = SyncConfig {
            file_workers: 2,
            chunk_workers: 2,
            ..SyncConfig::default()
        };
        let engine = SyncEngine::connect(
            config,
            store.clone(),
            metadata.clone(),
            &["project-a".to_string()],
        )
        .unwrap();
        (engine, store, metadata)
    }

    #[test]
    fn start_twice_is_rejected() {
        let (engine, _, _) = engine();
        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.start(), Err(SyncError::AlreadyStarted)));
        engine.shutdown();
        assert!(!engine.is_running());
    }

    #[test]
    fn explicit_sync_requires_running_engine() {
        let (engine, _, _) = engine();
        assert!(matches!(
            engine.trigger_explicit_sync(),
            Err(SyncError::NotRunning)
        ));
    }

    #[test]
    fn explicit_sync_flushes_active_files() {
        let (engine, store, metadata) = engine();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"contents").unwrap();
        metadata.lock().mark_dirty(DirtyFileInfo {
            inode: 1,
            object_id: None,
            project_id: "project-a".into(),
            folder: "/".into(),
            name: "a.txt".into(),
            local_path: path,
            file_size: 8,
            properties: BTreeMap::new(),
            tags: Vec::new(),
            dirty_data: true,
            dirty_metadata: false,
        });

        engine.start().unwrap();
        let report = engine.trigger_explicit_sync().unwrap();
        assert_eq!(report.sweep.collected, 1);
        assert_eq!(report.files_updated, 1);
        assert_eq!(report.files_failed, 0);

        let id = metadata.lock().object_id(1).unwrap();
        assert_eq!(store.object(&id).unwrap().content(), b"contents");
        assert!(engine.is_running());
        engine.shutdown();
    }

    #[test]
    fn restart_after_shutdown() {
        let (engine, _, _) = engine();
        engine.start().unwrap();
        engine.shutdown();
        engine.start().unwrap();
        assert!(engine.trigger_explicit_sync().is_ok());
    }

    #[test]
    fn unknown_project_fails_to_connect() {
        let store = Arc::new(MemoryObjectStore::new());
        let metadata = MemoryMetadataStore::new(Duration::ZERO).into_shared();
        let result = SyncEngine::connect(
            SyncConfig::default(),
            store,
            metadata,
            &["project-missing".to_string()],
        );
        assert!(matches!(result, Err(SyncError::Consistency { .. })));
    }
}
