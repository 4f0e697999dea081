//! The per-file update pipeline and the worker pool that runs it.
//!
//! A file update replaces the remote object wholesale: a new object is
//! created and filled, and only once it is closed is the previous version
//! removed. A failure at any step leaves the previous version and the local
//! bytes untouched. A previous version that is already gone counts as
//! removed.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, SendError, Sender};

use crate::error::SyncError;
use crate::store::{DirtyFileInfo, NewObject, ObjectStore, SharedMetadata, StoreError, UploadParameters};
use crate::transfer::chunk::{plan_chunks, Chunk, ChunkGroup};
use crate::transfer::extent::read_extent;
use crate::transfer::pool::ChunkSender;
use crate::transfer::stats::SyncStats;

use super::attributes;
use super::token::new_nonce;

/// A dirty file with the part size it will be uploaded with.
#[derive(Debug, Clone)]
pub struct FileUpdateRequest {
    pub file: DirtyFileInfo,
    pub part_size: u64,
    pub params: UploadParameters,
}

pub type RequestSender = Sender<FileUpdateRequest>;

/// Everything a file worker needs to carry out one update.
pub struct FileUploader {
    store: Arc<dyn ObjectStore>,
    metadata: SharedMetadata,
    chunks: ChunkSender,
    stats: Arc<SyncStats>,
}

impl FileUploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        metadata: SharedMetadata,
        chunks: ChunkSender,
        stats: Arc<SyncStats>,
    ) -> Self {
        Self {
            store,
            metadata,
            chunks,
            stats,
        }
    }

    /// Run the full update of one file: data first, then attributes.
    ///
    /// A file with dirty attributes but no remote object gets its data
    /// uploaded first, since attributes need an object to live on.
    pub fn process(&self, request: &FileUpdateRequest) -> Result<(), SyncError> {
        let file = &request.file;
        let mut object_id = file.object_id.clone();

        if file.dirty_data || (file.dirty_metadata && object_id.is_none()) {
            object_id = Some(self.update_file_data(request)?);
        }

        if file.dirty_metadata {
            if let Some(object_id) = object_id.as_deref() {
                attributes::reconcile(
                    self.store.as_ref(),
                    &file.project_id,
                    object_id,
                    &file.properties,
                    &file.tags,
                )?;
            }
        }
        Ok(())
    }

    /// Upload the file's bytes into a new object and retire the old one.
    /// Returns the new object id.
    pub fn update_file_data(&self, request: &FileUpdateRequest) -> Result<String, SyncError> {
        let file = &request.file;
        let nonce = new_nonce();

        // Creation and recording happen under the metadata lock, so a
        // concurrent removal of the file cannot slip in between them.
        let object_id = {
            let mut metadata = self.metadata.lock();
            let object_id = self
                .store
                .create_object(&NewObject {
                    project_id: &file.project_id,
                    folder: &file.folder,
                    name: &file.name,
                    nonce: &nonce,
                })
                .map_err(|e| SyncError::from_store("create object", e))?;
            metadata
                .update_inode_object_id(file.inode, &object_id)
                .map_err(|e| SyncError::Metadata(e.to_string()))?;
            object_id
        };
        tracing::debug!(
            inode = file.inode,
            object = %object_id,
            name = %file.name,
            "Created remote object"
        );

        self.upload_and_close(request, &object_id)?;

        if let Some(old) = file.object_id.as_ref().filter(|old| **old != object_id) {
            match self
                .store
                .remove_objects(&file.project_id, std::slice::from_ref(old))
            {
                Ok(()) => {
                    tracing::debug!(old = %old, new = %object_id, "Removed previous version")
                }
                Err(StoreError::NotFound(what)) => {
                    tracing::debug!(old = %old, new = %object_id, %what, "Previous version already gone")
                }
                Err(e) => return Err(SyncError::from_store("remove old version", e)),
            }
        }
        Ok(object_id)
    }

    fn upload_and_close(&self, request: &FileUpdateRequest, object_id: &str) -> Result<(), SyncError> {
        let file_size = request.file.file_size;
        tracing::debug!(
            object = %object_id,
            file_size,
            part_size = request.part_size,
            "Uploading file data"
        );

        if file_size == 0 {
            if request.params.empty_last_part_allowed {
                self.store
                    .upload_part(object_id, 1, &[])
                    .map_err(|e| SyncError::from_store("upload empty part", e))?;
            }
        } else if file_size <= request.part_size {
            let data = read_extent(&request.file.local_path, 0, file_size)?;
            self.store
                .upload_part(object_id, 1, &data)
                .map_err(|e| SyncError::from_store("upload part", e))?;
            self.stats.add_bytes(file_size);
        } else {
            self.upload_chunked(request, object_id)?;
        }

        self.store
            .close_and_wait(object_id)
            .map_err(|e| SyncError::from_store("close", e))
    }

    /// Queue every part on the chunk pool and wait for all of them.
    fn upload_chunked(&self, request: &FileUpdateRequest, object_id: &str) -> Result<(), SyncError> {
        let file = &request.file;
        assert!(
            file.file_size > 0,
            "zero-length file {} reached the chunked upload path",
            file.name
        );

        let group = ChunkGroup::new();
        let mut aborted: Option<SyncError> = None;

        for range in plan_chunks(file.file_size, request.part_size) {
            let data = match read_extent(&file.local_path, range.offset, range.length) {
                Ok(data) => data,
                Err(e) => {
                    aborted = Some(e.into());
                    break;
                }
            };
            group.register();
            let chunk = Chunk {
                object_id: object_id.to_string(),
                index: range.index,
                data,
                group: Arc::clone(&group),
            };
            // Blocks while the queue is full.
            if let Err(SendError(chunk)) = self.chunks.send(chunk) {
                chunk
                    .group
                    .complete(chunk.index, Err(StoreError::Transport("chunk queue closed".into())));
                aborted = Some(SyncError::QueueClosed);
                break;
            }
        }

        // Parts already queued run to completion even when this file has
        // already failed.
        let failure = group.wait();
        if let Some(err) = aborted {
            return Err(err);
        }
        match failure {
            Some(failure) => {
                tracing::warn!(object = %object_id, part = failure.index, "Part upload failed");
                Err(SyncError::from_store("upload part", failure.error))
            }
            None => Ok(()),
        }
    }
}

/// Fixed set of threads pulling file update requests.
///
/// The request queue has no buffer: a send hands the request straight to an
/// idle worker and blocks while all workers are busy.
pub struct FileUpdateWorkerPool {
    sender: Option<RequestSender>,
    workers: Vec<JoinHandle<()>>,
}

impl FileUpdateWorkerPool {
    pub fn start(uploader: Arc<FileUploader>, workers: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded::<FileUpdateRequest>(0);
        let workers = (0..workers)
            .filter_map(|i| {
                let receiver = receiver.clone();
                let uploader = Arc::clone(&uploader);
                thread::Builder::new()
                    .name(format!("file-update-{}", i))
                    .spawn(move || file_worker(receiver, uploader))
                    .map_err(|e| tracing::error!("Failed to spawn file worker: {}", e))
                    .ok()
            })
            .collect::<Vec<_>>();

        tracing::debug!(workers = workers.len(), "File update pool started");
        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn sender(&self) -> Option<RequestSender> {
        self.sender.clone()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Close the request queue and wait until every accepted request,
    /// including its parts, has finished.
    pub fn shutdown(mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("File update worker panicked");
            }
        }
        tracing::debug!("File update pool stopped");
    }
}

fn file_worker(receiver: Receiver<FileUpdateRequest>, uploader: Arc<FileUploader>) {
    for request in receiver.iter() {
        let file = &request.file;
        tracing::debug!(
            inode = file.inode,
            name = %file.name,
            dirty_data = file.dirty_data,
            dirty_metadata = file.dirty_metadata,
            "Updating file"
        );
        match uploader.process(&request) {
            Ok(()) => uploader.stats.add_updated(),
            Err(e) => {
                uploader.stats.add_failed();
                tracing::warn!(
                    inode = file.inode,
                    project = %file.project_id,
                    folder = %file.folder,
                    name = %file.name,
                    error = %e,
                    "File update abandoned"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{small_part_parameters, MemoryMetadataStore, MemoryObjectStore};
    use crate::store::{ObjectDescription, PropertyChanges};
    use crate::transfer::pool::ChunkUploadPool;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    type Hook = Box<dyn Fn() + Send + Sync>;

    /// Memory store that runs a hook on entry to `create_object` and
    /// `upload_part`.
    struct HookedStore {
        inner: Arc<MemoryObjectStore>,
        on_create: Hook,
        on_part: Hook,
    }

    impl ObjectStore for HookedStore {
        fn upload_parameters(&self, project_id: &str) -> Result<UploadParameters, StoreError> {
            self.inner.upload_parameters(project_id)
        }

        fn create_object(&self, request: &NewObject<'_>) -> Result<String, StoreError> {
            (self.on_create)();
            self.inner.create_object(request)
        }

        fn upload_part(&self, object_id: &str, index: u32, data: &[u8]) -> Result<(), StoreError> {
            (self.on_part)();
            self.inner.upload_part(object_id, index, data)
        }

        fn close_and_wait(&self, object_id: &str) -> Result<(), StoreError> {
            self.inner.close_and_wait(object_id)
        }

        fn remove_objects(&self, project_id: &str, object_ids: &[String]) -> Result<(), StoreError> {
            self.inner.remove_objects(project_id, object_ids)
        }

        fn describe(&self, object_id: &str) -> Result<ObjectDescription, StoreError> {
            self.inner.describe(object_id)
        }

        fn set_properties(
            &self,
            project_id: &str,
            object_id: &str,
            changes: &PropertyChanges,
        ) -> Result<(), StoreError> {
            self.inner.set_properties(project_id, object_id, changes)
        }

        fn add_tags(&self, project_id: &str, object_id: &str, tags: &[String]) -> Result<(), StoreError> {
            self.inner.add_tags(project_id, object_id, tags)
        }

        fn remove_tags(&self, project_id: &str, object_id: &str, tags: &[String]) -> Result<(), StoreError> {
            self.inner.remove_tags(project_id, object_id, tags)
        }
    }

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        metadata: Arc<parking_lot::Mutex<MemoryMetadataStore>>,
        stats: Arc<SyncStats>,
        pool: ChunkUploadPool,
        _dir: tempfile::TempDir,
        dir_path: std::path::PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryObjectStore::new());
            store.add_project("project-a", small_part_parameters());
            let metadata = MemoryMetadataStore::new(Duration::ZERO).into_shared();
            let stats = Arc::new(SyncStats::default());
            let pool = ChunkUploadPool::start(store.clone(), stats.clone(), 3, 3);
            let dir = tempfile::TempDir::new().unwrap();
            let dir_path = dir.path().to_path_buf();
            Self {
                store,
                metadata,
                stats,
                pool,
                _dir: dir,
                dir_path,
            }
        }

        fn uploader(&self) -> FileUploader {
            let metadata: SharedMetadata = self.metadata.clone();
            FileUploader::new(
                self.store.clone(),
                metadata,
                self.pool.sender().unwrap(),
                self.stats.clone(),
            )
        }

        fn request(&self, inode: u64, content: &[u8], object_id: Option<String>) -> FileUpdateRequest {
            let path = self.dir_path.join(format!("file-{}", inode));
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(content).unwrap();
            let file = DirtyFileInfo {
                inode,
                object_id,
                project_id: "project-a".into(),
                folder: "/data".into(),
                name: format!("file-{}", inode),
                local_path: path,
                file_size: content.len() as u64,
                properties: BTreeMap::new(),
                tags: Vec::new(),
                dirty_data: true,
                dirty_metadata: false,
            };
            self.metadata.lock().mark_dirty(file.clone());
            FileUpdateRequest {
                file,
                part_size: small_part_parameters().max_part_size,
                params: small_part_parameters(),
            }
        }
    }

    #[test]
    fn small_file_is_uploaded_as_one_part() {
        let fx = Fixture::new();
        let uploader = fx.uploader();
        let request = fx.request(1, b"hello", None);

        let id = uploader.update_file_data(&request).unwrap();
        let object = fx.store.object(&id).unwrap();
        assert!(object.closed);
        assert_eq!(object.parts.len(), 1);
        assert_eq!(object.content(), b"hello");
        assert_eq!(fx.metadata.lock().object_id(1), Some(id));
        assert_eq!(fx.store.calls("upload_part"), 1);
    }

    #[test]
    fn large_file_goes_through_chunk_pool() {
        let fx = Fixture::new();
        let uploader = fx.uploader();
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let request = fx.request(2, &content, None);

        let id = uploader.update_file_data(&request).unwrap();
        let object = fx.store.object(&id).unwrap();
        assert!(object.closed);
        assert_eq!(object.parts.len(), 5);
        assert_eq!(object.parts[&5].len(), 5000 - 4 * 1024);
        assert_eq!(object.content(), content);
        assert_eq!(fx.stats.snapshot().bytes_uploaded, 5000);
    }

    #[test]
    fn empty_file_gets_one_empty_part_when_required() {
        let fx = Fixture::new();
        let uploader = fx.uploader();
        let request = fx.request(3, b"", None);

        let id = uploader.update_file_data(&request).unwrap();
        let object = fx.store.object(&id).unwrap();
        assert!(object.closed);
        assert_eq!(object.parts.get(&1), Some(&Vec::new()));
    }

    #[test]
    fn empty_file_closes_without_parts_when_not_required() {
        let fx = Fixture::new();
        let params = UploadParameters {
            empty_last_part_allowed: false,
            ..small_part_parameters()
        };
        fx.store.add_project("project-a", params);
        let uploader = fx.uploader();
        let mut request = fx.request(4, b"", None);
        request.params = params;

        let id = uploader.update_file_data(&request).unwrap();
        assert!(fx.store.object(&id).unwrap().parts.is_empty());
        assert_eq!(fx.store.calls("upload_part"), 0);
    }

    #[test]
    fn replacing_a_file_removes_the_old_version_after_close() {
        let fx = Fixture::new();
        let old = fx
            .store
            .insert_closed("project-a", "/data", "file-5", b"old", BTreeMap::new(), Vec::new());
        let uploader = fx.uploader();
        let request = fx.request(5, b"new contents", Some(old.clone()));

        let id = uploader.update_file_data(&request).unwrap();
        assert_ne!(id, old);
        assert!(fx.store.object(&old).is_none());
        assert_eq!(fx.store.object(&id).unwrap().content(), b"new contents");
    }

    #[test]
    fn failed_part_keeps_old_version() {
        let fx = Fixture::new();
        fx.store.fail_part(3);
        let old = fx
            .store
            .insert_closed("project-a", "/data", "file-6", b"old", BTreeMap::new(), Vec::new());
        let uploader = fx.uploader();
        let request = fx.request(6, &vec![7u8; 4096], Some(old.clone()));

        let err = uploader.update_file_data(&request).unwrap_err();
        assert!(matches!(err, SyncError::Transport { op: "upload part", .. }));
        assert!(fx.store.object(&old).is_some());
        assert_eq!(fx.store.calls("upload_part"), 4);
        assert_eq!(fx.store.calls("close"), 0);
    }

    #[test]
    fn removed_folder_aborts_before_any_upload() {
        let fx = Fixture::new();
        fx.store.remove_folder("project-a", "/data");
        let uploader = fx.uploader();
        let request = fx.request(7, b"data", None);

        let err = uploader.update_file_data(&request).unwrap_err();
        assert!(matches!(err, SyncError::Consistency { op: "create object", .. }));
        assert_eq!(fx.store.calls("upload_part"), 0);
        assert_eq!(fx.metadata.lock().object_id(7), None);
    }

    #[test]
    fn missing_local_file_fails_with_io_error() {
        let fx = Fixture::new();
        let uploader = fx.uploader();
        let request = fx.request(8, b"data", None);
        std::fs::remove_file(&request.file.local_path).unwrap();

        let err = uploader.update_file_data(&request).unwrap_err();
        assert!(matches!(err, SyncError::Io { .. }));
    }

    #[test]
    fn metadata_only_change_without_object_forces_upload() {
        let fx = Fixture::new();
        let uploader = fx.uploader();
        let mut request = fx.request(9, b"", None);
        request.file.dirty_data = false;
        request.file.dirty_metadata = true;
        request.file.tags = vec!["t".into()];

        uploader.process(&request).unwrap();
        let id = fx.metadata.lock().object_id(9).expect("object recorded");
        assert_eq!(fx.store.object(&id).unwrap().tags, vec!["t".to_string()]);
    }

    #[test]
    fn metadata_only_change_skips_data_upload() {
        let fx = Fixture::new();
        let id = fx
            .store
            .insert_closed("project-a", "/data", "file-10", b"x", BTreeMap::new(), Vec::new());
        let uploader = fx.uploader();
        let mut request = fx.request(10, b"x", Some(id.clone()));
        request.file.dirty_data = false;
        request.file.dirty_metadata = true;
        request.file.properties.insert("k".into(), "v".into());

        uploader.process(&request).unwrap();
        assert_eq!(fx.store.calls("create_object"), 0);
        assert_eq!(fx.store.object(&id).unwrap().properties["k"], "v");
    }

    #[test]
    fn worker_pool_drains_on_shutdown() {
        let fx = Fixture::new();
        let uploader = Arc::new(fx.uploader());
        let pool = FileUpdateWorkerPool::start(Arc::clone(&uploader), 2);
        assert_eq!(pool.worker_count(), 2);

        let sender = pool.sender().unwrap();
        for inode in 20..26 {
            sender.send(fx.request(inode, &vec![1u8; 1500], None)).unwrap();
        }
        drop(sender);
        pool.shutdown();

        assert_eq!(fx.stats.snapshot().files_updated, 6);
        for inode in 20..26 {
            let id = fx.metadata.lock().object_id(inode).unwrap();
            assert!(fx.store.object(&id).unwrap().closed);
        }
    }

    #[test]
    fn already_removed_previous_version_still_gets_attributes() {
        let fx = Fixture::new();
        let old = fx
            .store
            .insert_closed("project-a", "/data", "file-11", b"old", BTreeMap::new(), Vec::new());
        fx.store
            .remove_objects("project-a", std::slice::from_ref(&old))
            .unwrap();

        let mut request = fx.request(11, b"new", Some(old.clone()));
        request.file.dirty_metadata = true;
        request.file.tags = vec!["keep".into()];

        let pool = FileUpdateWorkerPool::start(Arc::new(fx.uploader()), 1);
        pool.sender().unwrap().send(request).unwrap();
        pool.shutdown();

        let snapshot = fx.stats.snapshot();
        assert_eq!(snapshot.files_updated, 1);
        assert_eq!(snapshot.files_failed, 0);
        let id = fx.metadata.lock().object_id(11).unwrap();
        assert_ne!(id, old);
        let object = fx.store.object(&id).unwrap();
        assert!(object.closed);
        assert_eq!(object.content(), b"new");
        assert_eq!(object.tags, vec!["keep".to_string()]);
    }

    #[test]
    fn full_chunk_queue_blocks_the_file_worker() {
        let fx = Fixture::new();
        let entered = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        let store = Arc::new(HookedStore {
            inner: fx.store.clone(),
            on_create: Box::new(|| {}),
            on_part: {
                let entered = Arc::clone(&entered);
                Box::new(move || {
                    entered.fetch_add(1, Ordering::SeqCst);
                    let _ = release_rx.recv();
                })
            },
        });

        // One worker, room for two queued parts.
        let pool = ChunkUploadPool::start(store.clone(), fx.stats.clone(), 1, 2);
        let queue = pool.sender().unwrap();
        let metadata: SharedMetadata = fx.metadata.clone();
        let uploader = FileUploader::new(store, metadata, pool.sender().unwrap(), fx.stats.clone());

        let content: Vec<u8> = (0..10 * 1024u32).map(|i| (i % 13) as u8).collect();
        let request = fx.request(12, &content, None);
        let upload = thread::spawn(move || uploader.update_file_data(&request));

        let deadline = Instant::now() + Duration::from_secs(5);
        while entered.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(200));

        // Part 1 is held by the worker, parts 2 and 3 fill the queue, and
        // the file worker is stuck pushing part 4.
        assert_eq!(entered.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 2);
        assert!(!upload.is_finished());

        drop(release_tx);
        let id = upload.join().unwrap().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 10);
        assert_eq!(fx.store.object(&id).unwrap().content(), content);

        drop(queue);
        pool.shutdown();
    }

    #[test]
    fn metadata_lock_is_held_while_creating_the_object() {
        let fx = Fixture::new();
        let lock_was_free = Arc::new(AtomicBool::new(true));
        let store = Arc::new(HookedStore {
            inner: fx.store.clone(),
            on_create: {
                let metadata = fx.metadata.clone();
                let lock_was_free = Arc::clone(&lock_was_free);
                Box::new(move || {
                    lock_was_free.store(metadata.try_lock().is_some(), Ordering::SeqCst)
                })
            },
            on_part: Box::new(|| {}),
        });
        let metadata: SharedMetadata = fx.metadata.clone();
        let uploader = FileUploader::new(store, metadata, fx.pool.sender().unwrap(), fx.stats.clone());
        let request = fx.request(13, b"locked", None);

        let id = uploader.update_file_data(&request).unwrap();
        assert_eq!(fx.store.calls("create_object"), 1);
        assert!(!lock_was_free.load(Ordering::SeqCst));
        assert_eq!(fx.metadata.lock().object_id(13), Some(id));
    }
}
