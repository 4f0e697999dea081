//! The chunk upload pool: a fixed set of threads draining a bounded queue
//! of parts.
//!
//! Workers live for the whole synchronization lifetime. They exit only
//! once every sender of the queue is gone, so the pool is shut down after
//! the file workers that feed it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::store::ObjectStore;

use super::chunk::Chunk;
use super::stats::SyncStats;

/// Producer side of the chunk queue. `send` blocks while the queue is full.
pub type ChunkSender = Sender<Chunk>;

pub struct ChunkUploadPool {
    sender: Option<ChunkSender>,
    workers: Vec<JoinHandle<()>>,
}

impl ChunkUploadPool {
    /// Spawn `workers` upload threads behind a queue of `capacity` parts.
    pub fn start(
        store: Arc<dyn ObjectStore>,
        stats: Arc<SyncStats>,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded::<Chunk>(capacity);
        let workers = (0..workers)
            .filter_map(|i| {
                let receiver = receiver.clone();
                let store = Arc::clone(&store);
                let stats = Arc::clone(&stats);
                thread::Builder::new()
                    .name(format!("chunk-upload-{}", i))
                    .spawn(move || chunk_worker(receiver, store, stats))
                    .map_err(|e| tracing::error!("Failed to spawn chunk worker: {}", e))
                    .ok()
            })
            .collect::<Vec<_>>();

        tracing::debug!(workers = workers.len(), capacity, "Chunk upload pool started");
        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// A handle for queueing parts. Returns `None` after shutdown.
    pub fn sender(&self) -> Option<ChunkSender> {
        self.sender.clone()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Close the queue and wait for the workers to finish what is queued.
    /// Any sender handed out earlier must already be dropped, or this waits
    /// for it.
    pub fn shutdown(mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Chunk worker panicked");
            }
        }
        tracing::debug!("Chunk upload pool stopped");
    }
}

fn chunk_worker(receiver: Receiver<Chunk>, store: Arc<dyn ObjectStore>, stats: Arc<SyncStats>) {
    for chunk in receiver.iter() {
        let Chunk {
            object_id,
            index,
            data,
            group,
        } = chunk;
        let len = data.len() as u64;
        tracing::debug!(object = %object_id, part = index, len, "Uploading chunk");

        let result = store.upload_part(&object_id, index, &data);
        // Payload is released before completion is signalled.
        drop(data);

        match &result {
            Ok(()) => stats.add_bytes(len),
            Err(e) => {
                tracing::warn!(object = %object_id, part = index, error = %e, "Chunk upload failed")
            }
        }
        group.complete(index, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{small_part_parameters, MemoryObjectStore};
    use crate::store::NewObject;
    use crate::transfer::chunk::ChunkGroup;

    fn setup() -> (Arc<MemoryObjectStore>, String) {
        let store = Arc::new(MemoryObjectStore::new());
        store.add_project("project-a", small_part_parameters());
        let id = store
            .create_object(&NewObject {
                project_id: "project-a",
                folder: "/",
                name: "big.bin",
                nonce: "n",
            })
            .unwrap();
        (store, id)
    }

    #[test]
    fn uploads_every_queued_part() {
        let (store, id) = setup();
        let stats = Arc::new(SyncStats::default());
        let pool = ChunkUploadPool::start(store.clone(), stats.clone(), 3, 4);
        assert_eq!(pool.worker_count(), 3);

        let group = ChunkGroup::new();
        let sender = pool.sender().unwrap();
        for index in 1..=10u32 {
            group.register();
            sender
                .send(Chunk {
                    object_id: id.clone(),
                    index,
                    data: vec![index as u8; 8],
                    group: Arc::clone(&group),
                })
                .unwrap();
        }
        assert!(group.wait().is_none());
        drop(sender);
        pool.shutdown();

        let object = store.object(&id).unwrap();
        assert_eq!(object.parts.len(), 10);
        assert_eq!(object.parts[&7], vec![7u8; 8]);
        assert_eq!(stats.snapshot().bytes_uploaded, 80);
    }

    #[test]
    fn failed_part_does_not_cancel_the_others() {
        let (store, id) = setup();
        store.fail_part(2);
        let pool = ChunkUploadPool::start(store.clone(), Arc::new(SyncStats::default()), 2, 2);

        let group = ChunkGroup::new();
        let sender = pool.sender().unwrap();
        for index in 1..=5u32 {
            group.register();
            sender
                .send(Chunk {
                    object_id: id.clone(),
                    index,
                    data: vec![1; 4],
                    group: Arc::clone(&group),
                })
                .unwrap();
        }
        let failure = group.wait().expect("part 2 fails");
        assert_eq!(failure.index, 2);
        drop(sender);
        pool.shutdown();

        let object = store.object(&id).unwrap();
        let uploaded: Vec<u32> = object.parts.keys().copied().collect();
        assert_eq!(uploaded, vec![1, 3, 4, 5]);
        assert_eq!(store.calls("upload_part"), 5);
    }

    #[test]
    fn shutdown_with_empty_queue_returns() {
        let (store, _) = setup();
        let pool = ChunkUploadPool::start(store, Arc::new(SyncStats::default()), 4, 4);
        pool.shutdown();
    }
}
