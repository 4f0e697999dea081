//! In-process implementations of [`ObjectStore`] and [`MetadataStore`].
//!
//! The object store keeps every part in memory and can be told to fail
//! specific part uploads or to forget a folder, which is enough to exercise
//! every failure path of the engine without a network.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{
    DirtyFileInfo, DirtyScope, Inode, MetadataStore, NewObject, ObjectDescription, ObjectStore,
    PropertyChanges, StoreError, UploadParameters,
};

/// Limits small enough that a few KiB of test data spans several parts.
pub fn small_part_parameters() -> UploadParameters {
    UploadParameters {
        min_part_size: 16,
        max_part_size: 1024,
        max_num_parts: 10_000,
        max_file_size: 1 << 30,
        empty_last_part_allowed: true,
    }
}

/// Snapshot of one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub project_id: String,
    pub folder: String,
    pub name: String,
    pub parts: BTreeMap<u32, Vec<u8>>,
    pub closed: bool,
    pub properties: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

impl StoredObject {
    /// Concatenation of all parts in index order.
    pub fn content(&self) -> Vec<u8> {
        self.parts.values().flatten().copied().collect()
    }
}

#[derive(Default)]
struct ObjectState {
    projects: HashMap<String, UploadParameters>,
    removed_folders: HashSet<(String, String)>,
    objects: BTreeMap<String, StoredObject>,
    nonces: HashMap<String, String>,
    next_id: u64,
    failing_parts: HashSet<u32>,
    calls: HashMap<&'static str, usize>,
}

impl ObjectState {
    fn record(&mut self, op: &'static str) {
        *self.calls.entry(op).or_default() += 1;
    }

    fn object_mut(&mut self, object_id: &str) -> Result<&mut StoredObject, StoreError> {
        self.objects
            .get_mut(object_id)
            .ok_or_else(|| StoreError::NotFound(format!("object {}", object_id)))
    }

    fn insert(&mut self, object: StoredObject) -> String {
        self.next_id += 1;
        let id = format!("file-{:08}", self.next_id);
        self.objects.insert(id.clone(), object);
        id
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    state: Mutex<ObjectState>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&self, project_id: &str, params: UploadParameters) {
        self.state.lock().projects.insert(project_id.to_string(), params);
    }

    /// Simulate a folder deleted on the remote side.
    pub fn remove_folder(&self, project_id: &str, folder: &str) {
        self.state
            .lock()
            .removed_folders
            .insert((project_id.to_string(), folder.to_string()));
    }

    /// Make every upload of part `index` fail.
    pub fn fail_part(&self, index: u32) {
        self.state.lock().failing_parts.insert(index);
    }

    /// Store a closed object directly, as if it had been uploaded earlier.
    pub fn insert_closed(
        &self,
        project_id: &str,
        folder: &str,
        name: &str,
        content: &[u8],
        properties: BTreeMap<String, String>,
        tags: Vec<String>,
    ) -> String {
        let mut parts = BTreeMap::new();
        parts.insert(1, content.to_vec());
        self.state.lock().insert(StoredObject {
            project_id: project_id.to_string(),
            folder: folder.to_string(),
            name: name.to_string(),
            parts,
            closed: true,
            properties,
            tags,
        })
    }

    pub fn object(&self, object_id: &str) -> Option<StoredObject> {
        self.state.lock().objects.get(object_id).cloned()
    }

    pub fn object_ids(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    /// Number of calls made to operation `op` (e.g. `"upload_part"`).
    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn upload_parameters(&self, project_id: &str) -> Result<UploadParameters, StoreError> {
        let mut state = self.state.lock();
        state.record("describe_project");
        state
            .projects
            .get(project_id)
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("project {}", project_id)))
    }

    fn create_object(&self, request: &NewObject<'_>) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        state.record("create_object");
        if let Some(id) = state.nonces.get(request.nonce) {
            return Ok(id.clone());
        }
        if !state.projects.contains_key(request.project_id) {
            return Err(StoreError::NotFound(format!("project {}", request.project_id)));
        }
        let key = (request.project_id.to_string(), request.folder.to_string());
        if state.removed_folders.contains(&key) {
            return Err(StoreError::NotFound(format!("folder {}", request.folder)));
        }
        let id = state.insert(StoredObject {
            project_id: request.project_id.to_string(),
            folder: request.folder.to_string(),
            name: request.name.to_string(),
            parts: BTreeMap::new(),
            closed: false,
            properties: BTreeMap::new(),
            tags: Vec::new(),
        });
        state.nonces.insert(request.nonce.to_string(), id.clone());
        Ok(id)
    }

    fn upload_part(&self, object_id: &str, index: u32, data: &[u8]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.record("upload_part");
        if state.failing_parts.contains(&index) {
            return Err(StoreError::Transport(format!("injected failure on part {}", index)));
        }
        let object = state.object_mut(object_id)?;
        if object.closed {
            return Err(StoreError::Transport(format!("object {} is closed", object_id)));
        }
        object.parts.insert(index, data.to_vec());
        Ok(())
    }

    fn close_and_wait(&self, object_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.record("close");
        let project = state.object_mut(object_id)?.project_id.clone();
        let empty_part_required = state
            .projects
            .get(&project)
            .map(|p| p.empty_last_part_allowed)
            .unwrap_or(false);
        let object = state.object_mut(object_id)?;
        if object.parts.is_empty() && empty_part_required {
            return Err(StoreError::Transport(format!("object {} has no parts", object_id)));
        }
        let contiguous = object.parts.keys().copied().eq(1..=object.parts.len() as u32);
        if !contiguous {
            return Err(StoreError::Transport(format!(
                "object {} has gaps in its part indices",
                object_id
            )));
        }
        object.closed = true;
        Ok(())
    }

    fn remove_objects(&self, _project_id: &str, object_ids: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.record("remove_objects");
        for id in object_ids {
            if state.objects.remove(id).is_none() {
                return Err(StoreError::NotFound(format!("object {}", id)));
            }
        }
        Ok(())
    }

    fn describe(&self, object_id: &str) -> Result<ObjectDescription, StoreError> {
        let mut state = self.state.lock();
        state.record("describe");
        let object = state.object_mut(object_id)?;
        Ok(ObjectDescription {
            object_id: object_id.to_string(),
            project_id: object.project_id.clone(),
            properties: object.properties.clone(),
            tags: object.tags.clone(),
        })
    }

    fn set_properties(
        &self,
        _project_id: &str,
        object_id: &str,
        changes: &PropertyChanges,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.record("set_properties");
        let object = state.object_mut(object_id)?;
        for (key, value) in changes {
            match value {
                Some(value) => {
                    object.properties.insert(key.clone(), value.clone());
                }
                None => {
                    object.properties.remove(key);
                }
            }
        }
        Ok(())
    }

    fn add_tags(&self, _project_id: &str, object_id: &str, tags: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.record("add_tags");
        let object = state.object_mut(object_id)?;
        for tag in tags {
            if !object.tags.contains(tag) {
                object.tags.push(tag.clone());
            }
        }
        Ok(())
    }

    fn remove_tags(
        &self,
        _project_id: &str,
        object_id: &str,
        tags: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.record("remove_tags");
        let object = state.object_mut(object_id)?;
        object.tags.retain(|t| !tags.contains(t));
        Ok(())
    }
}

struct TrackedFile {
    info: DirtyFileInfo,
    touched: Instant,
}

/// Metadata store holding the files it was told about. A file counts as
/// inactive once it has not been touched for `inactive_after`.
pub struct MemoryMetadataStore {
    files: BTreeMap<Inode, TrackedFile>,
    inactive_after: Duration,
}

impl MemoryMetadataStore {
    pub fn new(inactive_after: Duration) -> Self {
        Self {
            files: BTreeMap::new(),
            inactive_after,
        }
    }

    pub fn into_shared(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }

    /// Record a local modification. Dirty flags accumulate until collected,
    /// and the inode keeps the object id the store already knows.
    pub fn mark_dirty(&mut self, info: DirtyFileInfo) {
        let now = Instant::now();
        match self.files.get_mut(&info.inode) {
            Some(tracked) => {
                let dirty_data = tracked.info.dirty_data || info.dirty_data;
                let dirty_metadata = tracked.info.dirty_metadata || info.dirty_metadata;
                let object_id = tracked.info.object_id.take().or(info.object_id.clone());
                tracked.info = DirtyFileInfo {
                    object_id,
                    dirty_data,
                    dirty_metadata,
                    ..info
                };
                tracked.touched = now;
            }
            None => {
                self.files.insert(info.inode, TrackedFile { info, touched: now });
            }
        }
    }

    /// Forget a file, as if it had been deleted locally.
    pub fn remove(&mut self, inode: Inode) {
        self.files.remove(&inode);
    }

    pub fn object_id(&self, inode: Inode) -> Option<String> {
        self.files.get(&inode).and_then(|t| t.info.object_id.clone())
    }

    pub fn is_dirty(&self, inode: Inode) -> bool {
        self.files
            .get(&inode)
            .map(|t| t.info.dirty_data || t.info.dirty_metadata)
            .unwrap_or(false)
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn take_dirty_files(&mut self, scope: DirtyScope) -> Result<Vec<DirtyFileInfo>, StoreError> {
        let inactive_after = self.inactive_after;
        let mut collected = Vec::new();
        for tracked in self.files.values_mut() {
            let info = &mut tracked.info;
            if !info.dirty_data && !info.dirty_metadata {
                continue;
            }
            if scope == DirtyScope::InactiveOnly && tracked.touched.elapsed() < inactive_after {
                continue;
            }
            collected.push(info.clone());
            info.dirty_data = false;
            info.dirty_metadata = false;
        }
        Ok(collected)
    }

    fn update_inode_object_id(&mut self, inode: Inode, object_id: &str) -> Result<(), StoreError> {
        let tracked = self
            .files
            .get_mut(&inode)
            .ok_or_else(|| StoreError::NotFound(format!("inode {}", inode)))?;
        tracked.info.object_id = Some(object_id.to_string());
        Ok(())
    }
}
