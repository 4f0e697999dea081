//! Contracts of the two collaborators the engine drives: the remote object
//! store and the local metadata store.
//!
//! Both are synchronous. Workers are plain threads, so a blocking call only
//! ever blocks the worker issuing it. Retries and timeouts for network calls
//! belong to the `ObjectStore` implementation.

pub mod memory;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SyncError;

/// Local filesystem reference to a file.
pub type Inode = u64;

/// Property changes to apply to an object: `Some` sets a value, `None`
/// removes the key.
pub type PropertyChanges = BTreeMap<String, Option<String>>;

/// The metadata store, behind the one coarse lock it shares with the rest of
/// the filesystem.
pub type SharedMetadata = Arc<Mutex<dyn MetadataStore>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Expected state is gone: a folder removed, an object already deleted.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other failure reported by the collaborator.
    #[error("{0}")]
    Transport(String),
}

/// Which dirty files a scan collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyScope {
    /// Every dirty file.
    All,
    /// Only files that have not been touched recently, so a file still being
    /// written is left alone.
    InactiveOnly,
}

/// Snapshot of a locally modified file, taken when its dirty flags were
/// collected and cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyFileInfo {
    pub inode: Inode,
    /// Current remote object, `None` if the file was never uploaded.
    pub object_id: Option<String>,
    pub project_id: String,
    pub folder: String,
    pub name: String,
    /// Where the file's bytes live locally.
    pub local_path: PathBuf,
    pub file_size: u64,
    pub properties: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub dirty_data: bool,
    pub dirty_metadata: bool,
}

/// Multipart limits of one project, as reported by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadParameters {
    pub min_part_size: u64,
    pub max_part_size: u64,
    pub max_num_parts: u64,
    pub max_file_size: u64,
    /// The object must receive one zero-length part before an empty object
    /// can be closed.
    pub empty_last_part_allowed: bool,
}

/// Request to create an empty object, open for writing.
#[derive(Debug, Clone, Copy)]
pub struct NewObject<'a> {
    pub project_id: &'a str,
    pub folder: &'a str,
    pub name: &'a str,
    /// Creation token; a retried call carrying the same token must not
    /// create a second object.
    pub nonce: &'a str,
}

/// Current remote attributes of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectDescription {
    pub object_id: String,
    pub project_id: String,
    pub properties: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

/// Remote object-store API.
pub trait ObjectStore: Send + Sync {
    /// Multipart limits for a project.
    fn upload_parameters(&self, project_id: &str) -> Result<UploadParameters, StoreError>;

    /// Create an empty object and return its id.
    fn create_object(&self, request: &NewObject<'_>) -> Result<String, StoreError>;

    /// Upload part `index` (1-based) of an open object.
    fn upload_part(&self, object_id: &str, index: u32, data: &[u8]) -> Result<(), StoreError>;

    /// Close an object and wait until the service has finalized it.
    fn close_and_wait(&self, object_id: &str) -> Result<(), StoreError>;

    fn remove_objects(&self, project_id: &str, object_ids: &[String]) -> Result<(), StoreError>;

    fn describe(&self, object_id: &str) -> Result<ObjectDescription, StoreError>;

    fn set_properties(
        &self,
        project_id: &str,
        object_id: &str,
        changes: &PropertyChanges,
    ) -> Result<(), StoreError>;

    fn add_tags(&self, project_id: &str, object_id: &str, tags: &[String])
        -> Result<(), StoreError>;

    fn remove_tags(
        &self,
        project_id: &str,
        object_id: &str,
        tags: &[String],
    ) -> Result<(), StoreError>;
}

/// The part of the metadata store the engine uses. Callers hold the shared
/// lock around every call.
pub trait MetadataStore: Send {
    /// Collect the dirty files in `scope` and clear their dirty flags.
    fn take_dirty_files(&mut self, scope: DirtyScope) -> Result<Vec<DirtyFileInfo>, StoreError>;

    /// Point an inode at a new remote object. Overwrites any previous id.
    fn update_inode_object_id(&mut self, inode: Inode, object_id: &str) -> Result<(), StoreError>;
}

/// Fetch the upload parameters of every project once, for the lifetime of
/// an engine.
pub fn fetch_upload_parameters<S>(
    store: &S,
    project_ids: &[String],
) -> Result<HashMap<String, UploadParameters>, SyncError>
where
    S: ObjectStore + ?Sized,
{
    let mut params = HashMap::with_capacity(project_ids.len());
    for project_id in project_ids {
        let p = store
            .upload_parameters(project_id)
            .map_err(|e| SyncError::from_store("describe project", e))?;
        tracing::debug!(project = %project_id, ?p, "Cached upload parameters");
        params.insert(project_id.clone(), p);
    }
    Ok(params)
}
