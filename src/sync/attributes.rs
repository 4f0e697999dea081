//! Property and tag reconciliation between a local snapshot and the remote
//! object.
//!
//! The diff is computed from two immutable snapshots: the local one taken
//! when the dirty set was collected, and the remote one returned by
//! `describe`. Only the difference is sent back, so keys the local side
//! never touched keep whatever value they have remotely.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::SyncError;
use crate::store::{ObjectDescription, ObjectStore, PropertyChanges};

/// Minimal set of changes that brings the remote attributes in line with
/// the local ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeDelta {
    /// `Some` to add or update a key, `None` to remove it.
    pub properties: PropertyChanges,
    pub tags_added: Vec<String>,
    pub tags_removed: Vec<String>,
}

impl AttributeDelta {
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.tags_added.is_empty() && self.tags_removed.is_empty()
    }
}

/// Compute the delta from `remote` to `local`.
pub fn diff_attributes(
    remote_properties: &BTreeMap<String, String>,
    remote_tags: &[String],
    local_properties: &BTreeMap<String, String>,
    local_tags: &[String],
) -> AttributeDelta {
    let mut properties = PropertyChanges::new();
    for key in remote_properties.keys() {
        if !local_properties.contains_key(key) {
            properties.insert(key.clone(), None);
        }
    }
    for (key, value) in local_properties {
        if remote_properties.get(key) != Some(value) {
            properties.insert(key.clone(), Some(value.clone()));
        }
    }

    let remote: BTreeSet<&String> = remote_tags.iter().collect();
    let local: BTreeSet<&String> = local_tags.iter().collect();

    AttributeDelta {
        properties,
        tags_added: local.difference(&remote).map(|t| (*t).clone()).collect(),
        tags_removed: remote.difference(&local).map(|t| (*t).clone()).collect(),
    }
}

/// Bring the attributes of `object_id` in line with the local snapshot.
///
/// Returns the delta that was applied. Only non-empty parts of the delta
/// are sent.
pub fn reconcile(
    store: &dyn ObjectStore,
    project_id: &str,
    object_id: &str,
    local_properties: &BTreeMap<String, String>,
    local_tags: &[String],
) -> Result<AttributeDelta, SyncError> {
    let ObjectDescription {
        properties: remote_properties,
        tags: remote_tags,
        ..
    } = store
        .describe(object_id)
        .map_err(|e| SyncError::from_store("describe", e))?;

    let delta = diff_attributes(&remote_properties, &remote_tags, local_properties, local_tags);
    if delta.is_empty() {
        tracing::debug!(object = %object_id, "Attributes already in sync");
        return Ok(delta);
    }

    if !delta.properties.is_empty() {
        store
            .set_properties(project_id, object_id, &delta.properties)
            .map_err(|e| SyncError::from_store("set properties", e))?;
    }
    if !delta.tags_added.is_empty() {
        store
            .add_tags(project_id, object_id, &delta.tags_added)
            .map_err(|e| SyncError::from_store("add tags", e))?;
    }
    if !delta.tags_removed.is_empty() {
        store
            .remove_tags(project_id, object_id, &delta.tags_removed)
            .map_err(|e| SyncError::from_store("remove tags", e))?;
    }

    tracing::debug!(
        object = %object_id,
        properties = delta.properties.len(),
        tags_added = delta.tags_added.len(),
        tags_removed = delta.tags_removed.len(),
        "Reconciled attributes"
    );
    Ok(delta)
}
