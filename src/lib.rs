//! Synchronization engine keeping a locally mounted project in step with
//! its remote object store.
//!
//! Local writes mark files dirty in a [`store::MetadataStore`]. The
//! [`sync::SyncEngine`] collects dirty files periodically, or on demand
//! through [`sync::SyncEngine::trigger_explicit_sync`], uploads their bytes
//! as multipart objects through an [`store::ObjectStore`], and reconciles
//! their properties and tags.

pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod store;
pub mod sync;
pub mod transfer;
