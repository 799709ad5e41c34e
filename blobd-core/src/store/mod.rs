//! Pluggable highly-available backing store for permanent blobs.
//!
//! The server consults the store only on permanent-blob cache misses and when
//! a permanent blob is first written. Transient blobs never reach it.

pub mod filesystem;
pub mod void;

use crate::error::Result;
use crate::key::{BlobKey, JobId};
use async_trait::async_trait;
use std::path::Path;

pub use filesystem::FileSystemBlobStore;
pub use void::VoidBlobStore;

/// Read-only view on the HA store.
#[async_trait]
pub trait BlobView: Send + Sync {
    /// Copies the blob into `local_file`. Returns `false` if the store has no
    /// such blob.
    async fn get(&self, job_id: &JobId, key: &BlobKey, local_file: &Path) -> Result<bool>;
}

#[async_trait]
pub trait BlobStore: BlobView {
    /// Copies `local_file` into the store. Returns whether a copy was kept.
    async fn put(&self, local_file: &Path, job_id: &JobId, key: &BlobKey) -> Result<bool>;

    /// Deletes one blob. Missing blobs count as deleted.
    async fn delete(&self, job_id: &JobId, key: &BlobKey) -> bool;

    /// Deletes every blob of `job_id`. A missing job counts as deleted.
    async fn delete_all(&self, job_id: &JobId) -> bool;
}
