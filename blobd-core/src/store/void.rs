use super::{BlobStore, BlobView};
use crate::error::Result;
use crate::key::{BlobKey, JobId};
use async_trait::async_trait;
use std::path::Path;

/// Store used when high availability is disabled: keeps nothing, finds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct VoidBlobStore;

#[async_trait]
impl BlobView for VoidBlobStore {
    async fn get(&self, _job_id: &JobId, _key: &BlobKey, _local_file: &Path) -> Result<bool> {
        Ok(false)
    }
}

#[async_trait]
impl BlobStore for VoidBlobStore {
    async fn put(&self, _local_file: &Path, _job_id: &JobId, _key: &BlobKey) -> Result<bool> {
        Ok(false)
    }

    async fn delete(&self, _job_id: &JobId, _key: &BlobKey) -> bool {
        true
    }

    async fn delete_all(&self, _job_id: &JobId) -> bool {
        true
    }
}
