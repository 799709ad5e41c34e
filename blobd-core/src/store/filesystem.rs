use super::{BlobStore, BlobView};
use crate::error::{BlobError, Result};
use crate::key::{BlobKey, JobId};
use crate::utils::{remove_dir_if_exists, remove_file_if_exists};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

/// FileSystemBlobStore keeps permanent blobs in a directory that outlives the
/// server process, typically a shared mount:
/// `{base}/job_{job id}/blob_{key}`.
pub struct FileSystemBlobStore {
    base_path: PathBuf,
}

impl FileSystemBlobStore {
    pub async fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.base_path.join(format!("job_{}", job_id))
    }

    pub fn blob_path(&self, job_id: &JobId, key: &BlobKey) -> PathBuf {
        self.job_dir(job_id).join(format!("blob_{}", key))
    }
}

#[async_trait]
impl BlobView for FileSystemBlobStore {
    async fn get(&self, job_id: &JobId, key: &BlobKey, local_file: &Path) -> Result<bool> {
        let blob_path = self.blob_path(job_id, key);
        if !fs::try_exists(&blob_path).await? {
            return Ok(false);
        }

        fs::copy(&blob_path, local_file).await.map_err(|error| {
            BlobError::Store(format!(
                "failed to copy {} from blob store: {}",
                blob_path.display(),
                error
            ))
        })?;

        tracing::debug!("copied BLOB {}/{} from blob store", job_id, key);
        Ok(true)
    }
}

#[async_trait]
impl BlobStore for FileSystemBlobStore {
    async fn put(&self, local_file: &Path, job_id: &JobId, key: &BlobKey) -> Result<bool> {
        let blob_path = self.blob_path(job_id, key);
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = blob_path.with_extension(format!("{}.tmp", ulid::Ulid::new()));
        let copied = async {
            fs::copy(local_file, &tmp_path).await?;
            fs::rename(&tmp_path, &blob_path).await
        }
        .await;

        if let Err(error) = copied {
            remove_file_if_exists(&tmp_path).await.ok();
            return Err(BlobError::Store(format!(
                "failed to copy {} to blob store: {}",
                local_file.display(),
                error
            )));
        }

        Ok(true)
    }

    async fn delete(&self, job_id: &JobId, key: &BlobKey) -> bool {
        let blob_path = self.blob_path(job_id, key);
        if let Err(error) = remove_file_if_exists(&blob_path).await {
            tracing::warn!(
                "failed to delete BLOB {} from blob store: {}",
                blob_path.display(),
                error
            );
            return false;
        }

        // drop the job directory once it is empty; a non-empty one stays
        let _ = fs::remove_dir(self.job_dir(job_id)).await;
        true
    }

    async fn delete_all(&self, job_id: &JobId) -> bool {
        let job_dir = self.job_dir(job_id);
        match remove_dir_if_exists(&job_dir).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    "failed to delete job directory {} from blob store: {}",
                    job_dir.display(),
                    error
                );
                false
            }
        }
    }
}
