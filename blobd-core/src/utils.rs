//! Storage layout and file helpers shared by the server and the HA stores.
//!
//! Layout under a storage root:
//! `incoming/temp-{counter}` for in-flight uploads,
//! `no_job/blob_{key}` for job-unrelated blobs and
//! `job_{job id}/blob_{key}` for job-scoped ones.

use crate::error::{BlobError, Result};
use crate::key::{BlobKey, JobId, DIGEST_SIZE};
use crate::store::BlobStore;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const INCOMING_DIR: &str = "incoming";
const NO_JOB_DIR: &str = "no_job";
const JOB_DIR_PREFIX: &str = "job_";
const BLOB_FILE_PREFIX: &str = "blob_";

const MAX_STORAGE_DIR_ATTEMPTS: usize = 10;

/// Creates a fresh `blobStore-{ulid}` directory below `base`, or below the
/// system temp directory when no base is configured.
pub async fn init_local_storage_directory(base: Option<&Path>) -> Result<PathBuf> {
    let base_dir = match base {
        Some(path) => path.to_path_buf(),
        None => std::env::temp_dir(),
    };
    fs::create_dir_all(&base_dir).await?;

    let mut last_error = None;
    for _ in 0..MAX_STORAGE_DIR_ATTEMPTS {
        let storage_dir = base_dir.join(format!("blobStore-{}", ulid::Ulid::new()));
        match fs::create_dir(&storage_dir).await {
            Ok(()) => return Ok(storage_dir),
            Err(error) => last_error = Some(error),
        }
    }

    Err(BlobError::Config(format!(
        "could not create storage directory for BLOB store in '{}': {}",
        base_dir.display(),
        last_error.map(|error| error.to_string()).unwrap_or_default()
    )))
}

/// Returns the staging directory for in-flight uploads, creating it if needed.
pub async fn incoming_directory(storage_dir: &Path) -> Result<PathBuf> {
    let incoming = storage_dir.join(INCOMING_DIR);
    create_leaf_directory(&incoming).await?;
    Ok(incoming)
}

/// Creates `path` but never its parents, so a storage root removed by
/// shutdown is not brought back.
async fn create_leaf_directory(path: &Path) -> Result<()> {
    match fs::create_dir(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(error) => Err(error.into()),
    }
}

pub fn job_directory_path(storage_dir: &Path, job_id: Option<&JobId>) -> PathBuf {
    match job_id {
        None => storage_dir.join(NO_JOB_DIR),
        Some(job_id) => storage_dir.join(format!("{}{}", JOB_DIR_PREFIX, job_id)),
    }
}

/// Pure mapping of `(job, key)` to a path below `storage_dir`.
pub fn storage_location_path(storage_dir: &Path, job_id: Option<&JobId>, key: &BlobKey) -> PathBuf {
    job_directory_path(storage_dir, job_id).join(format!("{}{}", BLOB_FILE_PREFIX, key))
}

/// Like [`storage_location_path`], but makes sure the parent directory exists.
pub async fn storage_location(
    storage_dir: &Path,
    job_id: Option<&JobId>,
    key: &BlobKey,
) -> Result<PathBuf> {
    create_leaf_directory(&job_directory_path(storage_dir, job_id)).await?;
    Ok(storage_location_path(storage_dir, job_id, key))
}

pub fn create_message_digest() -> Sha1 {
    Sha1::new()
}

pub fn finish_digest(hasher: Sha1) -> [u8; DIGEST_SIZE] {
    hasher.finalize().into()
}

pub fn compute_digest(data: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut hasher = create_message_digest();
    hasher.update(data);
    finish_digest(hasher)
}

/// Writes `data` to `path`, returning its digest.
pub async fn write_buffer_to_file(path: &Path, data: &[u8]) -> Result<[u8; DIGEST_SIZE]> {
    let mut file = fs::File::create(path).await?;
    let mut hasher = create_message_digest();
    for chunk in data.chunks(crate::protocol::BUFFER_SIZE) {
        file.write_all(chunk).await?;
        hasher.update(chunk);
    }
    file.sync_all().await?;
    Ok(finish_digest(hasher))
}

/// Relocates `incoming` to `storage_file` and, when `blob_store` is given,
/// uploads the result to it. An existing `storage_file` wins over the
/// incoming copy. `incoming` never survives this call.
///
/// Callers must hold the storage write lock.
pub async fn move_temp_file_to_store(
    incoming: &Path,
    job_id: Option<&JobId>,
    key: &BlobKey,
    storage_file: &Path,
    blob_store: Option<&dyn BlobStore>,
) -> Result<()> {
    let result = relocate(incoming, job_id, key, storage_file, blob_store).await;
    remove_file_if_exists(incoming).await.ok();
    result
}

async fn relocate(
    incoming: &Path,
    job_id: Option<&JobId>,
    key: &BlobKey,
    storage_file: &Path,
    blob_store: Option<&dyn BlobStore>,
) -> Result<()> {
    if fs::try_exists(storage_file).await? {
        // concurrent fetches of the same immutable content converge here
        tracing::warn!(
            "an entry for BLOB {} already exists at {}, keeping it",
            key,
            storage_file.display()
        );
        return Ok(());
    }

    fs::rename(incoming, storage_file).await?;

    let Some(store) = blob_store else {
        return Ok(());
    };

    let uploaded = match job_id {
        Some(job_id) => store.put(storage_file, job_id, key).await,
        None => Err(BlobError::InvalidRequest(format!(
            "cannot upload BLOB {} to the blob store without a job id",
            key
        ))),
    };

    match uploaded {
        Ok(true) => Ok(()),
        Ok(false) => {
            tracing::debug!("blob store did not keep a copy of BLOB {}", key);
            Ok(())
        }
        Err(error) => {
            if let Err(cleanup) = remove_file_if_exists(storage_file).await {
                tracing::warn!(
                    "could not delete local copy {} after failed upload: {}",
                    storage_file.display(),
                    cleanup
                );
            }
            Err(error)
        }
    }
}

/// Deletes `path`; a missing file counts as success.
pub async fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

/// Deletes the directory tree at `path`; a missing directory counts as success.
pub async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}
