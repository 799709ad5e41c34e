use super::{check_addressing, BlobServer};
use crate::error::{BlobError, Result};
use crate::key::{BlobKey, BlobType, JobId, DIGEST_SIZE};
use crate::net::BoxedStream;
use crate::protocol::{
    read_addressing, read_byte, read_fully, read_length, write_error, write_length, BUFFER_SIZE,
    END_OF_STREAM, GET_OPERATION, PUT_OPERATION, RETURN_OKAY,
};
use crate::utils::{create_message_digest, finish_digest, remove_file_if_exists};
use sha1::Digest;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// What the request loop does after an operation.
enum Next {
    Continue,
    Close,
}

/// Failure of a GET, split by whether the OK status already went out.
enum SendFailure {
    /// Nothing was written yet; the client can still be told what went wrong.
    BeforeData(BlobError),
    /// The response is partially written; only closing is left.
    DuringData(BlobError),
}

/// Serves the requests of one client connection, one at a time.
pub(crate) struct BlobServerConnection {
    stream: BoxedStream,
    peer: SocketAddr,
    server: Arc<BlobServer>,
    buf: Vec<u8>,
}

impl BlobServerConnection {
    pub(crate) fn new(stream: BoxedStream, peer: SocketAddr, server: Arc<BlobServer>) -> Self {
        Self {
            stream,
            peer,
            server,
            buf: vec![0u8; BUFFER_SIZE],
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!("Accepted BLOB connection from {}", self.peer);

        loop {
            let mut operation = [0u8; 1];
            match self.stream.read(&mut operation).await {
                // the client is done with us
                Ok(0) => break,
                Ok(_) => {}
                Err(error) => {
                    tracing::debug!("BLOB connection from {} failed: {}", self.peer, error);
                    break;
                }
            }

            let next = match operation[0] {
                PUT_OPERATION => self.put().await,
                GET_OPERATION => self.get().await,
                other => {
                    tracing::error!(
                        "Unknown operation {} from {}, closing connection",
                        other,
                        self.peer
                    );
                    Next::Close
                }
            };

            if let Next::Close = next {
                break;
            }
        }

        if let Err(error) = self.stream.shutdown().await {
            tracing::debug!("error closing BLOB connection to {}: {}", self.peer, error);
        }
        tracing::debug!("Closed BLOB connection from {}", self.peer);
    }

    async fn put(&mut self) -> Next {
        let mut incoming = None;
        let result = self.receive_put(&mut incoming).await;

        let next = match result {
            Ok(key) => match self.write_put_response(&key).await {
                Ok(()) => Next::Continue,
                Err(error) => {
                    tracing::debug!("could not acknowledge PUT from {}: {}", self.peer, error);
                    Next::Close
                }
            },
            Err(error) => {
                tracing::error!("PUT operation from {} failed: {}", self.peer, error);
                self.send_error(&error).await;
                Next::Close
            }
        };

        if let Some(incoming) = incoming {
            if let Err(error) = remove_file_if_exists(&incoming).await {
                tracing::warn!("could not delete staging file {}: {}", incoming.display(), error);
            }
        }
        next
    }

    async fn receive_put(&mut self, incoming: &mut Option<PathBuf>) -> Result<BlobKey> {
        let job_id = read_addressing(&mut self.stream).await?;
        let blob_type = BlobType::from_byte(read_byte(&mut self.stream, "BLOB type").await?)?;
        if blob_type == BlobType::Permanent && job_id.is_none() {
            return Err(BlobError::InvalidRequest(
                "invalid BLOB addressing for permanent BLOBs".to_string(),
            ));
        }

        tracing::debug!(
            "Received PUT request for {:?} BLOB of job {:?} from {}",
            blob_type,
            job_id.map(|job_id| job_id.to_string()),
            self.peer
        );

        let path = self.server.create_temporary_filename().await?;
        *incoming = Some(path.clone());

        let digest = self.read_file_fully(&path).await?;
        self.server
            .move_temp_file_to_store(&path, job_id, digest, blob_type)
            .await
    }

    /// Reads length-prefixed chunks into `path` until the end-of-stream
    /// marker, returning the digest of everything read.
    async fn read_file_fully(&mut self, path: &Path) -> Result<[u8; DIGEST_SIZE]> {
        let mut file = fs::File::create(path).await?;
        let mut hasher = create_message_digest();

        loop {
            let length = read_length(&mut self.stream).await?;
            if length == END_OF_STREAM {
                break;
            }
            if length < 0 || length as usize > BUFFER_SIZE {
                return Err(BlobError::Protocol(format!(
                    "unexpected number of incoming bytes: {}",
                    length
                )));
            }

            let chunk = &mut self.buf[..length as usize];
            read_fully(&mut self.stream, chunk, "buffer").await?;
            file.write_all(chunk).await?;
            hasher.update(chunk);
        }

        file.sync_all().await?;
        Ok(finish_digest(hasher))
    }

    async fn write_put_response(&mut self, key: &BlobKey) -> Result<()> {
        self.stream.write_u8(RETURN_OKAY).await?;
        key.write_to(&mut self.stream).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn get(&mut self) -> Next {
        let (job_id, key, blob_file) = match self.receive_get_request().await {
            Ok(request) => request,
            Err(error) => {
                tracing::error!("GET operation from {} failed: {}", self.peer, error);
                self.send_error(&error).await;
                return Next::Close;
            }
        };

        match self.send_blob(job_id, &key, &blob_file).await {
            Ok(()) => {}
            Err(SendFailure::BeforeData(error)) => {
                tracing::error!("GET operation for {} from {} failed: {}", key, self.peer, error);
                self.send_error(&error).await;
                return Next::Close;
            }
            Err(SendFailure::DuringData(error)) => {
                tracing::debug!(
                    "GET operation for {} from {} failed while streaming: {}",
                    key,
                    self.peer,
                    error
                );
                return Next::Close;
            }
        }

        let acknowledgement = match read_byte(&mut self.stream, "GET acknowledgement").await {
            Ok(acknowledgement) => acknowledgement,
            Err(error) => {
                tracing::debug!("no acknowledgement for {} from {}: {}", key, self.peer, error);
                return Next::Close;
            }
        };

        // a transient blob is handed out once, then dropped from the cache
        if acknowledgement == RETURN_OKAY
            && key.is_transient()
            && !self.server.delete_internal(job_id, &key).await
        {
            tracing::warn!(
                "DELETE operation failed for transient BLOB {} after successful GET",
                key
            );
        }
        Next::Continue
    }

    async fn receive_get_request(&mut self) -> Result<(Option<JobId>, BlobKey, PathBuf)> {
        let job_id = read_addressing(&mut self.stream).await?;
        let key = BlobKey::read_from(&mut self.stream).await?;
        check_addressing(job_id.as_ref(), &key)?;

        tracing::debug!(
            "Received GET request for BLOB {} of job {:?} from {}",
            key,
            job_id.map(|job_id| job_id.to_string()),
            self.peer
        );

        let blob_file = crate::utils::storage_location(
            self.server.storage_dir(),
            job_id.as_ref(),
            &key,
        )
        .await?;
        Ok((job_id, key, blob_file))
    }

    async fn send_blob(
        &mut self,
        job_id: Option<JobId>,
        key: &BlobKey,
        blob_file: &Path,
    ) -> std::result::Result<(), SendFailure> {
        let server = Arc::clone(&self.server);

        let read_guard = server.storage_lock().read().await;
        let read_guard = server
            .get_file_internal(read_guard, job_id, key, blob_file)
            .await
            .map_err(SendFailure::BeforeData)?;

        let length = fs::metadata(blob_file)
            .await
            .map_err(|error| SendFailure::BeforeData(error.into()))?
            .len();
        if length > i32::MAX as u64 {
            return Err(SendFailure::BeforeData(BlobError::TooLarge(length)));
        }

        self.stream_file(blob_file, length)
            .await
            .map_err(SendFailure::DuringData)?;

        drop(read_guard);
        Ok(())
    }

    async fn stream_file(&mut self, blob_file: &Path, length: u64) -> Result<()> {
        let mut file = fs::File::open(blob_file).await?;

        self.stream.write_u8(RETURN_OKAY).await?;
        write_length(&mut self.stream, length as i32).await?;

        let mut remaining = length as usize;
        while remaining > 0 {
            let want = remaining.min(BUFFER_SIZE);
            let read = file.read(&mut self.buf[..want]).await?;
            if read == 0 {
                return Err(BlobError::Protocol(format!(
                    "premature end of BLOB file {}",
                    blob_file.display()
                )));
            }
            self.stream.write_all(&self.buf[..read]).await?;
            remaining -= read;
        }

        self.stream.flush().await?;
        Ok(())
    }

    async fn send_error(&mut self, error: &BlobError) {
        if let Err(write_error_failure) = write_error(&mut self.stream, error).await {
            tracing::debug!(
                "could not send error response to {}: {}",
                self.peer,
                write_error_failure
            );
        }
    }
}
