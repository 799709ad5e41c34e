//! Client side of the blob protocol.
//!
//! A [`BlobClient`] wraps one connection and may issue any number of
//! sequential PUT and GET requests over it. The server closes the
//! connection after a failed request, so a client that saw an error should
//! be dropped.

use crate::config::BlobClientConfig;
use crate::error::{BlobError, Result};
use crate::key::{BlobKey, BlobType, JobId};
use crate::net::BoxedStream;
use crate::protocol::{
    read_length, read_response_status, write_addressing, write_length, BUFFER_SIZE,
    END_OF_STREAM, GET_OPERATION, PUT_OPERATION, RETURN_ERROR, RETURN_OKAY,
};
use crate::tls::ClientTransport;
use crate::utils::{create_message_digest, finish_digest, remove_file_if_exists};
use sha1::Digest;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct BlobClient {
    stream: BoxedStream,
    server_addr: SocketAddr,
    read_timeout: Option<Duration>,
    buf: Vec<u8>,
}

impl BlobClient {
    pub async fn connect(server_addr: SocketAddr, config: &BlobClientConfig) -> Result<Self> {
        let transport = ClientTransport::from_config(&config.tls).await?;
        if config.tls.enabled {
            tracing::info!("Using TLS connection to the BLOB server at {}", server_addr);
        }

        let connect = TcpStream::connect(server_addr);
        let connected = match config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                BlobError::Timeout(format!("connecting to BLOB server at {}", server_addr))
            })?,
            None => connect.await,
        };
        let socket = connected.map_err(|error| {
            BlobError::Io(std::io::Error::new(
                error.kind(),
                format!(
                    "could not connect to BLOB server at {}: {}",
                    server_addr, error
                ),
            ))
        })?;
        socket.set_nodelay(true)?;

        let stream = transport
            .wrap(socket, &server_addr.ip().to_string())
            .await?;

        Ok(Self {
            stream,
            server_addr,
            read_timeout: config.read_timeout(),
            buf: vec![0u8; BUFFER_SIZE],
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Uploads `data` and returns the key the server assigned.
    pub async fn put_buffer(
        &mut self,
        job_id: Option<&JobId>,
        data: &[u8],
        blob_type: BlobType,
    ) -> Result<BlobKey> {
        let mut reader = data;
        self.put_reader(job_id, &mut reader, blob_type).await
    }

    /// Uploads everything `reader` yields and checks the returned key against
    /// the locally computed digest.
    pub async fn put_reader<R>(
        &mut self,
        job_id: Option<&JobId>,
        reader: &mut R,
        blob_type: BlobType,
    ) -> Result<BlobKey>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if blob_type == BlobType::Permanent && job_id.is_none() {
            return Err(BlobError::InvalidRequest(
                "permanent BLOBs require a job id".to_string(),
            ));
        }

        tracing::debug!("PUT BLOB stream to {}", self.server_addr);

        self.stream.write_u8(PUT_OPERATION).await?;
        write_addressing(&mut self.stream, job_id).await?;
        self.stream.write_u8(blob_type.to_byte()).await?;

        let mut hasher = create_message_digest();
        loop {
            let read = reader.read(&mut self.buf).await?;
            if read == 0 {
                break;
            }
            write_length(&mut self.stream, read as i32).await?;
            self.stream.write_all(&self.buf[..read]).await?;
            hasher.update(&self.buf[..read]);
        }
        write_length(&mut self.stream, END_OF_STREAM).await?;
        self.stream.flush().await?;

        let digest = finish_digest(hasher);
        let read_timeout = self.read_timeout;
        let key = with_timeout(read_timeout, "PUT response", async {
            read_response_status(&mut self.stream).await?;
            BlobKey::read_from(&mut self.stream).await
        })
        .await?;

        if key.blob_type() != blob_type {
            return Err(BlobError::Corrupted {
                expected: format!("{:?} key", blob_type),
                actual: format!("{:?} key", key.blob_type()),
            });
        }
        if *key.digest() != digest {
            return Err(BlobError::Corrupted {
                expected: hex::encode(digest),
                actual: hex::encode(key.digest()),
            });
        }

        Ok(key)
    }

    /// Uploads the file at `path` as a permanent blob of `job_id`.
    pub async fn upload_file(&mut self, job_id: &JobId, path: &Path) -> Result<BlobKey> {
        let mut file = fs::File::open(path).await?;
        self.put_reader(Some(job_id), &mut file, BlobType::Permanent)
            .await
    }

    /// Downloads a blob into `local_file`, verifying its digest, and returns
    /// its length. `local_file` is removed if the download fails.
    pub async fn get(
        &mut self,
        job_id: Option<&JobId>,
        key: &BlobKey,
        local_file: &Path,
    ) -> Result<u64> {
        if key.is_permanent() && job_id.is_none() {
            return Err(BlobError::InvalidRequest(
                "permanent BLOBs require a job id".to_string(),
            ));
        }

        let result = self.receive_blob(job_id, key, local_file).await;
        if result.is_err() {
            if let Err(error) = remove_file_if_exists(local_file).await {
                tracing::debug!("could not remove {}: {}", local_file.display(), error);
            }
        }
        result
    }

    async fn receive_blob(
        &mut self,
        job_id: Option<&JobId>,
        key: &BlobKey,
        local_file: &Path,
    ) -> Result<u64> {
        tracing::debug!("GET BLOB {} from {}", key, self.server_addr);

        self.stream.write_u8(GET_OPERATION).await?;
        write_addressing(&mut self.stream, job_id).await?;
        key.write_to(&mut self.stream).await?;
        self.stream.flush().await?;

        let read_timeout = self.read_timeout;
        let length = with_timeout(read_timeout, "GET response", async {
            read_response_status(&mut self.stream).await?;
            read_length(&mut self.stream).await
        })
        .await?;
        if length < 0 {
            return Err(BlobError::Protocol(format!(
                "negative BLOB length: {}",
                length
            )));
        }

        let mut file = fs::File::create(local_file).await?;
        let mut hasher = create_message_digest();
        let mut remaining = length as usize;
        while remaining > 0 {
            let want = remaining.min(BUFFER_SIZE);
            let chunk = &mut self.buf[..want];
            let stream = &mut self.stream;
            let read = with_timeout(read_timeout, "BLOB data", async move {
                Ok(stream.read(chunk).await?)
            })
            .await?;
            if read == 0 {
                return Err(BlobError::Protocol(format!(
                    "premature end of stream for BLOB {}, {} bytes missing",
                    key, remaining
                )));
            }
            file.write_all(&self.buf[..read]).await?;
            hasher.update(&self.buf[..read]);
            remaining -= read;
        }
        file.sync_all().await?;

        let actual = finish_digest(hasher);
        if actual != *key.digest() {
            // tell the server the copy is bad so it keeps transient data around
            self.stream.write_u8(RETURN_ERROR).await?;
            self.stream.flush().await?;
            return Err(BlobError::Corrupted {
                expected: hex::encode(key.digest()),
                actual: hex::encode(actual),
            });
        }

        self.stream.write_u8(RETURN_OKAY).await?;
        self.stream.flush().await?;
        Ok(length as u64)
    }

    /// Closes the connection; the server sees a clean end of stream.
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Uploads `files` as permanent blobs of `job_id` over one connection,
/// returning their keys in order.
pub async fn upload_files(
    server_addr: SocketAddr,
    config: &BlobClientConfig,
    job_id: &JobId,
    files: &[PathBuf],
) -> Result<Vec<BlobKey>> {
    if files.is_empty() {
        return Ok(Vec::new());
    }

    let mut client = BlobClient::connect(server_addr, config).await?;
    let mut keys = Vec::with_capacity(files.len());
    for file in files {
        keys.push(client.upload_file(job_id, file).await?);
    }
    client.close().await?;
    Ok(keys)
}

/// Runs one GET over `client` and closes it. Once the blob was received and
/// acknowledged, a failing close no longer fails the download: the server may
/// already have dropped its transient copy.
async fn fetch_once(
    mut client: BlobClient,
    job_id: Option<&JobId>,
    key: &BlobKey,
    local_file: &Path,
) -> Result<u64> {
    let length = client.get(job_id, key, local_file).await?;
    let server_addr = client.server_addr;
    if let Err(error) = client.close().await {
        tracing::warn!(
            "BLOB {} was received but closing the connection to {} failed: {}",
            key,
            server_addr,
            error
        );
    }
    Ok(length)
}

/// Downloads a blob into `local_file`, opening a fresh connection per
/// attempt. Any failure is retried up to `config.fetch_retries` times.
pub async fn download_from_blob_server(
    server_addr: SocketAddr,
    config: &BlobClientConfig,
    job_id: Option<&JobId>,
    key: &BlobKey,
    local_file: &Path,
) -> Result<u64> {
    let mut attempt = 0;
    loop {
        let result = match BlobClient::connect(server_addr, config).await {
            Ok(client) => fetch_once(client, job_id, key, local_file).await,
            Err(error) => Err(error),
        };

        match result {
            Ok(length) => return Ok(length),
            Err(error) if attempt < config.fetch_retries => {
                attempt += 1;
                tracing::warn!(
                    "Failed to fetch BLOB {} from {} (attempt {} of {}): {}",
                    key,
                    server_addr,
                    attempt,
                    config.fetch_retries,
                    error
                );
            }
            Err(error) => return Err(error),
        }
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| BlobError::Timeout(format!("waiting for {}", what)))?,
        None => fut.await,
    }
}
