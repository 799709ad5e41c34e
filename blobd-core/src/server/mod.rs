//! The blob server: a TCP listener that stores uploaded blobs in a private
//! local directory, serves them back and mirrors permanent ones into an HA
//! blob store.
//!
//! All file-system mutations of stored blobs happen under the exclusive side
//! of one storage lock; reads that check and stream a file hold the shared
//! side. HA fetches run with no lock held at all.

mod cleanup;
mod connection;

pub use cleanup::{ExpiryKey, ExpiryTimes, TransientBlobCleanupTask};

use crate::config::BlobServerConfig;
use crate::error::{BlobError, Result};
use crate::key::{BlobKey, BlobType, JobId, DIGEST_SIZE};
use crate::net::bind_first_free;
use crate::store::{BlobStore, BlobView};
use crate::tls::ServerTransport;
use crate::utils;
use connection::BlobServerConnection;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, RwLock, RwLockReadGuard, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Attempts at finding an unused random key component before giving up.
const MAX_KEY_ATTEMPTS: usize = 10;

pub struct BlobServer {
    config: BlobServerConfig,
    storage_dir: PathBuf,
    blob_store: Arc<dyn BlobStore>,

    storage_lock: Arc<RwLock<()>>,
    expiry_times: Arc<ExpiryTimes>,
    cleanup_interval: Duration,

    transport: ServerTransport,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    admission: Arc<Semaphore>,
    connections: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_connection_id: AtomicU64,
    temp_file_counter: AtomicU64,

    shutdown_requested: AtomicBool,
    shutdown: CancellationToken,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl BlobServer {
    /// Creates the storage root, binds the first free configured port and
    /// schedules the transient blob cleanup. Connections are accepted once
    /// [`BlobServer::start`] is called.
    pub async fn bind(
        config: BlobServerConfig,
        blob_store: Arc<dyn BlobStore>,
    ) -> Result<Arc<Self>> {
        let config = config.sanitize()?;
        let storage_dir =
            utils::init_local_storage_directory(config.storage_directory.as_deref()).await?;
        tracing::info!("Created BLOB server storage directory {}", storage_dir.display());

        match Self::bind_in(config, storage_dir.clone(), blob_store).await {
            Ok(server) => Ok(server),
            Err(error) => {
                if let Err(cleanup) = utils::remove_dir_if_exists(&storage_dir).await {
                    tracing::warn!(
                        "could not remove storage directory {}: {}",
                        storage_dir.display(),
                        cleanup
                    );
                }
                Err(error)
            }
        }
    }

    async fn bind_in(
        config: BlobServerConfig,
        storage_dir: PathBuf,
        blob_store: Arc<dyn BlobStore>,
    ) -> Result<Arc<Self>> {
        let transport = ServerTransport::from_config(&config.tls).await?;
        let listener = bind_first_free(&config.bind_host, &config.port, config.backlog).await?;
        let local_addr = listener.local_addr()?;

        let storage_lock = Arc::new(RwLock::new(()));
        let expiry_times = Arc::new(ExpiryTimes::default());
        let cleanup_interval = config.cleanup_interval();
        let cleanup_task = TransientBlobCleanupTask::new(
            expiry_times.clone(),
            storage_lock.clone(),
            storage_dir.clone(),
        )
        .start(cleanup_interval);

        tracing::info!(
            "Started BLOB server at {} - max concurrent requests: {} - max backlog: {}{}",
            local_addr,
            config.max_connections,
            config.backlog,
            if transport.is_tls() { " - TLS" } else { "" }
        );

        Ok(Arc::new(Self {
            admission: Arc::new(Semaphore::new(config.max_connections)),
            config,
            storage_dir,
            blob_store,
            storage_lock,
            expiry_times,
            cleanup_interval,
            transport,
            local_addr,
            listener: Mutex::new(Some(listener)),
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(0),
            temp_file_counter: AtomicU64::new(0),
            shutdown_requested: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            listener_task: Mutex::new(None),
            cleanup_task: Mutex::new(Some(cleanup_task)),
        }))
    }

    /// Starts accepting connections. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(listener) = lock(&self.listener).take() else {
            return;
        };
        let server = Arc::clone(self);
        let handle = tokio::spawn(server.accept_loop(listener));
        *lock(&self.listener_task) = Some(handle);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        if let Err(error) = self.accept_connections(&listener).await {
            if self.is_shutdown() {
                return;
            }
            tracing::error!("BLOB server stopped working. Shutting down: {}", error);
            // close() joins this task, so it has to run elsewhere
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(error) = server.close().await {
                    tracing::error!("Could not properly close the BLOB server: {}", error);
                }
            });
        }
    }

    async fn accept_connections(self: &Arc<Self>, listener: &TcpListener) -> Result<()> {
        loop {
            // a slot is taken before accepting, so excess clients wait in the backlog
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                permit = Arc::clone(&self.admission).acquire_owned() => {
                    permit.map_err(|_| BlobError::ShutDown)?
                }
            };

            let (socket, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };

            self.spawn_connection(socket, peer, permit);
        }
    }

    fn spawn_connection(
        self: &Arc<Self>,
        socket: TcpStream,
        peer: SocketAddr,
        permit: OwnedSemaphorePermit,
    ) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let server = Arc::clone(self);

        // registered before the task can run, so its own unregistration always finds it
        let mut connections = lock(&self.connections);
        let handle = tokio::spawn(async move {
            let _registration = ConnectionRegistration {
                server: Arc::clone(&server),
                id,
                _permit: permit,
            };

            if let Err(error) = socket.set_nodelay(true) {
                tracing::debug!("could not set TCP_NODELAY for {}: {}", peer, error);
            }
            let stream = match server.transport.wrap(socket).await {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::warn!("TLS handshake with {} failed: {}", peer, error);
                    return;
                }
            };

            BlobServerConnection::new(stream, peer, server).run().await;
        });
        connections.insert(id, handle);
    }

    fn unregister_connection(&self, id: u64) {
        lock(&self.connections).remove(&id);
    }

    /// Next unique file name in the `incoming` staging directory.
    pub(crate) async fn create_temporary_filename(&self) -> Result<PathBuf> {
        let incoming = utils::incoming_directory(&self.storage_dir).await?;
        let n = self.temp_file_counter.fetch_add(1, Ordering::Relaxed);
        Ok(incoming.join(format!("temp-{:08}", n)))
    }

    /// Promotes a fully received upload to its final location under a fresh
    /// key. Permanent blobs are also written to the HA store; transient ones
    /// start their TTL.
    pub(crate) async fn move_temp_file_to_store(
        &self,
        incoming: &Path,
        job_id: Option<JobId>,
        digest: [u8; DIGEST_SIZE],
        blob_type: BlobType,
    ) -> Result<BlobKey> {
        self.move_temp_file_with_keys(incoming, job_id, blob_type, || {
            BlobKey::new(blob_type, digest)
        })
        .await
    }

    async fn move_temp_file_with_keys<F>(
        &self,
        incoming: &Path,
        job_id: Option<JobId>,
        blob_type: BlobType,
        mut next_key: F,
    ) -> Result<BlobKey>
    where
        F: FnMut() -> BlobKey,
    {
        if blob_type == BlobType::Permanent && job_id.is_none() {
            return Err(BlobError::InvalidRequest(
                "permanent BLOBs require a job id".to_string(),
            ));
        }

        let mut attempt = 0;
        loop {
            let key = next_key();
            let storage_file =
                utils::storage_location(&self.storage_dir, job_id.as_ref(), &key).await?;

            {
                let _write = self.storage_lock.write().await;
                if !fs::try_exists(&storage_file).await? {
                    let blob_store = key.is_permanent().then(|| self.blob_store.as_ref());
                    utils::move_temp_file_to_store(
                        incoming,
                        job_id.as_ref(),
                        &key,
                        &storage_file,
                        blob_store,
                    )
                    .await?;
                    if key.is_transient() {
                        self.refresh_ttl(job_id, key);
                    }
                    return Ok(key);
                }
            }

            attempt += 1;
            if attempt >= MAX_KEY_ATTEMPTS {
                let job = job_display(job_id.as_ref());
                tracing::error!(
                    "Cannot find a unique file name for BLOB {} of job {} after {} attempts",
                    key,
                    job,
                    MAX_KEY_ATTEMPTS
                );
                return Err(BlobError::KeyCollisionExhausted {
                    job,
                    path: storage_file.display().to_string(),
                });
            }
            tracing::debug!(
                "Trying to find alternative file name for BLOB {} of job {} (attempt {})",
                key,
                job_display(job_id.as_ref()),
                attempt
            );
        }
    }

    pub(crate) fn storage_lock(&self) -> &RwLock<()> {
        &self.storage_lock
    }

    /// Makes sure `local_file` holds the blob, fetching a permanent blob from
    /// the HA store on a cache miss.
    ///
    /// Takes the caller's shared guard and hands back a shared guard under
    /// which `local_file` exists. During an HA fetch the guard is released,
    /// the download runs unlocked, the move into place runs under the
    /// exclusive lock, and a fresh shared guard is taken afterwards.
    pub(crate) async fn get_file_internal<'a>(
        &'a self,
        read_guard: RwLockReadGuard<'a, ()>,
        job_id: Option<JobId>,
        key: &BlobKey,
        local_file: &Path,
    ) -> Result<RwLockReadGuard<'a, ()>> {
        if fs::try_exists(local_file).await? {
            if key.is_transient() {
                self.refresh_ttl(job_id, *key);
            }
            return Ok(read_guard);
        }

        if key.is_transient() {
            return Err(BlobError::NotFound(format!(
                "local file {} does not exist and transient BLOBs are not kept in the blob store",
                local_file.display()
            )));
        }

        let Some(job_id) = job_id else {
            return Err(BlobError::InvalidRequest(
                "permanent BLOBs require a job id".to_string(),
            ));
        };

        drop(read_guard);
        let fetched = self.fetch_from_blob_store(&job_id, key, local_file).await;
        let read_guard = self.storage_lock.read().await;
        fetched.map(|()| read_guard)
    }

    async fn fetch_from_blob_store(
        &self,
        job_id: &JobId,
        key: &BlobKey,
        local_file: &Path,
    ) -> Result<()> {
        let incoming = self.create_temporary_filename().await?;

        let result = async {
            tracing::debug!("Fetching BLOB {}/{} from the blob store", job_id, key);
            if !self.blob_store.get(job_id, key, &incoming).await? {
                return Err(BlobError::NotFound(format!(
                    "BLOB {}/{} is neither cached locally nor in the blob store",
                    job_id, key
                )));
            }

            let _write = self.storage_lock.write().await;
            utils::move_temp_file_to_store(&incoming, Some(job_id), key, local_file, None).await
        }
        .await;

        if let Err(error) = utils::remove_file_if_exists(&incoming).await {
            tracing::warn!("could not delete staging file {}: {}", incoming.display(), error);
        }
        result
    }

    /// Deletes a transient blob's local copy and forgets its TTL. Failures are
    /// logged and reported as `false`.
    pub(crate) async fn delete_internal(&self, job_id: Option<JobId>, key: &BlobKey) -> bool {
        if !key.is_transient() {
            tracing::warn!("refusing to delete non-transient BLOB {} from the cache", key);
            return false;
        }

        let local_file = utils::storage_location_path(&self.storage_dir, job_id.as_ref(), key);

        let _write = self.storage_lock.write().await;
        if let Err(error) = utils::remove_file_if_exists(&local_file).await {
            tracing::warn!(
                "Failed to locally delete BLOB {} at {}: {}",
                key,
                local_file.display(),
                error
            );
            return false;
        }
        lock(&self.expiry_times).remove(&(job_id, *key));
        true
    }

    fn refresh_ttl(&self, job_id: Option<JobId>, key: BlobKey) {
        let now = Instant::now();
        // the interval is bounded at bind time; expiring at the next sweep is
        // the fallback should the clock still overflow
        let expires_at = now.checked_add(self.cleanup_interval).unwrap_or(now);
        lock(&self.expiry_times).insert((job_id, key), expires_at);
    }

    /// Stores `data` as a transient blob, optionally scoped to `job_id`.
    pub async fn put_transient(&self, job_id: Option<JobId>, data: &[u8]) -> Result<BlobKey> {
        self.put_buffer(job_id, data, BlobType::Transient).await
    }

    /// Stores `data` as a permanent blob of `job_id` and uploads it to the HA
    /// store.
    pub async fn put_permanent(&self, job_id: JobId, data: &[u8]) -> Result<BlobKey> {
        self.put_buffer(Some(job_id), data, BlobType::Permanent).await
    }

    async fn put_buffer(
        &self,
        job_id: Option<JobId>,
        data: &[u8],
        blob_type: BlobType,
    ) -> Result<BlobKey> {
        self.ensure_running()?;
        let incoming = self.create_temporary_filename().await?;

        let result = async {
            let digest = utils::write_buffer_to_file(&incoming, data).await?;
            self.move_temp_file_to_store(&incoming, job_id, digest, blob_type).await
        }
        .await;

        if let Err(error) = utils::remove_file_if_exists(&incoming).await {
            tracing::warn!("could not delete staging file {}: {}", incoming.display(), error);
        }
        result
    }

    /// Returns a local path holding the blob. A permanent blob missing from
    /// the cache is fetched from the HA store first.
    pub async fn get_file(&self, job_id: Option<JobId>, key: &BlobKey) -> Result<PathBuf> {
        self.ensure_running()?;
        check_addressing(job_id.as_ref(), key)?;

        let local_file = utils::storage_location(&self.storage_dir, job_id.as_ref(), key).await?;
        let read_guard = self.storage_lock.read().await;
        let read_guard = self.get_file_internal(read_guard, job_id, key, &local_file).await?;
        drop(read_guard);
        Ok(local_file)
    }

    /// Deletes a transient blob from the local cache.
    pub async fn delete_from_cache(&self, job_id: Option<JobId>, key: &BlobKey) -> bool {
        self.delete_internal(job_id, key).await
    }

    /// Removes every locally stored blob of `job_id` and, if asked, the job's
    /// blobs in the HA store. Returns whether everything was removed.
    pub async fn cleanup_job(&self, job_id: &JobId, cleanup_blob_store: bool) -> bool {
        let job_dir = utils::job_directory_path(&self.storage_dir, Some(job_id));

        let _write = self.storage_lock.write().await;

        let mut removed = match utils::remove_dir_if_exists(&job_dir).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    "Failed to locally delete BLOB storage directory at {}: {}",
                    job_dir.display(),
                    error
                );
                false
            }
        };

        lock(&self.expiry_times).retain(|(job, _), _| job.as_ref() != Some(job_id));

        if cleanup_blob_store {
            removed &= self.blob_store.delete_all(job_id).await;
        }
        removed
    }

    /// Path a blob is (or would be) cached at.
    pub fn storage_location(&self, job_id: Option<&JobId>, key: &BlobKey) -> PathBuf {
        utils::storage_location_path(&self.storage_dir, job_id, key)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn config(&self) -> &BlobServerConfig {
        &self.config
    }

    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blob_store
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(BlobError::ShutDown);
        }
        Ok(())
    }

    /// Stops the cleanup timer, the listener and every connection, then
    /// deletes the storage root. Only the first call does anything.
    pub async fn close(&self) -> Result<()> {
        if let Some(cleanup_task) = lock(&self.cleanup_task).take() {
            cleanup_task.abort();
        }

        if self
            .shutdown_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        self.shutdown.cancel();
        self.admission.close();

        let listener_task = lock(&self.listener_task).take();
        if let Some(listener_task) = listener_task {
            if let Err(error) = listener_task.await {
                tracing::debug!("BLOB server listener task ended abnormally: {}", error);
            }
        }
        drop(lock(&self.listener).take());

        let connections: Vec<(u64, JoinHandle<()>)> =
            std::mem::take(&mut *lock(&self.connections)).into_iter().collect();
        for (id, handle) in connections {
            tracing::debug!("Shutting down BLOB connection {}", id);
            handle.abort();
            let _ = handle.await;
        }

        let result = utils::remove_dir_if_exists(&self.storage_dir).await;
        tracing::info!("Stopped BLOB server at {}", self.local_addr);
        result.map_err(BlobError::from)
    }
}

impl Drop for BlobServer {
    fn drop(&mut self) {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return;
        }
        // dropped without close(), e.g. when the runtime goes away
        self.shutdown.cancel();
        if let Some(cleanup_task) = lock(&self.cleanup_task).take() {
            cleanup_task.abort();
        }
        match std::fs::remove_dir_all(&self.storage_dir) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => tracing::warn!(
                "could not remove BLOB storage directory {}: {}",
                self.storage_dir.display(),
                error
            ),
        }
    }
}

/// Ties a connection task to its admission slot and registry entry.
struct ConnectionRegistration {
    server: Arc<BlobServer>,
    id: u64,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ConnectionRegistration {
    fn drop(&mut self) {
        self.server.unregister_connection(self.id);
    }
}

/// Permanent blobs are only addressable through their job.
pub(crate) fn check_addressing(job_id: Option<&JobId>, key: &BlobKey) -> Result<()> {
    if key.is_permanent() && job_id.is_none() {
        return Err(BlobError::InvalidRequest(
            "invalid BLOB addressing for permanent BLOBs".to_string(),
        ));
    }
    Ok(())
}

fn job_display(job_id: Option<&JobId>) -> String {
    job_id.map_or_else(|| "<none>".to_string(), |job_id| job_id.to_string())
}

/// Locks a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests;
