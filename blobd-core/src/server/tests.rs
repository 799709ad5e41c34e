use super::*;
use crate::client::{download_from_blob_server, upload_files, BlobClient};
use crate::config::BlobClientConfig;
use crate::protocol::{
    read_response_status, write_length, BUFFER_SIZE, JOB_UNRELATED_CONTENT, PUT_OPERATION,
};
use crate::store::{FileSystemBlobStore, VoidBlobStore};
use crate::utils::compute_digest;
use async_trait::async_trait;
use std::sync::atomic::AtomicUsize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const LARGE_BLOB_SIZE: usize = 2_000_000;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn server_config(dir: &Path) -> BlobServerConfig {
    BlobServerConfig {
        port: "0".to_string(),
        bind_host: "127.0.0.1".to_string(),
        storage_directory: Some(dir.to_path_buf()),
        ..Default::default()
    }
}

async fn start_server(config: BlobServerConfig, blob_store: Arc<dyn BlobStore>) -> Arc<BlobServer> {
    let server = BlobServer::bind(config, blob_store).await.unwrap();
    server.start();
    server
}

async fn connect(server: &BlobServer) -> BlobClient {
    BlobClient::connect(server.local_addr(), &BlobClientConfig::default())
        .await
        .unwrap()
}

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

/// A sweeper over the server's own expiry map, driven by the test instead of
/// the timer.
fn sweeper(server: &BlobServer) -> TransientBlobCleanupTask {
    TransientBlobCleanupTask::new(
        server.expiry_times.clone(),
        server.storage_lock.clone(),
        server.storage_dir.clone(),
    )
}

fn expiry_of(server: &BlobServer, job_id: Option<JobId>, key: &BlobKey) -> Instant {
    *lock(&server.expiry_times).get(&(job_id, *key)).unwrap()
}

/// FileSystemBlobStore that counts how often it is read from.
struct CountingBlobStore {
    inner: FileSystemBlobStore,
    gets: AtomicUsize,
}

impl CountingBlobStore {
    async fn new(path: PathBuf) -> Self {
        Self {
            inner: FileSystemBlobStore::new(path).await.unwrap(),
            gets: AtomicUsize::new(0),
        }
    }

    fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobView for CountingBlobStore {
    async fn get(&self, job_id: &JobId, key: &BlobKey, local_file: &Path) -> Result<bool> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(job_id, key, local_file).await
    }
}

#[async_trait]
impl BlobStore for CountingBlobStore {
    async fn put(&self, local_file: &Path, job_id: &JobId, key: &BlobKey) -> Result<bool> {
        self.inner.put(local_file, job_id, key).await
    }

    async fn delete(&self, job_id: &JobId, key: &BlobKey) -> bool {
        self.inner.delete(job_id, key).await
    }

    async fn delete_all(&self, job_id: &JobId) -> bool {
        self.inner.delete_all(job_id).await
    }
}

#[tokio::test]
async fn put_and_get_in_every_addressing_mode() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSystemBlobStore::new(dir.path().join("ha")).await.unwrap());
    let server = start_server(server_config(dir.path()), store.clone()).await;
    let job = JobId::generate();
    let data = payload(LARGE_BLOB_SIZE);

    // all requests share one connection
    let mut client = connect(&server).await;
    for (job_id, blob_type) in [
        (None, BlobType::Transient),
        (Some(job), BlobType::Transient),
        (Some(job), BlobType::Permanent),
    ] {
        let key = client
            .put_buffer(job_id.as_ref(), &data, blob_type)
            .await
            .unwrap();
        assert_eq!(key.blob_type(), blob_type);
        assert_eq!(*key.digest(), compute_digest(&data));

        let target = dir.path().join(format!("download-{}", key));
        let length = client.get(job_id.as_ref(), &key, &target).await.unwrap();
        assert_eq!(length, LARGE_BLOB_SIZE as u64);
        assert_eq!(tokio::fs::read(&target).await.unwrap(), data);

        let cached = server.storage_location(job_id.as_ref(), &key);
        if blob_type == BlobType::Transient {
            // handed out once, then removed from the cache
            assert!(eventually(|| !cached.exists()).await);
        } else {
            assert!(cached.exists());
            assert!(store.blob_path(&job, &key).exists());
        }
    }
    client.close().await.unwrap();

    server.close().await.unwrap();
}

#[tokio::test]
async fn identical_uploads_get_distinct_keys() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(server_config(dir.path()), Arc::new(VoidBlobStore)).await;
    let job = JobId::generate();
    let data = payload(LARGE_BLOB_SIZE);

    let mut client = connect(&server).await;
    let first = client
        .put_buffer(Some(&job), &data, BlobType::Permanent)
        .await
        .unwrap();
    let second = client
        .put_buffer(Some(&job), &data, BlobType::Permanent)
        .await
        .unwrap();

    assert_ne!(first, second);
    assert!(first.same_content(&second));

    for key in [first, second] {
        let target = dir.path().join(key.to_string());
        client.get(Some(&job), &key, &target).await.unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), data);
    }

    server.close().await.unwrap();
}

#[tokio::test]
async fn empty_blob_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(server_config(dir.path()), Arc::new(VoidBlobStore)).await;

    let mut client = connect(&server).await;
    let key = client.put_buffer(None, &[], BlobType::Transient).await.unwrap();
    let target = dir.path().join("empty");
    assert_eq!(client.get(None, &key, &target).await.unwrap(), 0);
    assert!(tokio::fs::read(&target).await.unwrap().is_empty());

    server.close().await.unwrap();
}

#[tokio::test]
async fn expired_transient_blobs_are_swept_but_permanent_ones_stay() {
    let dir = tempfile::tempdir().unwrap();
    let config = BlobServerConfig {
        cleanup_interval_secs: 1,
        ..server_config(dir.path())
    };
    let server = start_server(config, Arc::new(VoidBlobStore)).await;
    let job = JobId::generate();

    let transient = server.put_transient(Some(job), b"short lived").await.unwrap();
    let permanent = server.put_permanent(job, b"kept").await.unwrap();
    let transient_file = server.storage_location(Some(&job), &transient);
    let permanent_file = server.storage_location(Some(&job), &permanent);
    assert!(transient_file.exists());

    tokio::time::sleep(Duration::from_millis(3000)).await;

    assert!(!transient_file.exists());
    assert!(permanent_file.exists());
    assert!(matches!(
        server.get_file(Some(job), &transient).await,
        Err(BlobError::NotFound(_))
    ));

    server.close().await.unwrap();
}

#[tokio::test]
async fn get_extends_the_ttl_of_transient_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(server_config(dir.path()), Arc::new(VoidBlobStore)).await;
    let sweeper = sweeper(&server);

    let key = server.put_transient(None, b"read again").await.unwrap();
    let first_expiry = expiry_of(&server, None, &key);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let path = server.get_file(None, &key).await.unwrap();
    let refreshed = expiry_of(&server, None, &key);
    assert!(refreshed > first_expiry);

    // the original deadline has passed, the refreshed one has not
    assert_eq!(sweeper.run_once(first_expiry).await, 0);
    assert!(path.exists());

    assert_eq!(sweeper.run_once(refreshed).await, 1);
    assert!(!path.exists());
    assert!(matches!(
        server.get_file(None, &key).await,
        Err(BlobError::NotFound(_))
    ));

    server.close().await.unwrap();
}

#[tokio::test]
async fn large_job_unrelated_transient_blob_is_served_then_swept() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(server_config(dir.path()), Arc::new(VoidBlobStore)).await;
    let data = payload(LARGE_BLOB_SIZE);

    let mut client = connect(&server).await;
    let key = client
        .put_buffer(None, &data, BlobType::Transient)
        .await
        .unwrap();
    assert!(key.is_transient());

    let path = server.get_file(None, &key).await.unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), data);

    let expires_at = expiry_of(&server, None, &key);
    assert_eq!(sweeper(&server).run_once(expires_at).await, 1);
    assert!(!path.exists());
    assert!(lock(&server.expiry_times).is_empty());
    assert!(matches!(
        server.get_file(None, &key).await,
        Err(BlobError::NotFound(_))
    ));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn permanent_cache_miss_is_fetched_from_the_blob_store_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CountingBlobStore::new(dir.path().join("ha")).await);
    let server = start_server(server_config(dir.path()), store.clone()).await;
    let job = JobId::generate();
    let data = payload(200_000);

    let key = server.put_permanent(job, &data).await.unwrap();
    let cached = server.storage_location(Some(&job), &key);
    tokio::fs::remove_file(&cached).await.unwrap();

    let mut client = connect(&server).await;
    let target = dir.path().join("first");
    client.get(Some(&job), &key, &target).await.unwrap();
    assert_eq!(tokio::fs::read(&target).await.unwrap(), data);
    assert_eq!(store.gets(), 1);
    assert!(cached.exists());

    let target = dir.path().join("second");
    client.get(Some(&job), &key, &target).await.unwrap();
    assert_eq!(store.gets(), 1);

    server.close().await.unwrap();
}

#[tokio::test]
async fn recovered_server_serves_permanent_blobs_from_the_blob_store() {
    let dir = tempfile::tempdir().unwrap();
    let ha = dir.path().join("ha");
    let job = JobId::generate();

    let first = start_server(
        server_config(dir.path()),
        Arc::new(FileSystemBlobStore::new(ha.clone()).await.unwrap()),
    )
    .await;
    let key = first.put_permanent(job, b"job graph").await.unwrap();
    first.close().await.unwrap();

    let second = start_server(
        server_config(dir.path()),
        Arc::new(FileSystemBlobStore::new(ha).await.unwrap()),
    )
    .await;
    let local = second.get_file(Some(job), &key).await.unwrap();
    assert_eq!(tokio::fs::read(&local).await.unwrap(), b"job graph");
    assert!(local.starts_with(second.storage_dir()));

    second.close().await.unwrap();
}

#[tokio::test]
async fn unknown_keys_are_reported_as_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(server_config(dir.path()), Arc::new(VoidBlobStore)).await;
    let job = JobId::generate();

    let transient = BlobKey::new(BlobType::Transient, [7; 20]);
    let mut client = connect(&server).await;
    let err = client
        .get(None, &transient, &dir.path().join("missing"))
        .await
        .unwrap_err();
    assert_eq!(err.remote_kind(), Some("not_found"));
    assert!(!dir.path().join("missing").exists());

    // the server closed the failed connection; a new one works
    let permanent = BlobKey::new(BlobType::Permanent, [7; 20]);
    let mut client = connect(&server).await;
    let err = client
        .get(Some(&job), &permanent, &dir.path().join("missing"))
        .await
        .unwrap_err();
    assert_eq!(err.remote_kind(), Some("not_found"));

    server.close().await.unwrap();
}

#[tokio::test]
async fn permanent_put_without_job_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(server_config(dir.path()), Arc::new(VoidBlobStore)).await;

    let mut socket = tokio::net::TcpStream::connect(server.local_addr()).await.unwrap();
    socket
        .write_all(&[
            PUT_OPERATION,
            JOB_UNRELATED_CONTENT,
            BlobType::Permanent.to_byte(),
        ])
        .await
        .unwrap();

    let err = read_response_status(&mut socket).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some("invalid_request"));

    // and the connection is closed afterwards
    let mut rest = Vec::new();
    socket.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    server.close().await.unwrap();
}

#[tokio::test]
async fn oversized_chunk_is_a_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(server_config(dir.path()), Arc::new(VoidBlobStore)).await;

    let mut socket = tokio::net::TcpStream::connect(server.local_addr()).await.unwrap();
    socket
        .write_all(&[
            PUT_OPERATION,
            JOB_UNRELATED_CONTENT,
            BlobType::Transient.to_byte(),
        ])
        .await
        .unwrap();
    write_length(&mut socket, (BUFFER_SIZE + 1) as i32).await.unwrap();

    let err = read_response_status(&mut socket).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some("protocol"));

    // nothing is left behind in the staging area
    let incoming = server.storage_dir().join("incoming");
    let staging_empty = || {
        std::fs::read_dir(&incoming)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    };
    assert!(eventually(staging_empty).await);

    server.close().await.unwrap();
}

#[tokio::test]
async fn unknown_operation_closes_only_that_connection() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(server_config(dir.path()), Arc::new(VoidBlobStore)).await;

    let mut healthy = connect(&server).await;
    let before = healthy.put_buffer(None, b"before", BlobType::Transient).await.unwrap();

    let mut socket = tokio::net::TcpStream::connect(server.local_addr()).await.unwrap();
    socket.write_all(&[42]).await.unwrap();
    let mut rest = Vec::new();
    socket.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let after = healthy.put_buffer(None, b"after", BlobType::Transient).await.unwrap();
    let target = dir.path().join("before");
    healthy.get(None, &before, &target).await.unwrap();
    assert_ne!(before, after);
    assert!(!server.is_shutdown());

    server.close().await.unwrap();
}

#[tokio::test]
async fn corrupted_download_keeps_the_transient_blob() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(server_config(dir.path()), Arc::new(VoidBlobStore)).await;

    let key = server.put_transient(None, b"original").await.unwrap();
    let cached = server.storage_location(None, &key);
    tokio::fs::write(&cached, b"tampered").await.unwrap();

    let mut client = connect(&server).await;
    let target = dir.path().join("download");
    let err = client.get(None, &key, &target).await.unwrap_err();
    assert!(matches!(err, BlobError::Corrupted { .. }));
    assert!(!target.exists());

    // the negative acknowledgement leaves the cached copy in place
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cached.exists());

    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connections_beyond_the_limit_wait_for_a_free_slot() {
    let dir = tempfile::tempdir().unwrap();
    let config = BlobServerConfig {
        max_connections: 2,
        ..server_config(dir.path())
    };
    let server = start_server(config, Arc::new(VoidBlobStore)).await;

    let first = tokio::net::TcpStream::connect(server.local_addr()).await.unwrap();
    let _second = tokio::net::TcpStream::connect(server.local_addr()).await.unwrap();
    assert!(eventually(|| server.active_connections() == 2).await);

    let addr = server.local_addr();
    let waiting = tokio::spawn(async move {
        let mut client = BlobClient::connect(addr, &BlobClientConfig::default())
            .await
            .unwrap();
        client.put_buffer(None, b"queued", BlobType::Transient).await.unwrap()
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!waiting.is_finished());
    assert_eq!(server.active_connections(), 2);

    drop(first);
    let key = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(key.is_transient());
    assert!(server.active_connections() <= 2);

    server.close().await.unwrap();
}

#[tokio::test]
async fn service_api_stores_and_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(server_config(dir.path()), Arc::new(VoidBlobStore)).await;

    let key = server.put_transient(None, b"local").await.unwrap();
    let path = server.get_file(None, &key).await.unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), b"local");

    assert!(server.delete_from_cache(None, &key).await);
    assert!(!path.exists());
    // deleting twice still succeeds
    assert!(server.delete_from_cache(None, &key).await);

    let permanent = BlobKey::new(BlobType::Permanent, [1; 20]);
    assert!(matches!(
        server.get_file(None, &permanent).await,
        Err(BlobError::InvalidRequest(_))
    ));

    server.close().await.unwrap();
}

#[tokio::test]
async fn cleanup_job_removes_local_and_blob_store_copies() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSystemBlobStore::new(dir.path().join("ha")).await.unwrap());
    let server = start_server(server_config(dir.path()), store.clone()).await;
    let job = JobId::generate();
    let other = JobId::generate();

    let transient = server.put_transient(Some(job), b"t").await.unwrap();
    let permanent = server.put_permanent(job, b"p").await.unwrap();
    let unrelated = server.put_permanent(other, b"o").await.unwrap();
    assert!(store.blob_path(&job, &permanent).exists());

    assert!(server.cleanup_job(&job, true).await);

    assert!(!server.storage_location(Some(&job), &transient).exists());
    assert!(!server.storage_location(Some(&job), &permanent).exists());
    assert!(!store.job_dir(&job).exists());
    assert!(server.storage_location(Some(&other), &unrelated).exists());
    assert!(store.blob_path(&other, &unrelated).exists());
    assert!(lock(&server.expiry_times).keys().all(|(job_id, _)| *job_id != Some(job)));

    server.close().await.unwrap();
}

#[tokio::test]
async fn exhausted_key_attempts_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let server = BlobServer::bind(server_config(dir.path()), Arc::new(VoidBlobStore))
        .await
        .unwrap();

    let key = server.put_transient(None, b"taken").await.unwrap();
    let incoming = server.create_temporary_filename().await.unwrap();
    tokio::fs::write(&incoming, b"taken").await.unwrap();

    let err = server
        .move_temp_file_with_keys(&incoming, None, BlobType::Transient, || key)
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::KeyCollisionExhausted { .. }));

    server.close().await.unwrap();
}

#[tokio::test]
async fn upload_files_and_download_with_retries() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(server_config(dir.path()), Arc::new(VoidBlobStore)).await;
    let job = JobId::generate();
    let config = BlobClientConfig::default();

    let mut files = Vec::new();
    for (i, body) in [b"first".as_slice(), b"second".as_slice()].iter().enumerate() {
        let path = dir.path().join(format!("jar-{}", i));
        tokio::fs::write(&path, body).await.unwrap();
        files.push(path);
    }

    assert!(upload_files(server.local_addr(), &config, &job, &[])
        .await
        .unwrap()
        .is_empty());
    let keys = upload_files(server.local_addr(), &config, &job, &files).await.unwrap();
    assert_eq!(keys.len(), 2);
    assert!(keys.iter().all(BlobKey::is_permanent));

    let target = dir.path().join("fetched");
    let length =
        download_from_blob_server(server.local_addr(), &config, Some(&job), &keys[1], &target)
            .await
            .unwrap();
    assert_eq!(length, 6);
    assert_eq!(tokio::fs::read(&target).await.unwrap(), b"second");

    server.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent_and_removes_the_storage_root() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(server_config(dir.path()), Arc::new(VoidBlobStore)).await;
    let storage_dir = server.storage_dir().to_path_buf();
    assert!(storage_dir.exists());
    assert!(storage_dir
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("blobStore-"));

    let mut client = connect(&server).await;
    client.put_buffer(None, b"x", BlobType::Transient).await.unwrap();

    server.close().await.unwrap();
    server.close().await.unwrap();

    assert!(server.is_shutdown());
    assert!(!storage_dir.exists());
    assert_eq!(server.active_connections(), 0);
    assert!(matches!(
        server.put_transient(None, b"late").await,
        Err(BlobError::ShutDown)
    ));
}

#[tokio::test]
async fn nothing_is_recreated_under_a_closed_server() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(server_config(dir.path()), Arc::new(VoidBlobStore)).await;
    let storage_dir = server.storage_dir().to_path_buf();
    server.create_temporary_filename().await.unwrap();

    server.close().await.unwrap();

    assert!(server.create_temporary_filename().await.is_err());
    assert!(!storage_dir.exists());
}

#[tokio::test]
async fn bind_rejects_an_out_of_range_cleanup_interval() {
    let dir = tempfile::tempdir().unwrap();
    let config = BlobServerConfig {
        cleanup_interval_secs: u64::MAX,
        ..server_config(dir.path())
    };

    assert!(matches!(
        BlobServer::bind(config, Arc::new(VoidBlobStore)).await,
        Err(BlobError::Config(_))
    ));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn bind_fails_when_no_port_is_free() {
    let dir = tempfile::tempdir().unwrap();
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = BlobServerConfig {
        port: taken.local_addr().unwrap().port().to_string(),
        ..server_config(dir.path())
    };

    assert!(BlobServer::bind(config, Arc::new(VoidBlobStore)).await.is_err());
    // the storage root of the failed server is gone again
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
