//! blobd Core - content-addressed BLOB server, wire protocol and client for
//! moving job artifacts between cluster nodes

pub mod client;
pub mod config;
pub mod error;
pub mod key;
pub mod net;
pub mod protocol;
pub mod server;
pub mod store;
pub mod tls;
pub mod utils;

pub use client::{BlobClient, download_from_blob_server, upload_files};
pub use config::{BlobClientConfig, BlobServerConfig, TlsConfig};
pub use error::{BlobError, ErrorPayload, Result};
pub use key::{BlobKey, BlobType, DIGEST_SIZE, JobId, KEY_WIRE_SIZE, RANDOM_SIZE};
pub use net::parse_port_range;
pub use server::{BlobServer, TransientBlobCleanupTask};
pub use store::{BlobStore, BlobView, FileSystemBlobStore, VoidBlobStore};
pub use utils::compute_digest;
