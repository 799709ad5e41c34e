use crate::error::{BlobError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_CONNECTIONS: usize = 50;
pub const DEFAULT_BACKLOG: u32 = 1000;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;
/// One year; longer intervals can overflow `Instant` arithmetic.
pub const MAX_CLEANUP_INTERVAL_SECS: u64 = 365 * 24 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobServerConfig {
    /// Single ports, `a-b` ranges or comma separated combinations; `0` lets
    /// the OS pick.
    pub port: String,
    pub bind_host: String,
    /// Parent of the per-process storage root; the system temp dir if unset.
    pub storage_directory: Option<PathBuf>,
    pub max_connections: usize,
    pub backlog: u32,
    /// Sweep period, and the TTL granted to transient blobs.
    pub cleanup_interval_secs: u64,
    pub tls: TlsConfig,
}

impl Default for BlobServerConfig {
    fn default() -> Self {
        Self {
            port: "0".to_string(),
            bind_host: "0.0.0.0".to_string(),
            storage_directory: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            backlog: DEFAULT_BACKLOG,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            tls: TlsConfig::default(),
        }
    }
}

impl BlobServerConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Replaces out-of-range values with defaults and rejects settings the
    /// server cannot run with.
    pub fn sanitize(mut self) -> Result<Self> {
        if self.max_connections < 1 {
            tracing::warn!(
                "Invalid value for maximum connections in BLOB server: {}. Using default value of {}",
                self.max_connections,
                DEFAULT_MAX_CONNECTIONS
            );
            self.max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        if self.backlog < 1 {
            tracing::warn!(
                "Invalid value for BLOB connection backlog: {}. Using default value of {}",
                self.backlog,
                DEFAULT_BACKLOG
            );
            self.backlog = DEFAULT_BACKLOG;
        }

        if self.cleanup_interval_secs == 0
            || self.cleanup_interval_secs > MAX_CLEANUP_INTERVAL_SECS
        {
            return Err(BlobError::Config(format!(
                "cleanup_interval_secs must be between 1 and {}, got {}",
                MAX_CLEANUP_INTERVAL_SECS, self.cleanup_interval_secs
            )));
        }

        if self.tls.enabled && (self.tls.cert_path.is_none() || self.tls.key_path.is_none()) {
            return Err(BlobError::Config(
                "tls.cert_path and tls.key_path are required when TLS is enabled".to_string(),
            ));
        }

        crate::net::parse_port_range(&self.port)?;
        Ok(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobClientConfig {
    /// 0 waits for the OS connect timeout.
    pub connect_timeout_ms: u64,
    /// Upper bound for every read from the server; 0 disables it.
    pub read_timeout_secs: u64,
    pub fetch_retries: u32,
    pub tls: TlsConfig,
}

impl Default for BlobClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 0,
            read_timeout_secs: 300,
            fetch_retries: 5,
            tls: TlsConfig::default(),
        }
    }
}

impl BlobClientConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Server certificate chain (PEM).
    pub cert_path: Option<PathBuf>,
    /// Server private key (PEM).
    pub key_path: Option<PathBuf>,
    /// Trusted roots for clients (PEM).
    pub ca_path: Option<PathBuf>,
    /// Name clients verify the server certificate against; defaults to the
    /// host they connect to.
    pub server_name: Option<String>,
}
