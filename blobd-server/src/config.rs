use blobd_core::{
    BlobClientConfig, BlobError, BlobServerConfig, BlobStore, FileSystemBlobStore, Result,
    VoidBlobStore,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

const ENV_PREFIX: &str = "BLOBD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: BlobServerConfig,
    pub client: BlobClientConfig,
    pub ha_store: HaStoreConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HaStoreConfig {
    pub backend: HaStoreBackend,
    /// Root directory of the `filesystem` backend.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaStoreBackend {
    #[default]
    None,
    Filesystem,
}

impl fmt::Display for HaStoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaStoreBackend::None => f.write_str("none"),
            HaStoreBackend::Filesystem => f.write_str("filesystem"),
        }
    }
}

impl Config {
    /// Loads `path` and overlays `BLOBD_*` environment variables, e.g.
    /// `BLOBD_SERVER__PORT=50100-50200`.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }

    /// Defaults plus the `BLOBD_*` environment overlay.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| BlobError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BlobError::Config(e.to_string()))?;

        Ok(config)
    }

    pub async fn build_blob_store(&self) -> Result<Arc<dyn BlobStore>> {
        tracing::info!("HA blob store backend: {}", self.ha_store.backend);
        match self.ha_store.backend {
            HaStoreBackend::None => Ok(Arc::new(VoidBlobStore)),
            HaStoreBackend::Filesystem => {
                let path = self.ha_store.path.clone().ok_or_else(|| {
                    BlobError::Config(
                        "ha_store.path is required for the filesystem backend".to_string(),
                    )
                })?;
                Ok(Arc::new(FileSystemBlobStore::new(path).await?))
            }
        }
    }
}
