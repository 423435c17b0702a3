use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::coords::RegionKey;
use super::region::{Region, WorldFile};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Where world metadata and region resources come from.
#[async_trait]
pub trait RegionSource: Send + Sync {
    async fn load_world_file(&self) -> Result<WorldFile, SourceError>;
    async fn load_region(&self, key: RegionKey) -> Result<Region, SourceError>;
    /// Human-readable location of the world metadata, for error messages.
    fn describe(&self) -> String;
}

/// Reads `world/world.json` and `world/regions/{key}.json` under a data directory.
pub struct FileRegionSource {
    world_dir: PathBuf,
}

impl FileRegionSource {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            world_dir: data_dir.as_ref().join("world"),
        }
    }

    pub fn world_path(&self) -> PathBuf {
        self.world_dir.join("world.json")
    }

    pub fn region_path(&self, key: RegionKey) -> PathBuf {
        self.world_dir.join("regions").join(format!("{key}.json"))
    }
}

pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, SourceError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&contents).map_err(|source| SourceError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl RegionSource for FileRegionSource {
    async fn load_world_file(&self) -> Result<WorldFile, SourceError> {
        read_json(&self.world_path()).await
    }

    async fn load_region(&self, key: RegionKey) -> Result<Region, SourceError> {
        read_json(&self.region_path(key)).await
    }

    fn describe(&self) -> String {
        self.world_path().display().to_string()
    }
}
