pub mod coords;
pub mod region;
pub mod source;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::join_all;
use tracing::{debug, error, info, warn};

pub use coords::{Position, RegionKey, MAX_Z_LEVELS, REGION_SIZE_X, REGION_SIZE_Y};
pub use region::{Region, Tile, WorldInfo};
pub use source::{FileRegionSource, RegionSource, SourceError};

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("world data missing at {location}: {reason}")]
    WorldDataMissing { location: String, reason: String },
}

/// Outcome of a position update as seen by the world.
#[derive(Debug, Clone)]
pub enum RegionChange {
    Unchanged,
    /// The mover crossed into `key`; `region` is `None` when that area is not available.
    Entered {
        key: RegionKey,
        region: Option<Arc<Region>>,
    },
}

/// Lazily loaded, cached view of the tile world.
///
/// Regions are loaded on first request and stay cached until
/// [`WorldStore::unload_region`] or [`WorldStore::cleanup`]; there is no
/// automatic eviction. The cache map sits behind a lock so the store can be
/// shared across tasks; the lock is never held across an await.
pub struct WorldStore {
    source: Arc<dyn RegionSource>,
    info: RwLock<Option<Arc<WorldInfo>>>,
    regions: RwLock<HashMap<RegionKey, Arc<Region>>>,
}

impl WorldStore {
    pub fn new(source: Arc<dyn RegionSource>) -> Self {
        Self {
            source,
            info: RwLock::new(None),
            regions: RwLock::new(HashMap::new()),
        }
    }

    fn regions_read(&self) -> RwLockReadGuard<'_, HashMap<RegionKey, Arc<Region>>> {
        self.regions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn regions_write(&self) -> RwLockWriteGuard<'_, HashMap<RegionKey, Arc<Region>>> {
        self.regions.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Loads the world metadata. Callers treat an error as fatal.
    pub async fn load_world(&self) -> Result<Arc<WorldInfo>, WorldError> {
        let missing = |reason: String| WorldError::WorldDataMissing {
            location: self.source.describe(),
            reason,
        };
        let file = self
            .source
            .load_world_file()
            .await
            .map_err(|e| missing(e.to_string()))?;
        let info = Arc::new(WorldInfo::try_from(file).map_err(missing)?);
        *self.info.write().unwrap_or_else(|e| e.into_inner()) = Some(info.clone());
        info!("[world] World \"{}\" data loaded", info.name);
        Ok(info)
    }

    pub fn world_info(&self) -> Option<Arc<WorldInfo>> {
        self.info.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn world_name(&self) -> Option<String> {
        self.world_info().map(|info| info.name.clone())
    }

    pub fn start_spawn(&self) -> Option<Position> {
        let spawn = self.world_info().map(|info| info.spawn);
        if spawn.is_none() {
            warn!("[world] No start spawn available; world data not loaded");
        }
        spawn
    }

    /// Returns the cached region for `key`, loading it on a miss.
    ///
    /// `None` means the area is not available (bad z-level, missing or
    /// malformed resource). It is never an error for the caller.
    pub async fn get_region(&self, key: RegionKey) -> Option<Arc<Region>> {
        if !key.z_in_range() {
            warn!("[world] Refusing region {key}: z-level outside 0..{MAX_Z_LEVELS}");
            return None;
        }

        if let Some(region) = self.regions_read().get(&key) {
            return Some(region.clone());
        }

        let loaded = match self.source.load_region(key).await {
            Ok(region) => region,
            Err(e) => {
                error!("[world] Failed to load region {key}: {e}");
                return None;
            }
        };
        if let Err(reason) = loaded.validate(key) {
            error!("[world] Region {key} is invalid: {reason}");
            return None;
        }

        let mut regions = self.regions_write();
        // A concurrent load of the same key may have won; keep the first so
        // every caller shares one object.
        let region = regions.entry(key).or_insert_with(|| Arc::new(loaded)).clone();
        info!("[world] Loaded region {key}. Total cached: {}", regions.len());
        Some(region)
    }

    /// Drops `key` from the cache. No-op when it is not cached.
    pub fn unload_region(&self, key: RegionKey) {
        let mut regions = self.regions_write();
        if regions.remove(&key).is_some() {
            info!("[world] Unloaded region {key}. Total cached: {}", regions.len());
        }
    }

    pub async fn get_tile(&self, global_x: i32, global_y: i32, z: i32) -> Option<Tile> {
        let key = coords::region_of(global_x, global_y, z);
        let Some(region) = self.get_region(key).await else {
            debug!("[world] Tile ({global_x},{global_y},{z}): region {key} not available");
            return None;
        };
        let (local_x, local_y) = coords::local_of(global_x, global_y);
        let tile = region.tile_at(local_x, local_y, z).cloned();
        if tile.is_none() {
            debug!("[world] Tile ({global_x},{global_y},{z}) not present in region {key}");
        }
        tile
    }

    /// Loads the 3x3 block of regions around `center`. Members resolve
    /// independently; one failing does not affect the others.
    pub async fn load_neighborhood(
        &self,
        center: Position,
    ) -> Vec<(RegionKey, Option<Arc<Region>>)> {
        let keys = center.region().neighborhood();
        let loads = keys.iter().map(|key| self.get_region(*key));
        keys.iter().copied().zip(join_all(loads).await).collect()
    }

    /// Position-update hook: loads the destination region only when the move
    /// crosses a region boundary or changes level.
    pub async fn region_for_move(&self, from: Position, to: Position) -> RegionChange {
        let old_key = from.region();
        let new_key = to.region();
        if old_key == new_key {
            return RegionChange::Unchanged;
        }
        debug!("[world] Mover crossed from region {old_key} into {new_key}");
        RegionChange::Entered {
            key: new_key,
            region: self.get_region(new_key).await,
        }
    }

    pub fn is_cached(&self, key: RegionKey) -> bool {
        self.regions_read().contains_key(&key)
    }

    pub fn cached_count(&self) -> usize {
        self.regions_read().len()
    }

    pub fn cached_regions(&self) -> Vec<Arc<Region>> {
        let mut regions: Vec<_> = self.regions_read().values().cloned().collect();
        regions.sort_by_key(|r| r.key());
        regions
    }

    /// Clears every cached region and the world metadata.
    pub fn cleanup(&self) {
        self.regions_write().clear();
        *self.info.write().unwrap_or_else(|e| e.into_inner()) = None;
        info!("[world] All cached regions cleared");
    }
}
