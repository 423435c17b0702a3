use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of a region in tiles.
pub const REGION_SIZE_X: i32 = 256;
/// Height of a region in tiles.
pub const REGION_SIZE_Y: i32 = 256;
/// Number of z-levels; valid levels are `0..MAX_Z_LEVELS`.
pub const MAX_Z_LEVELS: i32 = 16;

/// A global tile position.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Position {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn region(&self) -> RegionKey {
        region_of(self.x, self.y, self.z)
    }
}

/// Address of one region: region-grid x/y plus the z-level.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl RegionKey {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn z_in_range(&self) -> bool {
        z_in_range(self.z)
    }

    /// The 3x3 block of keys centred on `self`, centre first.
    pub fn neighborhood(&self) -> [RegionKey; 9] {
        let Self { x, y, z } = *self;
        [
            Self::new(x, y, z),
            Self::new(x - 1, y, z),
            Self::new(x + 1, y, z),
            Self::new(x, y - 1, z),
            Self::new(x, y + 1, z),
            Self::new(x - 1, y - 1, z),
            Self::new(x + 1, y - 1, z),
            Self::new(x - 1, y + 1, z),
            Self::new(x + 1, y + 1, z),
        ]
    }
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.x, self.y, self.z)
    }
}

pub fn z_in_range(z: i32) -> bool {
    (0..MAX_Z_LEVELS).contains(&z)
}

/// Region containing the global tile, using floor division so negative
/// coordinates land in negative regions.
pub fn region_of(global_x: i32, global_y: i32, z: i32) -> RegionKey {
    RegionKey::new(
        global_x.div_euclid(REGION_SIZE_X),
        global_y.div_euclid(REGION_SIZE_Y),
        z,
    )
}

/// Offset of the global tile inside its region. Always non-negative.
pub fn local_of(global_x: i32, global_y: i32) -> (i32, i32) {
    (
        global_x.rem_euclid(REGION_SIZE_X),
        global_y.rem_euclid(REGION_SIZE_Y),
    )
}

pub fn local_in_bounds(local_x: i32, local_y: i32) -> bool {
    (0..REGION_SIZE_X).contains(&local_x) && (0..REGION_SIZE_Y).contains(&local_y)
}
