use serde::{Deserialize, Serialize};

use super::coords::{
    local_in_bounds, Position, RegionKey, MAX_Z_LEVELS, REGION_SIZE_X, REGION_SIZE_Y,
};

/// One cell of the world. `x`/`y` are local to the owning region.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Tile {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    /// Stacked item ids, bottom first.
    #[serde(default)]
    pub items: Vec<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    #[serde(default)]
    pub tiles: Vec<Tile>,
}

impl Region {
    pub fn key(&self) -> RegionKey {
        RegionKey::new(self.x, self.y, self.z)
    }

    /// First tile whose local coordinates and level all match.
    pub fn tile_at(&self, local_x: i32, local_y: i32, z: i32) -> Option<&Tile> {
        self.tiles
            .iter()
            .find(|tile| tile.x == local_x && tile.y == local_y && tile.z == z)
    }

    /// Checks that a region read for `expected` really describes that region.
    pub fn validate(&self, expected: RegionKey) -> Result<(), String> {
        if self.key() != expected {
            return Err(format!(
                "region declares {} but was requested as {}",
                self.key(),
                expected
            ));
        }
        for tile in &self.tiles {
            if !local_in_bounds(tile.x, tile.y) {
                return Err(format!(
                    "tile ({},{}) lies outside the {}x{} region bounds",
                    tile.x, tile.y, REGION_SIZE_X, REGION_SIZE_Y
                ));
            }
            if tile.z != self.z {
                return Err(format!(
                    "tile ({},{}) has z {} in a z {} region",
                    tile.x, tile.y, tile.z, self.z
                ));
            }
        }
        Ok(())
    }
}

/// Shape of `world/world.json`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorldFile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub spawn: Position,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct WorldInfo {
    pub name: String,
    pub description: String,
    pub spawn: Position,
    pub region_size_x: i32,
    pub region_size_y: i32,
    pub max_z_levels: i32,
}

impl TryFrom<WorldFile> for WorldInfo {
    type Error = String;

    fn try_from(file: WorldFile) -> Result<Self, Self::Error> {
        if file.name.trim().is_empty() {
            return Err("world name is empty".to_string());
        }
        Ok(Self {
            name: file.name,
            description: file.description,
            spawn: file.spawn,
            region_size_x: REGION_SIZE_X,
            region_size_y: REGION_SIZE_Y,
            max_z_levels: MAX_Z_LEVELS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(tiles: Vec<Tile>) -> Region {
        Region {
            x: 7,
            y: 5,
            z: 7,
            tiles,
        }
    }

    #[test]
    fn region_file_parses_with_defaults() {
        let parsed: Region = serde_json::from_str(
            r#"{ "x": 7, "y": 5, "z": 7, "tiles": [ { "x": 0, "y": 0, "z": 7, "items": [106, 2] } ] }"#,
        )
        .expect("parse region");
        assert_eq!(parsed.key(), RegionKey::new(7, 5, 7));
        assert_eq!(parsed.tiles[0].items, vec![106, 2]);

        let bare: Region = serde_json::from_str(r#"{ "x": 0, "y": 0, "z": 0 }"#).expect("parse");
        assert!(bare.tiles.is_empty());
    }

    #[test]
    fn tile_lookup_returns_first_match() {
        let r = region(vec![
            Tile { x: 1, y: 2, z: 7, items: vec![1] },
            Tile { x: 1, y: 2, z: 7, items: vec![2] },
        ]);
        assert_eq!(r.tile_at(1, 2, 7).map(|t| t.items[0]), Some(1));
        assert!(r.tile_at(2, 1, 7).is_none());
        assert!(r.tile_at(1, 2, 6).is_none());
    }

    #[test]
    fn validation_rejects_mismatched_key_and_bad_tiles() {
        assert!(region(vec![]).validate(RegionKey::new(7, 5, 7)).is_ok());
        assert!(region(vec![]).validate(RegionKey::new(7, 6, 7)).is_err());
        let out_of_bounds = region(vec![Tile { x: 256, y: 0, z: 7, items: vec![] }]);
        assert!(out_of_bounds.validate(RegionKey::new(7, 5, 7)).is_err());
        let wrong_level = region(vec![Tile { x: 0, y: 0, z: 6, items: vec![] }]);
        assert!(wrong_level.validate(RegionKey::new(7, 5, 7)).is_err());
    }

    #[test]
    fn world_info_requires_a_name() {
        let file = WorldFile {
            name: "  ".to_string(),
            description: String::new(),
            spawn: Position::new(0, 0, 7),
        };
        assert!(WorldInfo::try_from(file).is_err());

        let file = WorldFile {
            name: "Test".to_string(),
            description: "d".to_string(),
            spawn: Position::new(1920, 1408, 7),
        };
        let info = WorldInfo::try_from(file).expect("valid world");
        assert_eq!(info.region_size_x, REGION_SIZE_X);
        assert_eq!(info.max_z_levels, MAX_Z_LEVELS);
    }
}
