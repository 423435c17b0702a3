//! Writes a small playable data directory: world metadata, the 3x3 block of
//! regions around the spawn, and one sample NPC and global event.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::content::ContentKind;
use crate::world::region::WorldFile;
use crate::world::{FileRegionSource, Position, Region, Tile, REGION_SIZE_X, REGION_SIZE_Y};

pub const TEST_WORLD_Z: i32 = 7;
/// Any floor item id known to the item database.
pub const DEFAULT_ITEM_ID: u32 = 106;

/// Middle of region (7, 5) at the test z-level.
pub fn test_spawn() -> Position {
    Position::new(
        7 * REGION_SIZE_X + REGION_SIZE_X / 2,
        5 * REGION_SIZE_Y + REGION_SIZE_Y / 2,
        TEST_WORLD_Z,
    )
}

const SAMPLE_NPC_SCRIPT: &str = r#"function onGreet(playerName)
    broadcastMessage("Welcome to the test world, " .. playerName .. "!", MESSAGE_INFO)
    return "Hello, " .. playerName
end

function onThink()
    addEvent(function(text) log(text) end, 1000, "The guide looks around.")
end
"#;

const SAMPLE_STARTUP_SCRIPT: &str = r#"function onStartup()
    log("Test world is up")
    addEvent(function(text) broadcastMessage(text, MESSAGE_EVENT) end, 5000, "The test world has been running for five seconds.")
    return true
end
"#;

/// Files written by [`generate_test_world`].
#[derive(Debug, Default)]
pub struct GeneratedWorld {
    pub files: Vec<PathBuf>,
}

fn write_json<T: Serialize>(path: &Path, value: &T, out: &mut GeneratedWorld) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    out.files.push(path.to_path_buf());
    Ok(())
}

fn write_text(path: &Path, text: &str, out: &mut GeneratedWorld) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    out.files.push(path.to_path_buf());
    Ok(())
}

pub fn generate_test_world(data_dir: &Path) -> anyhow::Result<GeneratedWorld> {
    let mut out = GeneratedWorld::default();
    let source = FileRegionSource::new(data_dir);
    let spawn = test_spawn();

    let world = WorldFile {
        name: "Generated Test World".to_string(),
        description: "An automatically generated simple test world".to_string(),
        spawn,
    };
    write_json(&source.world_path(), &world, &mut out)?;

    for key in spawn.region().neighborhood() {
        let region = Region {
            x: key.x,
            y: key.y,
            z: key.z,
            tiles: vec![Tile {
                x: 0,
                y: 0,
                z: key.z,
                items: vec![DEFAULT_ITEM_ID],
            }],
        };
        write_json(&source.region_path(key), &region, &mut out)?;
    }

    let npc = ContentKind::Npc;
    write_json(
        &npc.index_path(data_dir),
        &json!([{ "name": "Guide", "script": "guide.lua" }]),
        &mut out,
    )?;
    write_text(&npc.scripts_dir(data_dir).join("guide.lua"), SAMPLE_NPC_SCRIPT, &mut out)?;

    let events = ContentKind::GlobalEvent;
    write_json(
        &events.index_path(data_dir),
        &json!([{ "name": "StartupGreeting", "script": "startup.lua", "type": "startup" }]),
        &mut out,
    )?;
    write_text(
        &events.scripts_dir(data_dir).join("startup.lua"),
        SAMPLE_STARTUP_SCRIPT,
        &mut out,
    )?;

    info!(
        "[server] Generated test world in {} ({} files, spawn {},{},{})",
        data_dir.display(),
        out.files.len(),
        spawn.x,
        spawn.y,
        spawn.z
    );
    Ok(out)
}
