//! Game-server core: lazily cached tile regions, sandboxed Lua content
//! scripts and the registries that bind them to named content.

pub mod config;
pub mod content;
pub mod scripting;
pub mod telemetry;
pub mod testgen;
pub mod world;
