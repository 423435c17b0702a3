use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::content::DuplicatePolicy;
use crate::scripting::{
    ScriptLimits, DEFAULT_MAX_TABLE_DEPTH, DEFAULT_SCRIPT_BUDGET_MS,
    DEFAULT_SCRIPT_HOOK_INSTRUCTION_INTERVAL,
};

pub const CONFIG_ENV: &str = "SWEV_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "server.json";

/// Server settings from `server.json`; every field is optional on disk.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub log_filter: String,
    pub script_budget_ms: u64,
    pub script_hook_instruction_interval: u64,
    pub script_max_table_depth: usize,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            log_filter: "info".to_string(),
            script_budget_ms: DEFAULT_SCRIPT_BUDGET_MS,
            script_hook_instruction_interval: DEFAULT_SCRIPT_HOOK_INSTRUCTION_INTERVAL as u64,
            script_max_table_depth: DEFAULT_MAX_TABLE_DEPTH,
            duplicate_policy: DuplicatePolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn script_limits(&self) -> ScriptLimits {
        ScriptLimits {
            budget: Duration::from_millis(self.script_budget_ms.max(1)),
            instruction_interval: self.script_hook_instruction_interval.clamp(100, 1_000_000)
                as u32,
            max_table_depth: self.script_max_table_depth.max(1),
        }
    }

    /// Applies `SWEV_*` overrides read through `lookup`. Unparseable values
    /// are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|s| !s.trim().is_empty());

        if let Some(dir) = var("SWEV_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(filter) = var("SWEV_LOG") {
            self.log_filter = filter;
        }
        let number = |name: &str| var(name).and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(ms) = number("SWEV_SCRIPT_BUDGET_MS") {
            self.script_budget_ms = ms;
        }
        if let Some(interval) = number("SWEV_SCRIPT_HOOK_INSTRUCTION_INTERVAL") {
            self.script_hook_instruction_interval = interval;
        }
        if let Some(depth) = number("SWEV_SCRIPT_MAX_TABLE_DEPTH") {
            self.script_max_table_depth = depth as usize;
        }
        if let Some(policy) = var("SWEV_DUPLICATE_POLICY").and_then(|v| v.parse().ok()) {
            self.duplicate_policy = policy;
        }
    }
}

fn parse_config(path: &str, contents: &str) -> ServerConfig {
    match serde_json::from_str::<ServerConfig>(contents) {
        Ok(cfg) => {
            println!("[server] Loaded config from {}", path);
            cfg
        }
        Err(e) => {
            eprintln!("[server] Failed to parse {}: {}", path, e);
            ServerConfig::default()
        }
    }
}

/// Reads the config file named by `SWEV_CONFIG` (or `server.json`), then
/// applies environment overrides. Runs before logging is up, so problems go
/// to stderr.
pub fn load_server_config() -> ServerConfig {
    let path = std::env::var(CONFIG_ENV)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let mut config = match std::fs::read_to_string(&path) {
        Ok(contents) => parse_config(&path, &contents),
        Err(_) => ServerConfig::default(),
    };
    config.apply_overrides(|name| std::env::var(name).ok());
    config
}
