//! Application configuration (spec.md §6 "Application configuration").

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::conf::ConfigType;

const DEFAULT_ENGINE_CONFIG: &str = include_str!("./default_engine_config.toml");

#[derive(Deserialize, Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DatasetConfig {
    pub path: String,
    pub metadata_schema: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct EngineBlock {
    pub database: String,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub start_workers: u64,
    #[serde(default)]
    pub dataset: HashMap<String, DatasetConfig>,
    /// Module-specific configuration subtrees (e.g. `fakespm.<id>`),
    /// opaque to the engine itself.
    #[serde(default, flatten)]
    pub modules: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct EngineConfig {
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub databases: HashMap<String, DatabaseConfig>,
    #[serde(default)]
    pub engines: HashMap<String, EngineBlock>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig { path: String::new() }
    }
}

impl ConfigType for EngineConfig {
    fn default_config() -> &'static str {
        DEFAULT_ENGINE_CONFIG
    }

    fn config_paths() -> Vec<PathBuf> {
        vec![
            PathBuf::from("/etc/capsul/config.toml"),
            PathBuf::from("capsul.toml"),
        ]
    }

    fn env_prefix() -> &'static str {
        "CAPSUL_"
    }
}

impl EngineConfig {
    pub fn database_path(&self, engine_name: &str) -> Option<&str> {
        let engine = self.engines.get(engine_name)?;
        self.databases.get(&engine.database).map(|d| d.path.as_str())
    }
}
