use crate::error::BlockGraphError;
use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::PathBuf,
};

/// When dirty graphs and index columns are written back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    /// Only when evicted from memory or when the store closes.
    OnUnload,
    /// A bounded share of the dirty set every tick.
    #[default]
    Incremental,
    /// The whole dirty set every tick.
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphStoreConfig {
    pub save_mode: SaveMode,
    /// Ticks an unused chunk stays in memory once the host world has unloaded it.
    pub max_chunk_age: u64,
    /// An incremental save writes `ceil(dirty / incremental_save_factor)` entries per tick.
    pub incremental_save_factor: usize,
    pub max_graphs_rebuilt_per_tick: usize,
    /// Ticks between rebuild progress reports.
    pub rebuild_progress_interval: u64,
}

impl Default for GraphStoreConfig {
    fn default() -> Self {
        GraphStoreConfig {
            save_mode: SaveMode::Incremental,
            max_chunk_age: 20 * 60,
            incremental_save_factor: 10,
            max_graphs_rebuilt_per_tick: 100,
            rebuild_progress_interval: 20,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }

    pub fn get_store_config(&self) -> Result<GraphStoreConfig, BlockGraphError> {
        tracing::debug!("Attempting to read graph store config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(GraphStoreConfig::default());
        }
        let content = read_to_string(&self.path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn set_store_config(&self, config: &GraphStoreConfig) -> Result<(), BlockGraphError> {
        tracing::debug!("Attempting to write graph store config to: {:?}", &self.path);
        let toml_string = toml::to_string(config)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let provider = TomlConfigProvider::new(dir.path().join("graphs.toml"));
        assert_eq!(provider.get_store_config().unwrap(), GraphStoreConfig::default());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graphs.toml");
        std::fs::write(&path, "save_mode = \"immediate\"\nmax_chunk_age = 5\n").unwrap();
        let config = TomlConfigProvider::new(path).get_store_config().unwrap();
        assert_eq!(config.save_mode, SaveMode::Immediate);
        assert_eq!(config.max_chunk_age, 5);
        assert_eq!(config.incremental_save_factor, 10);
    }

    #[test]
    fn test_config_written_and_read_back() {
        let dir = TempDir::new().unwrap();
        let provider = TomlConfigProvider::new(dir.path().join("graphs.toml"));
        let config = GraphStoreConfig {
            save_mode: SaveMode::OnUnload,
            max_graphs_rebuilt_per_tick: 3,
            ..Default::default()
        };
        provider.set_store_config(&config).unwrap();
        assert_eq!(provider.get_store_config().unwrap(), config);
    }

    #[test]
    fn test_bad_config_is_serialization_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graphs.toml");
        std::fs::write(&path, "save_mode = \"sometimes\"\n").unwrap();
        let err = TomlConfigProvider::new(path).get_store_config().unwrap_err();
        assert!(matches!(err, BlockGraphError::Serialization(_)));
    }
}
