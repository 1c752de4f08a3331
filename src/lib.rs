//! Model Indexer
//!
//! Keeps a typed property graph in step with model artifacts stored in
//! version-controlled repositories:
//! - Incremental, revision-based synchronization on a backoff schedule
//! - Transactional or batch-mode writes through a pluggable graph backend
//! - Cross-artifact references kept as proxies until their targets appear
//! - Derived attributes recomputed only when what they read has changed
//! - Named secondary indexes with exact, wildcard and range lookups

pub mod derived;
pub mod error;
pub mod events;
pub mod graph;
pub mod index;
pub mod instance;
pub mod model;
pub mod parser;
pub mod repository;
pub mod sync;
pub mod updater;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use error::IndexError;
pub use instance::{InstanceRecord, RepositoryConfig};
pub use sync::{SyncController, SyncSettings, SyncState};

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct YamlConfig {
    pub state_dir: String,
    pub sync: SyncYamlConfig,
    /// Metamodel JSON files registered at start
    pub metamodels: Vec<String>,
    pub repositories: Vec<RepositoryConfig>,
}

impl Default for YamlConfig {
    fn default() -> Self {
        Self {
            state_dir: ".model-indexer".into(),
            sync: SyncYamlConfig::default(),
            metamodels: Vec::new(),
            repositories: Vec::new(),
        }
    }
}

/// Synchronization section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncYamlConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub batch_mode: bool,
}

impl Default for SyncYamlConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1000,
            max_delay_ms: 512_000,
            batch_mode: true,
        }
    }
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    /// Holds the graph snapshot and the instance record
    pub state_dir: PathBuf,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub batch_mode: bool,
    pub metamodels: Vec<PathBuf>,
    pub repositories: Vec<RepositoryConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_yaml_and_env(None)
    }

    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        // 1. Load YAML config (or defaults if file not found)
        let yaml = Self::load_yaml(yaml_path);

        // 2. Build Config with env var overrides
        Ok(Self {
            state_dir: std::env::var("INDEXER_STATE_DIR")
                .unwrap_or(yaml.state_dir)
                .into(),
            min_delay_ms: std::env::var("INDEXER_MIN_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(yaml.sync.min_delay_ms),
            max_delay_ms: std::env::var("INDEXER_MAX_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(yaml.sync.max_delay_ms),
            batch_mode: std::env::var("INDEXER_BATCH_MODE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(yaml.sync.batch_mode),
            metamodels: yaml.metamodels.into_iter().map(PathBuf::from).collect(),
            repositories: yaml.repositories,
        })
    }

    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new("indexer.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            batch_mode: self.batch_mode,
            min_delay: Duration::from_millis(self.min_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn graph_path(&self) -> PathBuf {
        self.state_dir.join("graph.json")
    }

    pub fn instance_path(&self) -> PathBuf {
        self.state_dir.join(instance::RECORD_FILE)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_yaml_config_loading() {
        let yaml = r#"
state_dir: /var/lib/indexer
sync:
  min_delay_ms: 250
  max_delay_ms: 8000
  batch_mode: false
metamodels:
  - metamodels/arch.json
repositories:
  - location: /srv/models
  - location: /srv/shared
    kind: local-folder
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.state_dir, "/var/lib/indexer");
        assert_eq!(config.sync.min_delay_ms, 250);
        assert!(!config.sync.batch_mode);
        assert_eq!(config.metamodels, vec!["metamodels/arch.json".to_string()]);
        assert_eq!(config.repositories.len(), 2);
        assert_eq!(config.repositories[0].kind, "local-folder");
    }

    #[test]
    fn test_yaml_defaults() {
        let config = YamlConfig::default();
        assert_eq!(config.state_dir, ".model-indexer");
        assert_eq!(config.sync.min_delay_ms, 1000);
        assert_eq!(config.sync.max_delay_ms, 512_000);
        assert!(config.sync.batch_mode);
        assert!(config.repositories.is_empty());
    }

    #[test]
    fn test_partial_sync_section() {
        let yaml = r#"
sync:
  max_delay_ms: 60000
"#;
        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.sync.min_delay_ms, 1000);
        assert_eq!(config.sync.max_delay_ms, 60000);
    }

    #[test]
    fn test_yaml_and_env_lifecycle() {
        fn clear_env() {
            for var in &[
                "INDEXER_STATE_DIR",
                "INDEXER_MIN_DELAY_MS",
                "INDEXER_MAX_DELAY_MS",
                "INDEXER_BATCH_MODE",
            ] {
                std::env::remove_var(var);
            }
        }

        // --- Phase 1: YAML values loaded correctly ---
        let yaml = r#"
state_dir: /tmp/yaml-state
sync:
  min_delay_ms: 500
  batch_mode: false
"#;
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("indexer.yaml");
        let mut file = std::fs::File::create(&file_path).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        clear_env();

        let config = Config::from_yaml_and_env(Some(&file_path)).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/yaml-state"));
        assert_eq!(config.min_delay_ms, 500);
        assert!(!config.batch_mode);
        assert_eq!(
            config.instance_path(),
            PathBuf::from("/tmp/yaml-state/instance.yaml")
        );

        // --- Phase 2: Env vars override YAML ---
        std::env::set_var("INDEXER_MIN_DELAY_MS", "50");
        std::env::set_var("INDEXER_BATCH_MODE", "true");

        let config = Config::from_yaml_and_env(Some(&file_path)).unwrap();
        assert_eq!(config.min_delay_ms, 50);
        assert!(config.batch_mode);
        assert_eq!(config.sync_settings().min_delay, Duration::from_millis(50));
        // YAML value still used where no env override
        assert_eq!(config.state_dir, PathBuf::from("/tmp/yaml-state"));

        clear_env();

        // --- Phase 3: No YAML file → defaults ---
        let nonexistent = Path::new("/tmp/nonexistent-indexer-12345.yaml");
        let config = Config::from_yaml_and_env(Some(nonexistent)).unwrap();
        assert_eq!(config.max_delay_ms, 512_000);
        assert!(config.batch_mode);
        assert_eq!(config.graph_path(), PathBuf::from(".model-indexer/graph.json"));
    }
}
