//! Persisted instance record
//!
//! One YAML file per instance naming the backend, the monitored
//! repositories and the poll delay bounds. Per-repository revisions live in
//! the graph, not here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const RECORD_FILE: &str = "instance.yaml";

/// A monitored repository: where it is and which manager reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub location: String,
    #[serde(default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    crate::repository::local::KIND.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub backend: String,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl InstanceRecord {
    /// Read the record; `None` when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let record = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(record))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, serde_yaml::to_string(self)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}
