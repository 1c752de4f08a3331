//! Repository managers
//!
//! A repository manager exposes one monitored location as a revision id, a
//! delta of changed artifacts since an earlier revision, and the content of
//! one artifact at a revision.

pub mod local;

pub use local::LocalFolderRepository;

use crate::instance::RepositoryConfig;
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Updated,
    Deleted,
}

/// One changed artifact. `revision` identifies the artifact's content; it
/// is empty for deletions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeItem {
    pub path: String,
    pub change: ChangeType,
    pub revision: String,
}

/// Changes between two revisions.
///
/// A `full` delta lists every artifact of the current revision as added:
/// the manager could not diff against the requested revision, so anything
/// indexed but missing from the list is gone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub full: bool,
    pub items: Vec<ChangeItem>,
}

/// Content of one artifact at a revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: String,
    pub revision: String,
    pub content: Vec<u8>,
}

#[async_trait]
pub trait RepositoryManager: Send + Sync {
    /// Stable identity of the monitored location.
    fn location(&self) -> &str;

    /// Repository type, stored in the instance record.
    fn kind(&self) -> &'static str;

    async fn current_revision(&self) -> Result<String>;

    /// Changes from `since` to the current revision; `None` asks for a full
    /// listing.
    async fn delta(&self, since: Option<&str>) -> Result<Delta>;

    async fn import_file(&self, revision: &str, path: &str) -> Result<Artifact>;
}

/// Build the manager a configured repository kind names.
pub fn open(config: &RepositoryConfig) -> Result<Arc<dyn RepositoryManager>> {
    match config.kind.as_str() {
        local::KIND => Ok(Arc::new(LocalFolderRepository::new(&config.location))),
        other => bail!("Unknown repository kind {} for {}", other, config.location),
    }
}

/// Artifact path -> content digest.
pub type Listing = BTreeMap<String, String>;

/// Every entry of `listing` as an addition.
pub fn full_delta(listing: &Listing) -> Delta {
    Delta {
        full: true,
        items: listing
            .iter()
            .map(|(path, revision)| ChangeItem {
                path: path.clone(),
                change: ChangeType::Added,
                revision: revision.clone(),
            })
            .collect(),
    }
}

/// Changes turning `old` into `new`.
pub fn diff_listings(old: &Listing, new: &Listing) -> Delta {
    let mut items = Vec::new();
    for (path, revision) in new {
        let change = match old.get(path) {
            None => ChangeType::Added,
            Some(previous) if previous != revision => ChangeType::Updated,
            Some(_) => continue,
        };
        items.push(ChangeItem {
            path: path.clone(),
            change,
            revision: revision.clone(),
        });
    }
    for path in old.keys().filter(|p| !new.contains_key(*p)) {
        items.push(ChangeItem {
            path: path.clone(),
            change: ChangeType::Deleted,
            revision: String::new(),
        });
    }
    Delta { full: false, items }
}
