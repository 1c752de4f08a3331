//! Local folder repository
//!
//! Treats a directory tree as a repository. The revision is a digest over
//! every `(path, content digest)` pair, so any edit, addition or removal
//! yields a new revision. Recent listings are cached by revision to diff
//! against; an unknown revision produces a full delta.

use super::{diff_listings, full_delta, Artifact, Delta, Listing, RepositoryManager};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

pub const KIND: &str = "local-folder";

const LISTING_CACHE: usize = 8;

pub struct LocalFolderRepository {
    root: PathBuf,
    location: String,
    listings: Mutex<LruCache<String, Arc<Listing>>>,
}

impl LocalFolderRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let location = root.display().to_string();
        Self {
            root,
            location,
            listings: Mutex::new(LruCache::new(
                NonZeroUsize::new(LISTING_CACHE).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan the tree and remember the listing under its revision.
    async fn scan(&self) -> Result<(String, Arc<Listing>)> {
        let root = self.root.clone();
        let listing = tokio::task::spawn_blocking(move || scan_folder(&root))
            .await
            .context("Folder scan task panicked")??;
        let revision = listing_revision(&listing);
        let listing = Arc::new(listing);
        self.listings.lock().put(revision.clone(), listing.clone());
        Ok((revision, listing))
    }
}

#[async_trait]
impl RepositoryManager for LocalFolderRepository {
    fn location(&self) -> &str {
        &self.location
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    async fn current_revision(&self) -> Result<String> {
        Ok(self.scan().await?.0)
    }

    async fn delta(&self, since: Option<&str>) -> Result<Delta> {
        let previous = since.and_then(|rev| self.listings.lock().get(rev).cloned());
        let (_, current) = self.scan().await?;
        Ok(match previous {
            Some(previous) => diff_listings(&previous, &current),
            None => full_delta(&current),
        })
    }

    async fn import_file(&self, _revision: &str, path: &str) -> Result<Artifact> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Refusing to import {} outside {}", path, self.location);
        }
        let content = tokio::fs::read(self.root.join(relative))
            .await
            .with_context(|| format!("Failed to read {} in {}", path, self.location))?;
        Ok(Artifact {
            path: path.to_string(),
            revision: digest(&content),
            content,
        })
    }
}

fn scan_folder(root: &Path) -> Result<Listing> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let mut listing = Listing::new();
    let entries = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root)?;
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let content = std::fs::read(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;
        listing.insert(path, digest(&content));
    }
    Ok(listing)
}

fn digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn listing_revision(listing: &Listing) -> String {
    let mut hasher = Sha256::new();
    for (path, revision) in listing {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(revision.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::ChangeType;
    use tempfile::TempDir;

    fn write(dir: &TempDir, path: &str, content: &str) {
        let full = dir.path().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    #[tokio::test]
    async fn test_revision_changes_with_content() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.model.json", "{}");
        let repo = LocalFolderRepository::new(dir.path());

        let first = repo.current_revision().await.unwrap();
        assert_eq!(first, repo.current_revision().await.unwrap());

        write(&dir, "a.model.json", "{\"elements\": []}");
        assert_ne!(first, repo.current_revision().await.unwrap());
    }

    #[tokio::test]
    async fn test_delta_against_known_revision() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.model.json", "1");
        write(&dir, "nested/b.model.json", "1");
        let repo = LocalFolderRepository::new(dir.path());
        let first = repo.current_revision().await.unwrap();

        let full = repo.delta(None).await.unwrap();
        assert!(full.full);
        assert_eq!(full.items.len(), 2);
        assert!(full.items.iter().any(|i| i.path == "nested/b.model.json"));

        write(&dir, "a.model.json", "2");
        std::fs::remove_file(dir.path().join("nested/b.model.json")).unwrap();
        let delta = repo.delta(Some(&first)).await.unwrap();
        assert!(!delta.full);
        let changes: Vec<(&str, ChangeType)> =
            delta.items.iter().map(|i| (i.path.as_str(), i.change)).collect();
        assert_eq!(
            changes,
            vec![("a.model.json", ChangeType::Updated), ("nested/b.model.json", ChangeType::Deleted)]
        );
    }

    #[tokio::test]
    async fn test_unknown_revision_gives_full_delta() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.model.json", "1");
        let repo = LocalFolderRepository::new(dir.path());
        assert!(repo.delta(Some("deadbeef")).await.unwrap().full);
    }

    #[tokio::test]
    async fn test_hidden_entries_are_skipped() {
        let dir = TempDir::new().unwrap();
        write(&dir, ".git/config", "x");
        write(&dir, "a.model.json", "1");
        let repo = LocalFolderRepository::new(dir.path());
        let delta = repo.delta(None).await.unwrap();
        assert_eq!(delta.items.len(), 1);
    }

    #[tokio::test]
    async fn test_import_file() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.model.json", "hello");
        let repo = LocalFolderRepository::new(dir.path());
        let artifact = repo.import_file("any", "a.model.json").await.unwrap();
        assert_eq!(artifact.content, b"hello");
        assert_eq!(artifact.revision, digest(b"hello"));
        assert!(repo.import_file("any", "../escape").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_root_is_an_error() {
        let repo = LocalFolderRepository::new("/definitely/not/here");
        assert!(repo.current_revision().await.is_err());
    }
}
