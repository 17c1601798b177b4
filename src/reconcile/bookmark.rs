//! Reconciliation bookmark: the last entity ID fully reconciled.

use crate::model::EntityId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Resumption point of an ID-ordered scan.
///
/// `Beginning` sorts before every `After`, and `After` values sort by ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bookmark {
    #[default]
    Beginning,
    After(EntityId),
}

impl Bookmark {
    /// The earlier of two resumption points.
    pub fn lesser(self, other: Bookmark) -> Bookmark {
        std::cmp::min(self, other)
    }

    pub fn covers(&self, entity_id: &EntityId) -> bool {
        match self {
            Bookmark::Beginning => false,
            Bookmark::After(last) => entity_id <= last,
        }
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bookmark::Beginning => f.write_str("<beginning>"),
            Bookmark::After(id) => write!(f, "after {}", id),
        }
    }
}

/// Durable storage for the single bookmark record.
#[async_trait]
pub trait BookmarkStore: Send + Sync + 'static {
    async fn load(&self) -> Result<Bookmark>;
    async fn save(&self, bookmark: &Bookmark) -> Result<()>;
}

/// JSON file, replaced atomically through a temporary file and rename.
#[derive(Debug, Clone)]
pub struct FileBookmarkStore {
    path: PathBuf,
}

impl FileBookmarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl BookmarkStore for FileBookmarkStore {
    async fn load(&self) -> Result<Bookmark> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt bookmark file {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Bookmark::Beginning),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read bookmark {}", self.path.display())),
        }
    }

    async fn save(&self, bookmark: &Bookmark) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let temp = self.temp_path();
        let bytes = serde_json::to_vec(bookmark)?;
        tokio::fs::write(&temp, bytes)
            .await
            .with_context(|| format!("failed to write {}", temp.display()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Process-local bookmark, with a record of every save.
#[derive(Debug, Default)]
pub struct MemoryBookmarkStore {
    current: Mutex<Bookmark>,
    history: Mutex<Vec<Bookmark>>,
}

impl MemoryBookmarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(bookmark: Bookmark) -> Self {
        Self {
            current: Mutex::new(bookmark),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> Bookmark {
        self.current.lock().clone()
    }

    pub fn history(&self) -> Vec<Bookmark> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl BookmarkStore for MemoryBookmarkStore {
    async fn load(&self) -> Result<Bookmark> {
        Ok(self.current())
    }

    async fn save(&self, bookmark: &Bookmark) -> Result<()> {
        *self.current.lock() = bookmark.clone();
        self.history.lock().push(bookmark.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_beginning_sorts_first() {
        let a = Bookmark::After(EntityId::new("a"));
        let b = Bookmark::After(EntityId::new("b"));
        assert_eq!(a.clone().lesser(b.clone()), a);
        assert_eq!(b.lesser(Bookmark::Beginning), Bookmark::Beginning);
        assert!(a.covers(&EntityId::new("a")));
        assert!(!a.covers(&EntityId::new("b")));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileBookmarkStore::new(dir.path().join("state").join("bookmark.json"));
        assert_eq!(store.load().await.unwrap(), Bookmark::Beginning);

        let bookmark = Bookmark::After(EntityId::new("twin-42"));
        store.save(&bookmark).await.unwrap();
        assert_eq!(store.load().await.unwrap(), bookmark);
        assert!(!store.temp_path().exists());

        let reopened = FileBookmarkStore::new(store.path().to_path_buf());
        assert_eq!(reopened.load().await.unwrap(), bookmark);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bookmark.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(FileBookmarkStore::new(path).load().await.is_err());
    }
}
