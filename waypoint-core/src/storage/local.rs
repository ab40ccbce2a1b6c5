/*!
Local filesystem storage adapter implementation.

Each key maps to one file under the store root: the colon-separated
segments become nested directories and the last segment names the file,
e.g. `checkpoint:w1:abc` is stored at `<root>/checkpoint/w1/abc.ckpt`.
*/

use async_trait::async_trait;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::RwLock;
use tracing::debug;

use super::{StateStore, StoreCapabilities, StoreStats};
use crate::checkpoint::KEY_SEPARATOR;
use crate::{CheckpointError, Result};

const FILE_EXTENSION: &str = "ckpt";

/// Filesystem storage adapter
///
/// Writes go to a temporary file in the destination directory which is then
/// renamed over the target, so a reader sees either the previous value or
/// the new one, never a partial write. Parent directories are created on
/// demand and pruned again once empty.
///
/// # Example
/// ```rust,no_run
/// use waypoint_core::storage::{FileStore, StateStore};
///
/// # async fn demo() -> waypoint_core::Result<()> {
/// let store = FileStore::new("/var/lib/waypoint")?;
/// store.put("checkpoint:w1:abc", b"...").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FileStore {
    root: Arc<PathBuf>,
    /// Writers hold this exclusively so directory pruning never races a put
    lock: Arc<RwLock<()>>,
    closed: Arc<AtomicBool>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            CheckpointError::storage(format!(
                "Failed to create storage root {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self {
            root: Arc::new(root),
            lock: Arc::new(RwLock::new(())),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CheckpointError::Closed("filesystem store is closed".to_string()));
        }
        Ok(())
    }

    /// Resolve the file backing `key`, rejecting segments that would escape the root
    fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        key_to_path(&self.root, key)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || f(&root)).await?
    }
}

fn key_to_path(root: &Path, key: &str) -> Result<PathBuf> {
    if key.is_empty() {
        return Err(CheckpointError::validation("storage key must not be empty"));
    }

    let mut path = root.to_path_buf();
    let mut segments = key.split(KEY_SEPARATOR).peekable();
    while let Some(segment) = segments.next() {
        if !is_safe_segment(segment) {
            return Err(CheckpointError::validation(format!(
                "storage key {key:?} contains an unsafe segment {segment:?}"
            )));
        }
        if segments.peek().is_some() {
            path.push(segment);
        } else {
            path.push(format!("{segment}.{FILE_EXTENSION}"));
        }
    }
    Ok(path)
}

fn is_safe_segment(segment: &str) -> bool {
    if segment.is_empty() || segment.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Inverse of [`key_to_path`]; `None` for files the store did not write
fn path_to_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let file_name = relative.file_name()?.to_str()?;
    let stem = file_name.strip_suffix(&format!(".{FILE_EXTENSION}"))?;

    let mut segments: Vec<&str> = relative
        .parent()?
        .components()
        .map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect::<Option<_>>()?;
    segments.push(stem);
    Some(segments.join(&KEY_SEPARATOR.to_string()))
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CheckpointError::storage(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent).map_err(|e| {
        CheckpointError::storage(format!(
            "Failed to create directory {}: {e}",
            parent.display()
        ))
    })?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| {
        CheckpointError::storage(format!("Failed to persist {}: {}", path.display(), e.error))
    })?;
    Ok(())
}

/// Remove empty directories from `dir` upwards, stopping at `root`
fn prune_empty_dirs(root: &Path, dir: Option<&Path>) {
    let mut current = dir;
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        match fs::remove_dir(dir) {
            Ok(()) => current = dir.parent(),
            // Not empty, or already gone
            Err(_) => break,
        }
    }
}

fn collect_files(dir: &Path, out: &mut Vec<(PathBuf, u64)>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push((entry.path(), entry.metadata()?.len()));
        }
    }
    Ok(())
}

fn stored_entries(root: &Path) -> Result<Vec<(String, u64)>> {
    let mut files = Vec::new();
    collect_files(root, &mut files)?;
    Ok(files
        .into_iter()
        .filter_map(|(path, len)| path_to_key(root, &path).map(|key| (key, len)))
        .collect())
}

#[async_trait]
impl StateStore for FileStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let path = self.resolve_path(key)?;
        let data = value.to_vec();

        let _guard = self.lock.write().await;
        self.blocking(move |_| write_atomic(&path, &data)).await?;
        debug!(key, bytes = value.len(), "Wrote file");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let path = self.resolve_path(key)?;
        let key = key.to_string();

        let _guard = self.lock.read().await;
        self.blocking(move |_| match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CheckpointError::not_found(key)),
            Err(e) => Err(CheckpointError::storage(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let path = self.resolve_path(key)?;
        let key = key.to_string();

        let _guard = self.lock.write().await;
        self.blocking(move |root| {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(CheckpointError::not_found(key))
                }
                Err(e) => {
                    return Err(CheckpointError::storage(format!(
                        "Failed to delete {}: {e}",
                        path.display()
                    )))
                }
            }
            prune_empty_dirs(root, path.parent());
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let prefix = prefix.to_string();

        let _guard = self.lock.read().await;
        self.blocking(move |root| {
            let mut keys: Vec<String> = stored_entries(root)?
                .into_iter()
                .map(|(key, _)| key)
                .filter(|key| key.starts_with(&prefix))
                .collect();
            keys.sort();
            Ok(keys)
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let path = self.resolve_path(key)?;

        let _guard = self.lock.read().await;
        self.blocking(move |_| Ok(path.is_file())).await
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(root = %self.root.display(), "Closed filesystem store");
        }
        Ok(())
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            batch: false,
            stats: true,
            ttl: false,
        }
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.ensure_open()?;
        let _guard = self.lock.read().await;
        let entries = self.blocking(stored_entries).await?;

        let mut details = std::collections::BTreeMap::new();
        details.insert("root".to_string(), self.root.display().to_string());
        Ok(StoreStats {
            backend: self.backend_name().to_string(),
            count: entries.len() as u64,
            total_size: entries.iter().map(|(_, len)| len).sum(),
            details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path()).unwrap();
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_file_store_contract() {
        let (_d1, s1) = store();
        contract::exercise_basic_operations(&s1).await;
        let (_d2, s2) = store();
        contract::exercise_not_found(&s2).await;
        let (_d3, s3) = store();
        contract::exercise_prefix_listing(&s3).await;
        let (_d4, s4) = store();
        contract::exercise_empty_value(&s4).await;
        let (_d5, s5) = store();
        contract::exercise_stats(&s5).await;
    }

    #[tokio::test]
    async fn test_key_layout_on_disk() {
        let (dir, store) = store();
        store.put("checkpoint:w1:abc", b"data").await.unwrap();

        let expected = dir.path().join("checkpoint").join("w1").join("abc.ckpt");
        assert_eq!(fs::read(expected).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_delete_prunes_empty_directories() {
        let (dir, store) = store();
        store.put("checkpoint:w1:a", b"1").await.unwrap();
        store.put("checkpoint:w2:b", b"2").await.unwrap();

        store.delete("checkpoint:w1:a").await.unwrap();
        assert!(!dir.path().join("checkpoint").join("w1").exists());
        assert!(dir.path().join("checkpoint").join("w2").exists());

        store.delete("checkpoint:w2:b").await.unwrap();
        assert!(!dir.path().join("checkpoint").exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_list_ignores_foreign_and_temp_files() {
        let (dir, store) = store();
        store.put("checkpoint:w1:a", b"1").await.unwrap();
        fs::write(dir.path().join("checkpoint").join("w1").join(".tmpXYZ"), b"partial").unwrap();
        fs::write(dir.path().join("README"), b"not a key").unwrap();

        assert_eq!(
            store.list("").await.unwrap(),
            vec!["checkpoint:w1:a".to_string()]
        );
    }

    #[tokio::test]
    async fn test_overwrite_is_atomic_replacement() {
        let (dir, store) = store();
        store.put("checkpoint:w1:a", &vec![1u8; 4096]).await.unwrap();
        store.put("checkpoint:w1:a", b"short").await.unwrap();

        assert_eq!(store.get("checkpoint:w1:a").await.unwrap(), b"short");
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("checkpoint").join("w1"))
            .unwrap()
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_unsafe_keys_rejected() {
        let (_dir, store) = store();
        for key in ["", "checkpoint:..:a", "checkpoint:w1:", "a/b:c", "checkpoint::x"] {
            let err = store.put(key, b"x").await.unwrap_err();
            assert!(matches!(err, CheckpointError::Validation(_)), "key {key:?}");
        }
    }

    #[tokio::test]
    async fn test_batch_is_unsupported() {
        let (_dir, store) = store();
        assert!(!store.capabilities().batch);
        let err = store.batch_put(&[("k".into(), vec![1])]).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_reopen_sees_existing_data() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FileStore::new(temp_dir.path()).unwrap();
            store.put("workflow:w1:latest", b"{}").await.unwrap();
            store.close().await.unwrap();
        }
        let store = FileStore::new(temp_dir.path()).unwrap();
        assert!(store.exists("workflow:w1:latest").await.unwrap());
    }

    #[test]
    fn test_path_key_roundtrip() {
        let root = Path::new("/data");
        let path = key_to_path(root, "workflow:w1:latest").unwrap();
        assert_eq!(path, PathBuf::from("/data/workflow/w1/latest.ckpt"));
        assert_eq!(path_to_key(root, &path).as_deref(), Some("workflow:w1:latest"));
    }
}
