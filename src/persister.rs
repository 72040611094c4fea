//! Content-addressed configuration storage.
//!
//! Blobs are stored under the SHA-256 of their bytes, so persisting the same
//! bytes twice leaves a single history entry. Change notification is a
//! single-permit [`Notify`]: any number of persists between two waits wake
//! the consumer exactly once, and the consumer always re-reads the current
//! blob instead of counting wake-ups.

use crate::error::{QuotaError, QuotaResult};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

const CURRENT_FILE: &str = "current";
const INDEX_FILE: &str = "index";
const BLOB_EXTENSION: &str = "json";

/// Hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
pub trait ConfigPersister: Send + Sync {
    /// Stores `blob`, makes it current and signals watchers.
    async fn persist_and_notify(&self, blob: &[u8]) -> QuotaResult<()>;

    /// The current blob, if anything was ever persisted.
    async fn read_persisted_config(&self) -> QuotaResult<Option<Vec<u8>>>;

    /// Every distinct blob, in the order each was first persisted.
    async fn read_historical_configs(&self) -> QuotaResult<Vec<Vec<u8>>>;

    /// Coalesced change signal.
    fn config_changed_watcher(&self) -> Arc<Notify>;
}

#[derive(Default)]
struct MemoryState {
    current: Option<String>,
    blobs: HashMap<String, Vec<u8>>,
    order: Vec<String>,
}

#[derive(Default)]
pub struct MemoryConfigPersister {
    state: Mutex<MemoryState>,
    watcher: Arc<Notify>,
}

impl MemoryConfigPersister {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> QuotaResult<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| QuotaError::Internal("Failed to acquire persister lock".into()))
    }
}

#[async_trait]
impl ConfigPersister for MemoryConfigPersister {
    async fn persist_and_notify(&self, blob: &[u8]) -> QuotaResult<()> {
        let hash = content_hash(blob);
        {
            let mut state = self.state()?;
            if state.blobs.insert(hash.clone(), blob.to_vec()).is_none() {
                state.order.push(hash.clone());
            }
            state.current = Some(hash);
        }

        self.watcher.notify_one();
        Ok(())
    }

    async fn read_persisted_config(&self) -> QuotaResult<Option<Vec<u8>>> {
        let state = self.state()?;
        Ok(state
            .current
            .as_ref()
            .and_then(|hash| state.blobs.get(hash))
            .cloned())
    }

    async fn read_historical_configs(&self) -> QuotaResult<Vec<Vec<u8>>> {
        let state = self.state()?;
        Ok(state
            .order
            .iter()
            .filter_map(|hash| state.blobs.get(hash).cloned())
            .collect())
    }

    fn config_changed_watcher(&self) -> Arc<Notify> {
        Arc::clone(&self.watcher)
    }
}

/// Keeps blobs as `<dir>/<hash>.json`, the current hash in `<dir>/current`
/// and first-seen order in `<dir>/index`.
pub struct FileConfigPersister {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
    watcher: Arc<Notify>,
}

impl FileConfigPersister {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
            watcher: Arc::new(Notify::new()),
        }
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", hash, BLOB_EXTENSION))
    }

    async fn read_index(&self) -> QuotaResult<Vec<String>> {
        match tokio::fs::read_to_string(self.dir.join(INDEX_FILE)).await {
            Ok(index) => Ok(index
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomically(&self, name: &str, contents: &[u8]) -> QuotaResult<()> {
        let tmp = self.dir.join(format!(".{}.tmp", name));
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, self.dir.join(name)).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigPersister for FileConfigPersister {
    async fn persist_and_notify(&self, blob: &[u8]) -> QuotaResult<()> {
        let hash = content_hash(blob);
        {
            let _guard = self.write_lock.lock().await;
            tokio::fs::create_dir_all(&self.dir).await?;

            let blob_name = format!("{}.{}", hash, BLOB_EXTENSION);
            self.write_atomically(&blob_name, blob).await?;

            let mut index = self.read_index().await?;
            if !index.contains(&hash) {
                index.push(hash.clone());
                let mut contents = index.join("\n");
                contents.push('\n');
                self.write_atomically(INDEX_FILE, contents.as_bytes()).await?;
            }

            self.write_atomically(CURRENT_FILE, hash.as_bytes()).await?;
        }

        tracing::debug!(hash = %hash, dir = %self.dir.display(), "Persisted configuration");
        self.watcher.notify_one();
        Ok(())
    }

    async fn read_persisted_config(&self) -> QuotaResult<Option<Vec<u8>>> {
        let hash = match tokio::fs::read_to_string(self.dir.join(CURRENT_FILE)).await {
            Ok(hash) => hash.trim().to_string(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let blob = tokio::fs::read(self.blob_path(&hash)).await?;
        Ok(Some(blob))
    }

    async fn read_historical_configs(&self) -> QuotaResult<Vec<Vec<u8>>> {
        let mut blobs = Vec::new();
        for hash in self.read_index().await? {
            blobs.push(tokio::fs::read(self.blob_path(&hash)).await?);
        }
        Ok(blobs)
    }

    fn config_changed_watcher(&self) -> Arc<Notify> {
        Arc::clone(&self.watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("quotaservice-persister-{}", rand::random::<u64>()))
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(content_hash(b"a"), content_hash(b"b"));
    }

    #[tokio::test]
    async fn test_memory_dedup_and_current() {
        let persister = MemoryConfigPersister::new();
        assert!(persister.read_persisted_config().await.unwrap().is_none());

        persister.persist_and_notify(b"one").await.unwrap();
        persister.persist_and_notify(b"two").await.unwrap();
        persister.persist_and_notify(b"one").await.unwrap();

        assert_eq!(persister.read_persisted_config().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(
            persister.read_historical_configs().await.unwrap(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_notifications_coalesce() {
        let persister = MemoryConfigPersister::new();
        let watcher = persister.config_changed_watcher();

        for i in 0..5u8 {
            persister.persist_and_notify(&[i]).await.unwrap();
        }

        let mut first = task::spawn(watcher.notified());
        assert_ready!(first.poll());

        let mut second = task::spawn(watcher.notified());
        assert_pending!(second.poll());

        persister.persist_and_notify(b"again").await.unwrap();
        assert!(second.is_woken());
        assert_ready!(second.poll());
    }

    #[tokio::test]
    async fn test_file_persister_round_trip() {
        let dir = scratch_dir();
        let persister = FileConfigPersister::new(&dir);
        assert!(persister.read_persisted_config().await.unwrap().is_none());
        assert!(persister.read_historical_configs().await.unwrap().is_empty());

        persister.persist_and_notify(b"{\"v\":1}").await.unwrap();
        persister.persist_and_notify(b"{\"v\":2}").await.unwrap();
        persister.persist_and_notify(b"{\"v\":1}").await.unwrap();

        assert_eq!(
            persister.read_persisted_config().await.unwrap(),
            Some(b"{\"v\":1}".to_vec())
        );
        assert_eq!(persister.read_historical_configs().await.unwrap().len(), 2);

        // A second instance over the same directory sees the same state.
        let reopened = FileConfigPersister::new(&dir);
        assert_eq!(
            reopened.read_persisted_config().await.unwrap(),
            Some(b"{\"v\":1}".to_vec())
        );

        let _ = std::fs::remove_dir_all(&dir);
    }
}
