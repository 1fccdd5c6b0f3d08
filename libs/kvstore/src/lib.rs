//! The per-cluster embedded key/value store (C2 in the runtime design).
//!
//! One [`KvStore`] is opened under `<state_dir>/<cluster_id>/` and owns a set
//! of named buckets (sled trees). Values are JSON-encoded. Opening retries a
//! fixed number of times with linear backoff so a cluster directory that is
//! momentarily locked by a previous process's slow shutdown doesn't fail the
//! whole registry `Get`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

const OPEN_ATTEMPTS: usize = 5;
const OPEN_BACKOFF_UNIT: Duration = Duration::from_millis(200);
const STORE_FILE_NAME: &str = "guildnet.sqlite";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sled::Error,
    },
    #[error("store is closed")]
    Closed,
    #[error("bucket {0:?} is not open; call ensure_buckets first")]
    UnknownBucket(String),
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A per-cluster embedded store. Cheap to clone: all state lives behind an
/// `Arc` inside `sled::Db` plus one `Mutex` guarding the open/closed flag.
#[derive(Clone)]
pub struct KvStore {
    inner: std::sync::Arc<Mutex<Option<sled::Db>>>,
    path: PathBuf,
}

impl KvStore {
    /// Open (creating if absent) the store directory
    /// `<state_dir>/<cluster_id>/guildnet.sqlite`, retrying up to
    /// [`OPEN_ATTEMPTS`] times with `200ms * attempt` backoff.
    pub async fn open(state_dir: &Path, cluster_id: &str) -> Result<Self> {
        let dir = state_dir.join(cluster_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Open {
                path: dir.clone(),
                source: sled::Error::Io(e),
            })?;
        let path = dir.join(STORE_FILE_NAME);

        let db = {
            let path_for_retry = path.clone();
            let attempt = std::sync::atomic::AtomicUsize::new(0);
            (move || {
                let path = path_for_retry.clone();
                let n = attempt.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n > 0 {
                        tokio::time::sleep(OPEN_BACKOFF_UNIT * n as u32).await;
                    }
                    tokio::task::spawn_blocking(move || sled::open(&path))
                        .await
                        .expect("sled::open task panicked")
                }
            })
            .retry(ConstantBuilder::default().with_max_times(OPEN_ATTEMPTS))
            .await
            .map_err(|source| Error::Open {
                path: path.clone(),
                source,
            })?
        };

        tracing::debug!(msg = "opened cluster kv store", cluster_id, path = %path.display());
        Ok(Self {
            inner: std::sync::Arc::new(Mutex::new(Some(db))),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create (idempotently) the named buckets.
    pub async fn ensure_buckets(&self, names: &[&str]) -> Result<()> {
        let guard = self.inner.lock().await;
        let db = guard.as_ref().ok_or(Error::Closed)?;
        for name in names {
            db.open_tree(name)?;
        }
        Ok(())
    }

    pub async fn put<T: Serialize>(&self, bucket: &str, key: &str, value: &T) -> Result<()> {
        let guard = self.inner.lock().await;
        let db = guard.as_ref().ok_or(Error::Closed)?;
        let tree = db
            .open_tree(bucket)
            .map_err(|_| Error::UnknownBucket(bucket.to_string()))?;
        let bytes = serde_json::to_vec(value)?;
        tree.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Result<Option<T>> {
        let guard = self.inner.lock().await;
        let db = guard.as_ref().ok_or(Error::Closed)?;
        let tree = db
            .open_tree(bucket)
            .map_err(|_| Error::UnknownBucket(bucket.to_string()))?;
        match tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let guard = self.inner.lock().await;
        let db = guard.as_ref().ok_or(Error::Closed)?;
        let tree = db
            .open_tree(bucket)
            .map_err(|_| Error::UnknownBucket(bucket.to_string()))?;
        tree.remove(key.as_bytes())?;
        Ok(())
    }

    /// Idempotent: calling `close` on an already-closed store is a no-op.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(db) = guard.take() {
            let _ = db.flush_async().await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Widget {
        count: u32,
    }

    #[tokio::test]
    async fn open_ensure_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path(), "c-1").await.unwrap();
        store.ensure_buckets(&["settings"]).await.unwrap();
        store
            .put("settings", "k", &Widget { count: 7 })
            .await
            .unwrap();
        let got: Option<Widget> = store.get("settings", "k").await.unwrap();
        assert_eq!(got, Some(Widget { count: 7 }));
        assert!(dir.path().join("c-1").join(STORE_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_further_io() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path(), "c-1").await.unwrap();
        store.close().await;
        store.close().await;
        assert!(store.is_closed().await);
        let err = store.put("settings", "k", &1u32).await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path(), "c-1").await.unwrap();
        store.ensure_buckets(&["settings"]).await.unwrap();
        store.put("settings", "k", &1u32).await.unwrap();
        store.delete("settings", "k").await.unwrap();
        let got: Option<u32> = store.get("settings", "k").await.unwrap();
        assert_eq!(got, None);
    }
}
