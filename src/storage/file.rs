use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use super::error::StorageError;
use super::gateway::{BoxFuture, StorageGateway};

/// One JSON file per key under `root`, matching the teacher's
/// `Agent::save_history` (`serde_json::to_string_pretty` + `fs::write`)
/// but async and keyed, with a per-key lock so concurrent writes to the
/// *same* key serialize while writes to distinct keys proceed freely, per
/// `spec.md` §5.
pub struct FileStorageGateway {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStorageGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys may contain '/', e.g. "conversations/<id>" — preserve that as
        // a subdirectory rather than flattening it, mirroring the flat
        // keyspace's own naming convention.
        let mut path = self.root.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        path.set_extension("json");
        path
    }
}

impl StorageGateway for FileStorageGateway {
    fn load(&self, key: &str) -> BoxFuture<'_, Result<Option<Value>, StorageError>> {
        let key = key.to_string();
        Box::pin(async move {
            let lock = self.lock_for(&key).await;
            let _guard = lock.lock().await;
            let path = self.path_for(&key);
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn save(&self, key: &str, value: Value) -> BoxFuture<'_, Result<(), StorageError>> {
        let key = key.to_string();
        Box::pin(async move {
            let lock = self.lock_for(&key).await;
            let _guard = lock.lock().await;
            let path = self.path_for(&key);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let pretty = serde_json::to_string_pretty(&value)?;
            tokio::fs::write(&path, pretty).await?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), StorageError>> {
        let key = key.to_string();
        Box::pin(async move {
            let lock = self.lock_for(&key).await;
            let _guard = lock.lock().await;
            let path = self.path_for(&key);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}

pub fn default_root() -> PathBuf {
    Path::new(".flujo").to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_round_trips_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let gw = FileStorageGateway::new(dir.path());
        gw.save("models", serde_json::json!([{"id": "m1"}])).await.unwrap();
        let loaded = gw.load("models").await.unwrap();
        assert_eq!(loaded, Some(serde_json::json!([{"id": "m1"}])));
    }

    #[tokio::test]
    async fn nested_keys_become_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let gw = FileStorageGateway::new(dir.path());
        gw.save("conversations/c1", serde_json::json!({"id": "c1"}))
            .await
            .unwrap();
        assert!(dir.path().join("conversations").join("c1.json").exists());
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let gw = FileStorageGateway::new(dir.path());
        assert_eq!(gw.load("conversations/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let gw = FileStorageGateway::new(dir.path());
        gw.delete("never-saved").await.unwrap();
    }
}
