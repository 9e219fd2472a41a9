use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::Mutex;

use super::error::StorageError;
use super::gateway::{BoxFuture, StorageGateway};

/// In-memory [`StorageGateway`], used by tests and by callers that do not
/// need persistence across process restarts.
#[derive(Default)]
pub struct InMemoryStorageGateway {
    data: Mutex<HashMap<String, Value>>,
}

impl InMemoryStorageGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageGateway for InMemoryStorageGateway {
    fn load(&self, key: &str) -> BoxFuture<'_, Result<Option<Value>, StorageError>> {
        let key = key.to_string();
        Box::pin(async move {
            let data = self.data.lock().await;
            Ok(data.get(&key).cloned())
        })
    }

    fn save(&self, key: &str, value: Value) -> BoxFuture<'_, Result<(), StorageError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut data = self.data.lock().await;
            data.insert(key, value);
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), StorageError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut data = self.data.lock().await;
            data.remove(&key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::gateway::StorageGatewayExt;

    #[tokio::test]
    async fn missing_key_loads_as_none() {
        let gw = InMemoryStorageGateway::new();
        assert_eq!(gw.load("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn load_or_falls_back_to_default() {
        let gw = InMemoryStorageGateway::new();
        let value = gw.load_or("nope", serde_json::json!([])).await.unwrap();
        assert_eq!(value, serde_json::json!([]));
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let gw = InMemoryStorageGateway::new();
        gw.save("flows", serde_json::json!({"a": 1})).await.unwrap();
        assert_eq!(gw.load("flows").await.unwrap(), Some(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn delete_removes_the_key() {
        let gw = InMemoryStorageGateway::new();
        gw.save("k", serde_json::json!(1)).await.unwrap();
        gw.delete("k").await.unwrap();
        assert_eq!(gw.load("k").await.unwrap(), None);
    }
}
