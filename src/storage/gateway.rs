use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use super::error::StorageError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Narrow abstract key/value persistence, per `spec.md` §4.1.
///
/// Keyspace is flat; keys are stable strings (`flows`, `models`,
/// `mcp_servers`, `conversations/<id>`, `global_env_vars`). The gateway is
/// not transactional across keys — components must tolerate a crash
/// between two related writes.
pub trait StorageGateway: Send + Sync {
    fn load(&self, key: &str) -> BoxFuture<'_, Result<Option<Value>, StorageError>>;
    fn save(&self, key: &str, value: Value) -> BoxFuture<'_, Result<(), StorageError>>;
    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), StorageError>>;
}

/// Convenience extension implementing the "not found → default" read
/// semantics described in `spec.md` §4.1.
pub trait StorageGatewayExt: StorageGateway {
    fn load_or<'a>(&'a self, key: &'a str, default: Value) -> BoxFuture<'a, Result<Value, StorageError>> {
        Box::pin(async move { Ok(self.load(key).await?.unwrap_or(default)) })
    }
}

impl<T: StorageGateway + ?Sized> StorageGatewayExt for T {}
