mod error;
mod file;
mod gateway;
mod memory;

pub use error::StorageError;
pub use file::{default_root, FileStorageGateway};
pub use gateway::{BoxFuture, StorageGateway, StorageGatewayExt};
pub use memory::InMemoryStorageGateway;

/// Well-known flat storage keys, per `spec.md` §4.1.
pub mod keys {
    pub const FLOWS: &str = "flows";
    pub const MODELS: &str = "models";
    pub const MCP_SERVERS: &str = "mcp_servers";
    pub const GLOBAL_ENV_VARS: &str = "global_env_vars";
    pub const ENCRYPTION_METADATA: &str = "encryption_metadata";

    pub fn conversation(id: &str) -> String {
        format!("conversations/{id}")
    }
}
