mod error;
mod resolver;
mod store;

pub use error::SecretError;
pub use resolver::{SecretResolver, DEFAULT_MAX_RESOLUTION_DEPTH};
pub use store::{NullSecretStore, SecretStore, StaticSecretStore};
