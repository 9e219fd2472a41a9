use std::collections::HashMap;

use crate::storage::BoxFuture;

use super::error::SecretError;

/// The persistent secret store and password-based key-derivation layer are
/// out of scope for this crate (`spec.md` §1); this trait is the boundary
/// the [`super::SecretResolver`] consumes to unwrap `encrypted:`-prefixed
/// values.
pub trait SecretStore: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> BoxFuture<'_, Result<String, SecretError>>;
}

/// A store that fails every decryption; useful as a default when no real
/// secret store has been wired up, so a misconfigured deployment fails
/// loudly rather than silently leaking ciphertext.
pub struct NullSecretStore;

impl SecretStore for NullSecretStore {
    fn decrypt(&self, _ciphertext: &str) -> BoxFuture<'_, Result<String, SecretError>> {
        Box::pin(async { Err(SecretError::StoreUnavailable) })
    }
}

/// Test double backed by a plain map from ciphertext to plaintext.
#[derive(Default)]
pub struct StaticSecretStore {
    entries: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, ciphertext: impl Into<String>, plaintext: impl Into<String>) -> Self {
        self.entries.insert(ciphertext.into(), plaintext.into());
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn decrypt(&self, ciphertext: &str) -> BoxFuture<'_, Result<String, SecretError>> {
        let ciphertext = ciphertext.to_string();
        Box::pin(async move {
            self.entries
                .get(&ciphertext)
                .cloned()
                .ok_or_else(|| SecretError::DecryptionFailed(format!("no entry for {ciphertext}")))
        })
    }
}
