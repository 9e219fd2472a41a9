use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::storage::{keys, StorageGateway, StorageGatewayExt};

use super::store::SecretStore;

pub const DEFAULT_MAX_RESOLUTION_DEPTH: usize = 10;

const GLOBAL_PREFIX: &str = "${global:";
const GLOBAL_SUFFIX: &str = "}";
const ENCRYPTED_PREFIX: &str = "encrypted:";
const ENCRYPTED_FAILED_PREFIX: &str = "encrypted_failed:";

/// Resolves `${global:NAME}` references and unwraps `encrypted:`-prefixed
/// values at point of use, per `spec.md` §4.2. Idempotent up to
/// [`DEFAULT_MAX_RESOLUTION_DEPTH`] nested reference-then-decrypt cycles;
/// beyond that it returns the partially-resolved value and logs a warning.
pub struct SecretResolver {
    store: Arc<dyn SecretStore>,
    storage: Arc<dyn StorageGateway>,
    max_depth: usize,
}

impl SecretResolver {
    pub fn new(store: Arc<dyn SecretStore>, storage: Arc<dyn StorageGateway>) -> Self {
        Self {
            store,
            storage,
            max_depth: DEFAULT_MAX_RESOLUTION_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Recursively walk `value` (string / array / object), substituting
    /// every `${global:NAME}` occurrence and decrypting `encrypted:`-prefixed
    /// strings.
    pub async fn resolve(&self, value: Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve_string(s).await),
            Value::Array(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(Box::pin(self.resolve(item)).await);
                }
                Value::Array(resolved)
            }
            Value::Object(map) => {
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    resolved.insert(k, Box::pin(self.resolve(v)).await);
                }
                Value::Object(resolved)
            }
            other => other,
        }
    }

    /// A single string, resolved in isolation. Exposed for the Prompt
    /// Renderer and Model Invoker, which resolve individual fields (an API
    /// key, a tool argument) rather than a whole structured value.
    pub async fn resolve_string(&self, mut s: String) -> String {
        for depth in 0..self.max_depth {
            if s.starts_with(ENCRYPTED_FAILED_PREFIX) {
                // Already flagged as unresolvable; leave it alone.
                return s;
            }

            if let Some(ciphertext) = s.strip_prefix(ENCRYPTED_PREFIX) {
                match self.store.decrypt(ciphertext).await {
                    Ok(plaintext) => {
                        if plaintext == s {
                            return s;
                        }
                        s = plaintext;
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to decrypt secret, flagging as encrypted_failed");
                        return format!("{ENCRYPTED_FAILED_PREFIX}{ciphertext}");
                    }
                }
            }

            if s.contains(GLOBAL_PREFIX) {
                let substituted = self.substitute_global_refs(&s).await;
                if substituted == s {
                    return s;
                }
                s = substituted;
                continue;
            }

            // No encrypted prefix, no global reference: already resolved.
            if depth == 0 {
                return s;
            }
            return s;
        }

        warn!(
            max_depth = self.max_depth,
            "secret resolution exceeded max depth; returning partially-resolved value"
        );
        s
    }

    async fn substitute_global_refs(&self, input: &str) -> String {
        let globals = self
            .storage
            .load_or(keys::GLOBAL_ENV_VARS, serde_json::json!({}))
            .await
            .unwrap_or_else(|_| serde_json::json!({}));

        let mut output = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find(GLOBAL_PREFIX) {
            output.push_str(&rest[..start]);
            let after_prefix = &rest[start + GLOBAL_PREFIX.len()..];
            match after_prefix.find(GLOBAL_SUFFIX) {
                Some(end) => {
                    let name = &after_prefix[..end];
                    let replacement = globals
                        .get(name)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("{GLOBAL_PREFIX}{name}{GLOBAL_SUFFIX}"));
                    output.push_str(&replacement);
                    rest = &after_prefix[end + GLOBAL_SUFFIX.len()..];
                }
                None => {
                    // Unterminated pill; emit the rest verbatim and stop.
                    output.push_str(&rest[start..]);
                    rest = "";
                    break;
                }
            }
        }
        output.push_str(rest);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorageGateway;

    #[tokio::test]
    async fn already_resolved_values_are_unchanged() {
        let storage = Arc::new(InMemoryStorageGateway::new());
        let resolver = SecretResolver::new(Arc::new(super::super::store::NullSecretStore), storage);
        let out = resolver.resolve(Value::String("plain value".into())).await;
        assert_eq!(out, Value::String("plain value".into()));
    }

    #[tokio::test]
    async fn global_reference_is_substituted() {
        let storage = Arc::new(InMemoryStorageGateway::new());
        storage
            .save(keys::GLOBAL_ENV_VARS, serde_json::json!({"API_HOST": "api.example.com"}))
            .await
            .unwrap();
        let resolver = SecretResolver::new(
            Arc::new(super::super::store::NullSecretStore),
            storage,
        );
        let out = resolver
            .resolve(Value::String("https://${global:API_HOST}/v1".into()))
            .await;
        assert_eq!(out, Value::String("https://api.example.com/v1".into()));
    }

    #[tokio::test]
    async fn unknown_global_reference_is_left_untouched() {
        let storage = Arc::new(InMemoryStorageGateway::new());
        let resolver = SecretResolver::new(
            Arc::new(super::super::store::NullSecretStore),
            storage,
        );
        let out = resolver.resolve_string("${global:MISSING}".into()).await;
        assert_eq!(out, "${global:MISSING}");
    }

    #[tokio::test]
    async fn encrypted_value_is_decrypted_via_the_store() {
        let storage = Arc::new(InMemoryStorageGateway::new());
        let store = super::super::store::StaticSecretStore::new().with_entry("abc123", "sk-real-key");
        let resolver = SecretResolver::new(Arc::new(store), storage);
        let out = resolver.resolve_string("encrypted:abc123".into()).await;
        assert_eq!(out, "sk-real-key");
    }

    #[tokio::test]
    async fn failed_decryption_is_flagged_not_dropped() {
        let storage = Arc::new(InMemoryStorageGateway::new());
        let store = super::super::store::StaticSecretStore::new();
        let resolver = SecretResolver::new(Arc::new(store), storage);
        let out = resolver.resolve_string("encrypted:unknown".into()).await;
        assert_eq!(out, "encrypted_failed:unknown");
    }

    #[tokio::test]
    async fn already_flagged_values_are_left_alone() {
        let storage = Arc::new(InMemoryStorageGateway::new());
        let resolver = SecretResolver::new(Arc::new(super::super::store::NullSecretStore), storage);
        let out = resolver.resolve_string("encrypted_failed:abc".into()).await;
        assert_eq!(out, "encrypted_failed:abc");
    }

    #[tokio::test]
    async fn nested_reference_then_decrypt_resolves_within_depth() {
        let storage = Arc::new(InMemoryStorageGateway::new());
        storage
            .save(keys::GLOBAL_ENV_VARS, serde_json::json!({"KEY_REF": "encrypted:xyz"}))
            .await
            .unwrap();
        let store = super::super::store::StaticSecretStore::new().with_entry("xyz", "final-secret");
        let resolver = SecretResolver::new(Arc::new(store), storage);
        let out = resolver.resolve_string("${global:KEY_REF}".into()).await;
        assert_eq!(out, "final-secret");
    }
}
