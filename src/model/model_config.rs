use serde::{Deserialize, Serialize};

/// How a model's reasoning output is tagged in its raw text reply, e.g.
/// `<think>...</think>`. `None` means the model does not emit one.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ReasoningTagSchema {
    pub open_tag: String,
    pub close_tag: String,
}

/// How a model expresses function/tool calls when it cannot use the
/// provider's structured `tools` field (the "tools not supported" fallback
/// in `spec.md` §4.5, and the tool-pill rendering format in §4.3).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FunctionCallingSchema {
    Json,
    Xml,
    #[default]
    None,
}

/// A configured LLM endpoint, provider-neutral per `spec.md` §3.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ModelConfig {
    pub id: String,
    pub display_name: String,
    pub endpoint_url: String,
    /// May be a literal secret, `${global:NAME}`, or `encrypted:...` —
    /// resolved lazily by [`crate::secrets::SecretResolver`] at use-time.
    pub api_key_ref: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub prompt_template: String,
    #[serde(default)]
    pub reasoning_tag_schema: Option<ReasoningTagSchema>,
    #[serde(default)]
    pub function_calling_schema: FunctionCallingSchema,
}

/// In-memory catalog of [`ModelConfig`]s, keyed by id. The real catalog is
/// backed by the Storage Gateway's `models` key; this is the shape the
/// Flow Executor and Prompt Renderer consume.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: std::collections::HashMap<String, ModelConfig>,
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelConfig>) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ModelConfig> {
        self.models.get(id)
    }
}
