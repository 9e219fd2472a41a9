use std::sync::Arc;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, error, instrument, trace};

use crate::model::{FunctionCallingSchema, Message, ModelConfig, ToolCall};
use crate::secrets::SecretResolver;
use crate::storage::{keys, StorageGateway};
use crate::xml_escape;

use super::error::{InvokerError, InvokerErrorDetails};
use super::wire::{ChatCompletionRequest, ChatCompletionResponse, ToolSchema, WireMessage};

const TOOLS_NOT_SUPPORTED_MARKER: &str = "does not support tools";

#[derive(Debug, Clone)]
pub enum InvocationOutcome {
    Success {
        content: Option<String>,
        tool_calls: Option<Vec<ToolCall>>,
        /// Set when this response came back from the tools-not-supported
        /// fallback retry (tool descriptions folded into the prompt, no
        /// native `tools` field sent) — the only case where a model that
        /// wants to call a tool would have to say so as plain text instead
        /// of a structured `tool_calls` entry.
        retried_without_tools: bool,
        raw: Value,
    },
    Failure {
        error: String,
        details: InvokerErrorDetails,
    },
}

/// A single OpenAI-compatible chat-completion client, grounded on
/// `OllamaClient::post`'s read-text-then-parse discipline.
pub struct ModelInvoker {
    http: Client,
    storage: Arc<dyn StorageGateway>,
    secrets: Arc<SecretResolver>,
}

impl ModelInvoker {
    pub fn new(storage: Arc<dyn StorageGateway>, secrets: Arc<SecretResolver>) -> Self {
        Self {
            http: Client::new(),
            storage,
            secrets,
        }
    }

    #[instrument(name = "model_invoker.generate_completion", skip(self, history, tools), fields(model_id))]
    pub async fn generate_completion(
        &self,
        model_id: &str,
        system_prompt: &str,
        history: &[Message],
        tools: Option<&[ToolSchema]>,
    ) -> InvocationOutcome {
        let model = match self.load_model(model_id).await {
            Ok(Some(m)) => m,
            Ok(None) => {
                return InvocationOutcome::Failure {
                    error: format!("no model configured with id {model_id}"),
                    details: InvokerErrorDetails::new("ConfigError", "config", format!(
                        "no model configured with id {model_id}"
                    )),
                }
            }
            Err(e) => {
                return InvocationOutcome::Failure {
                    error: e.to_string(),
                    details: InvokerErrorDetails::new("ConfigError", "config", e.to_string()),
                }
            }
        };

        let api_key = self.secrets.resolve_string(model.api_key_ref.clone()).await;
        if api_key.is_empty() {
            return InvocationOutcome::Failure {
                error: "model has no api key configured".to_string(),
                details: InvokerErrorDetails::new("ApiKeyError", "api_key", "model has no api key configured"),
            };
        }

        let base_url = normalize_base_url(&model.endpoint_url);

        let tools_owned = tools.map(|t| t.to_vec());
        let result = self
            .call_once(&base_url, &api_key, &model, system_prompt, history, tools_owned.as_deref(), false)
            .await;

        match result {
            Ok(outcome) => outcome,
            Err((status, body)) if status == 400 && body.contains(TOOLS_NOT_SUPPORTED_MARKER) && tools_owned.is_some() => {
                debug!(model_id, "provider rejected tools; retrying with tool descriptions folded into the prompt");
                let augmented_prompt = fold_tools_into_prompt(system_prompt, tools_owned.as_deref().unwrap_or(&[]), model.function_calling_schema);
                match self.call_once(&base_url, &api_key, &model, &augmented_prompt, history, None, true).await {
                    Ok(outcome) => outcome,
                    Err((status, body)) => api_failure(status, body),
                }
            }
            Err((status, body)) => api_failure(status, body),
        }
    }

    async fn load_model(&self, model_id: &str) -> Result<Option<ModelConfig>, InvokerError> {
        let value = self
            .storage
            .load(keys::MODELS)
            .await
            .map_err(|e| InvokerError::Config(e.to_string()))?
            .unwrap_or_else(|| Value::Array(vec![]));
        let models: Vec<ModelConfig> = serde_json::from_value(value)
            .map_err(|e| InvokerError::Serialization(e.to_string()))?;
        Ok(models.into_iter().find(|m| m.id == model_id))
    }

    /// Issue one POST; on a non-success status return `Err((status, body))`
    /// so the caller can decide whether it matches the tools-not-supported
    /// fallback without us having already consumed the body into an error.
    async fn call_once(
        &self,
        base_url: &str,
        api_key: &str,
        model: &ModelConfig,
        system_prompt: &str,
        history: &[Message],
        tools: Option<&[ToolSchema]>,
        retried_without_tools: bool,
    ) -> Result<InvocationOutcome, (u16, String)> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(WireMessage {
            role: "system",
            content: Some(system_prompt.to_string()),
            tool_calls: None,
            tool_call_id: None,
        });
        messages.extend(history.iter().map(WireMessage::from));

        let request = ChatCompletionRequest {
            model: model.id.clone(),
            messages,
            tools: tools.map(|t| t.to_vec()),
            temperature: model.temperature,
        };

        let url = format!("{base_url}/chat/completions");
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| (0, e.to_string()))?;

        let status = response.status();
        let body_text = response
            .text()
            .await
            .unwrap_or_else(|_| "failed to read response body".to_string());

        if !status.is_success() {
            return Err((status.as_u16(), body_text));
        }

        let parsed: ChatCompletionResponse = match serde_json::from_str(&body_text) {
            Ok(p) => p,
            Err(e) => {
                error!(%e, raw = %body_text, "failed to deserialize chat completion response");
                return Ok(InvocationOutcome::Failure {
                    error: format!("failed to decode response body: {e}"),
                    details: InvokerErrorDetails::new("SerializationError", "serialization", e.to_string())
                        .with_status(status.as_u16()),
                });
            }
        };
        trace!(?parsed, "chat completion response");

        if let Some(api_error) = parsed.error {
            return Ok(InvocationOutcome::Failure {
                error: api_error.message.clone(),
                details: InvokerErrorDetails {
                    message: api_error.message,
                    kind: api_error.kind.unwrap_or_else(|| "api_error".to_string()),
                    code: api_error.code,
                    param: api_error.param,
                    status: Some(status.as_u16()),
                    name: "ApiError".to_string(),
                },
            });
        }

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Ok(InvocationOutcome::Failure {
                error: "provider returned no choices".to_string(),
                details: InvokerErrorDetails::new("EmptyChoicesError", "api", "provider returned no choices")
                    .with_status(status.as_u16()),
            });
        };

        Ok(InvocationOutcome::Success {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls,
            retried_without_tools,
            raw: serde_json::to_value(&request).unwrap_or(Value::Null),
        })
    }
}

fn api_failure(status: u16, body: String) -> InvocationOutcome {
    InvocationOutcome::Failure {
        error: format!("request failed with status {status}: {body}"),
        details: InvokerErrorDetails::new("ApiError", "api", body).with_status(status),
    }
}

fn normalize_base_url(endpoint_url: &str) -> String {
    endpoint_url
        .strip_suffix("/chat/completions")
        .unwrap_or(endpoint_url)
        .trim_end_matches('/')
        .to_string()
}

/// Builds the tool-description block folded into the system prompt when a
/// provider rejects the structured `tools` field, per `spec.md` §4.5.
fn fold_tools_into_prompt(system_prompt: &str, tools: &[ToolSchema], schema: FunctionCallingSchema) -> String {
    if tools.is_empty() {
        return system_prompt.to_string();
    }
    let mut block = String::from("\n\nYou have access to the following tools:\n");
    for tool in tools {
        block.push_str(&describe_tool(tool, schema));
        block.push('\n');
    }
    format!("{system_prompt}{block}")
}

fn describe_tool(tool: &ToolSchema, schema: FunctionCallingSchema) -> String {
    match schema {
        FunctionCallingSchema::Json => serde_json::to_string_pretty(&serde_json::json!({
            "name": tool.function.name,
            "description": tool.function.description,
            "parameters": tool.function.parameters,
        }))
        .unwrap_or_default(),
        FunctionCallingSchema::Xml => format!(
            "<tool>\n  <name>{}</name>\n  <description>{}</description>\n  <parameters>{}</parameters>\n</tool>",
            xml_escape::escape(&tool.function.name),
            xml_escape::escape(&tool.function.description),
            xml_escape::escape(&tool.function.parameters.to_string()),
        ),
        FunctionCallingSchema::None => format!(
            "- {}: {} (parameters: {})",
            tool.function.name, tool.function.description, tool.function.parameters
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_chat_completions_segment() {
        assert_eq!(normalize_base_url("https://api.openai.com/v1/chat/completions"), "https://api.openai.com/v1");
        assert_eq!(normalize_base_url("https://api.openai.com/v1"), "https://api.openai.com/v1");
        assert_eq!(normalize_base_url("https://api.openai.com/v1/"), "https://api.openai.com/v1");
    }

    #[test]
    fn folding_with_no_tools_leaves_prompt_untouched() {
        let out = fold_tools_into_prompt("base", &[], FunctionCallingSchema::None);
        assert_eq!(out, "base");
    }

    #[test]
    fn folding_appends_tool_block() {
        let tools = vec![ToolSchema::new("search", "search the web", serde_json::json!({"type": "object"}))];
        let out = fold_tools_into_prompt("base", &tools, FunctionCallingSchema::None);
        assert!(out.contains("base"));
        assert!(out.contains("search the web"));
    }
}
