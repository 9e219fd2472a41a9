use std::sync::Arc;

use flujo_engine::prelude::*;
use flujo_engine::{keys, Edge, FunctionCallingSchema, NodeProperties, NullSecretStore};

/// Minimal end-to-end demo: seeds a single-node flow and model pointed at
/// a local OpenAI-compatible endpoint (e.g. Ollama's `/v1` shim), then
/// runs one user turn to completion. Requires `OPENAI_BASE_URL` and
/// `OPENAI_MODEL` env vars; falls back to `http://localhost:11434/v1` and
/// `llama3.2` otherwise.
#[tokio::main]
async fn main() {
    init_default_tracing();

    let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "http://localhost:11434/v1".to_string());
    let model_id = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "llama3.2".to_string());

    let storage: Arc<dyn StorageGateway> = Arc::new(InMemoryStorageGateway::new());
    let engine = Engine::new(storage.clone(), Arc::new(NullSecretStore));

    let flow = Flow {
        id: "demo".to_string(),
        name: "Demo flow".to_string(),
        nodes: vec![
            Node { id: "start".into(), node_type: NodeType::Start, properties: NodeProperties::default() },
            Node {
                id: "chat".into(),
                node_type: NodeType::Process,
                properties: NodeProperties {
                    model_id: Some(model_id.clone()),
                    prompt_template: "You are a terse, helpful assistant.".to_string(),
                    ..Default::default()
                },
            },
        ],
        edges: vec![Edge { source: "start".into(), target: "chat".into(), action_label: "default".into() }],
    };

    let model = ModelConfig {
        id: model_id,
        display_name: "Demo model".to_string(),
        endpoint_url: base_url,
        api_key_ref: "not-needed".to_string(),
        temperature: Some(0.3),
        prompt_template: String::new(),
        reasoning_tag_schema: None,
        function_calling_schema: FunctionCallingSchema::None,
    };

    storage.save(keys::FLOWS, serde_json::to_value(vec![flow]).unwrap()).await.unwrap();
    storage.save(keys::MODELS, serde_json::to_value(vec![model]).unwrap()).await.unwrap();

    let mut conversation = ConversationState::new("demo-conversation", "demo");
    conversation.current_node_id = Some("start".to_string());
    conversation.pending_user_input = Some("What's the capital of France?".to_string());
    storage
        .save(&keys::conversation("demo-conversation"), serde_json::to_value(&conversation).unwrap())
        .await
        .unwrap();

    match engine.executor.run("demo", "demo-conversation", true).await {
        Ok(state) => {
            println!("status: {:?}", state.status);
            for message in &state.messages {
                println!("{:?}: {}", message.role, message.content.as_deref().unwrap_or(""));
            }
        }
        Err(e) => eprintln!("flow execution failed: {e}"),
    }
}
