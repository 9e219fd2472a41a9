use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::llm::ModelInvoker;
use crate::mcp::McpManager;
use crate::model::{ConversationState, ConversationStatus, Flow, ModelCatalog, NodeType, TraceEntry};
use crate::prompt::PromptRenderer;
use crate::storage::{keys, StorageGateway};

use super::action::Action;
use super::error::ExecutorError;
use super::process_node;

/// Hard ceiling on node-to-node handoffs within one request, per `spec.md`
/// §4.6 — guards against a cyclic flow looping forever on a model that
/// keeps choosing to hand off.
pub const MAX_INTERNAL_ITERATIONS: u32 = 150;

/// Drives a conversation through its flow one node at a time, per
/// `spec.md` §4.6. Owns no flow-specific state itself; everything that
/// varies node-to-node lives in [`ConversationState`], which is persisted
/// through the Storage Gateway after every step.
pub struct FlowExecutor {
    storage: Arc<dyn StorageGateway>,
    renderer: Arc<PromptRenderer>,
    mcp: Arc<McpManager>,
    invoker: Arc<ModelInvoker>,
    /// Per-conversation mutual exclusion: two requests racing on the same
    /// conversation id serialize rather than interleave node steps, per
    /// `spec.md` §5. Distinct conversations never block each other.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FlowExecutor {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        renderer: Arc<PromptRenderer>,
        mcp: Arc<McpManager>,
        invoker: Arc<ModelInvoker>,
    ) -> Self {
        Self { storage, renderer, mcp, invoker, locks: Mutex::new(HashMap::new()) }
    }

    async fn lock_for(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(conversation_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn load_flow(&self, flow_id: &str) -> Result<Flow, ExecutorError> {
        let value = self.storage.load(keys::FLOWS).await?.unwrap_or_else(|| Value::Array(vec![]));
        let flows: Vec<Flow> = serde_json::from_value(value).map_err(|e| ExecutorError::Storage(e.to_string()))?;
        flows.into_iter().find(|f| f.id == flow_id).ok_or_else(|| ExecutorError::UnknownFlow(flow_id.to_string()))
    }

    async fn load_models(&self) -> Result<ModelCatalog, ExecutorError> {
        let value = self.storage.load(keys::MODELS).await?.unwrap_or_else(|| Value::Array(vec![]));
        let models = serde_json::from_value(value).map_err(|e| ExecutorError::Storage(e.to_string()))?;
        Ok(ModelCatalog::new(models))
    }

    pub async fn load_conversation(&self, conversation_id: &str) -> Result<ConversationState, ExecutorError> {
        let value = self
            .storage
            .load(&keys::conversation(conversation_id))
            .await?
            .ok_or_else(|| ExecutorError::UnknownConversation(conversation_id.to_string()))?;
        serde_json::from_value(value).map_err(|e| ExecutorError::Storage(e.to_string()))
    }

    async fn persist(&self, state: &ConversationState) -> Result<(), ExecutorError> {
        let value = serde_json::to_value(state).map_err(|e| ExecutorError::Storage(e.to_string()))?;
        self.storage.save(&keys::conversation(&state.id), value).await?;
        Ok(())
    }

    /// Runs exactly one node step: `prep`/`exec`/`post` for whatever node
    /// `state.current_node_id` names, recording a trace entry and
    /// persisting before returning. `flujo` selects which tool-dispatch
    /// contract applies this request (see `spec.md` §4.6).
    pub async fn execute_step(
        &self,
        flow: &Flow,
        models: &ModelCatalog,
        mut state: ConversationState,
        flujo: bool,
    ) -> Result<(ConversationState, Action), ExecutorError> {
        if state.cancelled {
            let action = Action::Error("Execution cancelled by user.".to_string());
            state.status = ConversationStatus::Error;
            self.persist(&state).await?;
            return Ok((state, action));
        }

        let node_id = state
            .current_node_id
            .clone()
            .or_else(|| flow.start_node().map(|n| n.id.clone()))
            .ok_or_else(|| ExecutorError::UnknownNode("<none>".to_string()))?;
        let node = flow.node(&node_id).ok_or_else(|| ExecutorError::UnknownNode(node_id.clone()))?;

        let action = match node.node_type {
            NodeType::Process => {
                process_node::run(flow, models, node, &self.renderer, &self.mcp, &self.invoker, &mut state, flujo).await
            }
            NodeType::Start => {
                // Purely structural: fall straight through to its declared
                // successor without consuming a model turn.
                match flow.successor(&node.id, "default") {
                    Some(_) => Action::Handoff("default".to_string()),
                    None => Action::Unknown("default".to_string()),
                }
            }
            NodeType::Finish => Action::FinalResponse,
            NodeType::Mcp => Action::Error(format!("node {node_id} is an mcp node and cannot be executed directly")),
        };

        state.current_node_id = Some(node_id.clone());
        state.execution_trace.push(TraceEntry {
            node_id: node_id.clone(),
            action: describe_action(&action),
            timestamp_millis: now_millis(),
        });
        state.touch();
        self.persist(&state).await?;
        Ok((state, action))
    }

    /// Runs [`Self::execute_step`] repeatedly, resolving `handoff` actions
    /// against the flow's edges, until a terminal action, a debug-mode
    /// pause, or the iteration ceiling is reached. Serializes against any
    /// other in-flight `run` for the same conversation id.
    pub async fn run(
        &self,
        flow_id: &str,
        conversation_id: &str,
        flujo: bool,
    ) -> Result<ConversationState, ExecutorError> {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;

        let flow = self.load_flow(flow_id).await?;
        let models = self.load_models().await?;
        let mut state = self.load_conversation(conversation_id).await?;

        if state.current_node_id.is_none() {
            state.current_node_id = flow.start_node().map(|n| n.id.clone());
        }

        let mut iterations = 0u32;
        loop {
            if iterations >= MAX_INTERNAL_ITERATIONS {
                state.status = ConversationStatus::Error;
                state.messages.push(crate::model::Message::assistant(Some(
                    "Execution halted: too many node transitions in a single request.".to_string(),
                )));
                self.persist(&state).await?;
                return Ok(state);
            }
            iterations += 1;

            let (next_state, action) = self.execute_step(&flow, &models, state, flujo).await?;
            state = next_state;

            match action {
                Action::FinalResponse => {
                    state.status = ConversationStatus::Completed;
                    self.persist(&state).await?;
                    return Ok(state);
                }
                Action::Error(message) => {
                    state.status = ConversationStatus::Error;
                    warn!(conversation_id, %message, "flow execution stopped with an error");
                    self.persist(&state).await?;
                    return Ok(state);
                }
                Action::StayOnNode => {
                    self.persist(&state).await?;
                    return Ok(state);
                }
                Action::ToolCall => {
                    // No node type in this engine surfaces this to the outer
                    // loop today; treat it like stay_on_node rather than panic.
                    self.persist(&state).await?;
                    return Ok(state);
                }
                Action::Handoff(label) => {
                    let current = state.current_node_id.clone().unwrap_or_default();
                    match flow.successor(&current, &label) {
                        Some(next) => {
                            state.current_node_id = Some(next.id.clone());
                            if state.debug_mode {
                                state.status = ConversationStatus::PausedDebug;
                                self.persist(&state).await?;
                                return Ok(state);
                            }
                        }
                        None => {
                            state.status = ConversationStatus::Completed;
                            self.persist(&state).await?;
                            return Ok(state);
                        }
                    }
                }
                Action::Unknown(_) => {
                    state.status = ConversationStatus::Completed;
                    self.persist(&state).await?;
                    return Ok(state);
                }
            }
        }
    }

    /// Debug mode's single-step entry point: runs exactly one node step and
    /// returns, regardless of what action it produced (unless that action
    /// was itself terminal), per `spec.md` §4.6 "Debug mode."
    pub async fn step_once(
        &self,
        flow_id: &str,
        conversation_id: &str,
        flujo: bool,
    ) -> Result<ConversationState, ExecutorError> {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;

        let flow = self.load_flow(flow_id).await?;
        let models = self.load_models().await?;
        let mut state = self.load_conversation(conversation_id).await?;
        if state.current_node_id.is_none() {
            state.current_node_id = flow.start_node().map(|n| n.id.clone());
        }

        let (mut state, action) = self.execute_step(&flow, &models, state, flujo).await?;
        match action {
            Action::FinalResponse => state.status = ConversationStatus::Completed,
            Action::Error(_) => state.status = ConversationStatus::Error,
            Action::StayOnNode | Action::ToolCall => {}
            Action::Handoff(label) => {
                let current = state.current_node_id.clone().unwrap_or_default();
                match flow.successor(&current, &label) {
                    Some(next) => {
                        state.current_node_id = Some(next.id.clone());
                        state.status = ConversationStatus::PausedDebug;
                    }
                    None => state.status = ConversationStatus::Completed,
                }
            }
            Action::Unknown(_) => state.status = ConversationStatus::Completed,
        }
        self.persist(&state).await?;
        info!(conversation_id, node_id = ?state.current_node_id, "debug step complete");
        Ok(state)
    }
}

fn describe_action(action: &Action) -> String {
    match action {
        Action::FinalResponse => "final_response".to_string(),
        Action::Error(msg) => format!("error: {msg}"),
        Action::StayOnNode => "stay_on_node".to_string(),
        Action::ToolCall => "tool_call".to_string(),
        Action::Handoff(label) => format!("handoff: {label}"),
        Action::Unknown(label) => format!("unknown: {label}"),
    }
}

fn now_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock should be after the unix epoch")
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Edge, Node, NodeProperties};
    use crate::secrets::{NullSecretStore, SecretResolver};
    use crate::storage::InMemoryStorageGateway;

    fn build_executor(storage: Arc<dyn StorageGateway>) -> FlowExecutor {
        let secrets = Arc::new(SecretResolver::new(Arc::new(NullSecretStore), storage.clone()));
        let mcp = Arc::new(McpManager::new(storage.clone(), secrets.clone()));
        let renderer = Arc::new(PromptRenderer::new(mcp.clone()));
        let invoker = Arc::new(ModelInvoker::new(storage.clone(), secrets));
        FlowExecutor::new(storage, renderer, mcp, invoker)
    }

    #[tokio::test]
    async fn a_flow_with_no_process_nodes_completes_immediately() {
        let storage: Arc<dyn StorageGateway> = Arc::new(InMemoryStorageGateway::new());
        let flow = Flow {
            id: "f1".into(),
            name: "f".into(),
            nodes: vec![
                Node { id: "start".into(), node_type: NodeType::Start, properties: NodeProperties::default() },
                Node { id: "end".into(), node_type: NodeType::Finish, properties: NodeProperties::default() },
            ],
            edges: vec![Edge { source: "start".into(), target: "end".into(), action_label: "default".into() }],
        };
        storage.save(keys::FLOWS, serde_json::to_value(vec![flow]).unwrap()).await.unwrap();
        storage.save(keys::MODELS, serde_json::json!([])).await.unwrap();
        let conversation = ConversationState::new("c1", "f1");
        storage
            .save(&keys::conversation("c1"), serde_json::to_value(&conversation).unwrap())
            .await
            .unwrap();

        let executor = build_executor(storage);
        let result = executor.run("f1", "c1", true).await.unwrap();

        assert_eq!(result.status, ConversationStatus::Completed);
        assert_eq!(result.current_node_id.as_deref(), Some("end"));
        assert_eq!(result.execution_trace.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_flag_halts_execution_with_an_error() {
        let storage: Arc<dyn StorageGateway> = Arc::new(InMemoryStorageGateway::new());
        let flow = Flow {
            id: "f1".into(),
            name: "f".into(),
            nodes: vec![Node { id: "start".into(), node_type: NodeType::Start, properties: NodeProperties::default() }],
            edges: vec![],
        };
        storage.save(keys::FLOWS, serde_json::to_value(vec![flow]).unwrap()).await.unwrap();
        storage.save(keys::MODELS, serde_json::json!([])).await.unwrap();
        let mut conversation = ConversationState::new("c1", "f1");
        conversation.cancelled = true;
        storage
            .save(&keys::conversation("c1"), serde_json::to_value(&conversation).unwrap())
            .await
            .unwrap();

        let executor = build_executor(storage);
        let result = executor.run("f1", "c1", true).await.unwrap();

        assert_eq!(result.status, ConversationStatus::Error);
    }

    #[tokio::test]
    async fn unmatched_handoff_label_is_treated_as_completion_not_an_error() {
        let storage: Arc<dyn StorageGateway> = Arc::new(InMemoryStorageGateway::new());
        let flow = Flow {
            id: "f1".into(),
            name: "f".into(),
            nodes: vec![Node { id: "start".into(), node_type: NodeType::Start, properties: NodeProperties::default() }],
            edges: vec![],
        };
        storage.save(keys::FLOWS, serde_json::to_value(vec![flow]).unwrap()).await.unwrap();
        storage.save(keys::MODELS, serde_json::json!([])).await.unwrap();
        let conversation = ConversationState::new("c1", "f1");
        storage
            .save(&keys::conversation("c1"), serde_json::to_value(&conversation).unwrap())
            .await
            .unwrap();

        let executor = build_executor(storage);
        let result = executor.run("f1", "c1", true).await.unwrap();

        assert_eq!(result.status, ConversationStatus::Completed);
    }
}
