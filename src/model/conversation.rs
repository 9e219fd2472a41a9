use serde::{Deserialize, Serialize};

use super::message::Message;
use super::tool_call::ToolCall;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Running,
    Completed,
    Error,
    AwaitingToolApproval,
    PausedDebug,
}

/// One entry in a debug-mode execution trace: the node entered and the
/// action it produced, per `spec.md` §4.6 "Debug mode."
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TraceEntry {
    pub node_id: String,
    pub action: String,
    pub timestamp_millis: u128,
}

/// Persisted conversation state, resumed across requests via the Storage
/// Gateway under key `conversations/<id>`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConversationState {
    pub id: String,
    pub flow_id: String,
    #[serde(default)]
    pub current_node_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub status: ConversationStatus,
    #[serde(default)]
    pub pending_tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub execution_trace: Vec<TraceEntry>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub title: Option<String>,
    /// A user message queued for the next `process` node `prep` phase
    /// (e.g. a freshly-submitted request on a conversation resumed
    /// mid-flow), consumed once read.
    #[serde(default)]
    pub pending_user_input: Option<String>,
    pub created_at_millis: u128,
    pub updated_at_millis: u128,
}

impl ConversationState {
    pub fn new(id: impl Into<String>, flow_id: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            flow_id: flow_id.into(),
            current_node_id: None,
            messages: Vec::new(),
            status: ConversationStatus::Running,
            pending_tool_calls: Vec::new(),
            execution_trace: Vec::new(),
            cancelled: false,
            debug_mode: false,
            title: None,
            pending_user_input: None,
            created_at_millis: now,
            updated_at_millis: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at_millis = now_millis();
    }

    pub fn storage_key(id: &str) -> String {
        format!("conversations/{id}")
    }

    /// Every `tool_call_id` on a `tool` message must match a prior
    /// assistant message's `tool_calls[i].id` (`spec.md` §3 invariant).
    pub fn validate_tool_call_linkage(&self) -> Result<(), String> {
        use std::collections::HashSet;
        let mut seen_calls: HashSet<&str> = HashSet::new();
        for msg in &self.messages {
            if let Some(calls) = &msg.tool_calls {
                for call in calls {
                    if !seen_calls.insert(&call.id) {
                        return Err(format!("duplicate tool_call id {}", call.id));
                    }
                }
            }
            if msg.role == super::message::Role::Tool {
                let Some(id) = &msg.tool_call_id else {
                    return Err("tool message missing tool_call_id".into());
                };
                if !seen_calls.contains(id.as_str()) {
                    return Err(format!("tool message references unknown tool_call_id {id}"));
                }
            }
        }
        Ok(())
    }

    /// Reset the state so execution replays from `node_id`, per `spec.md`
    /// §6's `processNodeId` extension and §9's resolved open question: this
    /// clears pending/trace/handoff-adjacent fields but does **not**
    /// truncate `messages` — the engine does not guess whether a caller
    /// wants history truncated too.
    pub fn reset_to_node(&mut self, node_id: impl Into<String>) {
        self.current_node_id = Some(node_id.into());
        self.pending_tool_calls.clear();
        self.execution_trace.clear();
        self.status = ConversationStatus::Running;
        self.touch();
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

    #[test]
    fn fresh_conversation_is_running_with_no_pending_approvals() {
        let state = ConversationState::new("c1", "f1");
        assert_eq!(state.status, ConversationStatus::Running);
        assert!(state.pending_tool_calls.is_empty());
    }

    #[test]
    fn validate_tool_call_linkage_accepts_well_formed_history() {
        let mut state = ConversationState::new("c1", "f1");
        state.messages.push(Message::assistant_with_tool_calls(vec![ToolCall::new(
            "call_1",
            "echo",
            serde_json::json!({"x": "ping"}),
        )]));
        state.messages.push(Message::tool("ping", "call_1"));
        assert!(state.validate_tool_call_linkage().is_ok());
    }

    #[test]
    fn validate_tool_call_linkage_rejects_dangling_tool_message() {
        let mut state = ConversationState::new("c1", "f1");
        state.messages.push(Message::tool("ping", "call_unknown"));
        assert!(state.validate_tool_call_linkage().is_err());
    }

    #[test]
    fn reset_to_node_clears_pending_state_but_keeps_messages() {
        let mut state = ConversationState::new("c1", "f1");
        state.messages.push(Message::user("hi"));
        state
            .pending_tool_calls
            .push(ToolCall::new("call_1", "echo", serde_json::json!({})));
        state.reset_to_node("node-b");
        assert_eq!(state.current_node_id.as_deref(), Some("node-b"));
        assert!(state.pending_tool_calls.is_empty());
        assert_eq!(state.messages.len(), 1);
    }
}
