use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tool_call::ToolCall;

/// The role a [`Message`] was authored under, per OpenAI chat semantics.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single entry in a conversation's message list.
///
/// Messages are append-only: nothing in this crate mutates one in place
/// once it has been pushed onto [`crate::model::ConversationState::messages`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Message {
    #[serde(default = "new_message_id")]
    pub id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Id of the node whose `exec` phase produced this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default = "now_millis")]
    pub timestamp_millis: u128,
}

impl Message {
    fn new(role: Role, content: Option<String>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            node_id: None,
            timestamp_millis: now_millis(),
        }
    }

    pub fn system<T: Into<String>>(content: T) -> Self {
        Self::new(Role::System, Some(content.into()))
    }

    pub fn user<T: Into<String>>(content: T) -> Self {
        Self::new(Role::User, Some(content.into()))
    }

    pub fn assistant(content: Option<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(Role::Assistant, None);
        msg.tool_calls = Some(tool_calls);
        msg
    }

    pub fn tool<T, S>(content: T, tool_call_id: S) -> Self
    where
        T: Into<String>,
        S: Into<String>,
    {
        let mut msg = Self::new(Role::Tool, Some(content.into()));
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
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
    fn tool_message_carries_its_call_id() {
        let msg = Message::tool("42", "call_abc");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_abc"));
        assert_eq!(msg.content.as_deref(), Some("42"));
    }

    #[test]
    fn each_message_gets_a_unique_id() {
        let a = Message::user("hi");
        let b = Message::user("hi");
        assert_ne!(a.id, b.id);
    }
}
