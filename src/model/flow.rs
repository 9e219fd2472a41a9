use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A node's role in the graph. `Start` and `Finish` bracket the graph;
/// `Process` invokes an LLM; `Mcp` declares a tool-server dependency that
/// `Process` nodes reach via a graph edge tagged `mcp`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Start,
    Process,
    Finish,
    Mcp,
}

/// The MCP server (and optionally the tool subset) a `process` node may call.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct McpBinding {
    pub server_name: String,
    /// Empty means "every tool the server exposes."
    #[serde(default)]
    pub enabled_tools: Vec<String>,
}

/// Properties attached to a [`Node`], per `spec.md`'s Node row.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NodeProperties {
    /// Id of the [`crate::model::ModelConfig`] this node invokes, if any.
    #[serde(default)]
    pub model_id: Option<String>,
    /// Prompt template rendered for this node specifically.
    #[serde(default)]
    pub prompt_template: String,
    #[serde(default)]
    pub exclude_start_node_prompt: bool,
    #[serde(default)]
    pub exclude_model_prompt: bool,
    #[serde(default)]
    pub mcp_binding: Option<McpBinding>,
    #[serde(default)]
    pub extra_env: HashMap<String, String>,
    /// Whether tool calls on this node require external approval before
    /// execution (see the `flujo=true` branch of `spec.md` §4.6).
    #[serde(default)]
    pub require_approval: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Node {
    pub id: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub properties: NodeProperties,
}

/// A directed edge tagged with the action label that selects it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub action_label: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Flow {
    pub id: String,
    pub name: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Flow {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_type == NodeType::Start)
    }

    /// Resolve the successor reached from `node_id` by matching `action_label`
    /// against the node's outgoing edges exactly.
    pub fn successor(&self, node_id: &str, action_label: &str) -> Option<&Node> {
        let edge = self
            .edges
            .iter()
            .find(|e| e.source == node_id && e.action_label == action_label)?;
        self.node(&edge.target)
    }

    /// Mcp nodes reachable from `node_id` via edges tagged `"mcp"`, used by a
    /// `process` node's `prep` phase to gather available tool servers.
    pub fn mcp_children(&self, node_id: &str) -> Vec<&Node> {
        self.edges
            .iter()
            .filter(|e| e.source == node_id && e.action_label == "mcp")
            .filter_map(|e| self.node(&e.target))
            .filter(|n| n.node_type == NodeType::Mcp)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_flow() -> Flow {
        Flow {
            id: "f1".into(),
            name: "Demo".into(),
            nodes: vec![
                Node { id: "start".into(), node_type: NodeType::Start, properties: Default::default() },
                Node { id: "a".into(), node_type: NodeType::Process, properties: Default::default() },
                Node { id: "b".into(), node_type: NodeType::Process, properties: Default::default() },
            ],
            edges: vec![
                Edge { source: "start".into(), target: "a".into(), action_label: "default".into() },
                Edge { source: "a".into(), target: "b".into(), action_label: "to_b".into() },
            ],
        }
    }

    #[test]
    fn successor_matches_exact_action_label() {
        let flow = sample_flow();
        let next = flow.successor("a", "to_b").unwrap();
        assert_eq!(next.id, "b");
        assert!(flow.successor("a", "nonexistent").is_none());
    }

    #[test]
    fn start_node_is_found_by_type() {
        let flow = sample_flow();
        assert_eq!(flow.start_node().unwrap().id, "start");
    }
}
