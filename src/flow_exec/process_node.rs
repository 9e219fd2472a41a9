use serde_json::{json, Value};

use crate::llm::{InvocationOutcome, ModelInvoker, ToolSchema};
use crate::mcp::McpManager;
use crate::model::{ConversationState, ConversationStatus, Flow, FunctionCallingSchema, Message, Node, ToolCall};
use crate::prompt::{PromptRenderer, RenderOptions};
use crate::xml_escape;

use super::action::Action;
use super::tool_parse::extract_tool_calls;

pub const MAX_TOOL_ITERATIONS: u32 = 30;
const HANDOFF_TOOL_PREFIX: &str = "handoff_to_";
const GENERIC_HANDOFF_TOOL: &str = "handoff";

/// Runs one `process` node's `prep`/`exec`/`post` cycle, per `spec.md`
/// §4.6. Mutates `state.messages` in place and returns the action `post`
/// decided on; the caller (the outer loop) resolves that action against
/// the flow's edges.
pub async fn run(
    flow: &Flow,
    models: &crate::model::ModelCatalog,
    node: &Node,
    renderer: &PromptRenderer,
    mcp: &McpManager,
    invoker: &ModelInvoker,
    state: &mut ConversationState,
    flujo: bool,
) -> Action {
    let Some(model_id) = node.properties.model_id.clone() else {
        return Action::Error(format!("node {} has no model configured", node.id));
    };

    // prep
    if let Some(user_input) = state.pending_user_input.take() {
        state.messages.push(Message::user(user_input).with_node_id(node.id.clone()));
    }

    let system_prompt = match renderer.render(flow, models, &node.id, RenderOptions::default()).await {
        Ok(prompt) => prompt,
        Err(e) => return Action::Error(format!("failed to render prompt for node {}: {e}", node.id)),
    };

    let function_calling_schema = models.get(&model_id).map(|m| m.function_calling_schema).unwrap_or_default();
    let tools = gather_tools(flow, node, mcp).await;
    let tools_slice = if tools.is_empty() { None } else { Some(tools.as_slice()) };

    // exec
    for _ in 0..MAX_TOOL_ITERATIONS {
        if state.cancelled {
            return Action::Error("Execution cancelled by user.".to_string());
        }

        let outcome = invoker
            .generate_completion(&model_id, &system_prompt, &state.messages, tools_slice)
            .await;

        match outcome {
            InvocationOutcome::Failure { error, .. } => return Action::Error(error),
            InvocationOutcome::Success { content, tool_calls, retried_without_tools, .. } => {
                // A provider that rejected the structured `tools` field was
                // retried with tool descriptions folded into the prompt; a
                // model that still tried to call one expresses it as text,
                // which the native `tool_calls` field never carries. Only
                // attempt this recovery for that specific retried request —
                // an ordinary tool-free reply that happens to contain a
                // JSON- or XML-like span is not a tool call.
                let recovered_calls = tool_calls.filter(|c| !c.is_empty()).or_else(|| {
                    if !retried_without_tools || function_calling_schema == FunctionCallingSchema::None {
                        return None;
                    }
                    content
                        .as_deref()
                        .map(|text| extract_tool_calls(text, function_calling_schema))
                        .filter(|c| !c.is_empty())
                });

                let Some(calls) = recovered_calls else {
                    state
                        .messages
                        .push(Message::assistant(content).with_node_id(node.id.clone()));
                    return post(flow, node);
                };

                if let Some(handoff_call) = calls.iter().find(|c| is_handoff_call(&c.function.name)) {
                    return handle_handoff(flow, node, state, handoff_call);
                }

                state
                    .messages
                    .push(Message::assistant_with_tool_calls(calls.clone()).with_node_id(node.id.clone()));

                if flujo {
                    if node.properties.require_approval {
                        state.status = ConversationStatus::AwaitingToolApproval;
                        state.pending_tool_calls = calls;
                        return Action::StayOnNode;
                    }
                    execute_all(mcp, state, &calls).await;
                    continue;
                }

                let external: Vec<&ToolCall> = calls.iter().filter(|c| !ToolCall::is_internal(&c.function.name)).collect();
                if external.is_empty() {
                    execute_all(mcp, state, &calls).await;
                    continue;
                }

                wrap_external_calls(state, &calls);
                return Action::FinalResponse;
            }
        }
    }

    Action::Error(format!("node {} exceeded {MAX_TOOL_ITERATIONS} internal tool-call iterations", node.id))
}

/// `post`: the default outgoing label, taken from the node's first
/// non-`mcp` edge, or the literal string `"default"` if it has none.
fn post(flow: &Flow, node: &Node) -> Action {
    let label = flow
        .edges
        .iter()
        .find(|e| e.source == node.id && e.action_label != "mcp")
        .map(|e| e.action_label.clone())
        .unwrap_or_else(|| "default".to_string());

    match flow.successor(&node.id, &label) {
        Some(_) => Action::Handoff(label),
        None => Action::Unknown(label),
    }
}

fn is_handoff_call(name: &str) -> bool {
    name == GENERIC_HANDOFF_TOOL || name.starts_with(HANDOFF_TOOL_PREFIX)
}

/// Resolves a `handoff`/`handoff_to_*` tool call to an outgoing edge,
/// synthesizes the confirmation messages `spec.md` §4.6 describes, and
/// returns the edge's action label so the outer loop can transition.
fn handle_handoff(flow: &Flow, node: &Node, state: &mut ConversationState, call: &ToolCall) -> Action {
    let arguments = call.arguments_value().unwrap_or(Value::Null);
    let target = if let Some(suffix) = call.function.name.strip_prefix(HANDOFF_TOOL_PREFIX) {
        Some(suffix.to_string())
    } else {
        arguments
            .get("target")
            .or_else(|| arguments.get("node"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let Some(target) = target else {
        state
            .messages
            .push(Message::tool("handoff call did not name a target", call.id.clone()));
        return post(flow, node);
    };

    let edge_label = flow
        .edges
        .iter()
        .find(|e| e.source == node.id && (e.target == target || e.target.eq_ignore_ascii_case(&target)))
        .map(|e| e.action_label.clone())
        .or_else(|| flow.successor(&node.id, &target).map(|_| target.clone()));

    match edge_label {
        Some(label) => {
            state.messages.push(Message::tool("The handoff was confirmed.", call.id.clone()));
            state.messages.push(Message::user("The handoff was successful. Continue"));
            Action::Handoff(label)
        }
        None => {
            state
                .messages
                .push(Message::tool(format!("no outgoing edge leads to '{target}'"), call.id.clone()));
            post(flow, node)
        }
    }
}

async fn execute_all(mcp: &McpManager, state: &mut ConversationState, calls: &[ToolCall]) {
    for call in calls {
        let result = execute_one(mcp, call).await;
        state.messages.push(Message::tool(result, call.id.clone()));
    }
}

async fn execute_one(mcp: &McpManager, call: &ToolCall) -> String {
    let Some((server, tool)) = ToolCall::unqualify(&call.function.name) else {
        return format!("Error: '{}' is not a tool this node can dispatch.", call.function.name);
    };
    let arguments = call.arguments_value().unwrap_or_else(|_| json!({}));
    match mcp.call_tool(server, tool, arguments, None).await {
        Ok(text) => text,
        Err(e) => format!("Error calling tool {tool}: {e}"),
    }
}

/// When a `flujo=false` caller's model names a tool this node did not
/// qualify as internal, the engine stops dispatching for this turn and
/// hands the raw intention back as escaped XML inside the assistant's own
/// message, per `spec.md` §4.6.
fn wrap_external_calls(state: &mut ConversationState, calls: &[ToolCall]) {
    let mut xml = String::from("<tool_calls>\n");
    for call in calls {
        xml.push_str(&format!(
            "  <tool_call name=\"{}\">{}</tool_call>\n",
            xml_escape::escape(&call.function.name),
            xml_escape::escape(&call.function.arguments),
        ));
    }
    xml.push_str("</tool_calls>");

    if let Some(last) = state.messages.last_mut() {
        last.tool_calls = None;
        last.content = Some(xml);
    }
}

async fn gather_tools(flow: &Flow, node: &Node, mcp: &McpManager) -> Vec<ToolSchema> {
    let mut tools = Vec::new();

    for child in flow.mcp_children(&node.id) {
        let Some(binding) = &child.properties.mcp_binding else { continue };
        if let Err(e) = mcp.connect_server(&binding.server_name).await {
            tracing::warn!(server = %binding.server_name, error = %e, "skipping unreachable mcp server for tool gathering");
            continue;
        }
        let descriptors = match mcp.list_server_tools(&binding.server_name).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(server = %binding.server_name, error = %e, "failed to list tools for tool gathering");
                continue;
            }
        };
        for tool in descriptors {
            if !binding.enabled_tools.is_empty() && !binding.enabled_tools.contains(&tool.name) {
                continue;
            }
            let mut properties = serde_json::Map::new();
            let mut required = Vec::new();
            for param in &tool.params {
                properties.insert(param.name.clone(), json!({"type": param.type_name, "description": param.description}));
                required.push(param.name.clone());
            }
            let schema = json!({"type": "object", "properties": Value::Object(properties), "required": required});
            tools.push(ToolSchema::new(ToolCall::qualify(&binding.server_name, &tool.name), tool.description, schema));
        }
    }

    for edge in flow.edges.iter().filter(|e| e.source == node.id && e.action_label != "mcp") {
        tools.push(ToolSchema::new(
            format!("{HANDOFF_TOOL_PREFIX}{}", edge.target),
            format!("Hand off this conversation to node '{}'.", edge.target),
            json!({"type": "object", "properties": {}}),
        ));
    }

    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Edge, NodeProperties, NodeType};

    fn node(id: &str) -> Node {
        Node { id: id.to_string(), node_type: NodeType::Process, properties: NodeProperties::default() }
    }

    #[test]
    fn post_follows_first_non_mcp_edge() {
        let flow = Flow {
            id: "f".into(),
            name: "f".into(),
            nodes: vec![node("a"), node("b")],
            edges: vec![Edge { source: "a".into(), target: "b".into(), action_label: "next".into() }],
        };
        assert_eq!(post(&flow, &node("a")), Action::Handoff("next".to_string()));
    }

    #[test]
    fn post_falls_back_to_default_label_with_no_edges() {
        let flow = Flow { id: "f".into(), name: "f".into(), nodes: vec![node("a")], edges: vec![] };
        assert_eq!(post(&flow, &node("a")), Action::Unknown("default".to_string()));
    }

    #[test]
    fn handoff_tool_names_are_recognized() {
        assert!(is_handoff_call("handoff"));
        assert!(is_handoff_call("handoff_to_billing"));
        assert!(!is_handoff_call("search"));
    }
}
