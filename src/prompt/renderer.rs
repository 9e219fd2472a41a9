use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::model::{Flow, FunctionCallingSchema, ModelCatalog, Node, TOOL_DELIM};
use crate::xml_escape;

use super::backoff;
use super::catalog::{ToolCatalogSource, ToolDescriptor};
use super::error::PromptError;

const BACKOFF_MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    /// Skip tool-pill expansion and return pills unchanged.
    pub raw: bool,
}

/// Composes the effective system prompt for a node, per `spec.md` §4.3.
/// Generalizes `templates::Template::compile`'s placeholder substitution
/// into a pipeline of prompt concatenation followed by tool-pill expansion.
pub struct PromptRenderer {
    mcp: Arc<dyn ToolCatalogSource>,
}

impl PromptRenderer {
    pub fn new(mcp: Arc<dyn ToolCatalogSource>) -> Self {
        Self { mcp }
    }

    pub async fn render(
        &self,
        flow: &Flow,
        models: &ModelCatalog,
        node_id: &str,
        options: RenderOptions,
    ) -> Result<String, PromptError> {
        let node = flow
            .node(node_id)
            .ok_or_else(|| PromptError::UnknownNode(node_id.to_string()))?;

        let mut sections = Vec::new();

        if !node.properties.exclude_start_node_prompt {
            if let Some(start) = flow.start_node() {
                if !start.properties.prompt_template.is_empty() {
                    sections.push(start.properties.prompt_template.clone());
                }
            }
        }

        if !node.properties.exclude_model_prompt {
            if let Some(model_id) = &node.properties.model_id {
                let model = models
                    .get(model_id)
                    .ok_or_else(|| PromptError::UnknownModel(model_id.clone()))?;
                if !model.prompt_template.is_empty() {
                    sections.push(model.prompt_template.clone());
                }
                if let Some(schema) = &model.reasoning_tag_schema {
                    sections.push(format!(
                        "This model expresses reasoning between {} and {} tags.",
                        schema.open_tag, schema.close_tag
                    ));
                }
                match model.function_calling_schema {
                    FunctionCallingSchema::Json => {
                        sections.push("This model expresses tool calls as JSON.".to_string())
                    }
                    FunctionCallingSchema::Xml => {
                        sections.push("This model expresses tool calls as XML.".to_string())
                    }
                    FunctionCallingSchema::None => {}
                }
            }
        }

        if !node.properties.prompt_template.is_empty() {
            sections.push(node.properties.prompt_template.clone());
        }

        let composed = sections.join("\n\n");

        if options.raw {
            return Ok(composed);
        }

        let function_calling_schema = node
            .properties
            .model_id
            .as_deref()
            .and_then(|id| models.get(id))
            .map(|m| m.function_calling_schema)
            .unwrap_or_default();

        self.expand_pills(flow, node, &composed, function_calling_schema)
            .await
    }

    async fn expand_pills(
        &self,
        flow: &Flow,
        node: &Node,
        content: &str,
        schema: FunctionCallingSchema,
    ) -> Result<String, PromptError> {
        let mut output = String::with_capacity(content.len());
        let mut rest = content;

        while let Some(start) = rest.find(&format!("${{{TOOL_DELIM}")) {
            output.push_str(&rest[..start]);
            let after = &rest[start + 2 + TOOL_DELIM.len()..];
            match self.parse_pill(after) {
                Some((server, tool, pill_len)) => {
                    let rendered = self
                        .render_pill(flow, node, &server, &tool, schema)
                        .await;
                    output.push_str(&rendered);
                    rest = &after[pill_len..];
                }
                None => {
                    // Malformed pill syntax; emit the opening marker literally
                    // and keep scanning past it.
                    output.push_str(&rest[start..start + 2 + TOOL_DELIM.len()]);
                    rest = after;
                }
            }
        }
        output.push_str(rest);
        Ok(output)
    }

    /// Parses `<server>TOOL_DELIM<tool>}` out of `after`, returning the
    /// consumed byte length (including the closing `}`) alongside the
    /// decoded names.
    fn parse_pill(&self, after: &str) -> Option<(String, String, usize)> {
        let sep = after.find(TOOL_DELIM)?;
        let server = &after[..sep];
        let rest = &after[sep + TOOL_DELIM.len()..];
        let end = rest.find('}')?;
        let tool = &rest[..end];
        let consumed = sep + TOOL_DELIM.len() + end + 1;
        Some((server.to_string(), tool.to_string(), consumed))
    }

    async fn render_pill(
        &self,
        flow: &Flow,
        node: &Node,
        server: &str,
        tool: &str,
        schema: FunctionCallingSchema,
    ) -> String {
        let literal = format!("${{{TOOL_DELIM}{server}{TOOL_DELIM}{tool}}}");

        if flow.mcp_children(&node.id).iter().all(|n| {
            n.properties
                .mcp_binding
                .as_ref()
                .map(|b| b.server_name != server)
                .unwrap_or(true)
        }) {
            warn!(server, tool, "tool pill references a server not reachable from this node");
        }

        let mcp = self.mcp.clone();
        let server_owned = server.to_string();
        let connect_result = backoff::retry(BACKOFF_MAX_ATTEMPTS, BACKOFF_BASE, || {
            let mcp = mcp.clone();
            let server = server_owned.clone();
            async move { mcp.ensure_connected(&server).await }
        })
        .await;

        if let Err(e) = connect_result {
            warn!(server, tool, error = %e, "failed to connect mcp server for tool pill, leaving pill literal");
            return literal;
        }

        let tools = match self.mcp.list_tools(server).await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(server, tool, error = %e, "failed to list tools for tool pill, leaving pill literal");
                return literal;
            }
        };

        match tools.into_iter().find(|t| t.name == tool) {
            Some(descriptor) => render_tool_description(&descriptor, schema),
            None => {
                warn!(server, tool, "tool pill names a tool the server does not expose");
                literal
            }
        }
    }
}

fn render_tool_description(tool: &ToolDescriptor, schema: FunctionCallingSchema) -> String {
    match schema {
        FunctionCallingSchema::Json => render_json_description(tool),
        FunctionCallingSchema::Xml => render_xml_description(tool),
        FunctionCallingSchema::None => render_text_description(tool),
    }
}

fn render_json_description(tool: &ToolDescriptor) -> String {
    let params: Vec<_> = tool
        .params
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "type": p.type_name,
                "description": p.description,
            })
        })
        .collect();
    let value = serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": params,
    });
    serde_json::to_string_pretty(&value).unwrap_or_default()
}

fn render_xml_description(tool: &ToolDescriptor) -> String {
    let mut out = format!(
        "<tool>\n  <name>{}</name>\n  <description>{}</description>\n  <parameters>\n",
        xml_escape::escape(&tool.name),
        xml_escape::escape(&tool.description)
    );
    for p in &tool.params {
        out.push_str(&format!(
            "    <parameter name=\"{}\" type=\"{}\">{}</parameter>\n",
            xml_escape::escape(&p.name),
            xml_escape::escape(&p.type_name),
            xml_escape::escape(&p.description)
        ));
    }
    out.push_str("  </parameters>\n</tool>");
    out
}

fn render_text_description(tool: &ToolDescriptor) -> String {
    let mut out = format!("Tool `{}`: {}", tool.name, tool.description);
    if !tool.params.is_empty() {
        out.push_str("\nParameters:");
        for p in &tool.params {
            out.push_str(&format!("\n  - {} ({}): {}", p.name, p.type_name, p.description));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Edge, McpBinding, ModelConfig, NodeProperties, NodeType};
    use crate::storage::BoxFuture;
    use std::collections::HashMap;

    struct StubCatalog {
        tools: HashMap<String, Vec<ToolDescriptor>>,
    }

    impl ToolCatalogSource for StubCatalog {
        fn ensure_connected<'a>(&'a self, _server: &'a str) -> BoxFuture<'a, Result<(), PromptError>> {
            Box::pin(async { Ok(()) })
        }

        fn list_tools<'a>(
            &'a self,
            server: &'a str,
        ) -> BoxFuture<'a, Result<Vec<ToolDescriptor>, PromptError>> {
            let tools = self.tools.get(server).cloned().unwrap_or_default();
            Box::pin(async move { Ok(tools) })
        }
    }

    fn flow_with_node(prompt: &str, mcp_binding: Option<McpBinding>) -> Flow {
        Flow {
            id: "f".into(),
            name: "f".into(),
            nodes: vec![
                Node { id: "start".into(), node_type: NodeType::Start, properties: Default::default() },
                Node {
                    id: "n".into(),
                    node_type: NodeType::Process,
                    properties: NodeProperties {
                        prompt_template: prompt.to_string(),
                        exclude_start_node_prompt: true,
                        exclude_model_prompt: true,
                        ..Default::default()
                    },
                },
                Node {
                    id: "tools-1".into(),
                    node_type: NodeType::Mcp,
                    properties: NodeProperties {
                        mcp_binding,
                        ..Default::default()
                    },
                },
            ],
            edges: vec![Edge { source: "n".into(), target: "tools-1".into(), action_label: "mcp".into() }],
        }
    }

    #[tokio::test]
    async fn raw_mode_returns_pills_unchanged() {
        let pill = format!("${{{TOOL_DELIM}tools-1{TOOL_DELIM}echo}}");
        let flow = flow_with_node(&pill, None);
        let renderer = PromptRenderer::new(Arc::new(StubCatalog { tools: HashMap::new() }));
        let out = renderer
            .render(&flow, &ModelCatalog::default(), "n", RenderOptions { raw: true })
            .await
            .unwrap();
        assert_eq!(out, pill);
    }

    #[tokio::test]
    async fn tool_pill_expands_to_text_description_by_default() {
        let pill = format!("Use ${{{TOOL_DELIM}tools-1{TOOL_DELIM}echo}} please.");
        let binding = McpBinding { server_name: "tools-1".into(), enabled_tools: vec![] };
        let flow = flow_with_node(&pill, Some(binding));
        let mut tools = HashMap::new();
        tools.insert(
            "tools-1".to_string(),
            vec![ToolDescriptor {
                name: "echo".into(),
                description: "Echoes input".into(),
                params: vec![],
            }],
        );
        let renderer = PromptRenderer::new(Arc::new(StubCatalog { tools }));
        let out = renderer
            .render(&flow, &ModelCatalog::default(), "n", RenderOptions::default())
            .await
            .unwrap();
        assert!(out.contains("Echoes input"));
        assert!(!out.contains(TOOL_DELIM));
    }

    #[tokio::test]
    async fn unknown_tool_leaves_pill_literal() {
        let pill = format!("${{{TOOL_DELIM}tools-1{TOOL_DELIM}missing}}");
        let binding = McpBinding { server_name: "tools-1".into(), enabled_tools: vec![] };
        let flow = flow_with_node(&pill, Some(binding));
        let renderer = PromptRenderer::new(Arc::new(StubCatalog { tools: HashMap::new() }));
        let out = renderer
            .render(&flow, &ModelCatalog::default(), "n", RenderOptions::default())
            .await
            .unwrap();
        assert_eq!(out, pill);
    }

    #[tokio::test]
    async fn model_prompt_adds_function_calling_instruction() {
        let mut models = ModelCatalog::new(vec![ModelConfig {
            id: "m1".into(),
            display_name: "M1".into(),
            endpoint_url: "http://x".into(),
            api_key_ref: "k".into(),
            temperature: None,
            prompt_template: "Base prompt.".into(),
            reasoning_tag_schema: None,
            function_calling_schema: FunctionCallingSchema::Xml,
        }]);
        let flow = Flow {
            id: "f".into(),
            name: "f".into(),
            nodes: vec![Node {
                id: "n".into(),
                node_type: NodeType::Process,
                properties: NodeProperties {
                    model_id: Some("m1".into()),
                    exclude_start_node_prompt: true,
                    ..Default::default()
                },
            }],
            edges: vec![],
        };
        let renderer = PromptRenderer::new(Arc::new(StubCatalog { tools: HashMap::new() }));
        let out = renderer
            .render(&flow, &mut_ref(&mut models), "n", RenderOptions::default())
            .await
            .unwrap();
        assert!(out.contains("Base prompt."));
        assert!(out.contains("XML"));
    }

    fn mut_ref(models: &mut ModelCatalog) -> &ModelCatalog {
        models
    }
}
