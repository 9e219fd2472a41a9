use crate::storage::BoxFuture;

use super::error::PromptError;

/// One parameter of a tool, as reported by its MCP server's input schema.
#[derive(Debug, Clone)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub type_name: String,
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
}

/// What the Prompt Renderer needs from the MCP Connection Manager: connect
/// a server (retrying internally) and list what it offers. The renderer
/// never touches a transport or an `MCPClient` handle directly — it borrows
/// this narrower view, per `spec.md` §3's "MCP Connection Manager
/// exclusively owns `MCPClient` handles" rule.
pub trait ToolCatalogSource: Send + Sync {
    fn ensure_connected<'a>(&'a self, server: &'a str) -> BoxFuture<'a, Result<(), PromptError>>;

    fn list_tools<'a>(
        &'a self,
        server: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ToolDescriptor>, PromptError>>;
}
