use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Separator embedded in tool names that have been rewritten to carry their
/// owning MCP server across the model boundary: `TOOL_DELIM<server>TOOL_DELIM<tool>`.
///
/// Chosen as an invisible unicode separator so it can never collide with a
/// user- or model-authored tool name.
pub const TOOL_DELIM: &str = "\u{2063}";

/// A tool call the model asked the engine to dispatch.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub function: ToolCallFunction,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolCallFunction {
    pub name: String,
    /// Arguments as a JSON string, per the OpenAI wire contract; callers
    /// that already have a `Value` should serialize it before constructing
    /// this struct.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            function: ToolCallFunction {
                name: name.into(),
                arguments: arguments.to_string(),
            },
        }
    }

    /// Qualify a tool name with its owning MCP server, e.g. `echo` on server
    /// `tools-1` becomes `\u{2063}tools-1\u{2063}echo`.
    pub fn qualify(server: &str, tool: &str) -> String {
        format!("{TOOL_DELIM}{server}{TOOL_DELIM}{tool}")
    }

    /// Split a qualified name back into `(server, tool)`, if it is one.
    pub fn unqualify(name: &str) -> Option<(&str, &str)> {
        let rest = name.strip_prefix(TOOL_DELIM)?;
        let mut parts = rest.splitn(2, TOOL_DELIM);
        let server = parts.next()?;
        let tool = parts.next()?;
        Some((server, tool))
    }

    pub fn is_internal(name: &str) -> bool {
        name.starts_with(TOOL_DELIM)
    }

    pub fn arguments_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.function.arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualify_then_unqualify_round_trips() {
        let qualified = ToolCall::qualify("weather-server", "get_forecast");
        assert!(ToolCall::is_internal(&qualified));
        assert_eq!(
            ToolCall::unqualify(&qualified),
            Some(("weather-server", "get_forecast"))
        );
    }

    #[test]
    fn external_tool_names_are_not_internal() {
        assert!(!ToolCall::is_internal("search"));
        assert_eq!(ToolCall::unqualify("search"), None);
    }
}
