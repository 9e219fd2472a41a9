#[derive(Debug)]
pub enum PromptError {
    UnknownNode(String),
    UnknownModel(String),
    Mcp(String),
}

impl std::fmt::Display for PromptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PromptError::UnknownNode(id) => write!(f, "flow has no node {id}"),
            PromptError::UnknownModel(id) => write!(f, "flow has no model {id}"),
            PromptError::Mcp(msg) => write!(f, "mcp error: {msg}"),
        }
    }
}

impl std::error::Error for PromptError {}
