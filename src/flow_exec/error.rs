use std::error::Error;
use std::fmt;

/// Failures that stop a step from producing a well-formed [`super::Action`]
/// at all — not a node-level business error, which the executor instead
/// folds into `Action::Error` and a trace entry so the conversation can
/// still be persisted and inspected.
#[derive(Debug)]
pub enum ExecutorError {
    UnknownConversation(String),
    UnknownFlow(String),
    UnknownNode(String),
    Storage(String),
    Prompt(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownConversation(id) => write!(f, "no conversation with id {id}"),
            Self::UnknownFlow(id) => write!(f, "no flow with id {id}"),
            Self::UnknownNode(id) => write!(f, "flow has no node {id}"),
            Self::Storage(msg) => write!(f, "storage error: {msg}"),
            Self::Prompt(msg) => write!(f, "prompt rendering error: {msg}"),
        }
    }
}

impl Error for ExecutorError {}

impl From<crate::storage::StorageError> for ExecutorError {
    fn from(e: crate::storage::StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<crate::prompt::PromptError> for ExecutorError {
    fn from(e: crate::prompt::PromptError) -> Self {
        Self::Prompt(e.to_string())
    }
}
