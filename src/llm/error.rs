use serde::Serialize;

#[derive(Debug)]
pub enum InvokerError {
    Request(String),
    Api(String),
    Serialization(String),
    Config(String),
    Unsupported(String),
}

impl std::fmt::Display for InvokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvokerError::Request(s) => write!(f, "request error: {s}"),
            InvokerError::Api(s) => write!(f, "api error: {s}"),
            InvokerError::Serialization(s) => write!(f, "serialization error: {s}"),
            InvokerError::Config(s) => write!(f, "config error: {s}"),
            InvokerError::Unsupported(s) => write!(f, "unsupported: {s}"),
        }
    }
}

impl std::error::Error for InvokerError {}

impl From<reqwest::Error> for InvokerError {
    fn from(err: reqwest::Error) -> Self {
        InvokerError::Request(err.to_string())
    }
}

/// The error taxonomy callers receive on failure, per `spec.md` §4.5:
/// `{message, type, code?, param?, status?, name}`.
#[derive(Debug, Clone, Serialize)]
pub struct InvokerErrorDetails {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub name: String,
}

impl InvokerErrorDetails {
    pub fn new(name: &str, kind: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.to_string(),
            code: None,
            param: None,
            status: None,
            name: name.to_string(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}
