#[derive(Debug)]
pub enum SecretError {
    DecryptionFailed(String),
    StoreUnavailable,
}

impl std::fmt::Display for SecretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretError::DecryptionFailed(s) => write!(f, "failed to decrypt secret: {s}"),
            SecretError::StoreUnavailable => write!(f, "no secret store configured"),
        }
    }
}

impl std::error::Error for SecretError {}
