use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ssh error: {0}")]
    Ssh(String),
    #[error("invalid data: {0}")]
    Invalid(String),
    #[error("not found")]
    NotFound,
    #[error("connection {0} is not connected")]
    NotConnected(String),
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("ai error: {0}")]
    Ai(String),
    /// Endpoint, key or model missing; callers show a one-time setup prompt.
    #[error("AI_CONFIG_NOT_SET")]
    AiConfigNotSet,
}
