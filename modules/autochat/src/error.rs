use thiserror::Error;

use exagate_client::GatewayError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Gateway rejected request: {0}")]
    GatewayRejected(String),

    #[error("Inbound message from {from} matches no known conversation")]
    UnmatchedInbound { from: String },

    #[error("Insufficient identities: {found} known, at least 2 required")]
    InsufficientIdentities { found: usize },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Rejected { message, .. } => EngineError::GatewayRejected(message),
            other => EngineError::Transport(other.to_string()),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}
