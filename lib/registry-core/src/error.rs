use thiserror::Error;

use crate::command::expression::ExpressionError;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid route pattern: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Unsupported registry protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Configuration and expression errors come from authored settings and
    /// are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RegistryError::InvalidConfiguration(_)
                | RegistryError::Expression(_)
                | RegistryError::InvalidUrl(_)
        )
    }
}
