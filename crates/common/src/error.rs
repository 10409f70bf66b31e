//! Error types for stepwise

use thiserror::Error;

/// Result type alias using the stepwise Error
pub type Result<T> = std::result::Result<T, Error>;

/// stepwise error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown artifact kind '{kind}' for artifact '{name}'")]
    UnknownArtifact { kind: String, name: String },

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an `InvalidConfig` error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    /// Whether this error originates from configuration and should stop startup
    pub fn is_config(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::ConfigParse(_))
    }
}
