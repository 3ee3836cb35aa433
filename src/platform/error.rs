//! Error taxonomy shared by the engine and the CLI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RestFuzzError {
    /// Operator inputs are unusable (API description, dependency graph, token file).
    #[error("configuration error: {0}")]
    Config(String),

    /// Stored or generated data is corrupt or has an unsupported shape.
    #[error("data error: {0}")]
    Data(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

pub type RestFuzzResult<T> = Result<T, RestFuzzError>;
