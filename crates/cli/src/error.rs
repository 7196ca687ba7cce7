use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("wal error: {0}")]
    Wal(#[from] revbot_wal::WalError),
    #[error("validation error: {0}")]
    Validation(#[from] revbot_validation::ValidationError),
}
