use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("load failure: {0}")]
    LoadFailure(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EtlError {
    /// Stable label used in audit and dead-letter rows, so re-runs and
    /// dashboards can group failures without parsing free-form messages.
    pub fn kind(&self) -> &'static str {
        match self {
            EtlError::MalformedInput(_) => "MalformedInputError",
            EtlError::InvalidAmount(_) => "InvalidAmountError",
            EtlError::LoadFailure(_) => "LoadFailure",
            EtlError::Db(_) => "DatabaseError",
            EtlError::Json(_) => "JsonError",
            EtlError::Toml(_) => "ConfigError",
            EtlError::Io(_) => "IoError",
            EtlError::Config(_) => "ConfigError",
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
