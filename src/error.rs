use thiserror::Error;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Can't add a row to table '{table}' without a primary key")]
    MissingPrimaryKey { table: String },

    #[error("No key generation strategy for primary key type '{key_type}'")]
    NoPrimaryKey { key_type: String },

    #[error("Table '{table}' is not declared")]
    UnknownTable { table: String },

    #[error("Correlation id {id} is already registered")]
    DuplicateCorrelationId { id: String },

    #[error("Remote engine failed request {id}: {reason}")]
    RemoteEngine { id: String, reason: String },

    #[error("Remote engine disconnected before replying")]
    EngineDisconnected,

    #[error("Unexpected reply for request {id}: expected {expected}")]
    UnexpectedReply { id: String, expected: &'static str },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, TetherError>;
