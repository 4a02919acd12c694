use thiserror::Error;

use crate::bridge::storage::StorageError;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Async storage unavailable: {}", .0.join("; "))]
    Unavailable(Vec<String>),

    #[error("Worker did not report it was loaded within {0:?}")]
    WorkerTimeout(std::time::Duration),

    #[error("Unexpected message from worker: {0}")]
    UnexpectedMessage(String),

    #[error("Worker channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Codec(String),

    #[error("Sanity check failed at stage '{stage}': {detail}")]
    SanityCheck { stage: &'static str, detail: String },

    #[error("VFS registration failed: {0}")]
    VFSRegistrationFailed(i32),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid options: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
