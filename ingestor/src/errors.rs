use thiserror::Error;

/// Failures surfaced by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt document for key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Invalid storage key: {0:?}")]
    InvalidKey(String),

    #[error("Storage configuration error: {0}")]
    Configuration(String),
}

impl StorageError {
    /// Network or disk failure, as opposed to bad input or bad data.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StorageError::Io(_) => true,
            StorageError::Database(e) => crate::store::postgres::is_transient_error(e),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("MQTT publish error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Payload encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error")]
    ChannelSend,
}

pub type Result<T> = std::result::Result<T, Error>;
