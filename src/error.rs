use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoraNsError {
    #[error("Buffer truncated: {0}")]
    BufferTruncated(String),

    #[error("Unknown gateway message identifier: {0}")]
    UnknownIdentifier(u8),

    #[error("Invalid message type: {0}")]
    InvalidMessageType(String),

    #[error("Unsupported LoRaWAN major version: {0}")]
    UnsupportedVersion(u8),

    #[error("Parameter out of range: {0}")]
    ParameterOutOfRange(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("MAC command error: {0}")]
    MacCommandError(String),

    #[error("Invalid MIC")]
    InvalidMic,

    #[error("Band plan error: {0}")]
    BandError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Nothing to send for device {0}")]
    NothingToSend(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Base64 error: {0}")]
    Base64Error(#[from] base64::DecodeError),
}

impl LoraNsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LoraNsError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, LoraNsError>;
