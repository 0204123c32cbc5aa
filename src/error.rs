use std::path::PathBuf;

use thiserror::Error;

/// Wire message parsing errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("invalid message format")]
    MissingFields,

    #[error("invalid timestamp \"{0}\"")]
    InvalidTimestamp(String),

    #[error("invalid satellite \"{0}\"")]
    InvalidSatellite(String),

    #[error("invalid TEC value \"{0}\"")]
    InvalidValue(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode \"{}\": {reason}", path.display())]
    Decode { path: PathBuf, reason: String },

    #[error("failed to publish on \"{topic}\": {reason}")]
    Publish { topic: String, reason: String },

    #[error("failed to subscribe to \"{topic}\": {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("config file: {0}")]
    ConfigFile(#[from] serde_json::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),
}
