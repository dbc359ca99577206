use thiserror::Error;

/// Errors surfaced by the library API (node construction, transport setup).
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Prefix string is required for dsync")]
    InvalidPrefix,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Connection-level failure while sending an event record to a peer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request to {peer} failed: {message}")]
    Request { peer: String, message: String },

    #[error("Failed to build HTTP client: {0}")]
    Build(String),

    #[error("Invalid peer address: {0}")]
    InvalidPeer(String),
}

/// Failure inside a handler body. Converted to an `{error: ...}` result by the
/// dispatcher; never propagates past it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("Handler dropped its responder without responding")]
    Dropped,
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::Failed(e.to_string())
    }
}

/// Daemon-level errors (binary only).
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Sync(#[from] SyncError),
}
