use std::path::PathBuf;

/// Core error type for the fleet.
///
/// Adapter crates map their specific errors into this type so the core can
/// decide per failure class whether to skip a bot, mark a session errored, or
/// answer a single message with a fallback.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// The transport rejected the bot's credentials. Never retried automatically.
    #[error("transport authentication failed: {0}")]
    TransportAuth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::TransportAuth(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
