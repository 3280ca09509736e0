use std::path::PathBuf;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Not the leader: '{key}' is leader-writable only")]
    NotLeader { key: String },

    #[error("Secret generation failed: {0}")]
    SecretGeneration(String),

    #[error("Config I/O error on {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config document {} (line {line}): {reason}", path.display())]
    ConfigParse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Invalid entry for {}: {reason}", path.display())]
    InvalidEntry { path: PathBuf, reason: String },

    #[error("Shared settings error: {0}")]
    Settings(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Process control error: {0}")]
    Process(String),

    #[error("Handshake error: {0}")]
    Handshake(String),
}

impl AppError {
    pub fn not_leader<S: Into<String>>(key: S) -> Self {
        Self::NotLeader { key: key.into() }
    }

    pub fn config_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ConfigIo {
            path: path.into(),
            source,
        }
    }

    pub fn settings<S: Into<String>>(msg: S) -> Self {
        Self::Settings(msg.into())
    }

    pub fn process<S: Into<String>>(msg: S) -> Self {
        Self::Process(msg.into())
    }

    /// Errors that must halt the security transition instead of being
    /// retried on the next event.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SecretGeneration(_))
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
