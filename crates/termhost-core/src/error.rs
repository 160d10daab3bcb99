use thiserror::Error;

/// Errors produced by the terminal session layer.
#[derive(Debug, Error)]
pub enum TermError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("max sessions ({0}) reached")]
    LimitReached(usize),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl TermError {
    /// Stable machine-readable code, copied into wire error responses.
    pub fn code(&self) -> &'static str {
        match self {
            TermError::InvalidArgument(_) => "invalid_argument",
            TermError::AlreadyExists(_) => "already_exists",
            TermError::NotFound(_) => "not_found",
            TermError::LimitReached(_) => "limit_reached",
            TermError::Spawn(_) => "spawn_failed",
            TermError::Pty(_) => "pty_error",
            TermError::Config(_) => "config_error",
            TermError::Transport(_) => "transport_error",
            TermError::InvalidMessage(_) => "invalid_message",
            TermError::Io(_) => "io_error",
            TermError::Other(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for TermError {
    fn from(e: serde_json::Error) -> Self {
        TermError::InvalidMessage(e.to_string())
    }
}

pub type TermResult<T> = Result<T, TermError>;
