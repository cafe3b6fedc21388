use thiserror::Error;

/// Violations of the multi-frame message layout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Message has no frames")]
    Empty,
}

#[derive(Error, Debug)]
pub enum ZmwsError {
    #[error("Transport error: {0}")]
    Transport(#[from] zeromq::ZmqError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out waiting for a reply")]
    Timeout,

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

pub type Result<T> = std::result::Result<T, ZmwsError>;
