//! Error definitions for A55Link

use thiserror::Error;

/// A55Link error types
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Range {offset:#x}+{size} exceeds shared region of {region} bytes")]
    OutOfBounds { offset: u64, size: u64, region: u64 },

    #[error("Timeout")]
    Timeout,

    #[error("Queue full, dropped: {0}")]
    QueueFull(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Shutdown in progress")]
    Shutdown,
}

impl LinkError {
    pub fn config(msg: impl Into<String>) -> Self {
        LinkError::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        LinkError::Protocol(msg.into())
    }

    pub fn notification(msg: impl Into<String>) -> Self {
        LinkError::Notification(msg.into())
    }

    pub fn collaborator(msg: impl Into<String>) -> Self {
        LinkError::Collaborator(msg.into())
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        LinkError::Channel(msg.into())
    }
}

/// Result type alias for A55Link operations
pub type LinkResult<T> = Result<T, LinkError>;
