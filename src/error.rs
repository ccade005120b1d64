use std::io;

use thiserror::Error;

/// Errors returned by the eventline core.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket, epoll, or other syscall failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Configuration value out of range.
    #[error("config: {0}")]
    Config(String),
    /// Invalid connection token (stale or out of range).
    #[error("invalid connection")]
    InvalidConnection,
}
