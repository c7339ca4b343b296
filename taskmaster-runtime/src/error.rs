//! Runtime error types

use taskmaster_ipc::IpcError;
use thiserror::Error;

/// Errors raised while hosting tasks in a child process
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("ipc error: {0}")]
    Ipc(#[from] IpcError),

    #[error("io error: {0}")]
    Io(String),

    #[error("runtime error: {0}")]
    Other(String),
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Io(err.to_string())
    }
}
