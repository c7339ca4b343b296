//! Error types for task orchestration

use taskmaster_ipc::IpcError;
use taskmaster_runtime::RuntimeError;
use thiserror::Error;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("worker error: {0}")]
    Worker(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("ipc error: {0}")]
    Ipc(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<IpcError> for ExecutionError {
    fn from(err: IpcError) -> Self {
        ExecutionError::Ipc(err.to_string())
    }
}

impl From<RuntimeError> for ExecutionError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Spawn(message) => ExecutionError::Spawn(message),
            other => ExecutionError::Worker(other.to_string()),
        }
    }
}
