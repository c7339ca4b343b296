//! IPC error types

use thiserror::Error;

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// IO error
    #[error("io error: {0}")]
    Io(String),

    /// Connection closed
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame length prefix exceeded the hard cap
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// The proxy accumulated more undelivered envelopes than allowed
    #[error("proxy buffer overflow: {0} undelivered envelopes")]
    ProxyOverflow(usize),

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),
}

impl IpcError {
    /// Check if this error indicates an unrecoverable endpoint state
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::Deserialization(_)
                | IpcError::FrameTooLarge(_)
                | IpcError::ProxyOverflow(_)
                | IpcError::InvalidMessage(_)
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Io(err.to_string())
    }
}

impl From<nix::errno::Errno> for IpcError {
    fn from(err: nix::errno::Errno) -> Self {
        IpcError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::Io(err.to_string())
        } else if err.is_data() {
            IpcError::Deserialization(err.to_string())
        } else {
            IpcError::Serialization(err.to_string())
        }
    }
}
