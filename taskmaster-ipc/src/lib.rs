//! Inter-process communication for taskmaster
//!
//! This crate provides the framed transport, the wire protocol, one-shot
//! response promises and the proxy multiplexing layer used for communication
//! between the coordinator and worker processes.

pub mod connection;
pub mod error;
pub mod promise;
pub mod protocol;
pub mod proxy;
pub mod transport;

// Re-export commonly used types
pub use connection::{HandlerError, MessageConnection, RequestEnvelope};
pub use error::IpcError;
pub use promise::{PromiseSet, ResponsePromise};
pub use protocol::{InstanceDescriptor, Message, MessageBody, RequestKind, RequestPayload, ResponsePayload};
pub use proxy::{ProxiedSocket, ProxySocket, DEFAULT_UNHANDLED_WATERMARK};
pub use transport::{wait_for_readable, FramedSocket, PairSocket, PipeSocket, MAX_FRAME_SIZE};
