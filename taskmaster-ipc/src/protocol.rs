//! Wire protocol definitions and message types
//!
//! Every frame on the wire carries one JSON-encoded [`Message`]. Message ids
//! are allocated monotonically per endpoint; a response echoes the id of the
//! request it answers in `request_id`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::path::PathBuf;

/// One protocol message: a unique id plus a request or response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    pub fn request(id: u64, payload: RequestPayload) -> Self {
        Self {
            id,
            body: MessageBody::Request { payload },
        }
    }

    pub fn response(id: u64, request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            id,
            body: MessageBody::Response { request_id, payload },
        }
    }
}

/// Request or response discriminator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Request {
        #[serde(flatten)]
        payload: RequestPayload,
    },
    Response {
        request_id: u64,
        #[serde(flatten)]
        payload: ResponsePayload,
    },
}

/// Requests exchanged between coordinator, workers and proxy runtimes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestPayload {
    /// Execute the named task entry point with the given input
    RunTask { handler: String, input: JsonValue },

    /// Worker-to-coordinator callback invoking a function on the running task
    ExecuteFunction { name: String, args: JsonValue },

    /// Startup handshake announcing a worker is ready for tasks
    Ready { instance_id: String },

    /// Ask a proxy runtime to spawn and host a new worker instance
    StartWorkerInstance { descriptor: InstanceDescriptor },

    /// Ask a proxy runtime to stop a hosted worker instance; also sent
    /// upstream by the runtime when a hosted worker dies on its own
    StopWorkerInstance { instance_id: String },

    /// Shut down the receiving endpoint's event loop
    Terminate,
}

impl RequestPayload {
    /// Dispatch tag used by the request handler table
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::RunTask { .. } => RequestKind::RunTask,
            RequestPayload::ExecuteFunction { .. } => RequestKind::ExecuteFunction,
            RequestPayload::Ready { .. } => RequestKind::Ready,
            RequestPayload::StartWorkerInstance { .. } => RequestKind::StartWorkerInstance,
            RequestPayload::StopWorkerInstance { .. } => RequestKind::StopWorkerInstance,
            RequestPayload::Terminate => RequestKind::Terminate,
        }
    }
}

/// Request type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    RunTask,
    ExecuteFunction,
    Ready,
    StartWorkerInstance,
    StopWorkerInstance,
    Terminate,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::RunTask => "run_task",
            RequestKind::ExecuteFunction => "execute_function",
            RequestKind::Ready => "ready",
            RequestKind::StartWorkerInstance => "start_worker_instance",
            RequestKind::StopWorkerInstance => "stop_worker_instance",
            RequestKind::Terminate => "terminate",
        };
        f.write_str(name)
    }
}

/// Responses correlated to a prior request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    /// Successful result produced by the request handler
    Result { data: JsonValue },

    /// The handler rejected the request
    Error { message: String },

    /// The handler raised while processing the request
    Exception {
        message: String,
        backtrace: Option<String>,
    },

    /// Synthetic response injected when the owning worker fails mid-request
    WorkerFailed { reason: String },
}

impl ResponsePayload {
    pub fn ok(data: JsonValue) -> Self {
        ResponsePayload::Result { data }
    }

    /// Whether this payload reports any kind of failure
    pub fn is_err(&self) -> bool {
        !matches!(self, ResponsePayload::Result { .. })
    }
}

/// Everything a proxy runtime needs to spawn a hosted worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub instance_id: String,
    /// Worker executable; the hosting process falls back to its own binary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let message = Message::request(
            7,
            RequestPayload::RunTask {
                handler: "echo".to_string(),
                input: json!({"value": 42}),
            },
        );

        let encoded = serde_json::to_vec(&message).unwrap();
        let decoded: Message = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_response_round_trip() {
        let message = Message::response(
            9,
            7,
            ResponsePayload::Exception {
                message: "boom".to_string(),
                backtrace: None,
            },
        );

        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, message);
        match decoded.body {
            MessageBody::Response { request_id, payload } => {
                assert_eq!(request_id, 7);
                assert!(payload.is_err());
            }
            _ => panic!("expected a response body"),
        }
    }

    #[test]
    fn test_terminate_is_a_bare_tag() {
        let message = Message::request(1, RequestPayload::Terminate);
        let encoded = serde_json::to_string(&message).unwrap();
        assert!(encoded.contains("\"terminate\""));
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.body.clone(), message.body);
    }

    #[test]
    fn test_request_kind_tags() {
        let payload = RequestPayload::ExecuteFunction {
            name: "computeHelper".to_string(),
            args: json!(7),
        };
        assert_eq!(payload.kind(), RequestKind::ExecuteFunction);
        assert_eq!(payload.kind().to_string(), "execute_function");
    }
}
