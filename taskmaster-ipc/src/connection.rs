//! Request/response connection with a handler mux
//!
//! A [`MessageConnection`] owns one framed socket, allocates monotonic
//! message ids, keeps the pending-request map and dispatches incoming
//! requests to registered handlers. Handlers are synchronous with respect to
//! the pump and must not block; long-running work is structured as further
//! request/response exchanges over subsequent pumps.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value as JsonValue;
use tracing::warn;

use crate::error::IpcError;
use crate::promise::{PromiseSet, ResponsePromise};
use crate::protocol::{Message, MessageBody, RequestKind, RequestPayload, ResponsePayload};
use crate::transport::FramedSocket;

/// An incoming request: its message id plus the decoded payload.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub id: u64,
    pub payload: RequestPayload,
}

/// Failure modes of a request handler.
#[derive(Debug)]
pub enum HandlerError {
    /// The handler declined the request; answered with an error response.
    Rejected(String),
    /// The handler raised; answered with an exception response.
    Raised {
        message: String,
        backtrace: Option<String>,
    },
}

type RequestHandler = Box<dyn FnMut(&RequestEnvelope) -> Result<JsonValue, HandlerError>>;

fn panic_to_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "request handler panicked".to_string()
    }
}

pub struct MessageConnection {
    socket: Box<dyn FramedSocket>,
    next_id: u64,
    pending: HashMap<u64, ResponsePromise>,
    handlers: HashMap<RequestKind, RequestHandler>,
    continuations: PromiseSet,
}

impl MessageConnection {
    pub fn new(socket: Box<dyn FramedSocket>) -> Self {
        Self {
            socket,
            next_id: 1,
            pending: HashMap::new(),
            handlers: HashMap::new(),
            continuations: PromiseSet::new(),
        }
    }

    /// Register a handler for one request kind, replacing any previous one.
    pub fn on<F>(&mut self, kind: RequestKind, handler: F)
    where
        F: FnMut(&RequestEnvelope) -> Result<JsonValue, HandlerError> + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Send a request and return the promise for its response. Local send
    /// failures resolve the promise with a synthetic `WorkerFailed`.
    pub fn send_request(&mut self, payload: RequestPayload) -> ResponsePromise {
        let id = self.allocate_id();
        let promise = ResponsePromise::new();
        let message = Message::request(id, payload);
        match serde_json::to_vec(&message) {
            Ok(bytes) => {
                if self.socket.send(&bytes) {
                    self.pending.insert(id, promise.clone());
                } else {
                    promise.resolve(ResponsePayload::WorkerFailed {
                        reason: "socket closed before the request could be sent".to_string(),
                    });
                    self.continuations.track(&promise);
                }
            }
            Err(err) => {
                promise.resolve(ResponsePayload::WorkerFailed {
                    reason: format!("failed to encode request: {err}"),
                });
                self.continuations.track(&promise);
            }
        }
        promise
    }

    /// Send a response correlated to a prior request.
    pub fn send_response(&mut self, request_id: u64, payload: ResponsePayload) -> bool {
        let message = Message::response(self.allocate_id(), request_id, payload);
        match serde_json::to_vec(&message) {
            Ok(bytes) => self.socket.send(&bytes),
            Err(err) => {
                warn!(request_id, error = %err, "failed to encode response");
                false
            }
        }
    }

    /// Pump the socket once: drain frames, answer requests with registered
    /// handlers, resolve pending promises, run due continuations. Requests
    /// nobody registered for are returned to the owner.
    pub fn update(&mut self) -> Result<Vec<RequestEnvelope>, IpcError> {
        let mut unclaimed = Vec::new();
        for frame in self.socket.receive() {
            let message: Message = serde_json::from_slice(&frame)
                .map_err(|e| IpcError::Deserialization(e.to_string()))?;
            match message.body {
                MessageBody::Request { payload } => {
                    let envelope = RequestEnvelope {
                        id: message.id,
                        payload,
                    };
                    let kind = envelope.payload.kind();
                    match self.handlers.remove(&kind) {
                        Some(mut handler) => {
                            let result =
                                catch_unwind(AssertUnwindSafe(|| handler(&envelope)));
                            self.handlers.insert(kind, handler);
                            let payload = match result {
                                Ok(Ok(data)) => ResponsePayload::Result { data },
                                Ok(Err(HandlerError::Rejected(message))) => {
                                    ResponsePayload::Error { message }
                                }
                                Ok(Err(HandlerError::Raised { message, backtrace })) => {
                                    ResponsePayload::Exception { message, backtrace }
                                }
                                Err(panic) => {
                                    warn!(kind = %kind, "request handler panicked");
                                    ResponsePayload::Exception {
                                        message: panic_to_message(panic.as_ref()),
                                        backtrace: None,
                                    }
                                }
                            };
                            self.send_response(envelope.id, payload);
                        }
                        None => unclaimed.push(envelope),
                    }
                }
                MessageBody::Response {
                    request_id,
                    payload,
                } => match self.pending.remove(&request_id) {
                    Some(promise) => {
                        promise.resolve(payload);
                        self.continuations.track(&promise);
                    }
                    None => {
                        warn!(request_id, "dropping response with no matching request");
                    }
                },
            }
        }
        self.continuations.pump();
        Ok(unclaimed)
    }

    /// Answer a request no handler claimed with a protocol error.
    pub fn reject_unknown(&mut self, envelope: &RequestEnvelope) {
        warn!(kind = %envelope.payload.kind(), "unknown request type");
        self.send_response(
            envelope.id,
            ResponsePayload::Error {
                message: format!("unknown request type: {}", envelope.payload.kind()),
            },
        );
    }

    /// Resolve every in-flight request with a synthetic failure.
    pub fn fail_pending(&mut self, reason: &str) {
        for (_, promise) in self.pending.drain() {
            promise.resolve(ResponsePayload::WorkerFailed {
                reason: reason.to_string(),
            });
            self.continuations.track(&promise);
        }
        self.continuations.pump();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_open()
    }

    pub fn close(&mut self) {
        self.socket.close();
    }

    pub fn selectable_read_fd(&self) -> Option<RawFd> {
        self.socket.selectable_read_fd()
    }
}
