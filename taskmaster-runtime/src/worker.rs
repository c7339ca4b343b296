//! Child-side worker event loop
//!
//! The loop announces itself with a `Ready` handshake, then serves `RunTask`
//! requests through the registry until it is told to terminate or the
//! coordinator goes away. A running handler may call back into its
//! originating task; the loop keeps pumping the connection while that nested
//! exchange is in flight, so requests like `Terminate` are still dispatched.

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskmaster_ipc::{
    wait_for_readable, MessageConnection, PipeSocket, RequestEnvelope, RequestKind,
    RequestPayload, ResponsePayload,
};

use crate::error::RuntimeError;
use crate::executor::{panic_message, FunctionCaller, TaskContext, TaskFault, TaskRegistry};
use crate::spawn::{BOOTSTRAP_ENV, INSTANCE_ID_ENV};

/// Options for one worker child
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub instance_id: String,
    pub bootstrap: Option<PathBuf>,
    /// Upper bound on one blocking wait for socket readiness
    pub wait_time: Duration,
}

impl WorkerOptions {
    pub fn from_env() -> Self {
        Self {
            instance_id: std::env::var(INSTANCE_ID_ENV)
                .unwrap_or_else(|_| Uuid::new_v4().to_string()),
            bootstrap: std::env::var_os(BOOTSTRAP_ENV).map(PathBuf::from),
            wait_time: Duration::from_micros(1000),
        }
    }
}

/// Run the worker event loop over this process's stdin/stdout.
pub fn worker_main(registry: &TaskRegistry, options: WorkerOptions) -> Result<(), RuntimeError> {
    let socket = PipeSocket::from_stdio()?;
    let mut connection = MessageConnection::new(Box::new(socket));

    let running = Rc::new(Cell::new(true));
    {
        let running = running.clone();
        connection.on(RequestKind::Terminate, move |_| {
            running.set(false);
            Ok(JsonValue::Null)
        });
    }

    connection.send_request(RequestPayload::Ready {
        instance_id: options.instance_id.clone(),
    });
    info!(instance_id = %options.instance_id, "worker ready");

    while running.get() {
        let fds: Vec<RawFd> = connection.selectable_read_fd().into_iter().collect();
        wait_for_readable(&fds, options.wait_time)?;

        let requests = connection.update()?;
        for envelope in requests {
            handle_request(&mut connection, registry, &options, envelope, &running);
        }
        if !connection.is_open() {
            debug!("coordinator went away");
            break;
        }
    }

    info!(instance_id = %options.instance_id, "worker shutting down");
    Ok(())
}

fn handle_request(
    connection: &mut MessageConnection,
    registry: &TaskRegistry,
    options: &WorkerOptions,
    envelope: RequestEnvelope,
    running: &Rc<Cell<bool>>,
) {
    match &envelope.payload {
        RequestPayload::RunTask { handler, input } => {
            run_task(
                connection,
                registry,
                options,
                envelope.id,
                handler,
                input.clone(),
                running,
            );
        }
        _ => connection.reject_unknown(&envelope),
    }
}

fn run_task(
    connection: &mut MessageConnection,
    registry: &TaskRegistry,
    options: &WorkerOptions,
    request_id: u64,
    handler: &str,
    input: JsonValue,
    running: &Rc<Cell<bool>>,
) {
    let Some(task_fn) = registry.get(handler) else {
        warn!(handler, "unknown task handler");
        connection.send_response(
            request_id,
            ResponsePayload::Error {
                message: format!("unknown task handler: {handler}"),
            },
        );
        return;
    };

    debug!(handler, "running task");
    let payload = {
        let mut caller = ConnectionCaller {
            connection: &mut *connection,
            wait_time: options.wait_time,
            running,
        };
        let mut context =
            TaskContext::new(&mut caller, &options.instance_id, options.bootstrap.as_deref());
        match catch_unwind(AssertUnwindSafe(|| task_fn(input, &mut context))) {
            Ok(Ok(data)) => ResponsePayload::Result { data },
            Ok(Err(fault)) => ResponsePayload::Error {
                message: fault.to_string(),
            },
            Err(panic) => ResponsePayload::Exception {
                message: panic_message(panic.as_ref()),
                backtrace: None,
            },
        }
    };
    connection.send_response(request_id, payload);
}

/// Function caller that issues `ExecuteFunction` upstream and pumps the
/// connection until the correlated response arrives.
struct ConnectionCaller<'a> {
    connection: &'a mut MessageConnection,
    wait_time: Duration,
    running: &'a Rc<Cell<bool>>,
}

impl FunctionCaller for ConnectionCaller<'_> {
    fn call_function(&mut self, name: &str, args: JsonValue) -> Result<JsonValue, TaskFault> {
        let promise = self.connection.send_request(RequestPayload::ExecuteFunction {
            name: name.to_string(),
            args,
        });
        loop {
            if let Some(payload) = promise.result() {
                return match payload {
                    ResponsePayload::Result { data } => Ok(data),
                    ResponsePayload::Error { message } => Err(TaskFault::Callback(message)),
                    ResponsePayload::Exception { message, .. } => {
                        Err(TaskFault::Callback(message))
                    }
                    ResponsePayload::WorkerFailed { reason } => Err(TaskFault::Callback(reason)),
                };
            }
            if !self.running.get() {
                return Err(TaskFault::Callback(
                    "worker terminated while waiting for a callback result".to_string(),
                ));
            }
            if !self.connection.is_open() {
                return Err(TaskFault::Callback(
                    "connection closed while waiting for a callback result".to_string(),
                ));
            }

            let fds: Vec<RawFd> = self.connection.selectable_read_fd().into_iter().collect();
            wait_for_readable(&fds, self.wait_time)
                .map_err(|e| TaskFault::Callback(e.to_string()))?;
            let requests = self
                .connection
                .update()
                .map_err(|e| TaskFault::Callback(e.to_string()))?;
            for envelope in requests {
                // a nested RunTask while one is active is a protocol violation
                self.connection.reject_unknown(&envelope);
            }
        }
    }
}
