//! Per-child worker state machine
//!
//! An instance owns one message connection to a backing child (a spawned
//! process or a channel tunneled through a proxy), tracks the startup
//! handshake, runs at most one task at a time and maps every failure mode
//! onto a synthetic `WorkerFailed` for whatever was in flight.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

use taskmaster_ipc::{
    FramedSocket, HandlerError, InstanceDescriptor, MessageConnection, RequestKind,
    RequestPayload, ResponsePayload, ResponsePromise,
};
use taskmaster_runtime::{spawn_child, ChildProcess, ChildRole, SpawnSpec};

use crate::error::ExecutionError;
use crate::proxy::ProxyRef;
use crate::task::{dispatch_task_payload, TaskError, TaskRef};

/// How long a freshly started child may take to announce itself
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Worker lifecycle states. `Available` is the scheduler-facing alias for an
/// idle instance whose handshake completed; instances themselves report
/// `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Idle,
    Working,
    Available,
    Failed,
    Finished,
}

/// One worker instance: the per-child state machine.
pub trait WorkerInstance {
    fn id(&self) -> &str;

    fn status(&self) -> WorkerStatus;

    /// Promise resolving once the startup handshake completed, rejecting on
    /// spawn failure or handshake timeout.
    fn started(&self) -> ResponsePromise;

    /// Pump I/O and advance the state machine.
    fn update(&mut self);

    /// Dispatch a task. Precondition: the instance is idle.
    fn run_task(&mut self, task: TaskRef) -> Result<ResponsePromise, ExecutionError>;

    /// Terminate the backing child and transition to `Finished`. A task in
    /// flight is failed with a synthetic `WorkerFailed`.
    fn stop(&mut self);

    /// Idempotent failure handling: fails whatever is in flight and
    /// transitions to `Failed`. Does not restart.
    fn handle_fail(&mut self, reason: &str);

    fn collect_read_fds(&self, fds: &mut Vec<RawFd>);
}

/// Worker instance backed by a framed socket to a real child.
pub struct SocketWorkerInstance {
    id: String,
    connection: MessageConnection,
    child: Option<ChildProcess>,
    proxy: Option<ProxyRef>,
    /// Response to the proxy-side spawn request, for proxied instances
    spawn_promise: Option<ResponsePromise>,
    start_promise: ResponsePromise,
    handshake_seen: Rc<Cell<bool>>,
    handshake_deadline: Instant,
    status: WorkerStatus,
    current_task: Rc<RefCell<Option<TaskRef>>>,
    current_response: Option<ResponsePromise>,
}

impl SocketWorkerInstance {
    /// Spawn a worker child process and connect to it.
    pub fn spawn(descriptor: &InstanceDescriptor) -> Result<Self, ExecutionError> {
        let spec = SpawnSpec {
            role: ChildRole::Worker,
            executable: descriptor.executable.clone(),
            bootstrap: descriptor.bootstrap.clone(),
            instance_id: descriptor.instance_id.clone(),
        };
        let (child, socket) = spawn_child(&spec)?;
        Ok(Self::new(
            descriptor.instance_id.clone(),
            Box::new(socket),
            Some(child),
            None,
            None,
            DEFAULT_HANDSHAKE_TIMEOUT,
        ))
    }

    /// Route a worker instance through a proxy runtime.
    pub fn proxied(proxy: ProxyRef, descriptor: InstanceDescriptor) -> Result<Self, ExecutionError> {
        let socket = proxy
            .borrow_mut()
            .open_instance_socket(&descriptor.instance_id)?;
        let spawn_promise = proxy
            .borrow_mut()
            .start_worker_instance(descriptor.clone())?;
        Ok(Self::new(
            descriptor.instance_id,
            Box::new(socket),
            None,
            Some(proxy),
            Some(spawn_promise),
            DEFAULT_HANDSHAKE_TIMEOUT,
        ))
    }

    /// Attach to an already-connected channel; useful for custom transports.
    pub fn over_socket(socket: Box<dyn FramedSocket>, handshake_timeout: Duration) -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            socket,
            None,
            None,
            None,
            handshake_timeout,
        )
    }

    fn new(
        id: String,
        socket: Box<dyn FramedSocket>,
        child: Option<ChildProcess>,
        proxy: Option<ProxyRef>,
        spawn_promise: Option<ResponsePromise>,
        handshake_timeout: Duration,
    ) -> Self {
        let mut connection = MessageConnection::new(socket);

        let handshake_seen = Rc::new(Cell::new(false));
        {
            let seen = handshake_seen.clone();
            connection.on(RequestKind::Ready, move |_| {
                seen.set(true);
                Ok(JsonValue::Null)
            });
        }

        let current_task: Rc<RefCell<Option<TaskRef>>> = Rc::new(RefCell::new(None));
        {
            let cell = current_task.clone();
            connection.on(RequestKind::ExecuteFunction, move |envelope| {
                let RequestPayload::ExecuteFunction { name, args } = &envelope.payload else {
                    return Err(HandlerError::Rejected("malformed request".to_string()));
                };
                let task = cell.borrow().clone();
                match task {
                    Some(task) => task
                        .borrow_mut()
                        .call(name, args.clone())
                        .map_err(|e| HandlerError::Rejected(e.to_string())),
                    None => Err(HandlerError::Rejected(
                        "no task is currently running".to_string(),
                    )),
                }
            });
        }

        Self {
            id,
            connection,
            child,
            proxy,
            spawn_promise,
            start_promise: ResponsePromise::new(),
            handshake_seen,
            handshake_deadline: Instant::now() + handshake_timeout,
            status: WorkerStatus::Starting,
            current_task,
            current_response: None,
        }
    }

    /// Fail whatever is in flight with a synthetic response.
    fn abort_in_flight(&mut self, reason: &str) {
        if let Some(promise) = self.current_response.take() {
            promise.resolve(ResponsePayload::WorkerFailed {
                reason: reason.to_string(),
            });
            promise.fire();
        }
        let task = self.current_task.borrow_mut().take();
        if let Some(task) = task {
            task.borrow_mut().handle_error(TaskError::WorkerFailed {
                reason: reason.to_string(),
            });
        }
    }

    fn finalize_completed(&mut self) {
        let Some(promise) = &self.current_response else {
            return;
        };
        let Some(payload) = promise.result() else {
            return;
        };
        self.current_response = None;
        let task = self.current_task.borrow_mut().take();
        if let Some(task) = task {
            dispatch_task_payload(&task, payload);
        }
        if self.status == WorkerStatus::Working {
            self.status = WorkerStatus::Idle;
        }
    }
}

impl WorkerInstance for SocketWorkerInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> WorkerStatus {
        self.status
    }

    fn started(&self) -> ResponsePromise {
        self.start_promise.clone()
    }

    fn update(&mut self) {
        if matches!(self.status, WorkerStatus::Failed | WorkerStatus::Finished) {
            return;
        }

        // catch silent child exits without waiting for the next read
        if let Some(child) = &mut self.child {
            if !child.is_alive() {
                self.handle_fail("worker process exited unexpectedly");
                return;
            }
        }

        if let Some(spawn) = &self.spawn_promise {
            match spawn.result() {
                Some(ResponsePayload::Result { .. }) => {
                    self.spawn_promise = None;
                }
                Some(other) => {
                    let reason = match other {
                        ResponsePayload::Error { message } => message,
                        ResponsePayload::Exception { message, .. } => message,
                        ResponsePayload::WorkerFailed { reason } => reason,
                        ResponsePayload::Result { .. } => unreachable!(),
                    };
                    self.handle_fail(&format!("proxy could not start the instance: {reason}"));
                    return;
                }
                None => {}
            }
        }

        match self.connection.update() {
            Ok(requests) => {
                for envelope in requests {
                    self.connection.reject_unknown(&envelope);
                }
            }
            Err(err) => {
                self.handle_fail(&format!("transport failure: {err}"));
                return;
            }
        }

        if !self.connection.is_open() {
            self.handle_fail("connection closed unexpectedly");
            return;
        }

        if self.status == WorkerStatus::Starting {
            if self.handshake_seen.get() {
                debug!(instance_id = %self.id, "worker handshake completed");
                self.status = WorkerStatus::Idle;
                self.start_promise
                    .resolve(ResponsePayload::Result { data: JsonValue::Null });
            } else if Instant::now() >= self.handshake_deadline {
                self.handle_fail("handshake timed out");
                return;
            }
        }

        self.finalize_completed();
        self.start_promise.fire();
    }

    fn run_task(&mut self, task: TaskRef) -> Result<ResponsePromise, ExecutionError> {
        if self.status != WorkerStatus::Idle {
            return Err(ExecutionError::InvalidState(format!(
                "worker instance {} is {:?}, not idle",
                self.id, self.status
            )));
        }
        let (handler, input) = {
            let task = task.borrow();
            (task.handler().to_string(), task.input())
        };
        debug!(instance_id = %self.id, handler = %handler, "dispatching task");
        let promise = self
            .connection
            .send_request(RequestPayload::RunTask { handler, input });
        *self.current_task.borrow_mut() = Some(task);
        self.current_response = Some(promise.clone());
        self.status = WorkerStatus::Working;
        Ok(promise)
    }

    fn stop(&mut self) {
        if matches!(self.status, WorkerStatus::Failed | WorkerStatus::Finished) {
            return;
        }
        debug!(instance_id = %self.id, "stopping worker instance");
        self.connection.send_request(RequestPayload::Terminate);
        self.abort_in_flight("worker stopped");
        self.connection.fail_pending("worker stopped");
        if let Some(proxy) = &self.proxy {
            let _ = proxy.borrow_mut().stop_worker_instance(&self.id);
        }
        self.connection.close();
        if let Some(child) = &mut self.child {
            child.stop(Duration::from_secs(2));
        }
        self.status = WorkerStatus::Finished;
    }

    fn handle_fail(&mut self, reason: &str) {
        if matches!(self.status, WorkerStatus::Failed | WorkerStatus::Finished) {
            return;
        }
        warn!(instance_id = %self.id, reason, "worker instance failed");
        self.status = WorkerStatus::Failed;
        self.start_promise.reject(reason);
        self.abort_in_flight(reason);
        self.connection.fail_pending(reason);
        self.connection.close();
        if let Some(child) = &mut self.child {
            child.kill();
        }
        if let Some(proxy) = &self.proxy {
            let _ = proxy.borrow_mut().stop_worker_instance(&self.id);
        }
        self.start_promise.fire();
    }

    fn collect_read_fds(&self, fds: &mut Vec<RawFd>) {
        if let Some(fd) = self.connection.selectable_read_fd() {
            fds.push(fd);
        }
    }
}
