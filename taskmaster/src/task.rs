//! Task and task factory abstractions
//!
//! A task is a unit of work with an optional group label, the name of the
//! handler entry point that runs it in a worker, and result/error callbacks.
//! Exactly one of `handle_result`/`handle_error` fires over a task's
//! lifetime. A task may additionally expose named functions the worker-side
//! handler can invoke while it runs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use taskmaster_ipc::ResponsePayload;

/// Shared handle to a task
pub type TaskRef = Rc<RefCell<dyn Task>>;

/// Failure delivered to [`Task::handle_error`]
#[derive(Debug, Clone, PartialEq)]
pub enum TaskError {
    /// The handler rejected the task
    Failed { message: String },
    /// The handler raised in the worker
    Raised {
        message: String,
        backtrace: Option<String>,
    },
    /// The worker died before producing a result
    WorkerFailed { reason: String },
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Failed { message } => write!(f, "task failed: {message}"),
            TaskError::Raised { message, .. } => write!(f, "task raised: {message}"),
            TaskError::WorkerFailed { reason } => write!(f, "worker failed: {reason}"),
        }
    }
}

/// Error returned by [`Task::call`]
#[derive(Debug, Error)]
pub enum CallError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("{0}")]
    Failed(String),
}

/// A unit of work dispatched to a worker
pub trait Task {
    /// Group label used by the scheduler to match compatible workers.
    fn group(&self) -> Option<&str> {
        None
    }

    /// Name of the handler entry point that executes this task.
    fn handler(&self) -> &str;

    /// Input payload shipped to the worker alongside the handler name.
    fn input(&self) -> JsonValue {
        JsonValue::Null
    }

    /// Called exactly once with the handler's output.
    fn handle_result(&mut self, data: JsonValue);

    /// Called exactly once when the task failed.
    fn handle_error(&mut self, error: TaskError);

    /// Invoke a named function on this task on behalf of the worker-side
    /// handler. Unknown names are rejected.
    fn call(&mut self, name: &str, args: JsonValue) -> Result<JsonValue, CallError> {
        let _ = args;
        Err(CallError::UnknownFunction(name.to_string()))
    }
}

/// Lazy producer of tasks, optionally restricted to a set of groups
pub trait TaskFactory {
    /// Groups this factory serves. `None` serves any group.
    fn groups(&self) -> Option<Vec<String>> {
        None
    }

    /// The next task for the given group, or `None` when the factory is
    /// exhausted for that group (possibly temporarily).
    fn create_next_task(&mut self, group: Option<&str>) -> Option<TaskRef>;
}

type ResultCallback = Box<dyn FnMut(JsonValue)>;
type ErrorCallback = Box<dyn FnMut(TaskError)>;
type TaskFunction = Box<dyn FnMut(JsonValue) -> Result<JsonValue, CallError>>;

/// Convenience [`Task`] assembled from closures.
pub struct ClosureTask {
    group: Option<String>,
    handler: String,
    input: JsonValue,
    on_result: Option<ResultCallback>,
    on_error: Option<ErrorCallback>,
    functions: HashMap<String, TaskFunction>,
    finished: bool,
}

impl ClosureTask {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            group: None,
            handler: handler.into(),
            input: JsonValue::Null,
            on_result: None,
            on_error: None,
            functions: HashMap::new(),
            finished: false,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_input(mut self, input: JsonValue) -> Self {
        self.input = input;
        self
    }

    pub fn on_result(mut self, callback: impl FnMut(JsonValue) + 'static) -> Self {
        self.on_result = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl FnMut(TaskError) + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn with_function(
        mut self,
        name: impl Into<String>,
        function: impl FnMut(JsonValue) -> Result<JsonValue, CallError> + 'static,
    ) -> Self {
        self.functions.insert(name.into(), Box::new(function));
        self
    }

    /// Whether one of the callbacks has fired.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Task for ClosureTask {
    fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    fn handler(&self) -> &str {
        &self.handler
    }

    fn input(&self) -> JsonValue {
        self.input.clone()
    }

    fn handle_result(&mut self, data: JsonValue) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(callback) = &mut self.on_result {
            callback(data);
        }
    }

    fn handle_error(&mut self, error: TaskError) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(callback) = &mut self.on_error {
            callback(error);
        }
    }

    fn call(&mut self, name: &str, args: JsonValue) -> Result<JsonValue, CallError> {
        match self.functions.get_mut(name) {
            Some(function) => function(args),
            None => Err(CallError::UnknownFunction(name.to_string())),
        }
    }
}

/// Deliver a response payload to the task's terminal callback.
pub(crate) fn dispatch_task_payload(task: &TaskRef, payload: ResponsePayload) {
    match payload {
        ResponsePayload::Result { data } => task.borrow_mut().handle_result(data),
        ResponsePayload::Error { message } => task
            .borrow_mut()
            .handle_error(TaskError::Failed { message }),
        ResponsePayload::Exception { message, backtrace } => task
            .borrow_mut()
            .handle_error(TaskError::Raised { message, backtrace }),
        ResponsePayload::WorkerFailed { reason } => task
            .borrow_mut()
            .handle_error(TaskError::WorkerFailed { reason }),
    }
}
