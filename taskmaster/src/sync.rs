//! Synchronous worker instance
//!
//! Runs task handlers in-process instead of dispatching them to a child.
//! Function callbacks go straight to the originating task, and the returned
//! promise is already resolved; its continuations fire on the next pump.

use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use taskmaster_ipc::{PromiseSet, ResponsePayload, ResponsePromise};
use taskmaster_runtime::{panic_message, FunctionCaller, TaskContext, TaskFault, TaskRegistry};

use crate::error::ExecutionError;
use crate::instance::{WorkerInstance, WorkerStatus};
use crate::task::{dispatch_task_payload, TaskRef};

pub struct SyncWorkerInstance {
    id: String,
    registry: Arc<TaskRegistry>,
    status: WorkerStatus,
    start_promise: ResponsePromise,
    continuations: PromiseSet,
}

impl SyncWorkerInstance {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        // no handshake: an in-process worker is ready immediately
        let start_promise = ResponsePromise::new();
        start_promise.resolve(ResponsePayload::Result {
            data: JsonValue::Null,
        });
        let mut continuations = PromiseSet::new();
        continuations.track(&start_promise);
        Self {
            id: Uuid::new_v4().to_string(),
            registry,
            status: WorkerStatus::Idle,
            start_promise,
            continuations,
        }
    }
}

/// Direct function dispatch into the originating task.
struct DirectCaller {
    task: TaskRef,
}

impl FunctionCaller for DirectCaller {
    fn call_function(&mut self, name: &str, args: JsonValue) -> Result<JsonValue, TaskFault> {
        self.task
            .borrow_mut()
            .call(name, args)
            .map_err(|e| TaskFault::Callback(e.to_string()))
    }
}

impl WorkerInstance for SyncWorkerInstance {
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
        self.continuations.pump();
    }

    fn run_task(&mut self, task: TaskRef) -> Result<ResponsePromise, ExecutionError> {
        if self.status != WorkerStatus::Idle {
            return Err(ExecutionError::InvalidState(format!(
                "worker instance {} is {:?}, not idle",
                self.id, self.status
            )));
        }
        let (handler_name, input) = {
            let task = task.borrow();
            (task.handler().to_string(), task.input())
        };
        debug!(instance_id = %self.id, handler = %handler_name, "running task in-process");
        self.status = WorkerStatus::Working;

        let payload = match self.registry.get(&handler_name) {
            None => ResponsePayload::Error {
                message: format!("unknown task handler: {handler_name}"),
            },
            Some(task_fn) => {
                let mut caller = DirectCaller { task: task.clone() };
                let mut context = TaskContext::new(&mut caller, &self.id, None);
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
            }
        };

        self.status = WorkerStatus::Idle;
        dispatch_task_payload(&task, payload.clone());

        let promise = ResponsePromise::new();
        promise.resolve(payload);
        self.continuations.track(&promise);
        Ok(promise)
    }

    fn stop(&mut self) {
        if self.status != WorkerStatus::Failed {
            self.status = WorkerStatus::Finished;
        }
    }

    fn handle_fail(&mut self, reason: &str) {
        if matches!(self.status, WorkerStatus::Failed | WorkerStatus::Finished) {
            return;
        }
        debug!(instance_id = %self.id, reason, "synchronous worker failed");
        self.status = WorkerStatus::Failed;
        self.start_promise.reject(reason);
    }

    fn collect_read_fds(&self, _fds: &mut Vec<RawFd>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ClosureTask, TaskError};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn registry() -> Arc<TaskRegistry> {
        let mut registry = TaskRegistry::new();
        registry.register("echo", |input, _context| Ok(input));
        registry.register("relay", |input, context| {
            context.call_function("computeHelper", input)
        });
        registry.register("boom", |_input, _context| -> Result<JsonValue, TaskFault> {
            panic!("intentional panic")
        });
        Arc::new(registry)
    }

    #[test]
    fn test_runs_task_and_resolves_promise() {
        let mut instance = SyncWorkerInstance::new(registry());
        let results = Rc::new(RefCell::new(Vec::new()));
        let log = results.clone();
        let task: TaskRef = Rc::new(RefCell::new(
            ClosureTask::new("echo")
                .with_input(json!("ping"))
                .on_result(move |data| log.borrow_mut().push(data)),
        ));

        let promise = instance.run_task(task).unwrap();
        assert_eq!(instance.status(), WorkerStatus::Idle);
        assert_eq!(*results.borrow(), vec![json!("ping")]);
        assert_eq!(
            promise.result(),
            Some(ResponsePayload::Result {
                data: json!("ping")
            })
        );
    }

    #[test]
    fn test_function_callback_goes_to_the_task() {
        let mut instance = SyncWorkerInstance::new(registry());
        let results = Rc::new(RefCell::new(Vec::new()));
        let log = results.clone();
        let task: TaskRef = Rc::new(RefCell::new(
            ClosureTask::new("relay")
                .with_input(json!(7))
                .with_function("computeHelper", |args| {
                    Ok(json!(args.as_i64().unwrap_or(0) * 2))
                })
                .on_result(move |data| log.borrow_mut().push(data)),
        ));

        instance.run_task(task).unwrap();
        assert_eq!(*results.borrow(), vec![json!(14)]);
    }

    #[test]
    fn test_panic_becomes_task_error() {
        let mut instance = SyncWorkerInstance::new(registry());
        let errors = Rc::new(RefCell::new(Vec::new()));
        let log = errors.clone();
        let task: TaskRef = Rc::new(RefCell::new(
            ClosureTask::new("boom").on_error(move |error| log.borrow_mut().push(error)),
        ));

        instance.run_task(task).unwrap();
        assert_eq!(instance.status(), WorkerStatus::Idle);
        let errors = errors.borrow();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], TaskError::Raised { .. }));
    }

    #[test]
    fn test_unknown_handler_is_an_error() {
        let mut instance = SyncWorkerInstance::new(registry());
        let errors = Rc::new(RefCell::new(Vec::new()));
        let log = errors.clone();
        let task: TaskRef = Rc::new(RefCell::new(
            ClosureTask::new("missing").on_error(move |error| log.borrow_mut().push(error)),
        ));

        instance.run_task(task).unwrap();
        assert!(matches!(errors.borrow()[0], TaskError::Failed { .. }));
    }
}
