//! Task handler registry and execution context
//!
//! A worker hosts a finite set of named task entry points. The context
//! handed to a running handler lets it call back into the originating task
//! on the coordinator side through `call_function`.

use std::any::Any;
use std::collections::HashMap;
use std::path::Path;

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Error raised by a task handler
#[derive(Debug, Error)]
pub enum TaskFault {
    /// The handler rejected its input or failed on its own terms
    #[error("{0}")]
    Failed(String),

    /// A callback into the originating task failed
    #[error("callback failed: {0}")]
    Callback(String),
}

impl From<String> for TaskFault {
    fn from(message: String) -> Self {
        TaskFault::Failed(message)
    }
}

impl From<&str> for TaskFault {
    fn from(message: &str) -> Self {
        TaskFault::Failed(message.to_string())
    }
}

type TaskFn =
    Box<dyn Fn(JsonValue, &mut TaskContext<'_>) -> Result<JsonValue, TaskFault> + Send + Sync>;

/// Named task entry points hosted by a worker
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task entry point, replacing any previous one of that name.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(JsonValue, &mut TaskContext<'_>) -> Result<JsonValue, TaskFault>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<&TaskFn> {
        self.handlers.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

/// Channel through which a running handler reaches its originating task
pub trait FunctionCaller {
    fn call_function(&mut self, name: &str, args: JsonValue) -> Result<JsonValue, TaskFault>;
}

/// Handle given to task handlers while they run
pub struct TaskContext<'a> {
    caller: &'a mut dyn FunctionCaller,
    instance_id: &'a str,
    bootstrap: Option<&'a Path>,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        caller: &'a mut dyn FunctionCaller,
        instance_id: &'a str,
        bootstrap: Option<&'a Path>,
    ) -> Self {
        Self {
            caller,
            instance_id,
            bootstrap,
        }
    }

    /// Invoke a named function on the originating task and wait for its
    /// result. Inside a worker child this issues a request upstream and
    /// pumps the connection until the correlated response arrives.
    pub fn call_function(
        &mut self,
        name: &str,
        args: JsonValue,
    ) -> Result<JsonValue, TaskFault> {
        self.caller.call_function(name, args)
    }

    /// Id of the worker instance running this task
    pub fn instance_id(&self) -> &str {
        self.instance_id
    }

    /// Bootstrap path handed to this child, if any
    pub fn bootstrap(&self) -> Option<&Path> {
        self.bootstrap
    }
}

/// Best-effort human-readable message out of a caught panic payload
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "task handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoCaller;

    impl FunctionCaller for EchoCaller {
        fn call_function(
            &mut self,
            name: &str,
            args: JsonValue,
        ) -> Result<JsonValue, TaskFault> {
            Ok(json!({ "called": name, "args": args }))
        }
    }

    #[test]
    fn test_register_and_run() {
        let mut registry = TaskRegistry::new();
        registry.register("double", |input, _context| {
            let n = input
                .as_i64()
                .ok_or_else(|| TaskFault::Failed("expected an integer".to_string()))?;
            Ok(json!(n * 2))
        });

        let mut caller = EchoCaller;
        let mut context = TaskContext::new(&mut caller, "w-1", None);
        let handler = registry.get("double").unwrap();
        assert_eq!(handler(json!(21), &mut context).unwrap(), json!(42));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_context_callback() {
        let registry = {
            let mut registry = TaskRegistry::new();
            registry.register("relay", |input, context| {
                context.call_function("helper", input)
            });
            registry
        };

        let mut caller = EchoCaller;
        let mut context = TaskContext::new(&mut caller, "w-2", None);
        let handler = registry.get("relay").unwrap();
        let result = handler(json!(7), &mut context).unwrap();
        assert_eq!(result, json!({ "called": "helper", "args": 7 }));
        assert_eq!(context.instance_id(), "w-2");
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static str panic");
        assert_eq!(panic_message(boxed.as_ref()), "static str panic");

        let boxed: Box<dyn Any + Send> = Box::new("owned".to_string());
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(boxed.as_ref()), "task handler panicked");
    }
}
