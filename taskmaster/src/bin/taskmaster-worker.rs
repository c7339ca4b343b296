//! Standalone worker host
//!
//! Registers a small set of task handlers and hands control to the runtime
//! entry hook. Spawned with a child role marker this process becomes a
//! worker or proxy runtime; run directly it only explains itself.
//!
//! Logs go to stderr: stdout is the protocol channel.

use serde_json::{json, Value as JsonValue};
use tracing_subscriber::EnvFilter;

use taskmaster_runtime::{TaskFault, TaskRegistry};

fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    registry.register("echo", |input, _context| Ok(input));

    registry.register("double", |input, _context| {
        let n = input
            .as_i64()
            .ok_or_else(|| TaskFault::Failed("expected an integer".to_string()))?;
        Ok(json!(n * 2))
    });

    // asks the originating task to do the actual work
    registry.register("callback_double", |input, context| {
        context.call_function("computeHelper", input)
    });

    // sleeps, then reports which instance ran it
    registry.register("identify", |input, context| {
        let millis = input
            .get("sleep_ms")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        if millis > 0 {
            std::thread::sleep(std::time::Duration::from_millis(millis));
        }
        Ok(json!({
            "instance": context.instance_id(),
            "value": input.get("value").cloned().unwrap_or(JsonValue::Null),
        }))
    });

    registry.register("crash", |_input, _context| -> Result<JsonValue, TaskFault> {
        std::process::exit(3)
    });

    registry.register("panic", |_input, _context| -> Result<JsonValue, TaskFault> {
        panic!("intentional panic")
    });

    registry
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    taskmaster_runtime::init(registry());

    // still here: not spawned as a child
    eprintln!("taskmaster-worker only runs as a spawned worker or proxy child");
    std::process::exit(2);
}
