//! Taskmaster: parent-side task orchestration
//!
//! Dispatches user-defined tasks to a pool of isolated worker instances,
//! multiplexes framed message traffic with those workers (optionally
//! tunneled through a shared proxy runtime), and drives everything from a
//! single-threaded cooperative update loop.
//!
//! ```no_run
//! use serde_json::json;
//! use taskmaster::{ClosureTask, Taskmaster, Worker};
//! use taskmaster_runtime::TaskRegistry;
//!
//! let mut registry = TaskRegistry::new();
//! registry.register("double", |input, _context| {
//!     Ok(json!(input.as_i64().unwrap_or(0) * 2))
//! });
//! let registry = taskmaster_runtime::init(registry);
//!
//! let mut master = Taskmaster::new();
//! master.add_worker(Worker::sync_with(registry));
//! master.add_task(
//!     ClosureTask::new("double")
//!         .with_input(json!(21))
//!         .on_result(|data| println!("result: {data}")),
//! );
//! master.wait().stop();
//! ```

pub mod error;
pub mod instance;
pub mod proxy;
pub mod sync;
pub mod task;
pub mod taskmaster;
pub mod worker;

pub use error::ExecutionError;
pub use instance::{SocketWorkerInstance, WorkerInstance, WorkerStatus, DEFAULT_HANDSHAKE_TIMEOUT};
pub use proxy::{Proxy, ProxyRef};
pub use sync::SyncWorkerInstance;
pub use task::{CallError, ClosureTask, Task, TaskError, TaskFactory, TaskRef};
pub use taskmaster::{Taskmaster, TaskmasterOptions, DEFAULT_SOCKET_WAIT_TIME, PROXY_MODE_ENV};
pub use worker::{Worker, DEFAULT_MAX_RESTART_ATTEMPTS};

// The layered crates, re-exported for convenience
pub use taskmaster_ipc as ipc;
pub use taskmaster_runtime as runtime;
