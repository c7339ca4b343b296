//! Child-side task hosting for taskmaster
//!
//! A worker child is an ordinary process whose stdin/stdout carry the framed
//! protocol. This crate provides the task handler registry, the worker event
//! loop, a proxy runtime hosting several workers over one upstream socket,
//! the process spawn shim, and the entry hook that diverts a freshly spawned
//! child into the right event loop.

pub mod entry;
pub mod error;
pub mod executor;
pub mod proxy;
pub mod spawn;
pub mod worker;

pub use entry::{can_spawn_self, init, registry};
pub use error::RuntimeError;
pub use executor::{panic_message, FunctionCaller, TaskContext, TaskFault, TaskRegistry};
pub use proxy::{proxy_main, ProxyOptions};
pub use spawn::{spawn_child, ChildProcess, ChildRole, SpawnSpec};
pub use worker::{worker_main, WorkerOptions};
