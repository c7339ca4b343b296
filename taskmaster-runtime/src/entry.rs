//! Process entry hook
//!
//! A program that wants to host its own workers calls [`init`] first thing
//! in `main` with its task registry. In the parent this only installs the
//! registry (enabling self-respawn and synchronous workers); in a process
//! that was spawned as a child it diverts into the matching event loop and
//! never returns.

use std::sync::{Arc, OnceLock};

use tracing::error;

use crate::executor::TaskRegistry;
use crate::proxy::{proxy_main, ProxyOptions};
use crate::spawn::ChildRole;
use crate::worker::{worker_main, WorkerOptions};

static GLOBAL_REGISTRY: OnceLock<Arc<TaskRegistry>> = OnceLock::new();

/// Install the registry; when this process carries a child role marker,
/// enter the corresponding event loop and exit.
pub fn init(registry: TaskRegistry) -> Arc<TaskRegistry> {
    let registry = Arc::new(registry);
    let _ = GLOBAL_REGISTRY.set(registry.clone());

    let Some(role) = ChildRole::from_env() else {
        return registry;
    };

    let code = match role {
        ChildRole::Worker => match worker_main(&registry, WorkerOptions::from_env()) {
            Ok(()) => 0,
            Err(err) => {
                error!(error = %err, "worker runtime failed");
                1
            }
        },
        ChildRole::Proxy => match proxy_main(ProxyOptions::from_env()) {
            Ok(()) => 0,
            Err(err) => {
                error!(error = %err, "proxy runtime failed");
                1
            }
        },
    };
    std::process::exit(code);
}

/// The registry installed by [`init`], if any.
pub fn registry() -> Option<Arc<TaskRegistry>> {
    GLOBAL_REGISTRY.get().cloned()
}

/// Whether this process can respawn itself as a worker child: true once a
/// registry has been installed through [`init`].
pub fn can_spawn_self() -> bool {
    GLOBAL_REGISTRY.get().is_some()
}
