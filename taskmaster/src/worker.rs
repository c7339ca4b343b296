//! Parent-visible worker handles
//!
//! A worker wraps configuration (group, launch strategy, optional proxy
//! reference) and produces a worker instance lazily. When an instance fails
//! the worker respawns it up to a bounded number of attempts; after
//! exhaustion the worker itself reports failed. Cloning a worker clones its
//! configuration only, never a live instance.

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use taskmaster_ipc::{InstanceDescriptor, ResponsePromise};
use taskmaster_runtime::TaskRegistry;

use crate::error::ExecutionError;
use crate::instance::{SocketWorkerInstance, WorkerInstance, WorkerStatus};
use crate::proxy::ProxyRef;
use crate::sync::SyncWorkerInstance;
use crate::task::TaskRef;
use crate::taskmaster::TaskmasterOptions;

/// How often a worker instance is respawned before the worker gives up
pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 3;

#[derive(Clone)]
enum Launcher {
    /// Run tasks in-process against a registry (the installed one if `None`)
    Sync {
        registry: Option<Arc<TaskRegistry>>,
    },
    /// Spawn a child process (the current executable if `None` and no
    /// orchestrator default applies)
    Process {
        executable: Option<PathBuf>,
    },
}

pub struct Worker {
    group: Option<String>,
    launcher: Launcher,
    proxy: Option<ProxyRef>,
    bootstrap: Option<PathBuf>,
    max_restart_attempts: u32,
    restart_count: u32,
    instance: Option<Box<dyn WorkerInstance>>,
    failed: bool,
}

impl Worker {
    /// A worker running tasks in-process against the installed registry.
    pub fn sync() -> Self {
        Self::with_launcher(Launcher::Sync { registry: None })
    }

    /// A synchronous worker with an explicit registry.
    pub fn sync_with(registry: Arc<TaskRegistry>) -> Self {
        Self::with_launcher(Launcher::Sync {
            registry: Some(registry),
        })
    }

    /// A worker backed by a spawned child process.
    pub fn process() -> Self {
        Self::with_launcher(Launcher::Process { executable: None })
    }

    fn with_launcher(launcher: Launcher) -> Self {
        Self {
            group: None,
            launcher,
            proxy: None,
            bootstrap: None,
            max_restart_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            restart_count: 0,
            instance: None,
            failed: false,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.launcher = Launcher::Process {
            executable: Some(executable.into()),
        };
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: impl Into<PathBuf>) -> Self {
        self.bootstrap = Some(bootstrap.into());
        self
    }

    /// Route this worker's instances through a shared proxy.
    pub fn with_proxy(mut self, proxy: ProxyRef) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_max_restart_attempts(mut self, attempts: u32) -> Self {
        self.max_restart_attempts = attempts;
        self
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn proxy(&self) -> Option<&ProxyRef> {
        self.proxy.as_ref()
    }

    /// Scheduler-facing status: an idle instance whose handshake completed
    /// reports as available.
    pub fn status(&self) -> WorkerStatus {
        if self.failed {
            return WorkerStatus::Failed;
        }
        match &self.instance {
            None => WorkerStatus::Starting,
            Some(instance) => match instance.status() {
                WorkerStatus::Idle => WorkerStatus::Available,
                other => other,
            },
        }
    }

    /// Promise for the current instance's startup handshake.
    pub fn started(&self) -> Option<ResponsePromise> {
        self.instance.as_ref().map(|instance| instance.started())
    }

    pub(crate) fn is_sync(&self) -> bool {
        matches!(self.launcher, Launcher::Sync { .. }) && self.proxy.is_none()
    }

    /// Whether this worker could (eventually) take a task of this group.
    pub(crate) fn accepts(&self, group: Option<&str>) -> bool {
        if self.failed || self.group.as_deref() != group {
            return false;
        }
        !matches!(self.status(), WorkerStatus::Finished)
    }

    fn create_instance(
        &self,
        defaults: &TaskmasterOptions,
    ) -> Result<Box<dyn WorkerInstance>, ExecutionError> {
        match &self.launcher {
            Launcher::Sync { registry } => {
                let registry = registry
                    .clone()
                    .or_else(taskmaster_runtime::registry)
                    .ok_or_else(|| {
                        ExecutionError::Configuration(
                            "no task registry installed; call taskmaster_runtime::init first"
                                .to_string(),
                        )
                    })?;
                Ok(Box::new(SyncWorkerInstance::new(registry)))
            }
            Launcher::Process { executable } => {
                let descriptor = InstanceDescriptor {
                    instance_id: Uuid::new_v4().to_string(),
                    executable: executable.clone().or_else(|| defaults.executable.clone()),
                    bootstrap: self
                        .bootstrap
                        .clone()
                        .or_else(|| defaults.bootstrap.clone()),
                };
                match &self.proxy {
                    Some(proxy) => Ok(Box::new(SocketWorkerInstance::proxied(
                        proxy.clone(),
                        descriptor,
                    )?)),
                    None => Ok(Box::new(SocketWorkerInstance::spawn(&descriptor)?)),
                }
            }
        }
    }

    fn ensure_instance(&mut self, defaults: &TaskmasterOptions) {
        if self.failed || self.instance.is_some() {
            return;
        }
        match self.create_instance(defaults) {
            Ok(instance) => {
                info!(instance_id = %instance.id(), group = ?self.group, "worker instance launched");
                self.instance = Some(instance);
            }
            Err(err) => {
                warn!(error = %err, "failed to launch worker instance");
                self.note_instance_failure();
            }
        }
    }

    fn note_instance_failure(&mut self) {
        self.restart_count += 1;
        if self.restart_count > self.max_restart_attempts {
            error!(
                attempts = self.restart_count,
                "worker exhausted its restart attempts"
            );
            self.failed = true;
        } else {
            info!(attempt = self.restart_count, "worker instance will be respawned");
        }
    }

    /// Launch the instance if needed, pump it, and apply the restart policy.
    pub(crate) fn update(&mut self, defaults: &TaskmasterOptions) {
        if self.failed {
            return;
        }
        self.ensure_instance(defaults);
        let Some(instance) = &mut self.instance else {
            return;
        };
        instance.update();
        if instance.status() == WorkerStatus::Failed {
            // in-flight work was already finalized by the instance
            self.instance = None;
            self.note_instance_failure();
        }
    }

    /// Hand a task to the live instance.
    pub(crate) fn assign(&mut self, task: TaskRef) -> Result<ResponsePromise, ExecutionError> {
        match &mut self.instance {
            Some(instance) => instance.run_task(task),
            None => Err(ExecutionError::InvalidState(
                "worker has no live instance".to_string(),
            )),
        }
    }

    pub(crate) fn stop(&mut self) {
        if let Some(instance) = &mut self.instance {
            instance.stop();
        }
    }

    pub(crate) fn collect_read_fds(&self, fds: &mut Vec<RawFd>) {
        if let Some(instance) = &self.instance {
            instance.collect_read_fds(fds);
        }
    }
}

impl Clone for Worker {
    /// Clones configuration only; the clone starts with a fresh instance.
    fn clone(&self) -> Self {
        Self {
            group: self.group.clone(),
            launcher: self.launcher.clone(),
            proxy: self.proxy.clone(),
            bootstrap: self.bootstrap.clone(),
            max_restart_attempts: self.max_restart_attempts,
            restart_count: 0,
            instance: None,
            failed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskmaster::TaskmasterOptions;

    #[test]
    fn test_spawn_failure_exhausts_restart_attempts() {
        let options = TaskmasterOptions::default();
        let mut worker = Worker::process()
            .with_executable("/nonexistent/taskmaster-worker-binary")
            .with_max_restart_attempts(1);

        assert_eq!(worker.status(), WorkerStatus::Starting);
        worker.update(&options);
        // first failure: one respawn attempt left
        assert_ne!(worker.status(), WorkerStatus::Failed);
        worker.update(&options);
        assert_eq!(worker.status(), WorkerStatus::Failed);
        assert!(!worker.accepts(None));
    }

    #[test]
    fn test_clone_resets_runtime_state() {
        let worker = Worker::process()
            .with_group("a")
            .with_max_restart_attempts(7);
        let clone = worker.clone();
        assert_eq!(clone.group(), Some("a"));
        assert_eq!(clone.max_restart_attempts, 7);
        assert_eq!(clone.restart_count, 0);
        assert!(clone.instance.is_none());
    }

    #[test]
    fn test_group_matching() {
        let worker = Worker::sync().with_group("a");
        assert!(worker.accepts(Some("a")));
        assert!(!worker.accepts(Some("b")));
        assert!(!worker.accepts(None));

        let ungrouped = Worker::sync();
        assert!(ungrouped.accepts(None));
        assert!(!ungrouped.accepts(Some("a")));
    }
}
