//! The coordinator: task queue, scheduling and the update loop
//!
//! Single-threaded and cooperative: one update cycle assigns tasks to
//! available workers, pumps every worker and proxy, and then blocks at most
//! `socket_wait_time` on a poll over every selectable read handle. Sync-only
//! pools skip the wait entirely.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, warn};

use taskmaster_ipc::wait_for_readable;

use crate::error::ExecutionError;
use crate::instance::WorkerStatus;
use crate::proxy::{Proxy, ProxyRef};
use crate::task::{Task, TaskFactory, TaskRef};
use crate::worker::Worker;

/// Environment switch routing auto-detected workers through a process proxy
pub const PROXY_MODE_ENV: &str = "TASKMASTER_PROXY";

/// Default bound on one blocking wait in the update loop
pub const DEFAULT_SOCKET_WAIT_TIME: Duration = Duration::from_micros(1000);

/// Shared orchestrator configuration, pushed into workers and proxies
#[derive(Debug, Clone)]
pub struct TaskmasterOptions {
    /// Worker executable; `None` means the current executable
    pub executable: Option<PathBuf>,
    /// Bootstrap path handed to children verbatim
    pub bootstrap: Option<PathBuf>,
    /// Upper bound on one blocking wait in the update loop
    pub socket_wait_time: Duration,
    /// Pool size used by `auto_detect_workers(0)`
    pub default_worker_count: usize,
}

impl Default for TaskmasterOptions {
    fn default() -> Self {
        Self {
            executable: None,
            bootstrap: None,
            socket_wait_time: DEFAULT_SOCKET_WAIT_TIME,
            default_worker_count: num_cpus::get(),
        }
    }
}

/// The parent-side orchestration engine.
#[derive(Default)]
pub struct Taskmaster {
    options: TaskmasterOptions,
    tasks: VecDeque<TaskRef>,
    factories: Vec<Box<dyn TaskFactory>>,
    workers: Vec<Worker>,
    proxies: Vec<ProxyRef>,
}

impl Taskmaster {
    pub fn new() -> Self {
        Self::with_options(TaskmasterOptions::default())
    }

    pub fn with_options(options: TaskmasterOptions) -> Self {
        Self {
            options,
            tasks: VecDeque::new(),
            factories: Vec::new(),
            workers: Vec::new(),
            proxies: Vec::new(),
        }
    }

    pub fn options(&self) -> &TaskmasterOptions {
        &self.options
    }

    pub fn set_executable(&mut self, executable: impl Into<PathBuf>) -> &mut Self {
        self.options.executable = Some(executable.into());
        self
    }

    pub fn set_bootstrap(&mut self, bootstrap: impl Into<PathBuf>) -> &mut Self {
        self.options.bootstrap = Some(bootstrap.into());
        self
    }

    pub fn set_socket_wait_time(&mut self, wait_time: Duration) -> &mut Self {
        self.options.socket_wait_time = wait_time;
        self
    }

    /// Enqueue a task, returning the shared handle.
    pub fn add_task(&mut self, task: impl Task + 'static) -> TaskRef {
        let task: TaskRef = Rc::new(std::cell::RefCell::new(task));
        self.tasks.push_back(task.clone());
        task
    }

    /// Enqueue an already-shared task.
    pub fn queue_task(&mut self, task: TaskRef) -> &mut Self {
        self.tasks.push_back(task);
        self
    }

    pub fn add_task_factory(&mut self, factory: impl TaskFactory + 'static) -> &mut Self {
        self.factories.push(Box::new(factory));
        self
    }

    /// Number of queued tasks not yet assigned (factories not counted).
    pub fn pending_task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn proxies(&self) -> &[ProxyRef] {
        &self.proxies
    }

    /// Add one worker, enrolling its proxy (by identity, exactly once).
    pub fn add_worker(&mut self, worker: Worker) -> &mut Self {
        self.enroll_proxy(&worker);
        self.workers.push(worker);
        self
    }

    /// Add `count` clones of the given worker configuration.
    pub fn add_workers(&mut self, worker: Worker, count: usize) -> &mut Self {
        for _ in 0..count {
            self.add_worker(worker.clone());
        }
        self
    }

    /// Replace the pool, stopping any running instances first.
    pub fn set_workers(&mut self, workers: Vec<Worker>) -> &mut Self {
        for worker in &mut self.workers {
            worker.stop();
        }
        self.workers.clear();
        for worker in workers {
            self.add_worker(worker);
        }
        self
    }

    /// Build a worker pool from what this process supports: self-respawn
    /// when a registry is installed, otherwise the configured executable.
    /// With the proxy switch set in the environment, workers are routed
    /// through one shared process proxy. A count of zero means one worker
    /// per CPU.
    pub fn auto_detect_workers(&mut self, count: usize) -> Result<&mut Self, ExecutionError> {
        let count = if count == 0 {
            self.options.default_worker_count
        } else {
            count
        };
        let can_spawn =
            taskmaster_runtime::can_spawn_self() || self.options.executable.is_some();
        if !can_spawn {
            return Err(ExecutionError::Configuration(
                "no worker strategy available: install a task registry via \
                 taskmaster_runtime::init or set an executable"
                    .to_string(),
            ));
        }
        if std::env::var_os(PROXY_MODE_ENV).is_some() {
            info!(count, "auto-detected workers routed through a process proxy");
            let proxy = Proxy::process().into_ref();
            self.add_workers(Worker::process().with_proxy(proxy), count);
        } else {
            info!(count, "auto-detected process workers");
            self.add_workers(Worker::process(), count);
        }
        Ok(self)
    }

    fn enroll_proxy(&mut self, worker: &Worker) {
        let Some(proxy) = worker.proxy() else {
            return;
        };
        if self.proxies.iter().any(|known| Rc::ptr_eq(known, proxy)) {
            return;
        }
        {
            let mut proxy = proxy.borrow_mut();
            proxy.apply_defaults(&self.options);
            if let Err(err) = proxy.start() {
                warn!(error = %err, "failed to start proxy");
                proxy.fail(&err.to_string());
            }
        }
        self.proxies.push(proxy.clone());
    }

    /// Pull the next task for a group: factories in insertion order first,
    /// then the queued list FIFO by exact group equality.
    fn next_task(
        factories: &mut [Box<dyn TaskFactory>],
        tasks: &mut VecDeque<TaskRef>,
        group: Option<&str>,
    ) -> Option<TaskRef> {
        for factory in factories.iter_mut() {
            if let Some(groups) = factory.groups() {
                match group {
                    Some(group) if groups.iter().any(|g| g == group) => {}
                    _ => continue,
                }
            }
            if let Some(task) = factory.create_next_task(group) {
                return Some(task);
            }
        }
        let position = tasks
            .iter()
            .position(|task| task.borrow().group() == group)?;
        tasks.remove(position)
    }

    fn try_assign(&mut self, index: usize) {
        if self.workers[index].status() != WorkerStatus::Available {
            return;
        }
        let group = self.workers[index].group().map(str::to_string);
        let Some(task) =
            Self::next_task(&mut self.factories, &mut self.tasks, group.as_deref())
        else {
            return;
        };
        match self.workers[index].assign(task.clone()) {
            Ok(_) => debug!(group = ?group, "task assigned"),
            Err(err) => {
                warn!(error = %err, "task assignment failed, requeueing");
                self.tasks.push_front(task);
            }
        }
    }

    /// One update cycle: assign/pump/assign per worker, pump proxies, then
    /// wait for readiness.
    pub fn update(&mut self) {
        for index in 0..self.workers.len() {
            self.try_assign(index);
            self.workers[index].update(&self.options);
            // a worker may have just become available during its update
            self.try_assign(index);
        }
        for proxy in &self.proxies {
            proxy.borrow_mut().update();
        }
        self.wait_for_new_update();
    }

    fn wait_for_new_update(&self) {
        // a pool of purely synchronous workers never has anything to wait on
        if self.proxies.is_empty() && self.workers.iter().all(Worker::is_sync) {
            return;
        }
        let mut fds: Vec<RawFd> = Vec::new();
        for worker in &self.workers {
            worker.collect_read_fds(&mut fds);
        }
        for proxy in &self.proxies {
            proxy.borrow().collect_read_fds(&mut fds);
        }
        fds.sort_unstable();
        fds.dedup();
        if let Err(err) = wait_for_readable(&fds, self.options.socket_wait_time) {
            warn!(error = %err, "poll failed");
        }
    }

    fn has_pending_work(&self) -> bool {
        if self
            .workers
            .iter()
            .any(|worker| matches!(worker.status(), WorkerStatus::Starting | WorkerStatus::Working))
        {
            return true;
        }
        self.tasks.iter().any(|task| {
            let task = task.borrow();
            let group = task.group();
            self.workers.iter().any(|worker| worker.accepts(group))
        })
    }

    /// Run update cycles until nothing is starting or working and no queued
    /// task has a live matching worker.
    pub fn wait(&mut self) -> &mut Self {
        loop {
            self.update();
            if !self.has_pending_work() {
                break;
            }
        }
        self
    }

    /// Run update cycles until the queued task list is empty (factories are
    /// not drained). Gives up on tasks no live worker can ever match.
    pub fn wait_until_all_tasks_are_assigned(&mut self) -> &mut Self {
        loop {
            if self.tasks.is_empty() {
                break;
            }
            let assignable = self.tasks.iter().any(|task| {
                let task = task.borrow();
                let group = task.group();
                self.workers.iter().any(|worker| worker.accepts(group))
            });
            if !assignable {
                break;
            }
            self.update();
        }
        self
    }

    /// Stop every worker and every enrolled proxy.
    pub fn stop(&mut self) -> &mut Self {
        info!("stopping all workers");
        for worker in &mut self.workers {
            worker.stop();
        }
        for proxy in &self.proxies {
            proxy.borrow_mut().stop();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ClosureTask;
    use serde_json::json;
    use std::cell::RefCell;

    struct ListFactory {
        groups: Option<Vec<String>>,
        tasks: Vec<TaskRef>,
    }

    impl TaskFactory for ListFactory {
        fn groups(&self) -> Option<Vec<String>> {
            self.groups.clone()
        }

        fn create_next_task(&mut self, _group: Option<&str>) -> Option<TaskRef> {
            if self.tasks.is_empty() {
                None
            } else {
                Some(self.tasks.remove(0))
            }
        }
    }

    fn task(group: Option<&str>, tag: i64) -> TaskRef {
        let mut task = ClosureTask::new("echo").with_input(json!(tag));
        if let Some(group) = group {
            task = task.with_group(group);
        }
        Rc::new(RefCell::new(task))
    }

    #[test]
    fn test_queued_tasks_match_groups_fifo() {
        let mut tasks: VecDeque<TaskRef> = VecDeque::new();
        tasks.push_back(task(Some("a"), 1));
        tasks.push_back(task(None, 2));
        tasks.push_back(task(Some("a"), 3));

        let picked =
            Taskmaster::next_task(&mut [], &mut tasks, Some("a")).expect("task expected");
        assert_eq!(picked.borrow().input(), json!(1));

        let picked = Taskmaster::next_task(&mut [], &mut tasks, None).expect("task expected");
        assert_eq!(picked.borrow().input(), json!(2));

        let picked =
            Taskmaster::next_task(&mut [], &mut tasks, Some("a")).expect("task expected");
        assert_eq!(picked.borrow().input(), json!(3));
        assert!(Taskmaster::next_task(&mut [], &mut tasks, Some("a")).is_none());
    }

    #[test]
    fn test_factories_take_precedence_over_the_queue() {
        let mut factories: Vec<Box<dyn TaskFactory>> = vec![Box::new(ListFactory {
            groups: None,
            tasks: vec![task(None, 10)],
        })];
        let mut tasks: VecDeque<TaskRef> = VecDeque::new();
        tasks.push_back(task(None, 20));

        let first =
            Taskmaster::next_task(&mut factories, &mut tasks, None).expect("task expected");
        assert_eq!(first.borrow().input(), json!(10));

        let second =
            Taskmaster::next_task(&mut factories, &mut tasks, None).expect("task expected");
        assert_eq!(second.borrow().input(), json!(20));
    }

    #[test]
    fn test_group_restricted_factory_is_skipped() {
        let mut factories: Vec<Box<dyn TaskFactory>> = vec![Box::new(ListFactory {
            groups: Some(vec!["b".to_string()]),
            tasks: vec![task(Some("b"), 30)],
        })];
        let mut tasks: VecDeque<TaskRef> = VecDeque::new();

        // neither the null group nor a foreign group may drain it
        assert!(Taskmaster::next_task(&mut factories, &mut tasks, None).is_none());
        assert!(Taskmaster::next_task(&mut factories, &mut tasks, Some("a")).is_none());

        let picked = Taskmaster::next_task(&mut factories, &mut tasks, Some("b"))
            .expect("task expected");
        assert_eq!(picked.borrow().input(), json!(30));
    }

    #[test]
    fn test_proxy_enrolled_once_by_identity() {
        let mut master = Taskmaster::new();
        // a proxy that is never started: enrollment starts it and fails, but
        // identity-unique enrollment is what this test is about
        let proxy = Proxy::process()
            .with_executable("/nonexistent/proxy-runtime")
            .into_ref();
        master.add_workers(Worker::process().with_proxy(proxy.clone()), 3);

        assert_eq!(master.workers().len(), 3);
        assert_eq!(master.proxies().len(), 1);
        assert!(proxy.borrow().is_failed());
    }
}
