//! Parent-side proxy client
//!
//! A proxy runs a remote worker-hosting runtime and shares one physical
//! socket between every instance routed through it. The null logical id is
//! the control channel: start/stop hosted instances, terminate the runtime.
//! Proxies are shared by reference and enrolled in the orchestrator by
//! identity, exactly once.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use taskmaster_ipc::{
    InstanceDescriptor, MessageConnection, ProxiedSocket, ProxySocket, RequestKind,
    RequestPayload, ResponsePromise,
};
use taskmaster_runtime::{spawn_child, ChildProcess, ChildRole, SpawnSpec};

use crate::error::ExecutionError;
use crate::taskmaster::TaskmasterOptions;

/// Shared handle to a proxy
pub type ProxyRef = Rc<RefCell<Proxy>>;

/// Bound on how long `stop` waits for the runtime to exit voluntarily
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Proxy {
    id: String,
    executable: Option<PathBuf>,
    bootstrap: Option<PathBuf>,
    wait_time: Duration,
    child: Option<ChildProcess>,
    socket: Option<Rc<RefCell<ProxySocket>>>,
    control: Option<MessageConnection>,
    failed: bool,
}

impl Proxy {
    /// A proxy backed by a spawned runtime process.
    pub fn process() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            executable: None,
            bootstrap: None,
            wait_time: Duration::from_micros(1000),
            child: None,
            socket: None,
            control: None,
            failed: false,
        }
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: impl Into<PathBuf>) -> Self {
        self.bootstrap = Some(bootstrap.into());
        self
    }

    pub fn into_ref(self) -> ProxyRef {
        Rc::new(RefCell::new(self))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_started(&self) -> bool {
        self.socket.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Whether the runtime process is still running.
    pub fn is_running(&mut self) -> bool {
        match &mut self.child {
            Some(child) => child.is_alive(),
            None => false,
        }
    }

    /// Fill unset options from the orchestrator before starting.
    pub(crate) fn apply_defaults(&mut self, options: &TaskmasterOptions) {
        if self.executable.is_none() {
            self.executable = options.executable.clone();
        }
        if self.bootstrap.is_none() {
            self.bootstrap = options.bootstrap.clone();
        }
        self.wait_time = options.socket_wait_time;
    }

    /// Spawn the proxy runtime and open the shared transport.
    pub fn start(&mut self) -> Result<(), ExecutionError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let spec = SpawnSpec {
            role: ChildRole::Proxy,
            executable: self.executable.clone(),
            bootstrap: self.bootstrap.clone(),
            instance_id: self.id.clone(),
        };
        let (child, socket) = spawn_child(&spec)?;
        let shared = Rc::new(RefCell::new(ProxySocket::new(Box::new(socket))));
        let mut control = MessageConnection::new(Box::new(ProxiedSocket::control(shared.clone())));

        // the runtime reports hosted workers that died on their own
        {
            let shared = shared.clone();
            control.on(RequestKind::StopWorkerInstance, move |envelope| {
                if let RequestPayload::StopWorkerInstance { instance_id } = &envelope.payload {
                    warn!(instance_id = %instance_id, "proxy reported a dead worker instance");
                    shared.borrow_mut().mark_instance_closed(instance_id);
                }
                Ok(JsonValue::Null)
            });
        }

        info!(proxy_id = %self.id, pid = child.id(), "proxy runtime started");
        self.child = Some(child);
        self.socket = Some(shared);
        self.control = Some(control);
        Ok(())
    }

    /// Channel for one hosted instance, tunneled over the shared socket.
    pub(crate) fn open_instance_socket(
        &mut self,
        instance_id: &str,
    ) -> Result<ProxiedSocket, ExecutionError> {
        match &self.socket {
            Some(shared) => Ok(ProxiedSocket::new(shared.clone(), instance_id)),
            None => Err(ExecutionError::Proxy("proxy is not started".to_string())),
        }
    }

    /// Ask the runtime to spawn and host a new worker instance.
    pub fn start_worker_instance(
        &mut self,
        descriptor: InstanceDescriptor,
    ) -> Result<ResponsePromise, ExecutionError> {
        let control = self
            .control
            .as_mut()
            .ok_or_else(|| ExecutionError::Proxy("proxy is not started".to_string()))?;
        debug!(instance_id = %descriptor.instance_id, "requesting hosted instance");
        Ok(control.send_request(RequestPayload::StartWorkerInstance { descriptor }))
    }

    /// Ask the runtime to stop a hosted worker instance.
    pub fn stop_worker_instance(
        &mut self,
        instance_id: &str,
    ) -> Result<ResponsePromise, ExecutionError> {
        let control = self
            .control
            .as_mut()
            .ok_or_else(|| ExecutionError::Proxy("proxy is not started".to_string()))?;
        Ok(control.send_request(RequestPayload::StopWorkerInstance {
            instance_id: instance_id.to_string(),
        }))
    }

    /// Pump the shared socket and the control channel.
    pub fn update(&mut self) {
        if self.failed || self.socket.is_none() {
            return;
        }

        if let Some(child) = &mut self.child {
            if !child.is_alive() {
                self.fail("proxy process exited unexpectedly");
                return;
            }
        }

        let requests = match self.control.as_mut() {
            Some(control) => match control.update() {
                Ok(requests) => requests,
                Err(err) => {
                    let reason = err.to_string();
                    self.fail(&reason);
                    return;
                }
            },
            None => Vec::new(),
        };
        if let Some(control) = self.control.as_mut() {
            for envelope in requests {
                control.reject_unknown(&envelope);
            }
        }

        // surface watermark violations even when no instance is reading
        if let Some(socket) = &self.socket {
            let result = socket.borrow_mut().pump();
            if let Err(err) = result {
                let reason = err.to_string();
                self.fail(&reason);
                return;
            }
        }

        let open = self
            .socket
            .as_ref()
            .map(|socket| socket.borrow().is_open())
            .unwrap_or(false);
        if !open {
            self.fail("proxy transport closed unexpectedly");
        }
    }

    /// Unrecoverable proxy error: every instance routed through this proxy
    /// observes a closed channel and fails.
    pub(crate) fn fail(&mut self, reason: &str) {
        if self.failed {
            return;
        }
        error!(proxy_id = %self.id, reason, "proxy failed");
        self.failed = true;
        if let Some(socket) = &self.socket {
            socket.borrow_mut().fail();
        }
        if let Some(child) = &mut self.child {
            child.kill();
        }
    }

    /// Terminate the runtime and poll until it exits, then force it down.
    pub fn stop(&mut self) {
        if let Some(control) = &mut self.control {
            control.send_request(RequestPayload::Terminate);
        }
        let deadline = Instant::now() + DEFAULT_STOP_TIMEOUT;
        while self.is_running() && Instant::now() < deadline {
            if let Some(control) = &mut self.control {
                let _ = control.update();
            }
            std::thread::sleep(self.wait_time);
        }
        if let Some(child) = &mut self.child {
            child.stop(Duration::from_millis(500));
        }
        if let Some(socket) = &self.socket {
            socket.borrow_mut().close();
        }
        self.control = None;
        self.socket = None;
        debug!(proxy_id = %self.id, "proxy stopped");
    }

    pub(crate) fn collect_read_fds(&self, fds: &mut Vec<RawFd>) {
        if let Some(socket) = &self.socket {
            if let Some(fd) = socket.borrow().selectable_read_fd() {
                fds.push(fd);
            }
        }
    }
}
