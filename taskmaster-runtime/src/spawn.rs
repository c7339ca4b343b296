//! Process spawn shim for worker and proxy children
//!
//! Children are ordinary processes: stdin/stdout carry the framed protocol,
//! stderr is inherited for logs. Role, instance id and bootstrap path travel
//! through environment variables so the child's argument list stays
//! untouched.

use std::os::unix::io::OwnedFd;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use taskmaster_ipc::PipeSocket;

use crate::error::RuntimeError;

pub const ROLE_ENV: &str = "TASKMASTER_CHILD_ROLE";
pub const INSTANCE_ID_ENV: &str = "TASKMASTER_INSTANCE_ID";
pub const BOOTSTRAP_ENV: &str = "TASKMASTER_BOOTSTRAP";

/// What kind of event loop a spawned child should enter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildRole {
    Worker,
    Proxy,
}

impl ChildRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildRole::Worker => "worker",
            ChildRole::Proxy => "proxy",
        }
    }

    /// Role marker of the current process, if it was spawned as a child.
    pub fn from_env() -> Option<ChildRole> {
        match std::env::var(ROLE_ENV).ok()?.as_str() {
            "worker" => Some(ChildRole::Worker),
            "proxy" => Some(ChildRole::Proxy),
            other => {
                warn!(role = other, "unrecognized child role marker");
                None
            }
        }
    }
}

/// Everything needed to spawn one child process
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub role: ChildRole,
    /// Child executable; `None` respawns the current executable
    pub executable: Option<PathBuf>,
    pub bootstrap: Option<PathBuf>,
    pub instance_id: String,
}

/// Spawn a child and hand back its process handle plus the parent end of the
/// framed channel.
pub fn spawn_child(spec: &SpawnSpec) -> Result<(ChildProcess, PipeSocket), RuntimeError> {
    let executable = match &spec.executable {
        Some(path) => path.clone(),
        None => std::env::current_exe()
            .map_err(|e| RuntimeError::Spawn(format!("cannot resolve current executable: {e}")))?,
    };

    let mut command = Command::new(&executable);
    command
        .env(ROLE_ENV, spec.role.as_str())
        .env(INSTANCE_ID_ENV, &spec.instance_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    if let Some(bootstrap) = &spec.bootstrap {
        command.env(BOOTSTRAP_ENV, bootstrap);
    }

    let mut child = command
        .spawn()
        .map_err(|e| RuntimeError::Spawn(format!("failed to spawn {}: {e}", executable.display())))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RuntimeError::Spawn("child stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RuntimeError::Spawn("child stdout not captured".to_string()))?;

    debug!(
        pid = child.id(),
        role = spec.role.as_str(),
        instance_id = %spec.instance_id,
        "spawned child process"
    );

    let socket = PipeSocket::new(OwnedFd::from(stdout), OwnedFd::from(stdin))
        .map_err(|e| RuntimeError::Spawn(e.to_string()))?;
    Ok((ChildProcess::new(child), socket))
}

/// Handle to a spawned child process
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking liveness check
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait briefly for a voluntary exit, then kill.
    pub fn stop(&mut self, timeout: Duration) {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if !self.is_alive() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.kill();
    }

    pub fn kill(&mut self) {
        if self.is_alive() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
