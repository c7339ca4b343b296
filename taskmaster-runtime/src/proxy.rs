//! Child-side proxy runtime hosting multiple worker instances
//!
//! The runtime speaks the proxy envelope protocol upstream. Control requests
//! arrive on the null logical id: start/stop hosted instances, terminate.
//! Everything else is raw traffic forwarded between the upstream socket and
//! the hosted children without re-serialization. A hosted child that dies on
//! its own is reported upstream so the coordinator fails it promptly.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use serde_json::value::RawValue;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use taskmaster_ipc::{
    wait_for_readable, FramedSocket, HandlerError, MessageConnection, PipeSocket, ProxiedSocket,
    ProxySocket, RequestKind, RequestPayload,
};

use crate::error::RuntimeError;
use crate::spawn::{spawn_child, ChildProcess, ChildRole, SpawnSpec, BOOTSTRAP_ENV};

/// Options for one proxy runtime child
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub bootstrap: Option<PathBuf>,
    pub wait_time: Duration,
}

impl ProxyOptions {
    pub fn from_env() -> Self {
        Self {
            bootstrap: std::env::var_os(BOOTSTRAP_ENV).map(PathBuf::from),
            wait_time: Duration::from_micros(1000),
        }
    }
}

struct HostedInstance {
    child: ChildProcess,
    socket: PipeSocket,
}

impl HostedInstance {
    fn shutdown(&mut self) {
        self.socket.close();
        self.child.stop(Duration::from_millis(500));
    }
}

fn spawn_hosted(
    descriptor: &taskmaster_ipc::InstanceDescriptor,
    options: &ProxyOptions,
) -> Result<HostedInstance, RuntimeError> {
    let spec = SpawnSpec {
        role: ChildRole::Worker,
        executable: descriptor.executable.clone(),
        bootstrap: descriptor
            .bootstrap
            .clone()
            .or_else(|| options.bootstrap.clone()),
        instance_id: descriptor.instance_id.clone(),
    };
    let (child, socket) = spawn_child(&spec)?;
    Ok(HostedInstance { child, socket })
}

/// Run the proxy event loop over this process's stdin/stdout.
pub fn proxy_main(options: ProxyOptions) -> Result<(), RuntimeError> {
    let upstream = Rc::new(RefCell::new(ProxySocket::new(Box::new(
        PipeSocket::from_stdio()?,
    ))));
    let mut control = MessageConnection::new(Box::new(ProxiedSocket::control(upstream.clone())));

    let running = Rc::new(Cell::new(true));
    let hosted: Rc<RefCell<HashMap<String, HostedInstance>>> =
        Rc::new(RefCell::new(HashMap::new()));

    {
        let hosted = hosted.clone();
        let options = options.clone();
        control.on(RequestKind::StartWorkerInstance, move |envelope| {
            let RequestPayload::StartWorkerInstance { descriptor } = &envelope.payload else {
                return Err(HandlerError::Rejected("malformed request".to_string()));
            };
            match spawn_hosted(descriptor, &options) {
                Ok(instance) => {
                    info!(instance_id = %descriptor.instance_id, "hosting worker instance");
                    hosted
                        .borrow_mut()
                        .insert(descriptor.instance_id.clone(), instance);
                    Ok(JsonValue::Null)
                }
                Err(err) => Err(HandlerError::Rejected(err.to_string())),
            }
        });
    }
    {
        let hosted = hosted.clone();
        control.on(RequestKind::StopWorkerInstance, move |envelope| {
            let RequestPayload::StopWorkerInstance { instance_id } = &envelope.payload else {
                return Err(HandlerError::Rejected("malformed request".to_string()));
            };
            match hosted.borrow_mut().remove(instance_id) {
                Some(mut instance) => {
                    debug!(instance_id = %instance_id, "stopping hosted instance");
                    instance.shutdown();
                    Ok(JsonValue::Null)
                }
                None => Err(HandlerError::Rejected(format!(
                    "unknown worker instance: {instance_id}"
                ))),
            }
        });
    }
    {
        let running = running.clone();
        control.on(RequestKind::Terminate, move |_| {
            running.set(false);
            Ok(JsonValue::Null)
        });
    }

    info!("proxy runtime ready");
    while running.get() {
        let mut fds: Vec<RawFd> = upstream.borrow().selectable_read_fd().into_iter().collect();
        for instance in hosted.borrow().values() {
            if let Some(fd) = instance.socket.selectable_read_fd() {
                fds.push(fd);
            }
        }
        wait_for_readable(&fds, options.wait_time)?;

        // deliver tunneled traffic first so a terminate reaches a hosted
        // worker before a stop request for it is acted on
        forward_traffic(&upstream, &hosted, &mut control)?;

        // control traffic (null id) drives the handlers above
        for envelope in control.update()? {
            control.reject_unknown(&envelope);
        }

        if !upstream.borrow().is_open() {
            debug!("coordinator went away");
            break;
        }
    }

    for (instance_id, mut instance) in hosted.borrow_mut().drain() {
        debug!(instance_id = %instance_id, "stopping hosted instance");
        instance.shutdown();
    }
    info!("proxy runtime shutting down");
    Ok(())
}

fn forward_traffic(
    upstream: &Rc<RefCell<ProxySocket>>,
    hosted: &Rc<RefCell<HashMap<String, HostedInstance>>>,
    control: &mut MessageConnection,
) -> Result<(), RuntimeError> {
    let mut dead = Vec::new();
    {
        let mut hosted = hosted.borrow_mut();
        for (instance_id, instance) in hosted.iter_mut() {
            // coordinator → hosted worker
            let inbound = upstream
                .borrow_mut()
                .receive_raw_proxy_messages(Some(instance_id.as_str()))?;
            for payload in inbound {
                instance.socket.send(payload.get().as_bytes());
            }

            // hosted worker → coordinator
            for frame in instance.socket.receive() {
                match frame_to_raw(&frame) {
                    Some(raw) => {
                        upstream.borrow_mut().send_raw(Some(instance_id.as_str()), &raw);
                    }
                    None => {
                        warn!(instance_id = %instance_id, "dropping malformed frame from hosted worker");
                    }
                }
            }

            if !instance.socket.is_open() || !instance.child.is_alive() {
                dead.push(instance_id.clone());
            }
        }
    }

    for instance_id in dead {
        warn!(instance_id = %instance_id, "hosted worker exited");
        if let Some(mut instance) = hosted.borrow_mut().remove(&instance_id) {
            instance.shutdown();
        }
        // report upstream so in-flight requests fail promptly
        control.send_request(RequestPayload::StopWorkerInstance { instance_id });
    }
    Ok(())
}

fn frame_to_raw(frame: &[u8]) -> Option<Box<RawValue>> {
    let text = std::str::from_utf8(frame).ok()?;
    RawValue::from_string(text.to_string()).ok()
}
