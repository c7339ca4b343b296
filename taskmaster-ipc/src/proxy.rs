//! Proxy envelopes tunneling several logical sockets over one transport
//!
//! Each frame on the underlying socket carries one envelope: a logical
//! instance id (or `None` for the proxy runtime itself) plus the inner
//! message as raw JSON, so forwarding never re-serializes. Envelopes for ids
//! nobody asked for yet stay buffered, bounded by a watermark; between any
//! pair (sender, id) delivery order is preserved.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tracing::{error, warn};

use crate::error::IpcError;
use crate::protocol::Message;
use crate::transport::FramedSocket;

/// Default cap on undelivered envelopes before the proxy is failed
pub const DEFAULT_UNHANDLED_WATERMARK: usize = 1024;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    instance: Option<&'a str>,
    payload: &'a RawValue,
}

#[derive(Deserialize)]
struct Envelope {
    instance: Option<String>,
    payload: Box<RawValue>,
}

/// Multiplexing wrapper around one framed socket.
pub struct ProxySocket {
    socket: Box<dyn FramedSocket>,
    unhandled: VecDeque<(Option<String>, Box<RawValue>)>,
    max_unhandled: usize,
    closed_instances: HashSet<String>,
    failed: bool,
}

impl ProxySocket {
    pub fn new(socket: Box<dyn FramedSocket>) -> Self {
        Self::with_watermark(socket, DEFAULT_UNHANDLED_WATERMARK)
    }

    pub fn with_watermark(socket: Box<dyn FramedSocket>, max_unhandled: usize) -> Self {
        Self {
            socket,
            unhandled: VecDeque::new(),
            max_unhandled,
            closed_instances: HashSet::new(),
            failed: false,
        }
    }

    /// Envelope and send one message addressed to a logical id.
    pub fn send_proxy_message(&mut self, instance: Option<&str>, message: &Message) -> bool {
        let encoded = match serde_json::to_string(message) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(error = %err, "failed to encode proxied message");
                return false;
            }
        };
        match RawValue::from_string(encoded) {
            Ok(payload) => self.send_raw(instance, &payload),
            Err(err) => {
                warn!(error = %err, "failed to wrap proxied message");
                false
            }
        }
    }

    /// Send an already-encoded inner payload without re-serializing it.
    pub fn send_raw(&mut self, instance: Option<&str>, payload: &RawValue) -> bool {
        if self.failed {
            return false;
        }
        let envelope = EnvelopeRef { instance, payload };
        match serde_json::to_vec(&envelope) {
            Ok(bytes) => self.socket.send(&bytes),
            Err(err) => {
                warn!(error = %err, "failed to encode proxy envelope");
                false
            }
        }
    }

    /// Drain the underlying socket into the unhandled buffer. A decode
    /// failure or a watermark violation fails the whole proxy socket.
    pub fn pump(&mut self) -> Result<(), IpcError> {
        if self.failed {
            return Ok(());
        }
        for frame in self.socket.receive() {
            let envelope: Envelope = match serde_json::from_slice(&frame) {
                Ok(envelope) => envelope,
                Err(err) => {
                    self.fail();
                    return Err(IpcError::Deserialization(err.to_string()));
                }
            };
            self.unhandled
                .push_back((envelope.instance, envelope.payload));
        }
        if self.unhandled.len() > self.max_unhandled {
            let count = self.unhandled.len();
            error!(count, "proxy unhandled buffer overflow");
            self.fail();
            return Err(IpcError::ProxyOverflow(count));
        }
        Ok(())
    }

    /// Decoded messages addressed to the given logical id, in arrival order.
    pub fn receive_proxy_messages(
        &mut self,
        instance: Option<&str>,
    ) -> Result<Vec<Message>, IpcError> {
        let mut messages = Vec::new();
        for payload in self.receive_raw_proxy_messages(instance)? {
            let message: Message = serde_json::from_str(payload.get())
                .map_err(|e| IpcError::Deserialization(e.to_string()))?;
            messages.push(message);
        }
        Ok(messages)
    }

    /// Matching envelopes still encoded, for forwarding as-is.
    pub fn receive_raw_proxy_messages(
        &mut self,
        instance: Option<&str>,
    ) -> Result<Vec<Box<RawValue>>, IpcError> {
        self.pump()?;
        let mut matched = Vec::new();
        let mut index = 0;
        while index < self.unhandled.len() {
            if self.unhandled[index].0.as_deref() == instance {
                if let Some((_, payload)) = self.unhandled.remove(index) {
                    matched.push(payload);
                }
            } else {
                index += 1;
            }
        }
        Ok(matched)
    }

    /// Mark a logical id dead so its adapter reports closed.
    pub fn mark_instance_closed(&mut self, instance: &str) {
        self.closed_instances.insert(instance.to_string());
    }

    pub fn is_instance_closed(&self, instance: &str) -> bool {
        self.closed_instances.contains(instance)
    }

    /// Unrecoverable proxy error: close the transport and drop everything.
    pub fn fail(&mut self) {
        self.failed = true;
        self.unhandled.clear();
        self.socket.close();
    }

    pub fn close(&mut self) {
        self.socket.close();
    }

    pub fn is_open(&self) -> bool {
        !self.failed && self.socket.is_open()
    }

    pub fn unhandled_count(&self) -> usize {
        self.unhandled.len()
    }

    pub fn selectable_read_fd(&self) -> Option<RawFd> {
        self.socket.selectable_read_fd()
    }
}

/// Adapter binding a shared [`ProxySocket`] to one logical id, exposing the
/// plain framed-socket interface so higher layers are unaware of the tunnel.
pub struct ProxiedSocket {
    proxy: Rc<RefCell<ProxySocket>>,
    instance: Option<String>,
    closed: bool,
}

impl ProxiedSocket {
    /// Channel for one hosted worker instance.
    pub fn new(proxy: Rc<RefCell<ProxySocket>>, instance: impl Into<String>) -> Self {
        Self {
            proxy,
            instance: Some(instance.into()),
            closed: false,
        }
    }

    /// Channel addressing the proxy runtime itself.
    pub fn control(proxy: Rc<RefCell<ProxySocket>>) -> Self {
        Self {
            proxy,
            instance: None,
            closed: false,
        }
    }
}

impl FramedSocket for ProxiedSocket {
    fn send(&mut self, payload: &[u8]) -> bool {
        if self.closed {
            return false;
        }
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text.to_string(),
            Err(err) => {
                warn!(error = %err, "proxied payload is not valid JSON text");
                return false;
            }
        };
        match RawValue::from_string(text) {
            Ok(raw) => self
                .proxy
                .borrow_mut()
                .send_raw(self.instance.as_deref(), &raw),
            Err(err) => {
                warn!(error = %err, "proxied payload is not valid JSON");
                false
            }
        }
    }

    fn receive(&mut self) -> Vec<Vec<u8>> {
        if self.closed {
            return Vec::new();
        }
        match self
            .proxy
            .borrow_mut()
            .receive_raw_proxy_messages(self.instance.as_deref())
        {
            Ok(payloads) => payloads
                .into_iter()
                .map(|payload| payload.get().as_bytes().to_vec())
                .collect(),
            Err(err) => {
                error!(error = %err, "proxy socket failure");
                Vec::new()
            }
        }
    }

    fn close(&mut self) {
        // closes only this logical channel, never the shared transport
        self.closed = true;
    }

    fn is_open(&self) -> bool {
        if self.closed {
            return false;
        }
        let proxy = self.proxy.borrow();
        if !proxy.is_open() {
            return false;
        }
        match &self.instance {
            Some(id) => !proxy.is_instance_closed(id),
            None => true,
        }
    }

    fn selectable_read_fd(&self) -> Option<RawFd> {
        self.proxy.borrow().selectable_read_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestPayload, ResponsePayload};
    use crate::transport::PairSocket;
    use serde_json::json;

    fn proxied_pair() -> (Rc<RefCell<ProxySocket>>, Rc<RefCell<ProxySocket>>) {
        let (a, b) = PairSocket::pair();
        (
            Rc::new(RefCell::new(ProxySocket::new(Box::new(a)))),
            Rc::new(RefCell::new(ProxySocket::new(Box::new(b)))),
        )
    }

    fn request(id: u64) -> Message {
        Message::request(
            id,
            RequestPayload::RunTask {
                handler: "echo".to_string(),
                input: json!(id),
            },
        )
    }

    #[test]
    fn test_demultiplex_preserves_per_id_order() {
        let (near, far) = proxied_pair();

        near.borrow_mut().send_proxy_message(Some("a"), &request(1));
        near.borrow_mut().send_proxy_message(Some("b"), &request(2));
        near.borrow_mut().send_proxy_message(Some("a"), &request(3));
        near.borrow_mut().send_proxy_message(Some("b"), &request(4));

        let for_a = far.borrow_mut().receive_proxy_messages(Some("a")).unwrap();
        assert_eq!(
            for_a.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![1, 3]
        );

        let for_b = far.borrow_mut().receive_proxy_messages(Some("b")).unwrap();
        assert_eq!(
            for_b.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![2, 4]
        );
    }

    #[test]
    fn test_unknown_ids_stay_buffered() {
        let (near, far) = proxied_pair();
        near.borrow_mut().send_proxy_message(Some("later"), &request(1));

        let none = far.borrow_mut().receive_proxy_messages(Some("now")).unwrap();
        assert!(none.is_empty());
        assert_eq!(far.borrow().unhandled_count(), 1);

        let delivered = far
            .borrow_mut()
            .receive_proxy_messages(Some("later"))
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(far.borrow().unhandled_count(), 0);
    }

    #[test]
    fn test_watermark_violation_fails_the_proxy() {
        let (a, b) = PairSocket::pair();
        let near = Rc::new(RefCell::new(ProxySocket::new(Box::new(a))));
        let far = Rc::new(RefCell::new(ProxySocket::with_watermark(Box::new(b), 2)));

        for id in 0..4 {
            near.borrow_mut()
                .send_proxy_message(Some("ghost"), &request(id));
        }
        let err = far.borrow_mut().pump().unwrap_err();
        assert!(matches!(err, IpcError::ProxyOverflow(_)));
        assert!(!far.borrow().is_open());
    }

    #[test]
    fn test_raw_forwarding_preserves_bytes() {
        let (near, far) = proxied_pair();
        let message = Message::response(
            5,
            3,
            ResponsePayload::Result {
                data: json!({"nested": [1, 2, 3]}),
            },
        );
        near.borrow_mut().send_proxy_message(Some("w"), &message);

        let raw = far
            .borrow_mut()
            .receive_raw_proxy_messages(Some("w"))
            .unwrap();
        assert_eq!(raw.len(), 1);
        let reparsed: Message = serde_json::from_str(raw[0].get()).unwrap();
        assert_eq!(reparsed, message);
    }

    #[test]
    fn test_proxied_socket_round_trip() {
        let (near, far) = proxied_pair();
        let mut upstream = ProxiedSocket::new(near, "w-1");
        let mut downstream = ProxiedSocket::new(far.clone(), "w-1");
        let mut control = ProxiedSocket::control(far);

        let frame = serde_json::to_vec(&request(11)).unwrap();
        assert!(upstream.send(&frame));

        let frames = downstream.receive();
        assert_eq!(frames.len(), 1);
        let decoded: Message = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(decoded.id, 11);

        // nothing addressed to the control channel
        assert!(control.receive().is_empty());
    }

    #[test]
    fn test_closed_instance_reports_not_open() {
        let (_near, far) = proxied_pair();
        let socket = ProxiedSocket::new(far.clone(), "w-1");
        assert!(socket.is_open());

        far.borrow_mut().mark_instance_closed("w-1");
        assert!(!socket.is_open());

        let control = ProxiedSocket::control(far);
        assert!(control.is_open());
    }
}
