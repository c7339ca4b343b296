//! Framed transport implementations
//!
//! A frame is a 4-byte big-endian length prefix followed by that many bytes
//! of payload. Sockets are strictly non-blocking: partial reads and writes
//! are buffered internally and drained on subsequent pumps.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd;
use tracing::{error, warn};

use crate::error::IpcError;

/// Hard cap on a single frame; anything larger means a desynchronized stream
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Read granularity (matches the pipe buffer we ask the OS for)
const READ_CHUNK: usize = 64 * 1024;

const LEN_PREFIX: usize = 4;

/// Message-oriented, non-blocking transport.
pub trait FramedSocket {
    /// Queue one frame for delivery, flushing as much as the OS accepts.
    /// Returns `false` once the peer is gone.
    fn send(&mut self, payload: &[u8]) -> bool;

    /// Drain every complete frame currently available without blocking.
    /// Returns an empty list when nothing is buffered or the peer closed.
    fn receive(&mut self) -> Vec<Vec<u8>>;

    /// Close this endpoint. Idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Readiness handle for the coordinator's poll loop, or `None` for
    /// transports without OS-level readiness notification.
    fn selectable_read_fd(&self) -> Option<RawFd>;
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), IpcError> {
    let flags = fcntl::fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl::fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Framed socket over a pair of pipe file descriptors.
pub struct PipeSocket {
    read: OwnedFd,
    write: OwnedFd,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    open: bool,
}

impl PipeSocket {
    /// Wrap two fds, switching both to non-blocking mode.
    pub fn new(read: OwnedFd, write: OwnedFd) -> Result<Self, IpcError> {
        set_nonblocking(&read)?;
        set_nonblocking(&write)?;
        Ok(Self {
            read,
            write,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            open: true,
        })
    }

    /// Channel over this process's own stdin/stdout, for child-side use.
    pub fn from_stdio() -> Result<Self, IpcError> {
        let read = io::stdin()
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| IpcError::Io(e.to_string()))?;
        let write = io::stdout()
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| IpcError::Io(e.to_string()))?;
        Self::new(read, write)
    }

    fn flush_writes(&mut self) {
        while self.open && !self.write_buf.is_empty() {
            match unistd::write(&self.write, &self.write_buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!(error = %err, "write failed, closing socket");
                    self.open = false;
                }
            }
        }
    }

    fn fill_read_buf(&mut self) {
        loop {
            let old_len = self.read_buf.len();
            self.read_buf.resize(old_len + READ_CHUNK, 0);
            match unistd::read(self.read.as_raw_fd(), &mut self.read_buf[old_len..]) {
                Ok(0) => {
                    self.read_buf.truncate(old_len);
                    self.open = false;
                    break;
                }
                Ok(n) => {
                    self.read_buf.truncate(old_len + n);
                }
                Err(Errno::EAGAIN) => {
                    self.read_buf.truncate(old_len);
                    break;
                }
                Err(Errno::EINTR) => {
                    self.read_buf.truncate(old_len);
                }
                Err(err) => {
                    self.read_buf.truncate(old_len);
                    warn!(error = %err, "read failed, closing socket");
                    self.open = false;
                    break;
                }
            }
        }
    }

    fn extract_frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        loop {
            if self.read_buf.len() < LEN_PREFIX {
                break;
            }
            let len = u32::from_be_bytes([
                self.read_buf[0],
                self.read_buf[1],
                self.read_buf[2],
                self.read_buf[3],
            ]) as usize;
            if len > MAX_FRAME_SIZE {
                error!(len, "oversized frame length, closing socket");
                self.read_buf.clear();
                self.open = false;
                break;
            }
            if self.read_buf.len() < LEN_PREFIX + len {
                break;
            }
            frames.push(self.read_buf[LEN_PREFIX..LEN_PREFIX + len].to_vec());
            self.read_buf.drain(..LEN_PREFIX + len);
        }
        frames
    }
}

impl FramedSocket for PipeSocket {
    fn send(&mut self, payload: &[u8]) -> bool {
        if !self.open {
            return false;
        }
        if payload.len() > MAX_FRAME_SIZE {
            warn!(len = payload.len(), "refusing to send oversized frame");
            return false;
        }
        self.write_buf
            .extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.write_buf.extend_from_slice(payload);
        self.flush_writes();
        self.open
    }

    fn receive(&mut self) -> Vec<Vec<u8>> {
        // queued writes drain on every pump
        self.flush_writes();
        if self.open {
            self.fill_read_buf();
        }
        self.extract_frames()
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn selectable_read_fd(&self) -> Option<RawFd> {
        if self.open {
            Some(self.read.as_raw_fd())
        } else {
            None
        }
    }
}

struct PairState {
    // frames awaiting delivery to side 0 / side 1
    queues: [VecDeque<Vec<u8>>; 2],
    open: [bool; 2],
}

/// In-memory connected socket pair for synchronous workers and tests.
/// Has no OS handle, so `selectable_read_fd` is always `None`.
pub struct PairSocket {
    state: Rc<RefCell<PairState>>,
    side: usize,
}

impl PairSocket {
    pub fn pair() -> (PairSocket, PairSocket) {
        let state = Rc::new(RefCell::new(PairState {
            queues: [VecDeque::new(), VecDeque::new()],
            open: [true, true],
        }));
        (
            PairSocket {
                state: state.clone(),
                side: 0,
            },
            PairSocket { state, side: 1 },
        )
    }
}

impl FramedSocket for PairSocket {
    fn send(&mut self, payload: &[u8]) -> bool {
        let mut state = self.state.borrow_mut();
        if !state.open[self.side] || !state.open[1 - self.side] {
            return false;
        }
        state.queues[1 - self.side].push_back(payload.to_vec());
        true
    }

    fn receive(&mut self) -> Vec<Vec<u8>> {
        // frames delivered before a close are still yielded
        let mut state = self.state.borrow_mut();
        state.queues[self.side].drain(..).collect()
    }

    fn close(&mut self) {
        self.state.borrow_mut().open[self.side] = false;
    }

    fn is_open(&self) -> bool {
        let state = self.state.borrow();
        state.open[self.side] && state.open[1 - self.side]
    }

    fn selectable_read_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Block until any of the given fds is readable or the timeout elapses.
/// With no fds this sleeps for the full duration. Returns whether at least
/// one fd became ready.
pub fn wait_for_readable(fds: &[RawFd], timeout: Duration) -> Result<bool, IpcError> {
    if fds.is_empty() {
        std::thread::sleep(timeout);
        return Ok(false);
    }
    let mut poll_fds: Vec<PollFd> = fds
        .iter()
        .map(|fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN))
        .collect();
    // poll(2) granularity clamps sub-millisecond waits up to 1 ms
    let millis = timeout.as_millis().clamp(1, u16::MAX as u128) as u16;
    match poll(&mut poll_fds, PollTimeout::from(millis)) {
        Ok(n) => Ok(n > 0),
        Err(Errno::EINTR) => Ok(false),
        Err(err) => Err(IpcError::Io(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (PipeSocket, PipeSocket) {
        let (r1, w1) = unistd::pipe().expect("failed to create pipe");
        let (r2, w2) = unistd::pipe().expect("failed to create pipe");
        (
            PipeSocket::new(r1, w2).unwrap(),
            PipeSocket::new(r2, w1).unwrap(),
        )
    }

    #[test]
    fn test_frame_round_trip() {
        let (mut a, mut b) = pipe_pair();

        assert!(a.send(b"hello"));
        assert!(a.send(b""));
        assert!(a.send(&[0xde, 0xad, 0xbe, 0xef]));

        let frames = b.receive();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], b"hello");
        assert_eq!(frames[1], b"");
        assert_eq!(frames[2], &[0xde, 0xad, 0xbe, 0xef]);

        // nothing new buffered
        assert!(b.receive().is_empty());
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let (r1, w1) = unistd::pipe().expect("failed to create pipe");
        let (_r2, w2) = unistd::pipe().expect("failed to create pipe");
        let mut socket = PipeSocket::new(r1, w2).unwrap();

        let payload = b"split me";
        let mut wire = (payload.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(payload);

        // first half only: no complete frame yet
        unistd::write(&w1, &wire[..3]).unwrap();
        assert!(socket.receive().is_empty());

        unistd::write(&w1, &wire[3..]).unwrap();
        let frames = socket.receive();
        assert_eq!(frames, vec![payload.to_vec()]);
    }

    #[test]
    fn test_peer_close_is_silent() {
        let (mut a, mut b) = pipe_pair();
        assert!(a.send(b"last words"));
        drop(a);

        let frames = b.receive();
        assert_eq!(frames, vec![b"last words".to_vec()]);
        assert!(b.receive().is_empty());
        assert!(!b.is_open());
        assert!(b.selectable_read_fd().is_none());
    }

    #[test]
    fn test_oversized_length_closes_socket() {
        let (r1, w1) = unistd::pipe().expect("failed to create pipe");
        let (_r2, w2) = unistd::pipe().expect("failed to create pipe");
        let mut socket = PipeSocket::new(r1, w2).unwrap();

        // forge a length prefix far beyond the cap
        let bogus = ((MAX_FRAME_SIZE as u32) + 1).to_be_bytes();
        unistd::write(&w1, &bogus).unwrap();
        assert!(socket.receive().is_empty());
        assert!(!socket.is_open());
    }

    #[test]
    fn test_pair_socket_round_trip() {
        let (mut a, mut b) = PairSocket::pair();
        assert!(a.send(b"ping"));
        assert!(b.send(b"pong"));
        assert_eq!(b.receive(), vec![b"ping".to_vec()]);
        assert_eq!(a.receive(), vec![b"pong".to_vec()]);
        assert!(a.selectable_read_fd().is_none());
    }

    #[test]
    fn test_pair_socket_close() {
        let (mut a, mut b) = PairSocket::pair();
        assert!(a.send(b"delivered"));
        a.close();
        assert!(!a.send(b"lost"));
        assert!(!b.is_open());
        // frames delivered before the close still drain
        assert_eq!(b.receive(), vec![b"delivered".to_vec()]);
    }

    #[test]
    fn test_wait_for_readable() {
        let (r, w) = unistd::pipe().expect("failed to create pipe");
        let ready =
            wait_for_readable(&[r.as_raw_fd()], Duration::from_millis(10)).unwrap();
        assert!(!ready);

        unistd::write(&w, b"x").unwrap();
        let ready =
            wait_for_readable(&[r.as_raw_fd()], Duration::from_millis(100)).unwrap();
        assert!(ready);
    }
}
