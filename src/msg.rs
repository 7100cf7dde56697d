//! Fixed-length message framing over a descriptor.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::event::{Direction, EventSet};
use crate::monitor::Monitor;
use crate::source::Source;
use crate::sys;

/// What a [`MsgSource`] callback is invoked for.
pub enum MsgEvent<'a> {
    /// A complete message was received; the slice is exactly the configured
    /// message length.
    In(&'a [u8]),
    /// The descriptor is ready for output; the callback fills the slot with
    /// the next message to send (or leaves it empty to send nothing).
    Out(&'a mut Option<Vec<u8>>),
}

impl fmt::Debug for MsgEvent<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgEvent::In(message) => fmt.debug_tuple("In").field(&message.len()).finish(),
            MsgEvent::Out(slot) => fmt.debug_tuple("Out").field(&slot.is_some()).finish(),
        }
    }
}

type MsgFn = Box<dyn FnMut(&mut Monitor, RawFd, MsgEvent<'_>)>;

/// A [`Source`] transferring fixed-length messages.
///
/// With `perform_io` set, the source reads and writes the messages itself:
/// an input readiness yields exactly one message of `len` bytes to the
/// callback (a short transfer is a hard `EIO`), an output readiness asks
/// the callback for the next message and writes it out. With `perform_io`
/// clear, the callback performs the transfers on the descriptor it is
/// handed and the source only drives the framing protocol.
pub struct MsgSource {
    fd: Option<OwnedFd>,
    direction: Direction,
    len: usize,
    rcv_buf: Vec<u8>,
    send_buf: Option<Vec<u8>>,
    perform_io: bool,
    cb: Option<MsgFn>,
    clean: Option<Box<dyn FnOnce()>>,
}

impl MsgSource {
    /// Creates a message source over `fd` for messages of exactly `len`
    /// bytes. `len` must be non-zero (`EINVAL`).
    pub fn new<F>(
        fd: OwnedFd,
        direction: Direction,
        len: usize,
        perform_io: bool,
        cb: F,
    ) -> io::Result<MsgSource>
    where
        F: FnMut(&mut Monitor, RawFd, MsgEvent<'_>) + 'static,
    {
        if len == 0 {
            return Err(sys::errno(libc::EINVAL));
        }
        Ok(MsgSource {
            fd: Some(fd),
            direction,
            len,
            rcv_buf: vec![0; len],
            send_buf: None,
            perform_io,
            cb: Some(Box::new(cb)),
            clean: None,
        })
    }

    /// Installs a clean hook, invoked once when the source is removed.
    pub fn on_clean<F>(mut self, clean: F) -> MsgSource
    where
        F: FnOnce() + 'static,
    {
        self.clean = Some(Box::new(clean));
        self
    }

    /// Queues `message` as the next message to send. Normally called from
    /// the [`MsgEvent::Out`] callback; may also be called up front, before
    /// output is activated.
    pub fn set_next_message(&mut self, message: Vec<u8>) -> io::Result<()> {
        if message.len() != self.len {
            return Err(sys::errno(libc::EINVAL));
        }
        self.send_buf = Some(message);
        Ok(())
    }

    /// The receive buffer holding the most recent message.
    pub fn message(&self) -> &[u8] {
        &self.rcv_buf
    }

    /// The configured message length.
    pub fn message_len(&self) -> usize {
        self.len
    }

    fn recv(&mut self, mon: &mut Monitor, fd: RawFd) -> io::Result<()> {
        if self.perform_io {
            match sys::read(fd, &mut self.rcv_buf) {
                Ok(n) if n == self.len => {}
                Ok(_) => return Err(sys::errno(libc::EIO)),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        if let Some(mut cb) = self.cb.take() {
            cb(mon, fd, MsgEvent::In(&self.rcv_buf));
            self.cb = Some(cb);
        }
        Ok(())
    }

    fn send(&mut self, mon: &mut Monitor, fd: RawFd) -> io::Result<()> {
        // The callback prepares us something to send.
        if let Some(mut cb) = self.cb.take() {
            cb(mon, fd, MsgEvent::Out(&mut self.send_buf));
            self.cb = Some(cb);
        }
        if !self.perform_io {
            return Ok(());
        }
        let message = match self.send_buf.take() {
            Some(message) => message,
            None => return Ok(()),
        };
        match sys::write(fd, &message) {
            Ok(n) if n == self.len => Ok(()),
            Ok(_) => Err(sys::errno(libc::EIO)),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Not sent; keep it queued for the next readiness.
                self.send_buf = Some(message);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl Source for MsgSource {
    fn fd(&self) -> RawFd {
        self.fd.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn dispatch(&mut self, mon: &mut Monitor, events: EventSet) -> io::Result<()> {
        if events.has_error() {
            // The monitor's error path removes the source after this hook.
            return Ok(());
        }
        let fd = self.fd();
        if fd < 0 {
            return Ok(());
        }
        if self.direction.readable() && events.contains(EventSet::IN) {
            return self.recv(mon, fd);
        }
        if self.direction.writable() && events.contains(EventSet::OUT) {
            return self.send(mon, fd);
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.fd = None;
        self.cb = None;
        self.send_buf = None;
        self.rcv_buf.clear();
        if let Some(clean) = self.clean.take() {
            clean();
        }
    }
}

impl fmt::Debug for MsgSource {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("MsgSource")
            .field("fd", &self.fd())
            .field("direction", &self.direction)
            .field("len", &self.len)
            .field("perform_io", &self.perform_io)
            .finish()
    }
}
