//! Duplex stream engine: ring-buffered reads, queued guarded writes.

use std::cell::{Ref, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::event::{Direction, EventSet};
use crate::monitor::Monitor;
use crate::ring::RingBuffer;
use crate::source::Source;
use crate::sys;
use crate::timer::{Timer, TimerSource};

/// Capacity of the engine's receive ring buffer, in bytes.
pub const IO_RING_CAPACITY: usize = 2048;

/// Write watchdog default: how long the write path may sit not-writable
/// before pending writes are dropped with [`WriteStatus::Timeout`].
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive `EAGAIN` count at which the write path logs a stall warning.
/// Progress remains governed solely by the watchdog.
const WRITE_EAGAIN_WARN: usize = 16;

/// State of one direction of the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoState {
    /// Not transferring: no read callback installed, or no write queued.
    Stopped,
    /// Actively transferring.
    Started,
    /// A terminal error or timeout was hit; the direction holds no work.
    Error,
}

/// Final status delivered to a write buffer's completion callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// The whole payload reached the descriptor.
    Ok,
    /// A terminal write error occurred before the payload was fully sent.
    Error,
    /// The write watchdog expired while the descriptor was not writable.
    Timeout,
    /// The write was cancelled by [`Io::write_abort`] or [`Io::destroy`].
    Aborted,
}

type CompletionFn = Box<dyn FnOnce(WriteBuffer, WriteStatus)>;

/// A payload queued on the engine's write path.
///
/// The buffer owns its payload; the engine neither copies nor drops it.
/// When the transfer reaches a final status the completion callback (if one
/// was installed) receives the buffer back, exactly once: that callback is
/// the point where the caller regains ownership of the payload.
pub struct WriteBuffer {
    payload: Vec<u8>,
    complete: Option<CompletionFn>,
}

impl WriteBuffer {
    /// Wraps `payload` with no completion callback.
    pub fn new(payload: Vec<u8>) -> WriteBuffer {
        WriteBuffer {
            payload,
            complete: None,
        }
    }

    /// Wraps `payload`; `complete` fires exactly once with the final
    /// status.
    pub fn with_completion<F>(payload: Vec<u8>, complete: F) -> WriteBuffer
    where
        F: FnOnce(WriteBuffer, WriteStatus) + 'static,
    {
        WriteBuffer {
            payload,
            complete: Some(Box::new(complete)),
        }
    }

    /// The payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Unwraps the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    fn complete(mut self, status: WriteStatus) {
        if let Some(complete) = self.complete.take() {
            complete(self, status);
        }
    }
}

impl fmt::Debug for WriteBuffer {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("WriteBuffer")
            .field("len", &self.payload.len())
            .field("has_completion", &self.complete.is_some())
            .finish()
    }
}

type ReadFn = Box<dyn FnMut(&mut RingBuffer, usize) -> usize>;

type Completions = Vec<(WriteBuffer, WriteStatus)>;

struct ReadCtx {
    fd: RawFd,
    state: IoState,
    rb: RingBuffer,
    cb: Option<ReadFn>,
    ignore_eof: bool,
    eof_logged: bool,
}

struct WriteCtx {
    fd: RawFd,
    state: IoState,
    timeout: Duration,
    timer: Rc<Timer>,
    timer_fd: RawFd,
    queue: VecDeque<WriteBuffer>,
    current: Option<WriteBuffer>,
    nbwritten: usize,
    nbeagain: usize,
}

struct IoInner {
    name: String,
    dupped: bool,
    log_rx: bool,
    log_tx: bool,
    read: ReadCtx,
    write: WriteCtx,
}

impl IoInner {
    fn handle_read(&mut self, fd: RawFd) {
        if self.read.state != IoState::Started {
            return;
        }
        let ws = self.read.rb.write_slice();
        if ws.is_empty() {
            // Ring full: stop pulling until the callback consumes bytes.
            trace!("{}: rx ring full, read suspended", self.name);
            return;
        }
        match sys::read(fd, ws) {
            Ok(0) => {
                if self.read.ignore_eof {
                    return;
                }
                self.read.state = IoState::Stopped;
                if !self.read.eof_logged {
                    self.read.eof_logged = true;
                    debug!("{}: rx end of file, read stopped", self.name);
                }
            }
            Ok(n) => {
                self.read.rb.commit(n);
                if self.log_rx {
                    debug!("{}: rx {} bytes", self.name, n);
                }
                if let Some(mut cb) = self.read.cb.take() {
                    let consumed = cb(&mut self.read.rb, n);
                    if consumed == 0 {
                        trace!(
                            "{}: rx {} bytes buffered, waiting for more",
                            self.name,
                            self.read.rb.len(),
                        );
                    }
                    self.read.cb = Some(cb);
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                warn!("{}: rx error: {}", self.name, err);
                self.read.state = IoState::Error;
            }
        }
    }

    fn handle_write(&mut self, mon: &mut Monitor, fd: RawFd, out: &mut Completions) {
        if self.write.state != IoState::Started {
            return;
        }
        if self.write.current.is_none() {
            match self.write.queue.pop_front() {
                Some(buffer) => {
                    self.write.current = Some(buffer);
                    self.write.nbwritten = 0;
                    self.write.nbeagain = 0;
                }
                None => {
                    self.write.state = IoState::Stopped;
                    self.write_disarm(mon);
                    return;
                }
            }
        }

        let (res, total) = {
            let current = self.write.current.as_ref().expect("current write buffer");
            let chunk = &current.payload()[self.write.nbwritten..];
            (sys::write(fd, chunk), current.payload().len())
        };
        match res {
            Ok(n) => {
                self.write.nbwritten += n;
                self.write.nbeagain = 0;
                if self.log_tx {
                    debug!("{}: tx {} bytes", self.name, n);
                }
                // Progress restarts the watchdog countdown.
                let _ = self.write.timer.set_period(Some(self.write.timeout));
                if self.write.nbwritten == total {
                    let buffer = self.write.current.take().expect("current write buffer");
                    out.push((buffer, WriteStatus::Ok));
                    match self.write.queue.pop_front() {
                        Some(next) => {
                            self.write.current = Some(next);
                            self.write.nbwritten = 0;
                            self.write.nbeagain = 0;
                        }
                        None => {
                            self.write.state = IoState::Stopped;
                            self.write_disarm(mon);
                        }
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.write.nbeagain += 1;
                if self.write.nbeagain == WRITE_EAGAIN_WARN {
                    warn!(
                        "{}: tx stalled, {} consecutive EAGAIN",
                        self.name, self.write.nbeagain,
                    );
                }
            }
            Err(err) => {
                warn!("{}: tx error: {}", self.name, err);
                self.fail_writes(WriteStatus::Error, out);
                self.write.state = IoState::Error;
                self.write_disarm(mon);
            }
        }
    }

    /// Detaches `current` and every queued buffer, in FIFO order, for
    /// completion with `status`.
    fn fail_writes(&mut self, status: WriteStatus, out: &mut Completions) {
        if let Some(current) = self.write.current.take() {
            out.push((current, status));
        }
        while let Some(buffer) = self.write.queue.pop_front() {
            out.push((buffer, status));
        }
        self.write.nbwritten = 0;
        self.write.nbeagain = 0;
    }

    fn write_disarm(&mut self, mon: &mut Monitor) {
        if self.write.fd >= 0 {
            let _ = mon.activate_out(self.write.fd, false);
        }
        let _ = self.write.timer.set_period(None);
    }

    fn write_pending(&self) -> bool {
        self.write.current.is_some() || !self.write.queue.is_empty()
    }
}

/// The engine's readiness source: one per descriptor, serving the read
/// direction, the write direction, or both when the engine is duplex.
struct IoSource {
    fd: Option<OwnedFd>,
    direction: Direction,
    inner: Weak<RefCell<IoInner>>,
}

impl Source for IoSource {
    fn fd(&self) -> RawFd {
        self.fd.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn dispatch(&mut self, mon: &mut Monitor, events: EventSet) -> io::Result<()> {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return Ok(()),
        };
        let fd = self.fd();
        let mut completions = Completions::new();
        {
            let mut io = inner.borrow_mut();
            if self.direction.readable()
                && events.intersects(EventSet::IN | EventSet::HUP | EventSet::RDHUP)
            {
                io.handle_read(fd);
            }
            if self.direction.writable() && events.contains(EventSet::OUT) {
                io.handle_write(mon, fd, &mut completions);
            }
        }
        // Completion callbacks run with the engine borrow released so they
        // may re-enter it (e.g. queue a follow-up write).
        for (buffer, status) in completions {
            buffer.complete(status);
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.fd = None;
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let mut completions = Completions::new();
        {
            let mut io = inner.borrow_mut();
            if self.direction.readable() {
                // Read state keeps its policy-derived value; EOF handling
                // already ran from the dispatch path.
                io.read.fd = -1;
            }
            if self.direction.writable() {
                io.write.fd = -1;
                if io.write_pending() {
                    io.fail_writes(WriteStatus::Error, &mut completions);
                    io.write.state = IoState::Error;
                }
                let _ = io.write.timer.set_period(None);
            }
        }
        for (buffer, status) in completions {
            buffer.complete(status);
        }
    }
}

impl fmt::Debug for IoSource {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("IoSource")
            .field("fd", &self.fd())
            .field("direction", &self.direction)
            .finish()
    }
}

/// A duplex stream engine over one or two descriptors.
///
/// The engine combines a ring-buffered, callback-parsed read path with a
/// FIFO write queue guarded by a watchdog timer, all registered on a
/// [`Monitor`]. It is a cheap handle; clones drive the same engine.
///
/// Reads: [`read_start`] installs a framing callback which is invoked with
/// the ring buffer every time new bytes arrive; the callback owns the ring
/// buffer's read cursor. Writes: [`write_add`] queues caller-owned buffers
/// which complete, in FIFO order and exactly once each, with a final
/// [`WriteStatus`].
///
/// [`read_start`]: Io::read_start
/// [`write_add`]: Io::write_add
#[derive(Clone)]
pub struct Io {
    inner: Rc<RefCell<IoInner>>,
}

impl Io {
    /// Creates an engine reading from `rx` and writing to `tx`.
    ///
    /// Both descriptors are registered on `mon` (and forced non-blocking).
    /// Both paths start [`IoState::Stopped`]: no read callback, no queued
    /// writes, output monitoring off, watchdog disarmed. With `ignore_eof`
    /// set, zero-byte reads are ignored instead of stopping the read path
    /// (useful for descriptors that can be written to again later, such as
    /// terminals).
    pub fn new(
        mon: &mut Monitor,
        name: &str,
        rx: OwnedFd,
        tx: OwnedFd,
        ignore_eof: bool,
    ) -> io::Result<Io> {
        Io::create(mon, name, rx, Some(tx), ignore_eof)
    }

    /// Creates an engine over a single duplex descriptor serving both
    /// directions (a connected socket, a PTY, ...).
    pub fn new_duplex(
        mon: &mut Monitor,
        name: &str,
        fd: OwnedFd,
        ignore_eof: bool,
    ) -> io::Result<Io> {
        Io::create(mon, name, fd, None, ignore_eof)
    }

    fn create(
        mon: &mut Monitor,
        name: &str,
        rx: OwnedFd,
        tx: Option<OwnedFd>,
        ignore_eof: bool,
    ) -> io::Result<Io> {
        let rx_fd = rx.as_raw_fd();
        let tx_fd = tx.as_ref().map_or(rx_fd, |fd| fd.as_raw_fd());
        let dupped = tx.is_none();

        let timer = Rc::new(Timer::new()?);
        let timer_fd = timer.as_raw_fd();

        let inner = Rc::new(RefCell::new(IoInner {
            name: name.to_owned(),
            dupped,
            log_rx: false,
            log_tx: false,
            read: ReadCtx {
                fd: rx_fd,
                state: IoState::Stopped,
                rb: RingBuffer::with_capacity(IO_RING_CAPACITY),
                cb: None,
                ignore_eof,
                eof_logged: false,
            },
            write: WriteCtx {
                fd: tx_fd,
                state: IoState::Stopped,
                timeout: DEFAULT_WRITE_TIMEOUT,
                timer: Rc::clone(&timer),
                timer_fd,
                queue: VecDeque::new(),
                current: None,
                nbwritten: 0,
                nbeagain: 0,
            },
        }));

        if dupped {
            mon.add_source(Rc::new(RefCell::new(IoSource {
                fd: Some(rx),
                direction: Direction::Duplex,
                inner: Rc::downgrade(&inner),
            })))?;
        } else {
            mon.add_source(Rc::new(RefCell::new(IoSource {
                fd: Some(rx),
                direction: Direction::In,
                inner: Rc::downgrade(&inner),
            })))?;
            if let Err(err) = mon.add_source(Rc::new(RefCell::new(IoSource {
                fd: Some(tx.expect("tx descriptor")),
                direction: Direction::Out,
                inner: Rc::downgrade(&inner),
            }))) {
                let _ = mon.remove_source(rx_fd);
                return Err(err);
            }
        }

        // Write-ready watchdog: expiry with output still armed means the
        // peer stopped draining; every pending write is timed out.
        let weak = Rc::downgrade(&inner);
        let watchdog_timer = Rc::clone(&timer);
        let watchdog_name = name.to_owned();
        let watchdog = TimerSource::with_timer(timer, move |mon, _expirations| {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => {
                    let _ = watchdog_timer.set_period(None);
                    return;
                }
            };
            let mut completions = Completions::new();
            {
                let mut io = inner.borrow_mut();
                if !io.write_pending() {
                    // Stale expiry raced with completion; nothing to drop.
                    let _ = watchdog_timer.set_period(None);
                    return;
                }
                warn!(
                    "{}: tx not ready within {:?}, timing out pending writes",
                    watchdog_name, io.write.timeout,
                );
                io.fail_writes(WriteStatus::Timeout, &mut completions);
                io.write.state = IoState::Error;
                io.write_disarm(mon);
            }
            for (buffer, status) in completions {
                buffer.complete(status);
            }
        });
        if let Err(err) = mon.add_source(Rc::new(RefCell::new(watchdog))) {
            let _ = mon.remove_source(rx_fd);
            if !dupped {
                let _ = mon.remove_source(tx_fd);
            }
            return Err(err);
        }

        Ok(Io { inner })
    }

    /// The engine's diagnostic name.
    pub fn name(&self) -> Ref<'_, str> {
        Ref::map(self.inner.borrow(), |io| io.name.as_str())
    }

    /// Starts the read path.
    ///
    /// Requires the read state to be [`IoState::Stopped`] or
    /// [`IoState::Error`] (`EBUSY` otherwise). With `clear` set, bytes
    /// still buffered from an earlier run are discarded.
    ///
    /// `cb` is invoked with the ring buffer and the number of newly
    /// appended bytes after every successful read. The callback is
    /// authoritative over the ring buffer's read side: it consumes the
    /// frames it recognises and returns how many bytes it consumed, or 0 to
    /// leave everything buffered until more bytes arrive.
    pub fn read_start<F>(&self, cb: F, clear: bool) -> io::Result<()>
    where
        F: FnMut(&mut RingBuffer, usize) -> usize + 'static,
    {
        let mut io = self.inner.borrow_mut();
        if io.read.state == IoState::Started {
            return Err(sys::errno(libc::EBUSY));
        }
        if io.read.fd < 0 {
            return Err(sys::errno(libc::EBADF));
        }
        if clear {
            io.read.rb.clear();
        }
        io.read.cb = Some(Box::new(cb));
        io.read.eof_logged = false;
        io.read.state = IoState::Started;
        Ok(())
    }

    /// Stops the read path: uninstalls the callback and transitions to
    /// [`IoState::Stopped`]. The source stays registered; buffered bytes
    /// are kept.
    pub fn read_stop(&self) -> io::Result<()> {
        let mut io = self.inner.borrow_mut();
        io.read.cb = None;
        io.read.state = IoState::Stopped;
        Ok(())
    }

    /// Current state of the read path.
    pub fn read_state(&self) -> IoState {
        self.inner.borrow().read.state
    }

    /// Current state of the write path.
    pub fn write_state(&self) -> IoState {
        self.inner.borrow().write.state
    }

    /// Queues `buffer` at the tail of the write path.
    ///
    /// An idle engine arms output monitoring and the watchdog; a write path
    /// in [`IoState::Error`] is re-armed by the next `write_add`. Buffers
    /// complete in FIFO order, exactly once each. On a synchronous error
    /// (`EINVAL` for an empty payload, `EBADF` after destruction) the
    /// buffer's completion fires with [`WriteStatus::Error`] before this
    /// returns, so the caller always regains ownership of the payload.
    pub fn write_add(&self, mon: &mut Monitor, buffer: WriteBuffer) -> io::Result<()> {
        if buffer.payload().is_empty() {
            buffer.complete(WriteStatus::Error);
            return Err(sys::errno(libc::EINVAL));
        }
        let mut io = self.inner.borrow_mut();
        if io.write.fd < 0 {
            drop(io);
            buffer.complete(WriteStatus::Error);
            return Err(sys::errno(libc::EBADF));
        }
        let was_idle = !io.write_pending();
        if was_idle {
            if let Err(err) = mon.activate_out(io.write.fd, true) {
                drop(io);
                buffer.complete(WriteStatus::Error);
                return Err(err);
            }
            let _ = io.write.timer.set_period(Some(io.write.timeout));
            io.write.state = IoState::Started;
        }
        io.write.queue.push_back(buffer);
        Ok(())
    }

    /// Cancels the in-flight write and every queued buffer.
    ///
    /// Completions fire with [`WriteStatus::Aborted`], in FIFO order,
    /// before this returns. Output monitoring and the watchdog are
    /// disarmed; the write path returns to [`IoState::Stopped`].
    pub fn write_abort(&self, mon: &mut Monitor) -> io::Result<()> {
        let mut completions = Completions::new();
        {
            let mut io = self.inner.borrow_mut();
            io.fail_writes(WriteStatus::Aborted, &mut completions);
            io.write.state = IoState::Stopped;
            io.write_disarm(mon);
        }
        for (buffer, status) in completions {
            buffer.complete(status);
        }
        Ok(())
    }

    /// Changes the write watchdog timeout. Takes effect the next time the
    /// watchdog is armed (i.e. the next `write_add` on an idle engine or
    /// the next write progress).
    pub fn set_write_timeout(&self, timeout: Duration) {
        self.inner.borrow_mut().write.timeout = timeout;
    }

    /// Toggles traffic logging of received bytes.
    pub fn log_rx(&self, enable: bool) {
        self.inner.borrow_mut().log_rx = enable;
    }

    /// Toggles traffic logging of sent bytes.
    pub fn log_tx(&self, enable: bool) {
        self.inner.borrow_mut().log_tx = enable;
    }

    /// Tears the engine down: aborts pending writes, stops the read path
    /// and removes the engine's sources from `mon` (closing their
    /// descriptors and firing cleanup hooks).
    pub fn destroy(&self, mon: &mut Monitor) -> io::Result<()> {
        self.write_abort(mon)?;
        let (rx_fd, tx_fd, timer_fd, dupped) = {
            let mut io = self.inner.borrow_mut();
            io.read.cb = None;
            io.read.state = IoState::Stopped;
            (io.read.fd, io.write.fd, io.write.timer_fd, io.dupped)
        };
        if rx_fd >= 0 {
            let _ = mon.remove_source(rx_fd);
        }
        if !dupped && tx_fd >= 0 {
            let _ = mon.remove_source(tx_fd);
        }
        if timer_fd >= 0 {
            let _ = mon.remove_source(timer_fd);
        }
        {
            let mut io = self.inner.borrow_mut();
            io.read.fd = -1;
            io.write.fd = -1;
            io.write.timer_fd = -1;
            io.read.rb.clear();
        }
        Ok(())
    }
}

impl fmt::Debug for Io {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let io = self.inner.borrow();
        fmt.debug_struct("Io")
            .field("name", &io.name)
            .field("dupped", &io.dupped)
            .field("read_state", &io.read.state)
            .field("write_state", &io.write.state)
            .field("buffered", &io.read.rb.len())
            .field("queued", &io.write.queue.len())
            .finish()
    }
}
