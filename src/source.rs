//! The source protocol: one descriptor, its direction type, and hooks.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use crate::event::{Direction, EventSet};
use crate::monitor::Monitor;

/// A shared handle to a registered source.
///
/// The monitor keeps one clone of the handle; the caller may keep another to
/// drive source-specific operations (e.g. re-arming a timer) while the
/// source is registered. The core is single-threaded, so sharing is
/// `Rc`/`RefCell` based.
pub type SharedSource = Rc<RefCell<dyn Source>>;

/// An I/O interest that can be registered with a [`Monitor`].
///
/// A source wraps exactly one file descriptor together with the set of
/// directions it can ever serve and a dispatch hook. The monitor:
///
/// - forces the descriptor non-blocking when the source is added,
/// - calls [`dispatch`] with the readiness events the kernel delivered
///   (hooks must tolerate spurious or stale bits),
/// - removes the source when an error event is delivered, closing the
///   descriptor and calling [`cleanup`] exactly once.
///
/// [`Monitor`]: crate::Monitor
/// [`dispatch`]: Source::dispatch
/// [`cleanup`]: Source::cleanup
pub trait Source {
    /// The registered descriptor. Identifies the source inside its monitor;
    /// no two sources of one monitor may share a descriptor.
    fn fd(&self) -> RawFd;

    /// The set of directions this source can ever serve.
    fn direction(&self) -> Direction;

    /// Readiness hook, called from [`Monitor::process_events`].
    ///
    /// `events` is the bitset reported by the readiness layer. The hook may
    /// freely call back into the monitor (activate directions, add or
    /// remove sources, including removing itself). An `Err` return is
    /// logged by the monitor and otherwise ignored; user-visible errors
    /// travel through the source's own callback semantics.
    ///
    /// [`Monitor::process_events`]: crate::Monitor::process_events
    fn dispatch(&mut self, mon: &mut Monitor, events: EventSet) -> io::Result<()>;

    /// Removal hook, called exactly once when the source leaves its
    /// monitor. Implementations close their descriptor here and release
    /// any process-wide resources they acquired.
    fn cleanup(&mut self) {}
}

type DispatchFn = Box<dyn FnMut(&mut Monitor, RawFd, EventSet) -> io::Result<()>>;

/// A generic [`Source`] over a caller-supplied descriptor.
///
/// The dispatch hook receives the monitor, the source's descriptor and the
/// delivered events; the optional clean hook runs after the descriptor has
/// been closed on removal.
pub struct FdSource {
    fd: Option<OwnedFd>,
    direction: Direction,
    dispatch: DispatchFn,
    clean: Option<Box<dyn FnOnce()>>,
}

impl FdSource {
    /// Creates a source over `fd` serving `direction`.
    pub fn new<F>(fd: OwnedFd, direction: Direction, dispatch: F) -> FdSource
    where
        F: FnMut(&mut Monitor, RawFd, EventSet) -> io::Result<()> + 'static,
    {
        FdSource {
            fd: Some(fd),
            direction,
            dispatch: Box::new(dispatch),
            clean: None,
        }
    }

    /// Installs a clean hook, invoked once after the descriptor is closed
    /// on removal from the monitor.
    pub fn on_clean<F>(mut self, clean: F) -> FdSource
    where
        F: FnOnce() + 'static,
    {
        self.clean = Some(Box::new(clean));
        self
    }

    /// Wraps the source in a [`SharedSource`] handle.
    pub fn shared(self) -> Rc<RefCell<FdSource>> {
        Rc::new(RefCell::new(self))
    }
}

impl Source for FdSource {
    fn fd(&self) -> RawFd {
        self.fd.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn dispatch(&mut self, mon: &mut Monitor, events: EventSet) -> io::Result<()> {
        let fd = self.fd();
        (self.dispatch)(mon, fd, events)
    }

    fn cleanup(&mut self) {
        self.fd = None;
        if let Some(clean) = self.clean.take() {
            clean();
        }
    }
}

impl fmt::Debug for FdSource {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("FdSource")
            .field("fd", &self.fd())
            .field("direction", &self.direction)
            .finish()
    }
}
