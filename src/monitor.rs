//! The readiness monitor: a set of sources drained over one epoll instance.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use log::{trace, warn};

use crate::event::{Direction, EventSet};
use crate::source::{SharedSource, Source};
use crate::sys::{self, Selector};

/// Default bound on the number of readiness entries handled per drain.
///
/// This is a fairness and footprint ceiling, not a capacity limit: the
/// monitor registers everything level-triggered, so events beyond the batch
/// are re-reported by the next drain.
pub const MAX_EVENTS: usize = 10;

struct Registered {
    handle: SharedSource,
    direction: Direction,
    /// Events currently requested from epoll (minus the implicit errors).
    active: EventSet,
    /// Events delivered by the most recent drain.
    events: EventSet,
    /// Drain pass during which the source was added; sources never see
    /// events captured before they existed (guards fd reuse inside one
    /// drain).
    added_pass: u64,
    /// Removal was requested from within the source's own dispatch; the
    /// drain loop finalises it once the hook returns.
    doomed: bool,
}

/// Owns a set of [`Source`]s and dispatches their readiness events.
///
/// The monitor exposes a single readiness descriptor ([`as_raw_fd`]) for an
/// external event loop to block on; whenever that descriptor is readable,
/// one or more sources have pending events and [`process_events`] will
/// dispatch them without blocking. Dispatch is single-threaded and
/// cooperative: hooks run on the calling thread and may re-enter the
/// monitor to add, activate or remove sources (including the one currently
/// dispatching), but must not call [`process_events`] recursively.
///
/// Adding a source activates only its input direction; output monitoring is
/// switched on and off with [`activate_out`] as the owner acquires and
/// drains work. Sources receiving an error event are removed unconditionally
/// after their hook has observed the events.
///
/// [`Source`]: crate::Source
/// [`as_raw_fd`]: Monitor::as_raw_fd
/// [`process_events`]: Monitor::process_events
/// [`activate_out`]: Monitor::activate_out
///
/// ```no_run
/// use std::fs::File;
/// use std::os::fd::OwnedFd;
///
/// use evio::{Direction, FdSource, Monitor};
///
/// # fn main() -> std::io::Result<()> {
/// let mut mon = Monitor::new()?;
/// let fd: OwnedFd = File::open("/dev/null")?.into();
/// mon.add_source(FdSource::new(fd, Direction::In, |_mon, fd, events| {
///     println!("fd {} ready: {:?}", fd, events);
///     Ok(())
/// })
/// .shared())?;
///
/// loop {
///     // Block on `mon.as_raw_fd()` with poll/select/epoll, then:
///     mon.process_events()?;
/// }
/// # }
/// ```
pub struct Monitor {
    selector: Selector,
    sources: HashMap<RawFd, Registered>,
    scratch: Vec<libc::epoll_event>,
    batch: usize,
    pass: u64,
    dispatching: Option<RawFd>,
}

impl Monitor {
    /// Creates an empty monitor with the default drain batch
    /// ([`MAX_EVENTS`]).
    pub fn new() -> io::Result<Monitor> {
        Monitor::with_batch(MAX_EVENTS)
    }

    /// Creates an empty monitor draining at most `batch` readiness entries
    /// per [`process_events`] call.
    ///
    /// [`process_events`]: Monitor::process_events
    pub fn with_batch(batch: usize) -> io::Result<Monitor> {
        if batch == 0 {
            return Err(sys::errno(libc::EINVAL));
        }
        Ok(Monitor {
            selector: Selector::new()?,
            sources: HashMap::new(),
            scratch: Vec::with_capacity(batch),
            batch,
            pass: 0,
            dispatching: None,
        })
    }

    /// Number of registered sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns true if no source is registered.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Adds a source to the set the monitor watches.
    ///
    /// The source's descriptor is forced non-blocking and must be unique
    /// across the monitor's sources (`EEXIST` otherwise). Monitoring starts
    /// with only the input direction active (if the source has one); error
    /// events are always monitored.
    pub fn add_source(&mut self, source: SharedSource) -> io::Result<()> {
        let (fd, direction) = {
            let src = source
                .try_borrow()
                .map_err(|_| sys::errno(libc::EINVAL))?;
            (src.fd(), src.direction())
        };
        if fd < 0 {
            return Err(sys::errno(libc::EINVAL));
        }
        if self.sources.contains_key(&fd) {
            return Err(sys::errno(libc::EEXIST));
        }
        sys::set_nonblocking(fd)?;

        // By default, only IN monitoring is activated.
        let active = direction.event_set() - EventSet::OUT;
        self.selector
            .register(fd, (active | EventSet::ERROR_EVENTS).bits())?;
        self.sources.insert(
            fd,
            Registered {
                handle: source,
                direction,
                active,
                events: EventSet::EMPTY,
                added_pass: self.pass,
                doomed: false,
            },
        );
        trace!("added source fd={} direction={:?}", fd, direction);
        Ok(())
    }

    /// (De-)activates input monitoring for the source registered on `fd`.
    pub fn activate_in(&mut self, fd: RawFd, active: bool) -> io::Result<()> {
        self.activate(fd, EventSet::IN, active)
    }

    /// (De-)activates output monitoring for the source registered on `fd`.
    pub fn activate_out(&mut self, fd: RawFd, active: bool) -> io::Result<()> {
        self.activate(fd, EventSet::OUT, active)
    }

    fn activate(&mut self, fd: RawFd, direction: EventSet, active: bool) -> io::Result<()> {
        let reg = self
            .sources
            .get_mut(&fd)
            .ok_or_else(|| sys::errno(libc::ENOENT))?;
        if !reg.direction.allows(direction) {
            return Err(sys::errno(libc::EINVAL));
        }
        let old_active = reg.active;
        if active {
            reg.active |= direction;
        } else {
            reg.active = reg.active - direction;
        }
        if old_active == reg.active {
            return Ok(());
        }
        self.selector
            .reregister(fd, (reg.active | EventSet::ERROR_EVENTS).bits())
    }

    /// The active mask of the source registered on `fd`, if any.
    pub fn active(&self, fd: RawFd) -> Option<EventSet> {
        self.sources.get(&fd).map(|reg| reg.active)
    }

    /// The events most recently delivered to the source registered on `fd`.
    pub fn events(&self, fd: RawFd) -> Option<EventSet> {
        self.sources.get(&fd).map(|reg| reg.events)
    }

    /// Removes the source registered on `fd`.
    ///
    /// Removal deregisters the descriptor, closes it and runs the source's
    /// cleanup hook exactly once. A source may remove itself from its own
    /// dispatch hook; finalisation is then deferred until the hook returns.
    pub fn remove_source(&mut self, fd: RawFd) -> io::Result<()> {
        if !self.sources.contains_key(&fd) {
            return Err(sys::errno(libc::ENOENT));
        }
        if self.dispatching == Some(fd) {
            // The source's dispatch hook is on the stack; the drain loop
            // finalises once it returns.
            if let Some(reg) = self.sources.get_mut(&fd) {
                reg.doomed = true;
            }
            return Ok(());
        }
        self.finalize_remove(fd);
        Ok(())
    }

    fn finalize_remove(&mut self, fd: RawFd) {
        let reg = match self.sources.remove(&fd) {
            Some(reg) => reg,
            None => return,
        };
        if let Err(err) = self.selector.deregister(fd) {
            warn!("failed to deregister fd={}: {}", fd, err);
        }
        match reg.handle.try_borrow_mut() {
            Ok(mut src) => src.cleanup(),
            Err(_) => warn!("source fd={} still borrowed at removal, cleanup skipped", fd),
        }
        trace!("removed source fd={}", fd);
    }

    /// Dispatches every event currently reported by the readiness layer, up
    /// to the drain batch, without blocking. Returns the number of sources
    /// dispatched.
    ///
    /// For each readiness entry, in the order the kernel returned them, the
    /// monitor checks that the source still has a pending event within its
    /// current active mask or the error events (a hook that ran earlier in
    /// the same drain may have deactivated it), stores the delivered
    /// events, and calls the dispatch hook. When the delivered events
    /// contain an error, the source is removed afterwards, unconditionally.
    pub fn process_events(&mut self) -> io::Result<usize> {
        if self.dispatching.is_some() {
            return Err(sys::errno(libc::EBUSY));
        }
        self.pass = self.pass.wrapping_add(1);

        let mut scratch = std::mem::take(&mut self.scratch);
        let res = self.selector.select(&mut scratch, self.batch, 0);
        let n = match res {
            Ok(n) => n,
            Err(err) => {
                self.scratch = scratch;
                return Err(err);
            }
        };

        let mut dispatched = 0;
        for entry in scratch.iter().take(n) {
            let fd = entry.u64 as RawFd;
            let events = EventSet::from_bits(entry.events);

            // If during processing, sources are altered, some events may
            // have become irrelevant and must be filtered out.
            let handle = match self.sources.get_mut(&fd) {
                Some(reg) if reg.added_pass != self.pass => {
                    reg.events = events;
                    let pending = events & (reg.active | EventSet::ERROR_EVENTS);
                    if pending.is_empty() {
                        trace!("fd={} stale events {:?} dropped", fd, events);
                        continue;
                    }
                    Rc::clone(&reg.handle)
                }
                _ => continue,
            };

            self.dispatching = Some(fd);
            let ret = handle.borrow_mut().dispatch(self, events);
            self.dispatching = None;
            dispatched += 1;
            if let Err(err) = ret {
                warn!("source fd={} dispatch error: {}", fd, err);
            }

            let doomed = self.sources.get(&fd).map_or(false, |reg| reg.doomed);
            if events.has_error() || doomed {
                self.finalize_remove(fd);
            }
        }

        self.scratch = scratch;
        Ok(dispatched)
    }
}

impl AsRawFd for Monitor {
    /// The readiness descriptor an external loop blocks on.
    fn as_raw_fd(&self) -> RawFd {
        self.selector.as_raw_fd()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        let fds: Vec<RawFd> = self.sources.keys().copied().collect();
        for fd in fds {
            self.finalize_remove(fd);
        }
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Monitor")
            .field("fd", &self.as_raw_fd())
            .field("sources", &self.sources.len())
            .field("batch", &self.batch)
            .finish()
    }
}
