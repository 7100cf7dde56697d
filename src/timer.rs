//! Interval timer exposed as a readable source.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use crate::event::{Direction, EventSet};
use crate::monitor::Monitor;
use crate::source::Source;
use crate::sys;

/// A shared handle over a `timerfd`.
///
/// The handle is separate from [`TimerSource`] so the period can be changed
/// from anywhere, including from within the timer's own dispatch hook,
/// without touching the registered source. Cloning the `Rc` shares the
/// underlying descriptor; it is closed when the last handle drops.
pub struct Timer {
    fd: OwnedFd,
}

impl Timer {
    /// Creates a disarmed monotonic timer.
    pub fn new() -> io::Result<Timer> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        ))?;
        // SAFETY: `timerfd_create(2)` ensures the fd is valid.
        Ok(Timer {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Arms the timer to expire every `period`, starting one period from
    /// now. `None` disarms it.
    pub fn set_period(&self, period: Option<Duration>) -> io::Result<()> {
        let ts = |d: Duration| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        };
        let zero = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let spec = match period {
            Some(period) => libc::itimerspec {
                it_interval: ts(period),
                it_value: ts(period),
            },
            None => libc::itimerspec {
                it_interval: zero,
                it_value: zero,
            },
        };
        syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &spec,
            std::ptr::null_mut(),
        ))
        .map(|_| ())
    }
}

impl AsRawFd for Timer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Timer").field("fd", &self.as_raw_fd()).finish()
    }
}

type TimerFn = Box<dyn FnMut(&mut Monitor, u64)>;

/// A [`Source`] delivering timer expirations to a callback.
///
/// The callback receives the number of expirations elapsed since the
/// previous delivery (normally 1; more when drains lag behind the period).
pub struct TimerSource {
    timer: Option<Rc<Timer>>,
    cb: TimerFn,
}

impl TimerSource {
    /// Creates a disarmed timer source; arm it with [`set_period`].
    ///
    /// [`set_period`]: TimerSource::set_period
    pub fn new<F>(cb: F) -> io::Result<TimerSource>
    where
        F: FnMut(&mut Monitor, u64) + 'static,
    {
        Ok(TimerSource::with_timer(Rc::new(Timer::new()?), cb))
    }

    /// Creates a source over an existing shared [`Timer`].
    pub fn with_timer<F>(timer: Rc<Timer>, cb: F) -> TimerSource
    where
        F: FnMut(&mut Monitor, u64) + 'static,
    {
        TimerSource {
            timer: Some(timer),
            cb: Box::new(cb),
        }
    }

    /// Changes the period; `None` disarms. See [`Timer::set_period`].
    pub fn set_period(&self, period: Option<Duration>) -> io::Result<()> {
        match &self.timer {
            Some(timer) => timer.set_period(period),
            None => Err(sys::errno(libc::EBADF)),
        }
    }

    /// The shared handle over the underlying timer.
    pub fn timer(&self) -> Option<Rc<Timer>> {
        self.timer.clone()
    }
}

impl Source for TimerSource {
    fn fd(&self) -> RawFd {
        self.timer.as_ref().map_or(-1, |t| t.as_raw_fd())
    }

    fn direction(&self) -> Direction {
        Direction::In
    }

    fn dispatch(&mut self, mon: &mut Monitor, events: EventSet) -> io::Result<()> {
        if events.has_error() {
            return Ok(());
        }
        let fd = self.fd();
        if fd < 0 {
            return Ok(());
        }
        let mut buf = [0u8; 8];
        match sys::read(fd, &mut buf) {
            Ok(8) => {
                let expirations = u64::from_ne_bytes(buf);
                (self.cb)(mon, expirations);
                Ok(())
            }
            Ok(_) => Err(sys::errno(libc::EIO)),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn cleanup(&mut self) {
        self.timer = None;
    }
}

impl fmt::Debug for TimerSource {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TimerSource").field("fd", &self.fd()).finish()
    }
}
