//! Signal demultiplexing over a `signalfd`.

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::warn;

use crate::event::{Direction, EventSet};
use crate::monitor::Monitor;
use crate::source::Source;
use crate::sys;

type SignalFn = Box<dyn FnMut(&mut Monitor, &libc::signalfd_siginfo)>;

/// A [`Source`] surfacing delivery of a set of signals as readable events.
///
/// Initialisation blocks the monitored signals process-wide and records the
/// previous mask; cleanup restores it. The signal mask is a scoped
/// acquisition: callers must not keep two live signal sources contending
/// for the same signals.
pub struct SignalSource {
    fd: Option<OwnedFd>,
    mask: libc::sigset_t,
    old_mask: libc::sigset_t,
    restored: bool,
    last: Option<libc::signalfd_siginfo>,
    cb: SignalFn,
}

impl SignalSource {
    /// Creates a source monitoring `signals`.
    ///
    /// The monitored signals are blocked so that the only delivery path is
    /// the source's descriptor. Neither `SIGKILL` nor `SIGSTOP` can be
    /// monitored; passing one (or an empty set) fails with `EINVAL` before
    /// any mask change.
    pub fn new<F>(signals: &[libc::c_int], cb: F) -> io::Result<SignalSource>
    where
        F: FnMut(&mut Monitor, &libc::signalfd_siginfo) + 'static,
    {
        if signals.is_empty()
            || signals
                .iter()
                .any(|&sig| sig == libc::SIGKILL || sig == libc::SIGSTOP)
        {
            return Err(sys::errno(libc::EINVAL));
        }

        let mut mask: libc::sigset_t = unsafe { mem::zeroed() };
        syscall!(sigemptyset(&mut mask))?;
        for &sig in signals {
            if unsafe { libc::sigaddset(&mut mask, sig) } == -1 {
                return Err(sys::errno(libc::EINVAL));
            }
        }

        let mut old_mask: libc::sigset_t = unsafe { mem::zeroed() };
        syscall!(sigprocmask(libc::SIG_BLOCK, &mask, &mut old_mask))?;

        let fd = match syscall!(signalfd(
            -1,
            &mask,
            libc::SFD_NONBLOCK | libc::SFD_CLOEXEC,
        )) {
            Ok(fd) => fd,
            Err(err) => {
                // Leave the process mask as we found it.
                let _ = syscall!(sigprocmask(
                    libc::SIG_SETMASK,
                    &old_mask,
                    std::ptr::null_mut(),
                ));
                return Err(err);
            }
        };

        Ok(SignalSource {
            // SAFETY: `signalfd(2)` with fd -1 returned a new valid fd.
            fd: Some(unsafe { OwnedFd::from_raw_fd(fd) }),
            mask,
            old_mask,
            restored: false,
            last: None,
            cb: Box::new(cb),
        })
    }

    /// The most recently delivered signal record, if any.
    pub fn last_info(&self) -> Option<&libc::signalfd_siginfo> {
        self.last.as_ref()
    }

    /// Returns true if `sig` is in the monitored set.
    pub fn monitors(&self, sig: libc::c_int) -> bool {
        unsafe { libc::sigismember(&self.mask, sig) == 1 }
    }
}

impl Source for SignalSource {
    fn fd(&self) -> RawFd {
        self.fd.as_ref().map_or(-1, |fd| fd.as_raw_fd())
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

        const INFO_LEN: usize = mem::size_of::<libc::signalfd_siginfo>();
        let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
        let buf = unsafe {
            std::slice::from_raw_parts_mut(&mut info as *mut _ as *mut u8, INFO_LEN)
        };
        match sys::read(fd, buf) {
            Ok(INFO_LEN) => {
                self.last = Some(info);
                (self.cb)(mon, &info);
                Ok(())
            }
            Ok(_) => Err(sys::errno(libc::EIO)),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn cleanup(&mut self) {
        self.fd = None;
        if !self.restored {
            self.restored = true;
            if let Err(err) = syscall!(sigprocmask(
                libc::SIG_SETMASK,
                &self.old_mask,
                std::ptr::null_mut(),
            )) {
                warn!("failed to restore signal mask: {}", err);
            }
        }
    }
}

impl Drop for SignalSource {
    /// Restores the signal mask even if the source was never added to a
    /// monitor.
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl fmt::Debug for SignalSource {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("SignalSource")
            .field("fd", &self.fd())
            .field("last", &self.last.map(|si| si.ssi_signo))
            .finish()
    }
}
