use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

mod selector;

pub(crate) use self::selector::Selector;

/// Forces a descriptor into non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    if flags & libc::O_NONBLOCK == 0 {
        syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
}

/// Creates a close-on-exec pipe, returning the `(read, write)` ends.
///
/// The ends are left blocking; the monitor forces every descriptor
/// non-blocking when a source is added.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1, -1];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC))?;
    // SAFETY: `pipe2(2)` returned two valid, owned descriptors.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// `read(2)` with `EINTR` retry.
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())) {
            Ok(n) => return Ok(n as usize),
            Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// `write(2)` with `EINTR` retry.
pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        match syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())) {
            Ok(n) => return Ok(n as usize),
            Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}
