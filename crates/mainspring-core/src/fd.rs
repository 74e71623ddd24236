//! Small file-descriptor utilities shared by the backends, the wakeup pipe,
//! and the signal pipes.

use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

/// Put a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a caller-supplied fd; F_GETFL/F_SETFL do not touch
    // memory.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Mark a descriptor close-on-exec.
pub fn set_close_on_exec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a caller-supplied fd.
    unsafe {
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Create a pipe with both ends non-blocking, returned as (read, write).
pub(crate) fn nonblocking_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [0; 2];
    // SAFETY: fds is a 2-element array matching pipe()'s expected output.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just returned by pipe() and are owned
    // exclusively here.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_nonblocking(fds[0])?;
    set_nonblocking(fds[1])?;
    Ok((read, write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn pipe_is_nonblocking() {
        let (read, _write) = nonblocking_pipe().unwrap();
        let mut buf = [0u8; 1];
        // SAFETY: reading into a valid buffer from our own fd.
        let n = unsafe { libc::read(read.as_raw_fd(), buf.as_mut_ptr() as *mut _, 1) };
        assert_eq!(n, -1);
        assert_eq!(io::Error::last_os_error().raw_os_error(), Some(libc::EAGAIN));
    }

    #[test]
    fn close_on_exec_sets_flag() {
        let (read, _write) = nonblocking_pipe().unwrap();
        set_close_on_exec(read.as_raw_fd()).unwrap();
        // SAFETY: F_GETFD on our own fd.
        let flags = unsafe { libc::fcntl(read.as_raw_fd(), libc::F_GETFD) };
        assert!(flags & libc::FD_CLOEXEC != 0);
    }
}
