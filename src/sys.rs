//! Safe wrappers for the system calls the stages rely on.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::sys::socket::{self, sockopt, MsgFlags};
use nix::unistd::{close, read, write};

/// Convert a nix error into an I/O error.
pub fn to_io(e: nix::Error) -> io::Error {
    match e {
        nix::Error::Sys(errno) => io::Error::from_raw_os_error(errno as i32),
        e => io::Error::new(io::ErrorKind::Other, e),
    }
}

/// Convert an I/O error into a nix error, keeping the errno.
pub fn from_io(e: &io::Error) -> nix::Error {
    nix::Error::Sys(Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO)))
}

/// True for errors meaning the peer is gone.
pub fn is_disconnect(e: &nix::Error) -> bool {
    matches!(
        e,
        nix::Error::Sys(Errno::ECONNRESET)
            | nix::Error::Sys(Errno::ENOTCONN)
            | nix::Error::Sys(Errno::EPIPE)
            | nix::Error::Sys(Errno::ECONNABORTED)
    )
}

/// Copy pending input into `buf` without consuming it.
pub fn peek(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    socket::recv(fd, buf, MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT)
}

/// Consume and discard pending input.
pub fn discard(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    socket::recv(fd, buf, MsgFlags::MSG_DONTWAIT)
}

/// Non-blocking send that never raises SIGPIPE.
pub fn send(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
    let flags = MsgFlags::MSG_DONTWAIT | MsgFlags::from_bits_truncate(libc::MSG_NOSIGNAL);
    socket::send(fd, buf, flags)
}

/// Safe wrapper for `libc::sendfile64`.
pub fn sendfile64(
    out_fd: RawFd,
    in_fd: RawFd,
    offset: Option<&mut libc::off64_t>,
    count: usize,
) -> nix::Result<usize> {
    let offset = offset
        .map(|offset| offset as *mut _)
        .unwrap_or(std::ptr::null_mut());
    let ret = unsafe { libc::sendfile64(out_fd, in_fd, offset, count) };
    Errno::result(ret).map(|r| r as usize)
}

/// Bytes queued on a socket that the peer hasn't acknowledged yet.
fn unsent_bytes(fd: RawFd) -> io::Result<usize> {
    let mut outq: libc::c_int = 0;
    if unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut outq as *mut libc::c_int) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(outq.max(0) as usize)
}

/// Free space in a socket's send buffer.
pub fn send_space(fd: RawFd) -> io::Result<usize> {
    let sndbuf = socket::getsockopt(fd, sockopt::SndBuf).map_err(to_io)?;
    Ok(sndbuf.saturating_sub(unsent_bytes(fd)?))
}

/// Owned epoll instance.
#[derive(Debug)]
pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).map_err(to_io)?;
        Ok(Self { fd })
    }

    /// Register `fd` for edge-triggered notifications.
    pub fn add(&self, fd: RawFd, interest: EpollFlags, token: u64) -> io::Result<()> {
        let mut event = EpollEvent::new(interest | EpollFlags::EPOLLET, token);
        epoll_ctl(self.fd, EpollOp::EpollCtlAdd, fd, &mut event).map_err(to_io)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        epoll_ctl(self.fd, EpollOp::EpollCtlDel, fd, None).map_err(to_io)
    }

    /// Wait at most `timeout` for events. An interrupted wait returns no events.
    pub fn wait(&self, events: &mut [EpollEvent], timeout: Duration) -> io::Result<usize> {
        let timeout_ms = timeout.as_millis().min(isize::MAX as u128) as isize;
        match epoll_wait(self.fd, events, timeout_ms) {
            Ok(n) => Ok(n),
            Err(nix::Error::Sys(Errno::EINTR)) => Ok(0),
            Err(e) => Err(to_io(e)),
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        close(self.fd).ok();
    }
}

/// Interest set for client connections.
pub fn connection_interest() -> EpollFlags {
    EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT | EpollFlags::EPOLLRDHUP
}

/// eventfd used to interrupt a sleeping worker.
#[derive(Debug)]
pub struct Waker {
    fd: RawFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let fd = eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK).map_err(to_io)?;
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn wake(&self) -> io::Result<()> {
        match write(self.fd, &1u64.to_ne_bytes()) {
            // counter saturated, a wake-up is pending anyway
            Ok(_) | Err(nix::Error::Sys(Errno::EAGAIN)) => Ok(()),
            Err(e) => Err(to_io(e)),
        }
    }

    /// Reset the counter so the next wake-up produces a new edge.
    pub fn reset(&self) {
        let mut buf = [0; 8];
        read(self.fd, &mut buf).ok();
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        close(self.fd).ok();
    }
}
