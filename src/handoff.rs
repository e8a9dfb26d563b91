//! Passing connections the workers won't serve to a cooperating server.
//!
//! The request head is only ever peeked, never consumed, so whoever receives
//! the connection reads the request from the start. Two transports exist:
//!
//! - [`DescriptorHandoff`] sends the socket itself over a Unix stream socket
//!   (`SCM_RIGHTS`). The receiving process gets the live connection, no new
//!   handshake involved; [`receive_connection`] is its half of the protocol.
//! - [`RelayHandoff`] connects to the cooperating server over TCP and copies
//!   bytes between it and the client.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::socket::{
    self, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockAddr, SockFlag,
    SockType,
};
use nix::sys::uio::IoVec;
use nix::unistd::close;

use crate::config::Config;
use crate::http;
use crate::pool::ConnectionSlot;
use crate::record::RequestRecord;
use crate::sys::{self, Epoll};
use crate::worker::{Queue, WorkerStats};

/// Payload accompanying a passed descriptor.
pub const HANDOFF_MAGIC: &[u8] = b"KHTTPD1";
/// Bound on connecting to the cooperating server when relaying.
pub const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Transfers an established connection to another server.
///
/// On success the other side owns the connection and the caller only closes
/// its own descriptor. On failure the connection is untouched.
///
/// `slot` is the connection's share of the global count. A transport that
/// keeps serving the connection from this process takes it, so the
/// connection stays counted until it really ends.
pub trait Handoff: Send + Sync {
    fn hand_off(&self, socket: &TcpStream, slot: &mut Option<ConnectionSlot>) -> io::Result<()>;
}

/// Build the hand-off transport the configuration asks for.
pub fn from_config(config: &Config) -> Arc<dyn Handoff> {
    match &config.handoff_socket {
        Some(path) => Arc::new(DescriptorHandoff::new(path)),
        None => Arc::new(RelayHandoff::new(config.handoff_socket_addr(), config.timeout)),
    }
}

/// Passes the socket descriptor over a Unix stream socket.
#[derive(Debug)]
pub struct DescriptorHandoff {
    path: PathBuf,
}

impl DescriptorHandoff {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Non-blocking connect, so a full backlog fails with EAGAIN instead of
    /// stalling the worker.
    fn connect(&self) -> io::Result<UnixStream> {
        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(sys::to_io)?;
        let channel = unsafe { UnixStream::from_raw_fd(fd) };
        let addr = SockAddr::new_unix(self.path.as_path()).map_err(sys::to_io)?;
        socket::connect(channel.as_raw_fd(), &addr).map_err(sys::to_io)?;
        Ok(channel)
    }
}

impl Handoff for DescriptorHandoff {
    fn hand_off(
        &self,
        socket: &TcpStream,
        _slot: &mut Option<ConnectionSlot>,
    ) -> io::Result<()> {
        let channel = self.connect()?;
        let fds = [socket.as_raw_fd()];
        let iov = [IoVec::from_slice(HANDOFF_MAGIC)];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        let sent = socket::sendmsg(
            channel.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::MSG_DONTWAIT | MsgFlags::from_bits_truncate(libc::MSG_NOSIGNAL),
            None,
        )
        .map_err(sys::to_io)?;
        if sent != HANDOFF_MAGIC.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write on hand-off channel",
            ));
        }
        Ok(())
    }
}

/// Accept one passed connection on `listener`.
///
/// This is the cooperating server's side of [`DescriptorHandoff`].
pub fn receive_connection(listener: &UnixListener) -> io::Result<TcpStream> {
    let (channel, _) = listener.accept()?;
    let mut buf = [0; 16];
    let iov = [IoVec::from_mut_slice(&mut buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let msg = socket::recvmsg(
        channel.as_raw_fd(),
        &iov,
        Some(&mut cmsg_buffer),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(sys::to_io)?;

    let mut received = None;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for fd in fds {
                if received.is_none() {
                    received = Some(fd);
                } else {
                    close(fd).ok();
                }
            }
        }
    }
    let fd = received.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "no descriptor on hand-off channel")
    })?;
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    if msg.bytes != HANDOFF_MAGIC.len() || &buf[..HANDOFF_MAGIC.len()] != HANDOFF_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected payload on hand-off channel",
        ));
    }
    stream.set_nonblocking(false)?;
    Ok(stream)
}

/// Relays the connection to a server listening on a TCP port.
///
/// Each relayed connection runs two blocking copy threads, one per
/// direction. Both share the connection's slot, and both give up after
/// `timeout` without traffic.
#[derive(Debug)]
pub struct RelayHandoff {
    addr: SocketAddr,
    timeout: Option<Duration>,
}

impl RelayHandoff {
    pub fn new(addr: SocketAddr, timeout: Option<Duration>) -> Self {
        Self { addr, timeout }
    }
}

impl Handoff for RelayHandoff {
    fn hand_off(
        &self,
        socket: &TcpStream,
        slot: &mut Option<ConnectionSlot>,
    ) -> io::Result<()> {
        let upstream = TcpStream::connect_timeout(&self.addr, RELAY_CONNECT_TIMEOUT)?;
        upstream.set_read_timeout(self.timeout)?;
        upstream.set_write_timeout(self.timeout)?;
        let client = socket.try_clone()?;
        client.set_read_timeout(self.timeout)?;
        client.set_write_timeout(self.timeout)?;
        let client_reader = client.try_clone()?;
        let upstream_writer = upstream.try_clone()?;

        // The relay threads block; the flag is shared with the worker's
        // descriptor, which is closed right after a successful hand-off.
        client.set_nonblocking(false)?;
        let held = Arc::new(slot.take());
        let request_slot = Arc::clone(&held);
        let spawned = thread::Builder::new()
            .name("khttpd-relay".to_string())
            .spawn(move || {
                relay(client_reader, upstream_writer, Shutdown::Write);
                drop(request_slot);
            });
        if let Err(e) = spawned {
            client.set_nonblocking(true).ok();
            if let Ok(taken) = Arc::try_unwrap(held) {
                *slot = taken;
            }
            return Err(e);
        }
        // From here on the request direction is running; a failure to start
        // the response direction still counts as handed off, the client just
        // sees the connection close.
        if let Err(e) = thread::Builder::new()
            .name("khttpd-relay".to_string())
            .spawn(move || {
                relay(upstream, client, Shutdown::Both);
                drop(held);
            })
        {
            warn!("failed to start relay thread: {}", e);
        }
        Ok(())
    }
}

/// Copy until EOF, an error or a timeout, then shut `to` down.
fn relay(mut from: TcpStream, mut to: TcpStream, how: Shutdown) {
    if let Err(e) = io::copy(&mut from, &mut to) {
        debug!("relay ended: {}", e);
    }
    to.shutdown(how).ok();
}

/// Hand-off stage: give the connection away, or refuse it with 403.
///
/// The descriptor is removed from the worker's epoll set first: a passed or
/// duplicated descriptor shares the registration, which would outlive the
/// worker's own copy.
pub fn poll(
    config: &Config,
    epoll: &Epoll,
    handoff: &dyn Handoff,
    record: &mut RequestRecord,
    now: SystemTime,
    stats: &mut WorkerStats,
) -> Queue {
    let socket = match record.socket.take() {
        Some(socket) => socket,
        None => return Queue::Finishing,
    };
    if let Err(e) = epoll.delete(socket.as_raw_fd()) {
        debug!("request {}: failed to deregister: {}", record.id, e);
    }

    match handoff.hand_off(&socket, record.slot_mut()) {
        Ok(()) => {
            debug!("request {}: handed off", record.id);
            record.handed_off = true;
            stats.handoffs += 1;
        }
        Err(e) => {
            debug!("request {}: hand-off failed: {}", record.id, e);
            let reply = http::forbidden(&config.server_name);
            match sys::send(socket.as_raw_fd(), reply.as_bytes()) {
                Ok(_) | Err(nix::Error::Sys(Errno::EAGAIN)) => {}
                Err(e) => debug!("request {}: failed to send 403: {}", record.id, e),
            }
            record.http_code = 403;
            stats.forbidden += 1;
            record.socket = Some(socket);
        }
    }
    record.touch(now);
    Queue::Finishing
}
