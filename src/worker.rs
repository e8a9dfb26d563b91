//! One instance of the request pipeline.
//!
//! A worker owns four queues and moves every record it admitted through them
//! until the record is finished. Records never leave the worker that accepted
//! them, so nothing here is shared except the connection count and the
//! shutdown generation in [`Shared`].

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use nix::sys::epoll::{EpollEvent, EpollFlags};

use crate::access_log::AccessLog;
use crate::config::Config;
use crate::finish;
use crate::handoff::{self, Handoff};
use crate::header::{self, PEEK_BUF_LEN};
use crate::http;
use crate::pool::{ConnectionSlot, Shared};
use crate::record::RequestRecord;
use crate::send;
use crate::sys::{self, Epoll, Waker};

/// Most connections accepted in one admission pass.
pub const ACCEPT_BATCH: usize = 64;
/// Longest sleep when a cycle made no progress.
pub const IDLE_SLEEP: Duration = Duration::from_millis(100);

const LISTENER_TOKEN: u64 = u64::MAX;
const WAKER_TOKEN: u64 = u64::MAX - 1;
const MAX_EVENTS: usize = 64;

/// The queue a record belongs in after a stage looked at it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Queue {
    AwaitingHeader,
    Sending,
    Handoff,
    Finishing,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SchedulerState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Counters kept by each worker, summed when the pool stops.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WorkerStats {
    pub accepted: u64,
    /// Connections answered with 503.
    pub rejected: u64,
    pub requests: u64,
    pub served: u64,
    pub not_modified: u64,
    pub handoffs: u64,
    /// Hand-offs that failed and got a 403.
    pub forbidden: u64,
    pub timeouts: u64,
    pub bytes_out: u64,
}

impl WorkerStats {
    pub fn add(&mut self, other: &Self) {
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.requests += other.requests;
        self.served += other.served;
        self.not_modified += other.not_modified;
        self.handoffs += other.handoffs;
        self.forbidden += other.forbidden;
        self.timeouts += other.timeouts;
        self.bytes_out += other.bytes_out;
    }
}

impl fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accepted {}, rejected {}, requests {}, served {}, not modified {}, \
            handed off {}, forbidden {}, timed out {}, bytes out {}",
            self.accepted,
            self.rejected,
            self.requests,
            self.served,
            self.not_modified,
            self.handoffs,
            self.forbidden,
            self.timeouts,
            self.bytes_out
        )
    }
}

pub struct Worker {
    id: usize,
    config: Arc<Config>,
    shared: Arc<Shared>,
    listener: Arc<TcpListener>,
    handoff: Arc<dyn Handoff>,
    access_log: Arc<AccessLog>,
    waker: Arc<Waker>,
    epoll: Epoll,
    events: Vec<EpollEvent>,

    awaiting_header: VecDeque<RequestRecord>,
    sending: VecDeque<RequestRecord>,
    handing_off: VecDeque<RequestRecord>,
    finishing: VecDeque<RequestRecord>,

    state: SchedulerState,
    generation: u64,
    next_request: u64,
    buf: Vec<u8>,
    stats: WorkerStats,
}

impl Worker {
    /// Set up a worker accepting from `listener`, which must be non-blocking.
    pub fn new(
        id: usize,
        config: Arc<Config>,
        shared: Arc<Shared>,
        listener: Arc<TcpListener>,
        handoff: Arc<dyn Handoff>,
        access_log: Arc<AccessLog>,
        waker: Arc<Waker>,
    ) -> io::Result<Self> {
        let epoll = Epoll::new()?;
        epoll.add(listener.as_raw_fd(), EpollFlags::EPOLLIN, LISTENER_TOKEN)?;
        epoll.add(waker.fd(), EpollFlags::EPOLLIN, WAKER_TOKEN)?;
        let generation = shared.generation();
        Ok(Self {
            id,
            config,
            shared,
            listener,
            handoff,
            access_log,
            waker,
            epoll,
            events: vec![EpollEvent::empty(); MAX_EVENTS],
            awaiting_header: VecDeque::new(),
            sending: VecDeque::new(),
            handing_off: VecDeque::new(),
            finishing: VecDeque::new(),
            state: SchedulerState::Idle,
            generation,
            next_request: 0,
            buf: vec![0; PEEK_BUF_LEN],
            stats: WorkerStats::default(),
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Records currently owned by this worker.
    pub fn len(&self) -> usize {
        self.awaiting_header.len()
            + self.sending.len()
            + self.handing_off.len()
            + self.finishing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run until the pool asks for a shutdown, then drain and return the
    /// counters.
    pub fn run(mut self) -> WorkerStats {
        self.state = SchedulerState::Running;
        debug!("worker {}: running", self.id);
        while self.state == SchedulerState::Running {
            if self.shared.generation() != self.generation {
                self.state = SchedulerState::Draining;
                break;
            }
            if !self.cycle(SystemTime::now()) {
                self.idle();
            }
        }
        self.drain();
        info!("worker {}: stopped: {}", self.id, self.stats);
        self.stats
    }

    /// One pass over admission and every stage. True if anything changed.
    pub fn cycle(&mut self, now: SystemTime) -> bool {
        let mut progress = self.admit(now) > 0;
        if !self.is_empty() {
            progress |= self.run_header_stage(now);
            progress |= self.run_send_stage(now);
            progress |= self.run_handoff_stage(now);
            progress |= self.run_finish_stage(now);
            // a connection may have arrived mid-pass
            progress |= self.admit(now) > 0;
        }
        progress
    }

    /// Accept pending connections while the global count allows. Returns the
    /// number admitted.
    pub fn admit(&mut self, now: SystemTime) -> usize {
        let mut admitted = 0;
        for _ in 0..ACCEPT_BATCH {
            // Reserved before accepting so the count never passes the limit.
            // Dropping the slot gives it back.
            let slot = match self.shared.reserve_connection(self.config.max_connections) {
                Some(slot) => slot,
                None => break,
            };
            let (socket, client) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("worker {}: accept failed: {}", self.id, e);
                    break;
                }
            };
            if let Err(e) = socket.set_nonblocking(true) {
                debug!("worker {}: dropping {}: {}", self.id, client, e);
                continue;
            }
            if self.enqueue(socket, client, slot, now) {
                admitted += 1;
            }
        }
        admitted
    }

    /// Queue an accepted connection for its request head, or turn it away
    /// with 503. True if it was queued.
    fn enqueue(
        &mut self,
        socket: TcpStream,
        client: SocketAddr,
        slot: ConnectionSlot,
        now: SystemTime,
    ) -> bool {
        let id = self.next_request;
        self.next_request += 1;
        if let Err(e) = self.register(&socket, id) {
            // dropping the socket and the slot closes and uncounts it
            self.reject(&socket, e);
            return false;
        }
        self.stats.accepted += 1;
        debug!("worker {}: request {}: accepted {}", self.id, id, client);
        self.awaiting_header
            .push_back(RequestRecord::new(id, socket, client, slot, now));
        true
    }

    /// Make room for one more record and watch its socket.
    fn register(&mut self, socket: &TcpStream, id: u64) -> io::Result<()> {
        self.awaiting_header
            .try_reserve(1)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:?}", e)))?;
        self.epoll
            .add(socket.as_raw_fd(), sys::connection_interest(), id)
    }

    fn reject(&mut self, socket: &TcpStream, e: io::Error) {
        warn!("worker {}: rejecting connection: {}", self.id, e);
        self.stats.rejected += 1;
        let reply = http::service_unavailable(&self.config.server_name);
        sys::send(socket.as_raw_fd(), reply.as_bytes()).ok();
    }

    fn route(&mut self, record: RequestRecord, queue: Queue) {
        match queue {
            Queue::AwaitingHeader => self.awaiting_header.push_back(record),
            Queue::Sending => self.sending.push_back(record),
            Queue::Handoff => self.handing_off.push_back(record),
            Queue::Finishing => self.finishing.push_back(record),
        }
    }

    fn run_header_stage(&mut self, now: SystemTime) -> bool {
        let mut changed = false;
        for _ in 0..self.awaiting_header.len() {
            let mut record = match self.awaiting_header.pop_front() {
                Some(record) => record,
                None => break,
            };
            let next = header::poll(
                &self.config,
                &mut record,
                &mut self.buf,
                now,
                &mut self.stats,
            );
            changed |= next != Queue::AwaitingHeader;
            self.route(record, next);
        }
        changed
    }

    fn run_send_stage(&mut self, now: SystemTime) -> bool {
        let mut changed = false;
        for _ in 0..self.sending.len() {
            let mut record = match self.sending.pop_front() {
                Some(record) => record,
                None => break,
            };
            let sent = record.bytes_sent;
            let next = send::poll(&self.config, &mut record, now, &mut self.stats);
            changed |= next != Queue::Sending || record.bytes_sent != sent;
            self.route(record, next);
        }
        changed
    }

    fn run_handoff_stage(&mut self, now: SystemTime) -> bool {
        let mut changed = false;
        while let Some(mut record) = self.handing_off.pop_front() {
            let next = handoff::poll(
                &self.config,
                &self.epoll,
                &*self.handoff,
                &mut record,
                now,
                &mut self.stats,
            );
            self.route(record, next);
            changed = true;
        }
        changed
    }

    fn run_finish_stage(&mut self, now: SystemTime) -> bool {
        let mut changed = false;
        while let Some(record) = self.finishing.pop_front() {
            finish::poll(record, &self.access_log, now, &mut self.buf);
            changed = true;
        }
        changed
    }

    /// Sleep until a socket becomes ready, the pool wakes us, or the idle
    /// interval passes.
    fn idle(&mut self) {
        match self.epoll.wait(&mut self.events, IDLE_SLEEP) {
            Ok(n) => {
                if self.events[..n].iter().any(|e| e.data() == WAKER_TOKEN) {
                    self.waker.reset();
                }
            }
            Err(e) => {
                warn!("worker {}: epoll_wait failed: {}", self.id, e);
                thread::sleep(IDLE_SLEEP);
            }
        }
    }

    /// Discard everything in flight.
    fn drain(&mut self) {
        self.state = SchedulerState::Draining;
        let in_flight = self.len();
        for record in self
            .awaiting_header
            .drain(..)
            .chain(self.sending.drain(..))
            .chain(self.handing_off.drain(..))
        {
            self.finishing.push_back(record);
        }
        self.run_finish_stage(SystemTime::now());
        if in_flight > 0 {
            info!("worker {}: dropped {} requests in flight", self.id, in_flight);
        }
        self.state = SchedulerState::Stopped;
    }
}
