use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};

use crate::access_log::AccessLog;
use crate::config::Config;
use crate::handoff::{self, Handoff};
use crate::sys::Waker;
use crate::worker::{Worker, WorkerStats};

/// State shared by all workers. Everything else is private to one worker.
#[derive(Debug, Default)]
pub struct Shared {
    connections: AtomicUsize,
    generation: AtomicU64,
}

impl Shared {
    /// Count a new connection, unless that would take the total past `max`.
    pub fn reserve_connection(self: &Arc<Self>, max: usize) -> Option<ConnectionSlot> {
        self.connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .ok()
            .map(|_| ConnectionSlot {
                shared: Arc::clone(self),
            })
    }

    /// Connections currently tracked by all workers.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Ask every worker to drain its queues and stop.
    pub fn request_shutdown(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// One unit of the global connection count. Released when dropped.
#[derive(Debug)]
pub struct ConnectionSlot {
    shared: Arc<Shared>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.shared.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

struct WorkerHandle {
    id: usize,
    thread: Option<thread::JoinHandle<WorkerStats>>,
    waker: Arc<Waker>,
}

/// The running set of workers sharing one listening socket.
pub struct Pool {
    workers: Vec<WorkerHandle>,
    shared: Arc<Shared>,
    local_addr: SocketAddr,
}

impl Pool {
    /// Start `config.threads` workers accepting from `listener`.
    pub fn start(
        config: Arc<Config>,
        listener: TcpListener,
        access_log: AccessLog,
    ) -> Result<Self> {
        listener
            .set_nonblocking(true)
            .context("failed to make listening socket non-blocking")?;
        let local_addr = listener
            .local_addr()
            .context("failed to get listening address")?;
        let listener = Arc::new(listener);
        let access_log = Arc::new(access_log);
        let handoff: Arc<dyn Handoff> = handoff::from_config(&config);
        let shared = Arc::new(Shared::default());

        let mut pool = Self {
            workers: Vec::new(),
            shared: Arc::clone(&shared),
            local_addr,
        };

        for id in 0..config.threads.max(1) {
            let waker = Arc::new(Waker::new().context("failed to create eventfd")?);
            let worker = Worker::new(
                id,
                Arc::clone(&config),
                Arc::clone(&shared),
                Arc::clone(&listener),
                Arc::clone(&handoff),
                Arc::clone(&access_log),
                Arc::clone(&waker),
            )
            .with_context(|| format!("failed to create worker {}", id))?;
            let thread = thread::Builder::new()
                .name(format!("khttpd-worker-{}", id))
                .spawn(move || worker.run())
                .with_context(|| format!("failed to spawn worker {}", id))?;
            pool.workers.push(WorkerHandle {
                id,
                thread: Some(thread),
                waker,
            });
        }

        info!(
            "started {} workers, admission limit {}",
            pool.workers.len(),
            config.max_connections
        );
        Ok(pool)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Connections currently tracked by all workers.
    pub fn connections(&self) -> usize {
        self.shared.connections()
    }

    /// Stop all workers, dropping in-flight requests, and sum their statistics.
    pub fn stop(mut self) -> Result<WorkerStats> {
        self.stop_workers()
    }

    fn stop_workers(&mut self) -> Result<WorkerStats> {
        self.shared.request_shutdown();
        for worker in &self.workers {
            if let Err(e) = worker.waker.wake() {
                warn!("worker {}: failed to wake: {}", worker.id, e);
            }
        }
        let mut total = WorkerStats::default();
        let mut panicked = 0;
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                match thread.join() {
                    Ok(stats) => total.add(&stats),
                    Err(_) => panicked += 1,
                }
            }
        }
        debug!("connections left after stop: {}", self.shared.connections());
        if panicked > 0 {
            return Err(anyhow!("{} workers panicked", panicked));
        }
        Ok(total)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.workers.iter().any(|worker| worker.thread.is_some()) {
            self.stop_workers().ok();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::{self, Permissions};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    use tempfile::tempdir;
    use test_log::test;

    #[test]
    fn reserve_respects_limit() {
        let shared = Arc::new(Shared::default());
        let first = shared.reserve_connection(2).expect("first slot");
        let second = shared.reserve_connection(2).expect("second slot");
        assert!(shared.reserve_connection(2).is_none());
        assert_eq!(shared.connections(), 2);
        drop(first);
        assert_eq!(shared.connections(), 1);
        let third = shared.reserve_connection(2).expect("freed slot");
        assert!(shared.reserve_connection(2).is_none());
        drop((second, third));
        assert_eq!(shared.connections(), 0);
    }

    #[test]
    fn zero_limit_admits_nothing() {
        let shared = Arc::new(Shared::default());
        assert!(shared.reserve_connection(0).is_none());
        assert_eq!(shared.connections(), 0);
    }

    #[test]
    fn concurrent_reservations_never_exceed_limit() {
        let shared = Arc::new(Shared::default());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    let mut held = Vec::new();
                    for _ in 0..1000 {
                        if let Some(slot) = shared.reserve_connection(5) {
                            assert!(shared.connections() <= 5);
                            held.push(slot);
                        }
                        if held.len() > 2 {
                            held.clear();
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(shared.connections(), 0);
    }

    #[test]
    fn serves_until_stopped() {
        let dir = tempdir().expect("failed to create tempdir");
        let path = dir.path().join("index.htm");
        fs::write(&path, b"<p>pool</p>").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();
        let docroot = fs::canonicalize(dir.path()).unwrap();
        let mut config = Config::new(docroot.to_str().unwrap());
        config.threads = 2;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = Pool::start(Arc::new(config), listener, AccessLog::disabled()).unwrap();

        for _ in 0..3 {
            let mut client = TcpStream::connect(pool.local_addr()).unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            client.write_all(b"GET /index.htm HTTP/1.0\r\n\r\n").unwrap();
            let mut reply = String::new();
            client.read_to_string(&mut reply).unwrap();
            assert!(reply.starts_with("HTTP/1.0 200 OK\r\n"));
            assert!(reply.ends_with("\r\n\r\n<p>pool</p>"));
        }

        let _idle = TcpStream::connect(pool.local_addr()).unwrap();
        let shared = Arc::clone(pool.shared());
        let stats = pool.stop().unwrap();
        assert_eq!(stats.served, 3);
        assert_eq!(stats.bytes_out, 3 * 11);
        assert_eq!(shared.connections(), 0);
    }

    #[test]
    fn dropping_pool_stops_workers() {
        let mut config = Config::new("/");
        config.threads = 1;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = Pool::start(Arc::new(config), listener, AccessLog::disabled()).unwrap();
        let shared = Arc::clone(pool.shared());
        let generation = shared.generation();
        drop(pool);
        assert_ne!(shared.generation(), generation);
    }

    #[test]
    fn shutdown_bumps_generation() {
        let shared = Shared::default();
        let before = shared.generation();
        shared.request_shutdown();
        assert_ne!(shared.generation(), before);
    }
}
