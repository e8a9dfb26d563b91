//! Send stage: stream file contents in bounded chunks.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::SystemTime;

use log::debug;
use nix::errno::Errno;

use crate::config::{Config, TransferMode};
use crate::header::PAGE_SIZE;
use crate::record::RequestRecord;
use crate::sys;
use crate::worker::{Queue, WorkerStats};

/// Most bytes moved for one record in one pass.
pub const SEND_BUDGET: usize = 4 * PAGE_SIZE;

/// Move the next chunk of a record's file to its socket.
///
/// The chunk is bounded by the budget, the bytes left, and the free space in
/// the socket's send buffer, so a pass never blocks.
pub fn poll(
    config: &Config,
    record: &mut RequestRecord,
    now: SystemTime,
    stats: &mut WorkerStats,
) -> Queue {
    let fd = match &record.socket {
        Some(socket) => socket.as_raw_fd(),
        None => return Queue::Finishing,
    };
    if record.is_fully_sent() {
        push(record);
        return Queue::Finishing;
    }
    if record.is_idle(config.timeout, now) {
        debug!("request {}: timed out sending", record.id);
        stats.timeouts += 1;
        return Queue::Finishing;
    }
    let file = match &record.file {
        Some(file) => file,
        None => return Queue::Finishing,
    };

    let space = match sys::send_space(fd) {
        Ok(space) => space,
        Err(e) => {
            debug!("request {}: can't query send buffer: {}", record.id, e);
            return Queue::Finishing;
        }
    };
    let count = (SEND_BUDGET as u64).min(record.remaining()).min(space as u64) as usize;
    if count == 0 {
        return Queue::Sending;
    }

    let result = match config.transfer {
        TransferMode::Sendfile => {
            let mut offset = record.bytes_sent as libc::off64_t;
            sys::sendfile64(fd, file.as_raw_fd(), Some(&mut offset), count)
        }
        TransferMode::Copy => copy_chunk(file, fd, record.bytes_sent, count),
    };
    match result {
        Ok(0) => {
            // The file shrank, or the peer stopped reading.
            debug!("request {}: no progress sending", record.id);
            return Queue::Finishing;
        }
        Ok(sent) => {
            record.advance(sent as u64);
            record.touch(now);
            stats.bytes_out += sent as u64;
        }
        Err(nix::Error::Sys(Errno::EAGAIN)) => return Queue::Sending,
        Err(e) => {
            debug!("request {}: send failed: {}", record.id, e);
            return Queue::Finishing;
        }
    }

    if record.is_fully_sent() {
        push(record);
        Queue::Finishing
    } else {
        Queue::Sending
    }
}

/// Read a chunk at `offset` and send it. Returns the bytes the socket took.
fn copy_chunk(file: &File, fd: RawFd, offset: u64, count: usize) -> nix::Result<usize> {
    let mut buf = [0; SEND_BUDGET];
    let count = count.min(buf.len());
    let n = file
        .read_at(&mut buf[..count], offset)
        .map_err(|e| sys::from_io(&e))?;
    if n == 0 {
        return Ok(0);
    }
    sys::send(fd, &buf[..n])
}

/// Flush anything Nagle is holding back.
fn push(record: &RequestRecord) {
    if let Some(socket) = &record.socket {
        if let Err(e) = socket.set_nodelay(true) {
            debug!("request {}: failed to push: {}", record.id, e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::{Read, Write};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use tempfile::tempfile;
    use test_case::test_case;

    use crate::pool::Shared;
    use crate::record::test::loopback_record;

    fn file_with(contents: &[u8]) -> File {
        let mut file = tempfile().expect("failed to create tempfile");
        file.write_all(contents).unwrap();
        file
    }

    fn contents(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test_case(TransferMode::Sendfile ; "sendfile")]
    #[test_case(TransferMode::Copy ; "copy")]
    fn streams_whole_file(transfer: TransferMode) {
        let mut config = Config::new("/");
        config.transfer = transfer;
        let shared = Arc::new(Shared::default());
        let (mut record, mut client) = loopback_record(&shared);
        let expected = contents(3 * SEND_BUDGET + 123);
        record.file = Some(file_with(&expected));
        record.file_len = expected.len() as u64;
        record.total_bytes = record.file_len;

        let reader = std::thread::spawn(move || {
            let mut received = Vec::new();
            client.read_to_end(&mut received).unwrap();
            received
        });

        let mut stats = WorkerStats::default();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut last_sent = 0;
        loop {
            let next = poll(&config, &mut record, SystemTime::now(), &mut stats);
            assert!(record.bytes_sent >= last_sent);
            assert!(record.bytes_sent <= record.total_bytes);
            last_sent = record.bytes_sent;
            if next == Queue::Finishing {
                break;
            }
            assert_eq!(next, Queue::Sending);
            assert!(Instant::now() < deadline, "transfer stalled");
        }
        assert!(record.is_fully_sent());
        assert_eq!(stats.bytes_out, expected.len() as u64);
        drop(record);

        assert_eq!(reader.join().unwrap(), expected);
    }

    #[test]
    fn empty_file_finishes_at_once() {
        let config = Config::new("/");
        let shared = Arc::new(Shared::default());
        let (mut record, _client) = loopback_record(&shared);
        record.file = Some(file_with(b""));
        let mut stats = WorkerStats::default();
        assert_eq!(
            poll(&config, &mut record, SystemTime::now(), &mut stats),
            Queue::Finishing
        );
        assert_eq!(stats.bytes_out, 0);
    }

    #[test]
    fn truncated_file_finishes() {
        let config = Config::new("/");
        let shared = Arc::new(Shared::default());
        let (mut record, _client) = loopback_record(&shared);
        record.file = Some(file_with(b"short"));
        record.total_bytes = 100;
        record.bytes_sent = 5;
        let mut stats = WorkerStats::default();
        assert_eq!(
            poll(&config, &mut record, SystemTime::now(), &mut stats),
            Queue::Finishing
        );
        assert_eq!(record.bytes_sent, 5);
    }

    #[test]
    fn idle_transfer_finishes() {
        let config = Config::new("/");
        let shared = Arc::new(Shared::default());
        let (mut record, _client) = loopback_record(&shared);
        record.file = Some(file_with(b"hello"));
        record.total_bytes = 5;
        let later = record.last_active + Duration::from_secs(60);
        let mut stats = WorkerStats::default();
        assert_eq!(poll(&config, &mut record, later, &mut stats), Queue::Finishing);
        assert_eq!(record.bytes_sent, 0);
        assert_eq!(stats.timeouts, 1);
    }

    #[test]
    fn missing_socket_finishes() {
        let config = Config::new("/");
        let shared = Arc::new(Shared::default());
        let (mut record, _client) = loopback_record(&shared);
        record.socket = None;
        record.total_bytes = 5;
        let mut stats = WorkerStats::default();
        assert_eq!(
            poll(&config, &mut record, SystemTime::now(), &mut stats),
            Queue::Finishing
        );
    }
}
