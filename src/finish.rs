//! Finish stage: tear a record down and log it.

use std::os::unix::io::AsRawFd;
use std::time::SystemTime;

use log::debug;

use crate::access_log::AccessLog;
use crate::record::RequestRecord;
use crate::sys;

/// Most reads spent discarding unread input before closing.
pub const DRAIN_ROUNDS: usize = 16;

/// Release everything `record` holds: unread input, socket, file and its
/// share of the connection count.
///
/// Safe on a partly set up record and safe to call again.
pub fn teardown(record: &mut RequestRecord, scratch: &mut [u8]) {
    if let Some(socket) = record.socket.take() {
        // Unread input turns close() into a reset.
        let fd = socket.as_raw_fd();
        for _ in 0..DRAIN_ROUNDS {
            match sys::discard(fd, scratch) {
                Ok(n) if n > 0 => continue,
                _ => break,
            }
        }
        drop(socket);
    }
    record.file = None;
    record.release_slot();
}

/// Finish a record taken off the finishing queue.
pub fn poll(
    mut record: RequestRecord,
    access_log: &AccessLog,
    now: SystemTime,
    scratch: &mut [u8],
) {
    teardown(&mut record, scratch);
    debug!(
        "request {}: done, status {}, {} of {} bytes{}",
        record.id,
        record.http_code,
        record.bytes_sent,
        record.total_bytes,
        if record.handed_off { ", handed off" } else { "" }
    );
    access_log.log_request(&record, now);
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::File;
    use std::io::{Read, Write};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use tempfile::{tempdir, tempfile};

    use crate::access_log::LogTarget;
    use crate::pool::Shared;
    use crate::record::test::loopback_record;

    #[test]
    fn closes_connection_and_releases_slot() {
        let shared = Arc::new(Shared::default());
        let (mut record, mut client) = loopback_record(&shared);
        record.file = Some(tempfile().unwrap());
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();

        // let the request arrive so there is something to drain
        let mut buf = [0; 64];
        let deadline = Instant::now() + Duration::from_secs(1);
        while sys::peek(record.socket.as_ref().unwrap().as_raw_fd(), &mut buf).is_err()
            && Instant::now() < deadline
        {}

        poll(record, &AccessLog::disabled(), SystemTime::now(), &mut buf);
        assert_eq!(shared.connections(), 0);

        client
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn teardown_twice() {
        let shared = Arc::new(Shared::default());
        let (mut record, _client) = loopback_record(&shared);
        let mut buf = [0; 64];
        teardown(&mut record, &mut buf);
        assert!(record.socket.is_none());
        assert_eq!(shared.connections(), 0);
        teardown(&mut record, &mut buf);
        assert_eq!(shared.connections(), 0);
    }

    #[test]
    fn handed_off_record_is_logged() {
        let dir = tempdir().expect("failed to create tempdir");
        let path = dir.path().join("access.log");
        let log = AccessLog::open(&LogTarget::File(path.to_str().unwrap().to_string())).unwrap();

        let shared = Arc::new(Shared::default());
        let (mut record, _client) = loopback_record(&shared);
        record.socket = None;
        record.handed_off = true;
        record.method = Some("GET".to_string());
        record.path = Some("/x.cgi".to_string());
        let mut buf = [0; 64];
        poll(record, &log, SystemTime::now(), &mut buf);
        assert_eq!(shared.connections(), 0);

        let mut contents = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert!(contents.contains("\"GET /x.cgi HTTP/1.0\" 0 0"));
    }
}
