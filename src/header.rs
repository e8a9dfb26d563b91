//! Header stage: wait for a request head, decide where it is served and
//! start the reply when it is served here.

use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;
use nix::errno::Errno;

use crate::config::Config;
use crate::http::{self, HttpVersion, ParseOutcome};
use crate::record::{Disposition, RequestRecord};
use crate::security;
use crate::sys;
use crate::worker::{Queue, WorkerStats};

/// Request heads must fit in one page.
pub const PAGE_SIZE: usize = 4096;
/// Size of the buffer handed to [`poll`]. One byte more than a page, so an
/// oversized head shows up as a full buffer.
pub const PEEK_BUF_LEN: usize = PAGE_SIZE + 1;
/// Longest document root plus request path served locally.
pub const MAX_FILENAME_LEN: usize = 256;

/// Look at one record waiting for its request head.
///
/// The head is peeked, never read, so a connection handed off later still
/// carries the whole request.
pub fn poll(
    config: &Config,
    record: &mut RequestRecord,
    buf: &mut [u8],
    now: SystemTime,
    stats: &mut WorkerStats,
) -> Queue {
    debug_assert!(buf.len() >= PEEK_BUF_LEN);
    let fd = match &record.socket {
        Some(socket) => socket.as_raw_fd(),
        None => return Queue::Finishing,
    };
    if record.is_idle(config.timeout, now) {
        debug!("request {}: timed out waiting for request", record.id);
        stats.timeouts += 1;
        return Queue::Finishing;
    }

    let n = match sys::peek(fd, &mut buf[..PEEK_BUF_LEN]) {
        Ok(0) => return Queue::Finishing,
        Ok(n) => n,
        Err(nix::Error::Sys(Errno::EAGAIN)) => return Queue::AwaitingHeader,
        Err(e) if sys::is_disconnect(&e) => return Queue::Finishing,
        Err(e) => {
            debug!("request {}: peek failed: {}", record.id, e);
            return external(record);
        }
    };
    if n > PAGE_SIZE {
        debug!("request {}: request head too large", record.id);
        return external(record);
    }

    let head = match http::parse_request_head(&buf[..n]) {
        ParseOutcome::Complete(head) => head,
        ParseOutcome::Incomplete if n >= PAGE_SIZE => return external(record),
        ParseOutcome::Incomplete => {
            if n > record.peeked {
                record.peeked = n;
                record.touch(now);
            }
            return Queue::AwaitingHeader;
        }
        ParseOutcome::Malformed => {
            debug!("request {}: malformed request", record.id);
            return external(record);
        }
    };
    stats.requests += 1;
    record.apply_head(head);
    record.touch(now);
    decode(config, record, fd, now, stats)
}

fn external(record: &mut RequestRecord) -> Queue {
    record.mark_external();
    Queue::Handoff
}

/// Decide the disposition of a parsed request and send what goes out before
/// the body.
fn decode(
    config: &Config,
    record: &mut RequestRecord,
    fd: RawFd,
    now: SystemTime,
    stats: &mut WorkerStats,
) -> Queue {
    if record.method.as_deref() != Some("GET") {
        return external(record);
    }
    let path = record.path.as_deref().unwrap_or("");
    if !path.starts_with('/') || config.docroot.len() + path.len() > MAX_FILENAME_LEN {
        return external(record);
    }
    let mut filename = Vec::with_capacity(config.docroot.len() + path.len());
    filename.extend_from_slice(config.docroot.as_bytes());
    filename.extend_from_slice(path.as_bytes());
    record.filename = filename;

    let mimetype = match config.mime_table.resolve_shared(&record.filename) {
        Some(mimetype) => mimetype,
        None => {
            debug!("request {}: no content type for {}", record.id, path);
            return external(record);
        }
    };
    record.mimetype = Some(Arc::clone(&mimetype));

    let permitted = match security::check(
        &mut record.filename,
        &config.path_filter,
        &config.permissions,
    ) {
        Ok(permitted) => permitted,
        Err(denial) => {
            debug!(
                "request {}: {} denied: {}",
                record.id,
                String::from_utf8_lossy(&record.filename),
                denial
            );
            return external(record);
        }
    };
    record.decide(Disposition::Local);

    let mtime = UNIX_EPOCH + Duration::from_secs(permitted.metadata.mtime().max(0) as u64);
    let last_modified = truncate_to_secs(mtime.min(now));
    record.file_len = permitted.metadata.len();
    record.file = Some(permitted.file);
    record.last_modified = Some(last_modified);

    if record.version == HttpVersion::Http10OrLater {
        record.if_modified_since_time = record
            .if_modified_since
            .as_deref()
            .and_then(http::parse_http_date);
        if let Some(since) = record.if_modified_since_time {
            if since >= last_modified {
                record.total_bytes = 0;
                record.http_code = 304;
                stats.not_modified += 1;
                send_header(record.id, fd, &http::not_modified(&config.server_name));
                return Queue::Finishing;
            }
        }
    }

    record.total_bytes = record.file_len;
    record.http_code = 200;
    stats.served += 1;
    if record.version == HttpVersion::Http10OrLater {
        let header = http::ok_header(
            &config.server_name,
            now,
            &mimetype,
            last_modified,
            record.file_len,
        );
        if !send_header(record.id, fd, &header) {
            return Queue::Finishing;
        }
    }
    Queue::Sending
}

/// Write a header in one non-blocking send. False unless all of it went out.
fn send_header(id: u64, fd: RawFd, header: &str) -> bool {
    match sys::send(fd, header.as_bytes()) {
        Ok(n) if n == header.len() => true,
        Ok(n) => {
            debug!("request {}: short header write, {} of {}", id, n, header.len());
            false
        }
        Err(e) => {
            debug!("request {}: header write failed: {}", id, e);
            false
        }
    }
}

fn truncate_to_secs(time: SystemTime) -> SystemTime {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    UNIX_EPOCH + Duration::from_secs(secs)
}
