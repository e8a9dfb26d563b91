use std::fs::File;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::http::{HttpVersion, RequestHead};
use crate::pool::ConnectionSlot;

/// Where a request is served.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Disposition {
    Undecided,
    Local,
    /// Must be handled by the cooperating server.
    External,
}

/// Per-connection state threaded through every stage of a worker.
///
/// A record sits in exactly one queue at a time; stages take it out, look at
/// it and hand it to the queue it belongs in next.
#[derive(Debug)]
pub struct RequestRecord {
    pub id: u64,
    /// `None` once the connection was handed off or closed.
    pub socket: Option<TcpStream>,
    pub client: SocketAddr,
    pub file: Option<File>,

    pub method: Option<String>,
    pub path: Option<String>,
    pub version: HttpVersion,
    pub if_modified_since: Option<String>,
    pub user_agent: Option<String>,
    pub host: Option<String>,

    /// Document root joined with the request path, percent-decoded once the
    /// security check ran.
    pub filename: Vec<u8>,
    pub mimetype: Option<Arc<str>>,
    pub file_len: u64,
    pub last_modified: Option<SystemTime>,
    pub if_modified_since_time: Option<SystemTime>,

    pub bytes_sent: u64,
    pub total_bytes: u64,

    /// Status sent to the client, for the access log. Zero if none was.
    pub http_code: u16,
    pub handed_off: bool,
    pub last_active: SystemTime,
    /// Bytes seen by the last peek, to tell new input from a stalled client.
    pub peeked: usize,

    disposition: Disposition,
    slot: Option<ConnectionSlot>,
}

impl RequestRecord {
    /// Allocate and initialize an empty record for a freshly accepted connection.
    pub fn new(
        id: u64,
        socket: TcpStream,
        client: SocketAddr,
        slot: ConnectionSlot,
        now: SystemTime,
    ) -> Self {
        Self {
            id,
            socket: Some(socket),
            client,
            file: None,
            method: None,
            path: None,
            version: HttpVersion::Http10OrLater,
            if_modified_since: None,
            user_agent: None,
            host: None,
            filename: Vec::new(),
            mimetype: None,
            file_len: 0,
            last_modified: None,
            if_modified_since_time: None,
            bytes_sent: 0,
            total_bytes: 0,
            http_code: 0,
            handed_off: false,
            last_active: now,
            peeked: 0,
            disposition: Disposition::Undecided,
            slot: Some(slot),
        }
    }

    /// Copy the request facts out of a parsed head.
    pub fn apply_head(&mut self, head: RequestHead) {
        self.version = head.http_version();
        self.method = Some(head.method);
        self.path = Some(head.path);
        self.if_modified_since = head.if_modified_since;
        self.user_agent = head.user_agent;
        self.host = head.host;
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    /// Record the disposition. Only the first decision sticks.
    pub fn decide(&mut self, disposition: Disposition) {
        debug_assert!(disposition != Disposition::Undecided);
        if self.disposition == Disposition::Undecided {
            self.disposition = disposition;
        }
    }

    pub fn mark_external(&mut self) {
        self.decide(Disposition::External);
    }

    pub fn is_external(&self) -> bool {
        self.disposition == Disposition::External
    }

    /// Bytes of the file still to be sent.
    pub fn remaining(&self) -> u64 {
        self.total_bytes.saturating_sub(self.bytes_sent)
    }

    /// Account for `sent` bytes, never beyond the total.
    pub fn advance(&mut self, sent: u64) {
        self.bytes_sent = self.total_bytes.min(self.bytes_sent + sent);
    }

    pub fn is_fully_sent(&self) -> bool {
        self.bytes_sent >= self.total_bytes
    }

    /// Give back this record's share of the global connection count.
    pub fn release_slot(&mut self) {
        self.slot = None;
    }

    /// The record's share of the connection count, for a hand-off that keeps
    /// the connection open on this host after the record is finished.
    pub fn slot_mut(&mut self) -> &mut Option<ConnectionSlot> {
        &mut self.slot
    }

    pub fn touch(&mut self, now: SystemTime) {
        self.last_active = now;
    }

    /// True if nothing happened on this record for at least `timeout`.
    pub fn is_idle(&self, timeout: Option<Duration>, now: SystemTime) -> bool {
        match timeout {
            Some(timeout) => {
                now.duration_since(self.last_active)
                    .unwrap_or_else(|_| Duration::from_secs(0))
                    >= timeout
            }
            None => false,
        }
    }
}
