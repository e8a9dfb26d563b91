use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};

/// Longest request path accepted from the request line.
pub const MAX_PATH_LEN: usize = 256;
/// Recognised header values are truncated to this many bytes.
pub const MAX_FIELD_LEN: usize = 256;

/// HTTP version of a request. Requests without a version token are HTTP/0.9
/// and never get a response header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HttpVersion {
    Http09,
    Http10OrLater,
}

/// The parts of a request head the pipeline cares about.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: Option<String>,
    pub if_modified_since: Option<String>,
    pub user_agent: Option<String>,
    pub host: Option<String>,
}

impl RequestHead {
    pub fn http_version(&self) -> HttpVersion {
        match self.version {
            None => HttpVersion::Http09,
            Some(_) => HttpVersion::Http10OrLater,
        }
    }
}

/// Result of looking at the bytes peeked from a connection.
#[derive(Debug, PartialEq)]
pub enum ParseOutcome {
    /// The head isn't complete yet; look again later.
    Incomplete,
    Complete(RequestHead),
    /// The request line can't be understood.
    Malformed,
}

/// Length of the request head in `buf`, including its terminating empty line,
/// or `None` if the terminator hasn't arrived.
///
/// An HTTP/0.9 request consists of a single line, so a complete request line
/// without a version token also ends the head.
pub fn head_len(buf: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    for (i, &c) in buf.iter().enumerate() {
        if c != b'\n' {
            continue;
        }
        let line = trim_cr(&buf[line_start..i]);
        if line_start == 0 {
            if request_line_tokens(line).count() == 2 {
                return Some(i + 1);
            }
        } else if line.is_empty() {
            return Some(i + 1);
        }
        line_start = i + 1;
    }
    None
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn request_line_tokens(line: &[u8]) -> impl Iterator<Item = &[u8]> {
    line.split(|&c| c == b' ' || c == b'\t')
        .filter(|token| !token.is_empty())
}

/// Parse the first request head found in `buf`.
///
/// Only `If-Modified-Since:`, `User-Agent:` and `Host:` are recognised, by
/// case-sensitive prefix; every other header line is skipped.
pub fn parse_request_head(buf: &[u8]) -> ParseOutcome {
    let len = match head_len(buf) {
        Some(len) => len,
        None => return ParseOutcome::Incomplete,
    };
    let mut lines = buf[..len].split(|&c| c == b'\n').map(trim_cr);

    let mut request_line = match lines.next() {
        Some(line) => request_line_tokens(line),
        None => return ParseOutcome::Malformed,
    };
    let (method, path) = match (request_line.next(), request_line.next()) {
        (Some(method), Some(path)) => (method, path),
        _ => return ParseOutcome::Malformed,
    };
    if path.len() > MAX_PATH_LEN {
        return ParseOutcome::Malformed;
    }
    let version = match request_line.next() {
        Some(version) if version.starts_with(b"HTTP/") => Some(lossy(version)),
        Some(_) => return ParseOutcome::Malformed,
        None => None,
    };
    if request_line.next().is_some() {
        return ParseOutcome::Malformed;
    }

    let mut head = RequestHead {
        method: lossy(method),
        path: lossy(path),
        version,
        ..Default::default()
    };

    for line in lines.take_while(|line| !line.is_empty()) {
        if let Some(value) = field_value(line, b"If-Modified-Since:") {
            head.if_modified_since = Some(value);
        } else if let Some(value) = field_value(line, b"User-Agent:") {
            head.user_agent = Some(value);
        } else if let Some(value) = field_value(line, b"Host:") {
            head.host = Some(value);
        }
    }

    ParseOutcome::Complete(head)
}

/// Value of a header line starting with `name`, bounded to MAX_FIELD_LEN.
fn field_value(line: &[u8], name: &[u8]) -> Option<String> {
    let value = line.strip_prefix(name)?;
    let start = value
        .iter()
        .position(|&c| c != b' ' && c != b'\t')
        .unwrap_or(value.len());
    let value = &value[start..];
    Some(lossy(&value[..value.len().min(MAX_FIELD_LEN)]))
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// RFC1123 formatted date.
pub struct HttpDate(pub SystemTime);

impl std::fmt::Display for HttpDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

const HTTP_DATE_FORMATS: &[&str] = &[
    "%a, %d %b %Y %H:%M:%S GMT", // RFC 1123
    "%A, %d-%b-%y %H:%M:%S GMT", // RFC 850
    "%a %b %e %H:%M:%S %Y",      // asctime()
];

/// Parse a date in any of the three formats HTTP/1.0 allows.
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    let value = value.trim();
    HTTP_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| SystemTime::from(DateTime::<Utc>::from_utc(naive, Utc)))
        .or_else(|| {
            DateTime::parse_from_rfc2822(value)
                .ok()
                .map(SystemTime::from)
        })
}

/// Header of a successful reply, sent before the file contents.
pub fn ok_header(
    server_name: &str,
    now: SystemTime,
    mimetype: &str,
    last_modified: SystemTime,
    content_length: u64,
) -> String {
    format!(
        "HTTP/1.0 200 OK\r\n\
        Server: {}\r\n\
        Date: {}\r\n\
        Content-type: {}\r\n\
        Last-modified: {}\r\n\
        Content-length: {}\r\n\
        \r\n",
        server_name,
        HttpDate(now),
        mimetype,
        HttpDate(last_modified),
        content_length,
    )
}

/// A not modified reply.
pub fn not_modified(server_name: &str) -> String {
    format!("HTTP/1.0 304 Not Modified\r\nServer: {}\r\n\r\n", server_name)
}

/// Reply for requests that neither this server nor a cooperating one handles.
pub fn forbidden(server_name: &str) -> String {
    format!("HTTP/1.0 403 Forbidden\r\nServer: {}\r\n\r\n", server_name)
}

/// Reply for connections that can't be admitted right now.
pub fn service_unavailable(server_name: &str) -> String {
    format!(
        "HTTP/1.0 503 Service Unavailable\r\n\
        Server: {}\r\n\
        Content-Length: 15\r\n\
        \r\n\
        Try again later",
        server_name
    )
}
