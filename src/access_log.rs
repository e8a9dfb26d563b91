use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use log::warn;

use crate::http::HttpVersion;
use crate::record::RequestRecord;

/// Where the access log goes, as chosen on the command line.
#[derive(Debug, Clone, PartialEq)]
pub enum LogTarget {
    Stdout,
    Syslog,
    File(String),
    Off,
}

impl Default for LogTarget {
    fn default() -> Self {
        Self::Stdout
    }
}

/// Where to put the access log.
#[derive(Debug)]
enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
}

impl LogSink {
    fn log(&mut self, message: &str) -> std::io::Result<()> {
        match self {
            Self::Stdout => {
                print!("{}", message);
            }
            Self::Syslog => {
                // LogEncoded output has no NUL bytes.
                if let Ok(message) = CString::new(message) {
                    unsafe {
                        libc::syslog(
                            libc::LOG_INFO,
                            b"%s\0".as_ptr() as *const libc::c_char,
                            message.as_ptr(),
                        )
                    };
                }
            }
            Self::File(file) => {
                write!(file, "{}", message)?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

/// Request log shared by all workers. Each line is written under the lock.
#[derive(Debug)]
pub struct AccessLog {
    sink: Option<Mutex<LogSink>>,
}

impl AccessLog {
    pub fn open(target: &LogTarget) -> Result<Self> {
        let sink = match target {
            LogTarget::Off => None,
            LogTarget::Stdout => Some(LogSink::Stdout),
            LogTarget::Syslog => Some(LogSink::Syslog),
            LogTarget::File(filename) => Some(LogSink::File(BufWriter::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(filename)
                    .with_context(|| format!("failed to open log file {}", filename))?,
            ))),
        };
        Ok(Self {
            sink: sink.map(Mutex::new),
        })
    }

    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Add a finished request's details to the log.
    pub fn log_request(&self, record: &RequestRecord, now: SystemTime) {
        let sink = match &self.sink {
            Some(sink) => sink,
            None => return,
        };
        let message = match format_entry(record, now) {
            Some(message) => message,
            None => return,
        };
        let mut sink = match sink.lock() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = sink.log(&message) {
            warn!("failed to write access log: {}", e);
        }
    }
}

/// Common Log Format line for a record, or `None` if no request was parsed.
fn format_entry(record: &RequestRecord, now: SystemTime) -> Option<String> {
    let method = record.method.as_ref()?;
    let protocol = match record.version {
        HttpVersion::Http09 => "HTTP/0.9",
        HttpVersion::Http10OrLater => "HTTP/1.0",
    };
    // Handed-off requests are answered elsewhere; log them with status 0.
    Some(format!(
        "{} - - {} \"{} {} {}\" {} {} \"\" \"{}\"\n",
        record.client.ip(),
        ClfDate(now),
        LogEncoded(method),
        LogEncoded(record.path.as_deref().unwrap_or("")),
        protocol,
        record.http_code,
        record.bytes_sent,
        LogEncoded(record.user_agent.as_deref().unwrap_or(""))
    ))
}

/// Common Log Format (CLF) formatted date in local timezone.
struct ClfDate(SystemTime);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Encode string for logging. Logs should not contain control characters or double quotes.
struct LogEncoded<'a>(&'a str);

impl<'a> std::fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for b in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", b)?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}
