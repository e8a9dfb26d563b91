#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{self, create_dir, Permissions};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

#[macro_export]
macro_rules! map {
    ($($k:expr => $v:expr),* $(,)?) => {
        std::iter::Iterator::collect(std::array::IntoIter::new([$(($k, $v),)*]))
    };
}

pub fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

pub fn server_name() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
}
impl Server {
    /// Spawn khttpd on an unused port, serving a fresh temporary directory.
    ///
    /// Unless `args` say otherwise, hand-offs go to a port nobody listens on.
    pub fn with_args(args: &[&str]) -> Self {
        let root = tempdir().expect("failed to create tempdir");

        // Get unused ports. Assumes they won't be reused before we start khttpd.
        let port = get_unused_port().expect("failed to get unused port");
        let handoff_port = get_unused_port().expect("failed to get unused port");

        let child = Command::new(env!("CARGO_BIN_EXE_khttpd"))
            .args(&[
                root.path().to_str().expect("path is not valid UTF-8"),
                "--port",
                &format!("{}", port),
                "--addr",
                "127.0.0.1",
                "--handoff-port",
                &format!("{}", handoff_port),
                "--threads",
                "2",
                "--no-log",
            ])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn khttpd")
            .into();

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to khttpd");

        Self {
            _child: child,
            port,
            root,
        }
    }
    pub fn new() -> Self {
        Self::with_args(&[])
    }
    pub fn root(&self) -> &Path {
        self.root.path()
    }
    pub fn create_dir(&self, name: &str) {
        create_dir(self.root().join(name)).expect("failed to create directory");
    }
    /// Create a world-readable file.
    pub fn create_file(&self, name: &str, contents: &[u8]) {
        self.create_file_with_mode(name, contents, 0o644);
    }
    pub fn create_file_with_mode(&self, name: &str, contents: &[u8], mode: u32) {
        let path = self.root().join(name);
        fs::write(&path, contents).expect("failed to create file");
        fs::set_permissions(&path, Permissions::from_mode(mode))
            .expect("failed to set permissions");
    }
    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to khttpd");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }
    /// Send raw request bytes and return everything until the server closes.
    pub fn request(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = self.stream();
        stream.write_all(request).unwrap();
        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .expect("failed to read response");
        response
    }
    pub fn get(&self, path: &str, headers: HashMap<&str, &str>) -> Response {
        let mut stream = self.stream();
        write!(stream, "GET {} HTTP/1.0\r\n", path).unwrap();
        for (header_name, header_value) in headers {
            write!(stream, "{}: {}\r\n", header_name, header_value).unwrap();
        }
        write!(stream, "\r\n").unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }
}

/// HTTP Response from khttpd.
pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}
impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = headers
            .get("content-length")
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .map(|length| Self::read_body(reader, length))
            .transpose()?;
        Ok(Self {
            response_line,
            headers,
            body,
        })
    }
    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_ascii_lowercase();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }
    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }
    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }
    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, ' ')
            .nth(1)
            .expect("invalid response line")
    }
    /// Header value, looked up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|value| value.as_str())
    }
    pub fn text(&self) -> Option<&str> {
        self.body
            .as_ref()
            .map(|body| std::str::from_utf8(body).expect("body is not valid UTF-8"))
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
