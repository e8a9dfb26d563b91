use std::ffi::OsString;
use std::net::{
    AddrParseError, IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6,
    TcpListener,
};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::unistd::getuid;

use crate::access_log::LogTarget;
use crate::filter::{PathFilter, DEFAULT_BLACKLIST};
use crate::mime::MimeTable;
use crate::security::PermissionPolicy;

pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDOFF_PORT: u16 = 8081;

/// How file contents travel from disk to socket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransferMode {
    Sendfile,
    /// Read into a buffer, then send it.
    Copy,
}

/// Everything read once at start-up. Changing any of it means restarting the
/// worker pool.
#[derive(Debug, Clone)]
pub struct Config {
    /// Absolute document root without a trailing slash.
    pub docroot: String,
    pub bindaddr: Option<String>,
    pub bindport: u16,
    pub inet6: bool,
    pub threads: usize,
    pub max_connections: usize,
    pub handoff_addr: IpAddr,
    pub handoff_port: u16,
    pub handoff_socket: Option<PathBuf>,
    pub mime_table: MimeTable,
    pub path_filter: PathFilter,
    pub permissions: PermissionPolicy,
    pub timeout: Option<Duration>,
    pub transfer: TransferMode,
    pub server_name: String,
    pub log_target: LogTarget,
}

impl Config {
    /// Defaults for serving `docroot`.
    pub fn new(docroot: &str) -> Self {
        let mut docroot = docroot.to_string();
        // Strip ending slash.
        while docroot.len() > 1 && docroot.ends_with('/') {
            docroot.pop();
        }
        if docroot == "/" {
            docroot.clear();
        }
        Self {
            docroot,
            bindaddr: None,
            bindport: if getuid().is_root() { 80 } else { 8080 },
            inet6: false,
            threads: default_threads(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handoff_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            handoff_port: DEFAULT_HANDOFF_PORT,
            handoff_socket: None,
            mime_table: MimeTable::default(),
            path_filter: PathFilter::default(),
            permissions: PermissionPolicy::default(),
            timeout: Some(DEFAULT_TIMEOUT),
            transfer: TransferMode::Sendfile,
            server_name: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            log_target: LogTarget::default(),
        }
    }

    /// Parse the arguments following the program name.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let mut args = args.into_iter();
        let docroot = args.next().context("missing document root")?;
        let docroot = std::fs::canonicalize(&docroot)
            .with_context(|| format!("failed to resolve document root {}", docroot))?;
        let docroot = docroot
            .to_str()
            .with_context(|| format!("document root {} is not valid UTF-8", docroot.display()))?
            .to_string();
        let mut config = Self::new(&docroot);

        let mut blacklist = Vec::new();
        let mut default_blacklist = true;
        let mut sloppy_mime = false;

        while let Some(arg) = args.next().as_deref() {
            match arg {
                "--port" => {
                    let number = args.next().context("missing number after --port")?;
                    config.bindport = number
                        .parse()
                        .with_context(|| format!("port number {} is invalid", number))?;
                }
                "--addr" => {
                    config.bindaddr = Some(args.next().context("missing ip after --addr")?);
                }
                "--ipv6" => config.inet6 = true,
                "--threads" => {
                    let number = args.next().context("missing number after --threads")?;
                    config.threads = number
                        .parse::<usize>()
                        .ok()
                        .filter(|&threads| threads > 0)
                        .with_context(|| format!("threads number {} is invalid", number))?;
                }
                "--maxconn" => {
                    let number = args.next().context("missing number after --maxconn")?;
                    config.max_connections = number
                        .parse()
                        .with_context(|| format!("maxconn number {} is invalid", number))?;
                }
                "--handoff-port" => {
                    let number = args.next().context("missing number after --handoff-port")?;
                    config.handoff_port = number
                        .parse()
                        .with_context(|| format!("handoff port number {} is invalid", number))?;
                }
                "--handoff-addr" => {
                    let addr = args.next().context("missing ip after --handoff-addr")?;
                    config.handoff_addr = addr
                        .parse()
                        .with_context(|| format!("handoff address {} is invalid", addr))?;
                }
                "--handoff-socket" => {
                    config.handoff_socket = Some(PathBuf::from(
                        args.next().context("missing path after --handoff-socket")?,
                    ));
                }
                "--mimetypes" => {
                    let filename = args.next().context("missing filename after --mimetypes")?;
                    config
                        .mime_table
                        .parse_suffix_map_file(&OsString::from(filename))?;
                }
                "--sloppy-mime" => sloppy_mime = true,
                "--perm-required" => {
                    let mode = args.next().context("missing mode after --perm-required")?;
                    config.permissions.required = parse_mode(&mode)?;
                }
                "--perm-forbidden" => {
                    let mode = args.next().context("missing mode after --perm-forbidden")?;
                    config.permissions.forbidden = parse_mode(&mode)?;
                }
                "--blacklist" => {
                    blacklist.push(args.next().context("missing string after --blacklist")?);
                }
                "--no-default-blacklist" => default_blacklist = false,
                "--timeout" => {
                    let number = args.next().context("missing number after --timeout")?;
                    let timeout_secs = number
                        .parse::<u64>()
                        .with_context(|| format!("timeout number {} is invalid", number))?;
                    config.timeout = match timeout_secs {
                        0 => None,
                        timeout_secs => Some(Duration::from_secs(timeout_secs)),
                    };
                }
                "--no-sendfile" => config.transfer = TransferMode::Copy,
                "--server-name" => {
                    config.server_name =
                        args.next().context("missing string after --server-name")?;
                }
                "--log" => {
                    config.log_target =
                        LogTarget::File(args.next().context("missing filename after --log")?);
                }
                "--syslog" => config.log_target = LogTarget::Syslog,
                "--no-log" => config.log_target = LogTarget::Off,
                _ => {
                    return Err(anyhow!("unknown argument `{}'", arg));
                }
            }
        }

        config.path_filter = PathFilter::empty();
        if default_blacklist {
            for pattern in DEFAULT_BLACKLIST {
                config.path_filter.add(pattern);
            }
        }
        for pattern in &blacklist {
            config.path_filter.add(pattern);
        }
        config.mime_table.set_sloppy(sloppy_mime);

        Ok(config)
    }

    pub fn usage(&self, argv0: &str) {
        print!(
            "usage:\t{} /path/to/wwwroot [flags]\n\n\
            flags:\t--port number (default: {}, or 80 if running as root)\n\
            \t\tSpecifies which port to listen on for connections.\n\
            \t\tPass 0 to let the system choose any free port for you.\n\n\
            \t--addr ip (default: all)\n\
            \t\tIf multiple interfaces are present, specifies\n\
            \t\twhich one to bind the listening port to.\n\n\
            \t--ipv6\n\
            \t\tListen on IPv6 address.\n\n\
            \t--threads number (default: {})\n\
            \t\tNumber of worker threads.\n\n\
            \t--maxconn number (default: {})\n\
            \t\tSpecifies how many concurrent connections to track.\n\
            \t\tFurther connections wait in the listen backlog.\n\n\
            \t--handoff-port number (default: {})\n\
            \t--handoff-addr ip (default: 127.0.0.1)\n\
            \t\tWhere the cooperating server listens. Requests that\n\
            \t\tcan't be served here are relayed to it.\n\n\
            \t--handoff-socket path (default: relay over TCP)\n\
            \t\tPass connections to the cooperating server as file\n\
            \t\tdescriptors over this Unix socket instead.\n\n\
            \t--mimetypes filename (optional)\n\
            \t\tParses specified file for suffix-MIME associations.\n\n\
            \t--sloppy-mime\n\
            \t\tServe files with unknown suffixes as the first known type\n\
            \t\tinstead of handing them off.\n\n\
            \t--perm-required mode (default: {:o})\n\
            \t--perm-forbidden mode (default: {:o})\n\
            \t\tPermission bits a file must have, and must not have, to be\n\
            \t\tserved. Octal. Every required bit must be set; any one\n\
            \t\tforbidden bit is enough to refuse the file.\n\n\
            \t--blacklist string (default: {})\n\
            \t\tHand off paths containing this string. May be repeated.\n\n\
            \t--no-default-blacklist\n\
            \t\tDon't include the default blacklist.\n\n\
            \t--timeout secs (default: {})\n\
            \t\tIf a connection is idle for more than this many seconds,\n\
            \t\tit will be closed. Set to zero to disable timeouts.\n\n\
            \t--no-sendfile\n\
            \t\tCopy file contents through a buffer instead of sendfile().\n\n\
            \t--server-name string (default: {})\n\
            \t\tIdentifier sent in the Server header.\n\n\
            \t--log filename (default: stdout)\n\
            \t\tSpecifies which file to append the request log to.\n\n\
            \t--syslog\n\
            \t\tUse syslog for request log.\n\n\
            \t--no-log\n\
            \t\tDon't log requests.\n\n",
            argv0,
            self.bindport,
            self.threads,
            DEFAULT_MAX_CONNECTIONS,
            DEFAULT_HANDOFF_PORT,
            self.permissions.required,
            self.permissions.forbidden,
            DEFAULT_BLACKLIST.join(" "),
            DEFAULT_TIMEOUT.as_secs(),
            self.server_name,
        );
    }

    fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        Ok(if self.inet6 {
            let addr = Ipv6Addr::from_str(self.bindaddr.as_deref().unwrap_or("::"))?;
            SocketAddr::V6(SocketAddrV6::new(addr, self.bindport, 0, 0))
        } else {
            let addr = Ipv4Addr::from_str(self.bindaddr.as_deref().unwrap_or("0.0.0.0"))?;
            SocketAddr::V4(SocketAddrV4::new(addr, self.bindport))
        })
    }

    /// Initialize the TcpListener. This is the socket that we accept connections from.
    pub fn create_listener(&self) -> Result<TcpListener> {
        let socket_addr = self.socket_addr().context("malformed --addr argument")?;
        // Sets `SO_REUSEADDR` implicitly.
        let listener = TcpListener::bind(socket_addr)
            .with_context(|| format!("failed to create listening socket for {}", socket_addr))?;
        Ok(listener)
    }

    /// Address of the cooperating server for relayed hand-offs.
    pub fn handoff_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.handoff_addr, self.handoff_port)
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.get())
        .unwrap_or(1)
}

fn parse_mode(mode: &str) -> Result<u32> {
    let digits = mode.trim_start_matches("0o");
    u32::from_str_radix(digits, 8).with_context(|| format!("mode {} is not octal", mode))
}
