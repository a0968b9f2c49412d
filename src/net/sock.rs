//! Non-blocking socket abstraction over TCP and local (unix) streams.
//!
//! Outbound sockets are created through `socket2` so the connect stays
//! observable while in progress: the caller parks the socket in the poller
//! with write interest and finishes the handshake once writability fires.
//! Inbound sockets come straight from the tokio listeners.

use std::io::{self, IoSlice};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use socket2::{Domain, Protocol, SockAddr, Socket as RawSocket, Type};
use tokio::io::{Interest, Ready};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::{Instant, timeout_at};
use tracing::warn;

/// Socket-level error classification.
///
/// `WouldBlock` and `Interrupted` are transient and consumed by the retry
/// loops; `Reset` and `Timeout` terminate the current attempt; `Fatal`
/// carries everything else.
#[derive(Debug, thiserror::Error)]
pub enum SockError {
    #[error("operation would block")]
    WouldBlock,

    #[error("interrupted")]
    Interrupted,

    #[error("connection reset by peer")]
    Reset,

    #[error("operation timed out")]
    Timeout,

    #[error("address unresolvable: {0}")]
    Unresolvable(String),

    #[error("io error: {0}")]
    Fatal(#[from] io::Error),
}

impl SockError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SockError::WouldBlock | SockError::Interrupted)
    }
}

/// Map a raw io error into the transport taxonomy.
fn classify(e: io::Error) -> SockError {
    match e.kind() {
        io::ErrorKind::WouldBlock => SockError::WouldBlock,
        io::ErrorKind::Interrupted => SockError::Interrupted,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => SockError::Reset,
        _ => SockError::Fatal(e),
    }
}

/// Where an outbound socket should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl std::fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectTarget::Inet(a) => write!(f, "{a}"),
            ConnectTarget::Unix(p) => write!(f, "unix://{}", p.display()),
        }
    }
}

/// A connected (or connecting) stream socket.
#[derive(Debug)]
pub enum Sock {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Sock {
    /// Wait until the socket is ready for `interest`.
    pub async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        match self {
            Sock::Tcp(s) => s.ready(interest).await,
            Sock::Unix(s) => s.ready(interest).await,
        }
    }

    /// Best-effort receive. Returns the byte count (0 means the peer closed
    /// the stream, reported as `Reset` by the bounded read loop).
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<usize, SockError> {
        let r = match self {
            Sock::Tcp(s) => s.try_read(buf),
            Sock::Unix(s) => s.try_read(buf),
        };
        r.map_err(classify)
    }

    /// Best-effort send of one chunk.
    pub fn try_send(&self, buf: &[u8]) -> Result<usize, SockError> {
        let r = match self {
            Sock::Tcp(s) => s.try_write(buf),
            Sock::Unix(s) => s.try_write(buf),
        };
        r.map_err(classify)
    }

    /// Best-effort vectored send.
    pub fn try_send_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize, SockError> {
        let r = match self {
            Sock::Tcp(s) => s.try_write_vectored(bufs),
            Sock::Unix(s) => s.try_write_vectored(bufs),
        };
        r.map_err(classify)
    }

    /// Pending SO_ERROR, if any. Used to finish a non-blocking connect.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Sock::Tcp(s) => s.take_error(),
            Sock::Unix(s) => s.take_error(),
        }
    }

    /// Raw descriptor, for pool identity checks and logs.
    pub fn raw_fd(&self) -> i32 {
        use std::os::fd::AsRawFd;
        match self {
            Sock::Tcp(s) => s.as_raw_fd(),
            Sock::Unix(s) => s.as_raw_fd(),
        }
    }

    pub fn peer_label(&self) -> String {
        match self {
            Sock::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".into()),
            Sock::Unix(_) => "unix".into(),
        }
    }

    /// Read exactly `buf.len()` bytes before `deadline`.
    ///
    /// Fails with `Timeout`, `Reset` or `Interrupted`. A signal only aborts
    /// the read while `interruptible` is still set; after any partial
    /// progress the flag is cleared so an interrupt cannot lose buffered
    /// bytes on a later iteration.
    pub async fn read_exact_deadline(
        &self,
        buf: &mut [u8],
        deadline: Instant,
        mut interruptible: bool,
    ) -> Result<(), SockError> {
        let mut got = 0usize;
        while got < buf.len() {
            if Instant::now() >= deadline {
                return Err(SockError::Timeout);
            }
            match timeout_at(deadline, self.ready(Interest::READABLE)).await {
                Err(_) => return Err(SockError::Timeout),
                Ok(Err(e)) => return Err(classify(e)),
                Ok(Ok(_)) => {}
            }
            match self.try_recv(&mut buf[got..]) {
                Ok(0) => return Err(SockError::Reset),
                Ok(n) => {
                    got += n;
                    interruptible = false;
                }
                Err(SockError::WouldBlock) => continue,
                Err(SockError::Interrupted) => {
                    if interruptible {
                        return Err(SockError::Interrupted);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Result of starting a non-blocking connect.
pub struct ConnectStart {
    pub sock: Sock,
    /// True when the connect completed synchronously (loopback, fast-open).
    pub established: bool,
}

/// Kick off a non-blocking connect. When `established` comes back false the
/// caller waits for writability and then calls [`connect_finish`].
pub fn connect_begin(target: &ConnectTarget) -> Result<ConnectStart, SockError> {
    match target {
        ConnectTarget::Inet(addr) => {
            let domain = match addr {
                SocketAddr::V4(_) => Domain::IPV4,
                SocketAddr::V6(_) => Domain::IPV6,
            };
            let raw = RawSocket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
            raw.set_nonblocking(true)?;
            let established = start_connect(&raw, &SockAddr::from(*addr))?;
            let std_stream: std::net::TcpStream = raw.into();
            let stream = TcpStream::from_std(std_stream)?;
            let _ = stream.set_nodelay(true);
            Ok(ConnectStart {
                sock: Sock::Tcp(stream),
                established,
            })
        }
        ConnectTarget::Unix(path) => {
            let raw = RawSocket::new(Domain::UNIX, Type::STREAM, None)?;
            raw.set_nonblocking(true)?;
            let established = start_connect(&raw, &SockAddr::unix(path)?)?;
            let std_stream: std::os::unix::net::UnixStream = raw.into();
            let stream = UnixStream::from_std(std_stream)?;
            Ok(ConnectStart {
                sock: Sock::Unix(stream),
                established,
            })
        }
    }
}

fn start_connect(raw: &RawSocket, addr: &SockAddr) -> Result<bool, SockError> {
    match raw.connect(addr) {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
        Err(e) => Err(classify(e)),
    }
}

/// Check the outcome of a connect that went through the writable wait.
pub fn connect_finish(sock: &Sock) -> Result<(), SockError> {
    match sock.take_error() {
        Ok(None) => Ok(()),
        Ok(Some(e)) => Err(classify(e)),
        Err(e) => Err(classify(e)),
    }
}

/// Connect with an absolute deadline. Convenience wrapper used by the
/// frontends and tests; agent connections drive the same two steps through
/// the poller instead.
pub async fn connect_deadline(
    target: &ConnectTarget,
    deadline: Instant,
) -> Result<Sock, SockError> {
    let start = connect_begin(target)?;
    if !start.established {
        match timeout_at(deadline, start.sock.ready(Interest::WRITABLE)).await {
            Err(_) => return Err(SockError::Timeout),
            Ok(Err(e)) => return Err(classify(e)),
            Ok(Ok(_)) => {}
        }
        connect_finish(&start.sock)?;
    }
    Ok(start.sock)
}

/// Resolve a host name to a single IPv4 address.
///
/// With `strict_ip` the input must already be a literal address. When DNS
/// returns several A-records the first one wins and the rest are logged.
/// The lookup is a synchronous `getaddrinfo`; tasks on the runtime go
/// through [`resolve_host`] instead.
pub fn resolve(host: &str, strict_ip: bool) -> Result<Ipv4Addr, SockError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    if strict_ip {
        return Err(SockError::Unresolvable(format!(
            "{host}: not a literal IPv4 address"
        )));
    }
    let addrs: Vec<Ipv4Addr> = (host, 0u16)
        .to_socket_addrs()
        .map_err(|e| SockError::Unresolvable(format!("{host}: {e}")))?
        .filter_map(|a| match a.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect();
    match addrs.as_slice() {
        [] => Err(SockError::Unresolvable(format!("{host}: no A records"))),
        [one] => Ok(*one),
        [first, ..] => {
            warn!(
                "{} resolves to {} addresses, using {}",
                host,
                addrs.len(),
                first
            );
            Ok(*first)
        }
    }
}

/// Resolve on the blocking pool. Literal addresses short-circuit; a real
/// DNS lookup must never run inline on the net loop or a worker task.
pub async fn resolve_host(host: &str, strict_ip: bool) -> Result<Ipv4Addr, SockError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let host = host.to_string();
    match tokio::task::spawn_blocking(move || resolve(&host, strict_ip)).await {
        Ok(res) => res,
        Err(e) => Err(SockError::Unresolvable(format!("resolver task failed: {e}"))),
    }
}
