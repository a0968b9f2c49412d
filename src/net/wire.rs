//! Wire envelope of the legacy binary protocol plus the socket-backed
//! buffer pair.
//!
//! Every request is `u16 command, u16 version, u32 body_length, body`;
//! every reply is `u16 status, u16 version, u32 body_length, body`. All
//! integers big-endian. The 4-byte hello exchanged right after accept
//! doubles as the magic prefix for protocol sniffing.

use std::io::IoSlice;
use std::sync::Arc;

use tokio::io::Interest;
use tokio::time::{Instant, timeout_at};

use super::buf::{ChainedOut, InBuf, OutBuf};
use super::sock::{Sock, SockError};

/// Handshake word sent by both sides of a legacy-binary connection.
pub const PROTO_HELLO: u32 = 1;

/// Default listen port for the legacy binary protocol.
pub const DEFAULT_PORT_SPHINX: u16 = 9312;

/// Default listen port for the MySQL wire frontend.
pub const DEFAULT_PORT_MYSQL: u16 = 9306;

/// Default cap on a single request or reply body.
pub const DEFAULT_MAX_PACKET: usize = 8 << 20;

/// Absolute cap a configuration may raise the packet limit to.
pub const HARD_MAX_PACKET: usize = 128 << 20;

/// Envelope header size for both requests and replies.
pub const HEADER_LEN: usize = 8;

/// Command tags (stable wire IDs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Search = 0,
    Excerpt = 1,
    Update = 2,
    Keywords = 3,
    Persist = 4,
    Status = 5,
    FlushAttrs = 7,
    Sql = 8,
    Ping = 9,
    Delete = 10,
    Uvar = 11,
    Insert = 12,
    Replace = 13,
    Commit = 14,
    Suggest = 15,
    Json = 16,
    CallPq = 17,
    ClusterPq = 18,
}

impl Command {
    pub fn from_u16(v: u16) -> Option<Command> {
        use Command::*;
        Some(match v {
            0 => Search,
            1 => Excerpt,
            2 => Update,
            3 => Keywords,
            4 => Persist,
            5 => Status,
            7 => FlushAttrs,
            8 => Sql,
            9 => Ping,
            10 => Delete,
            11 => Uvar,
            12 => Insert,
            13 => Replace,
            14 => Commit,
            15 => Suggest,
            16 => Json,
            17 => CallPq,
            18 => ClusterPq,
            _ => return None,
        })
    }

    /// Current implementation version per command.
    pub fn version(self) -> u16 {
        use Command::*;
        match self {
            Search => 0x121,
            Excerpt => 0x104,
            Update => 0x103,
            Keywords => 0x101,
            Persist => 0x100,
            Status => 0x101,
            FlushAttrs => 0x100,
            Sql => 0x100,
            Ping => 0x100,
            Delete => 0x101,
            Uvar => 0x100,
            Insert => 0x100,
            Replace => 0x100,
            Commit => 0x100,
            Suggest => 0x100,
            Json => 0x100,
            CallPq => 0x100,
            ClusterPq => 0x100,
        }
    }
}

/// Reply status carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReplyStatus {
    Ok = 0,
    Error = 1,
    Retry = 2,
    Warning = 3,
}

impl ReplyStatus {
    pub fn from_u16(v: u16) -> Option<ReplyStatus> {
        Some(match v {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::Error,
            2 => ReplyStatus::Retry,
            3 => ReplyStatus::Warning,
            _ => return None,
        })
    }
}

/// Parsed request envelope header.
#[derive(Debug, Clone, Copy)]
pub struct RequestHeader {
    pub command: u16,
    pub version: u16,
    pub body_len: u32,
}

impl RequestHeader {
    pub fn parse(raw: &[u8; HEADER_LEN]) -> RequestHeader {
        let mut inp = InBuf::new(raw, HEADER_LEN);
        RequestHeader {
            command: inp.get_u16(),
            version: inp.get_u16(),
            body_len: inp.get_u32(),
        }
    }
}

/// Parsed reply envelope header.
#[derive(Debug, Clone, Copy)]
pub struct ReplyHeader {
    pub status: u16,
    pub version: u16,
    pub body_len: u32,
}

impl ReplyHeader {
    pub fn parse(raw: &[u8; HEADER_LEN]) -> ReplyHeader {
        let mut inp = InBuf::new(raw, HEADER_LEN);
        ReplyHeader {
            status: inp.get_u16(),
            version: inp.get_u16(),
            body_len: inp.get_u32(),
        }
    }
}

/// Frame a request: header plus body in one blob.
pub fn request_frame(cmd: Command, body: &[u8]) -> Vec<u8> {
    let mut out = OutBuf::with_capacity(HEADER_LEN + body.len());
    out.put_u16(cmd as u16);
    out.put_u16(cmd.version());
    out.begin_length();
    out.put_raw(body);
    out.commit_length();
    out.into_vec()
}

/// Frame a reply: header plus body in one blob.
pub fn reply_frame(status: ReplyStatus, version: u16, body: &[u8]) -> Vec<u8> {
    let mut out = OutBuf::with_capacity(HEADER_LEN + body.len());
    out.put_u16(status as u16);
    out.put_u16(version);
    out.begin_length();
    out.put_raw(body);
    out.commit_length();
    out.into_vec()
}

/// Frame an error reply carrying a message string.
pub fn error_reply(version: u16, msg: &str) -> Vec<u8> {
    let mut body = OutBuf::with_capacity(4 + msg.len());
    body.put_str(msg);
    reply_frame(ReplyStatus::Error, version, body.as_slice())
}

/// Socket-backed output: buffered chunks drained with vectored writes.
///
/// Any failure other than would-block/interrupt sticks; later flushes
/// return the recorded error without touching the socket again.
pub struct NetOut {
    sock: Arc<Sock>,
    chain: ChainedOut,
    broken: bool,
}

impl NetOut {
    pub fn new(sock: Arc<Sock>) -> Self {
        Self {
            sock,
            chain: ChainedOut::new(),
            broken: false,
        }
    }

    pub fn buf(&mut self) -> &mut OutBuf {
        self.chain.buf()
    }

    pub fn chain(&mut self) -> &mut ChainedOut {
        &mut self.chain
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Drain everything buffered before `deadline`.
    pub async fn flush(&mut self, deadline: Instant) -> Result<(), SockError> {
        if self.broken {
            return Err(SockError::Reset);
        }
        self.chain.seal();
        while !self.chain.is_empty() {
            if Instant::now() >= deadline {
                self.broken = true;
                return Err(SockError::Timeout);
            }
            let sent = {
                let slices: Vec<IoSlice<'_>> = self.chain.to_io_slices();
                self.sock.try_send_vectored(&slices)
            };
            match sent {
                Ok(n) => self.chain.consume(n),
                Err(SockError::WouldBlock) => {
                    match timeout_at(deadline, self.sock.ready(Interest::WRITABLE)).await {
                        Err(_) => {
                            self.broken = true;
                            return Err(SockError::Timeout);
                        }
                        Ok(Err(e)) => {
                            self.broken = true;
                            return Err(SockError::Fatal(e));
                        }
                        Ok(Ok(_)) => {}
                    }
                }
                Err(SockError::Interrupted) => {}
                Err(e) => {
                    self.broken = true;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Socket-backed input: an owned byte buffer grown by deadline reads.
pub struct NetIn {
    sock: Arc<Sock>,
    buf: Vec<u8>,
    broken: bool,
}

impl NetIn {
    pub fn new(sock: Arc<Sock>) -> Self {
        Self {
            sock,
            buf: Vec::new(),
            broken: false,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Acquire `n` more bytes, appending or replacing the buffer contents.
    /// Short reads and timeouts stick.
    pub async fn read_more(
        &mut self,
        n: usize,
        deadline: Instant,
        interruptible: bool,
        append: bool,
    ) -> Result<(), SockError> {
        if self.broken {
            return Err(SockError::Reset);
        }
        if !append {
            self.buf.clear();
        }
        let start = self.buf.len();
        self.buf.resize(start + n, 0);
        match self
            .sock
            .read_exact_deadline(&mut self.buf[start..], deadline, interruptible)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.buf.truncate(start);
                self.broken = true;
                Err(e)
            }
        }
    }
}
