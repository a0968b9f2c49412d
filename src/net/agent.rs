//! Remote agent dispatch: the per-query connection state machine and the
//! net loop that drives every outstanding remote call.
//!
//! One net-loop task owns the poller, the registered connections, and a
//! min-heap of absolute deadlines. Workers hand it [`AgentQuery`] batches
//! through an unbounded channel (plus a poller wake) and block on an
//! [`Reporter`] until every mirror reported a terminal outcome. All
//! transient errors are consumed here by the retry loop; only terminal
//! outcomes reach the reporter.

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::Interest;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace, warn};

use super::buf::{InBuf, OutBuf};
use super::dashboard::Counters;
use super::mirror::MirrorGroup;
use super::pool::Rented;
use super::poller::{Poller, PollWaker, Readiness};
use super::sock::{Sock, SockError, connect_begin, connect_finish};
use super::wire::{
    Command, HEADER_LEN, PROTO_HELLO, ReplyHeader, ReplyStatus, request_frame,
};

/// Terminal failure of one agent call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentFailure {
    #[error("connect timed out")]
    ConnectTimeout,

    #[error("query timed out")]
    QueryTimeout,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("remote closed connection unexpectedly")]
    UnexpectedClose,

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("address unresolvable: {0}")]
    Unresolvable(String),

    #[error("cancelled by shutdown")]
    Cancelled,
}

/// Terminal outcome of one agent call, success or not.
#[derive(Debug)]
pub struct AgentResult {
    pub host_key: String,
    pub reply: Vec<u8>,
    pub warning: Option<String>,
    pub error: Option<AgentFailure>,
    pub elapsed_us: u64,
}

impl AgentResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Collects terminal outcomes across the mirrors of one distributed query
/// and wakes the originating worker when the last one lands.
pub struct Reporter {
    expected: usize,
    done: AtomicUsize,
    results: Mutex<Vec<AgentResult>>,
    notify: Notify,
}

impl Reporter {
    pub fn new(expected: usize) -> Arc<Reporter> {
        Arc::new(Reporter {
            expected,
            done: AtomicUsize::new(0),
            results: Mutex::new(Vec::with_capacity(expected)),
            notify: Notify::new(),
        })
    }

    fn report(&self, res: AgentResult) {
        self.results.lock().push(res);
        let done = self.done.fetch_add(1, Ordering::AcqRel) + 1;
        if done >= self.expected {
            self.notify.notify_waiters();
        }
    }

    pub fn finished(&self) -> usize {
        self.done.load(Ordering::Acquire)
    }

    /// Wait until every expected outcome arrived or the deadline passes.
    /// Returns true when the set is complete.
    pub async fn wait(&self, deadline: Instant) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register with the notifier before re-checking, otherwise a
            // report landing in between is a lost wakeup.
            notified.as_mut().enable();
            if self.finished() >= self.expected {
                return true;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(deadline) => {
                    return self.finished() >= self.expected;
                }
            }
        }
    }

    /// Drain collected results, arrival order.
    pub fn take_results(&self) -> Vec<AgentResult> {
        std::mem::take(&mut *self.results.lock())
    }
}

/// One remote call to be dispatched against a mirror group.
pub struct AgentQuery {
    pub group: Arc<MirrorGroup>,
    /// Pin the call to one mirror (used by the pinger); `None` lets the
    /// group strategy choose, possibly switching on retries.
    pub pinned_mirror: Option<usize>,
    pub command: Command,
    pub body: Vec<u8>,
    pub connect_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub max_packet: usize,
    pub reporter: Arc<Reporter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentState {
    Connecting,
    Healthy,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvPhase {
    Hello,
    Header,
    Body,
}

struct AgentConn {
    query: AgentQuery,
    mirror_idx: usize,
    sock: Option<Arc<Sock>>,
    state: AgentState,
    r#gen: u64,
    attempts: u64,
    retries_left: u32,
    started: Instant,
    attempt_started: Instant,
    connect_ms: u64,
    /// True when the current socket came from the persistent pool.
    pooled: bool,
    send_buf: Vec<u8>,
    sent: usize,
    recv_phase: RecvPhase,
    recv_buf: Vec<u8>,
    recv_target: usize,
    reply_hdr: Option<ReplyHeader>,
}

impl AgentConn {
    fn mirror(&self) -> &super::mirror::AgentDesc {
        &self.query.group.mirrors()[self.mirror_idx]
    }

    fn send_done(&self) -> bool {
        self.sent >= self.send_buf.len()
    }
}

enum LoopCmd {
    Dispatch(AgentQuery),
    Shutdown,
}

/// Cloneable submission handle to the net loop.
#[derive(Clone)]
pub struct NetLoopHandle {
    tx: mpsc::UnboundedSender<LoopCmd>,
    waker: PollWaker,
}

impl NetLoopHandle {
    /// Submit one agent call. The reporter receives exactly one terminal
    /// outcome for it, in success and in failure alike.
    pub fn dispatch(&self, query: AgentQuery) {
        if self.tx.send(LoopCmd::Dispatch(query)).is_err() {
            warn!("net loop is gone, dropping agent dispatch");
        }
        self.waker.wake();
    }

    /// Cancel everything in flight and stop the loop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(LoopCmd::Shutdown);
        self.waker.wake();
    }
}

/// The net-loop task: owns the poller, all agent connections, and their
/// deadlines.
pub struct NetLoop {
    poller: Poller,
    conns: HashMap<u64, AgentConn>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, u64)>>,
    rx: mpsc::UnboundedReceiver<LoopCmd>,
    next_token: u64,
}

impl NetLoop {
    pub fn new() -> (NetLoop, NetLoopHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let poller = Poller::new();
        let handle = NetLoopHandle {
            tx,
            waker: poller.waker(),
        };
        (
            NetLoop {
                poller,
                conns: HashMap::new(),
                deadlines: BinaryHeap::new(),
                rx,
                next_token: 1,
            },
            handle,
        )
    }

    /// Drive until shutdown. Spawn this on its own task.
    pub async fn run(mut self) {
        loop {
            let next = self
                .deadlines
                .peek()
                .map(|Reverse((t, _, _))| *t)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            self.poller.wait(next).await;

            if self.drain_cmds() {
                self.cancel_all();
                break;
            }

            let events: Vec<(u64, Readiness)> = self.poller.events().collect();
            for (token, mask) in events {
                self.step_io(token, mask);
            }
            self.fire_timeouts();
        }
        debug!("net loop stopped");
    }

    fn drain_cmds(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(LoopCmd::Dispatch(query)) => self.admit(query),
                Ok(LoopCmd::Shutdown) => return true,
                Err(mpsc::error::TryRecvError::Empty) => return false,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return true;
                }
            }
        }
    }

    fn admit(&mut self, query: AgentQuery) {
        let token = self.next_token;
        self.next_token += 1;
        let retries = query.retries;
        let conn = AgentConn {
            mirror_idx: 0,
            sock: None,
            state: AgentState::Retry,
            r#gen: 0,
            attempts: 0,
            retries_left: retries,
            started: Instant::now(),
            attempt_started: Instant::now(),
            connect_ms: 0,
            pooled: false,
            send_buf: Vec::new(),
            sent: 0,
            recv_phase: RecvPhase::Hello,
            recv_buf: Vec::new(),
            recv_target: 0,
            reply_hdr: None,
            query,
        };
        self.begin_attempt(token, conn);
    }

    /// Open (or rent) a socket against the chosen mirror and register it.
    fn begin_attempt(&mut self, token: u64, mut conn: AgentConn) {
        // First attempt follows the group strategy; retries walk to the
        // next mirror so a dead host cannot eat the whole retry budget.
        conn.mirror_idx = match conn.query.pinned_mirror {
            Some(i) => i,
            None if conn.attempts == 0 => conn.query.group.choose(),
            None => (conn.mirror_idx + 1) % conn.query.group.len().max(1),
        };
        conn.attempts += 1;
        conn.attempt_started = Instant::now();
        conn.connect_ms = 0;
        conn.sent = 0;
        conn.recv_buf.clear();
        conn.reply_hdr = None;

        let mirror = conn.mirror().clone();

        // Persistent hosts try the FIFO pool first; a rented socket has the
        // handshake behind it already.
        if mirror.host.persistent {
            if let Some(pool) = mirror.dashboard.pool() {
                if let Rented::Pooled(sock) = pool.rent() {
                    trace!("rented pooled socket to {}", mirror.host.key());
                    conn.pooled = true;
                    conn.sock = Some(Arc::new(sock));
                    conn.send_buf = request_frame(conn.query.command, &conn.query.body);
                    conn.recv_phase = RecvPhase::Header;
                    conn.recv_target = HEADER_LEN;
                    self.enter_healthy(token, conn);
                    return;
                }
            }
        }

        let target = match mirror.host.connect_target() {
            Ok(t) => t,
            Err(e) => {
                self.fail_attempt(
                    token,
                    conn,
                    AgentFailure::Unresolvable(e.to_string()),
                    Counters {
                        connect_failures: 1,
                        ..Counters::default()
                    },
                    true,
                );
                return;
            }
        };

        conn.pooled = false;
        let mut out = OutBuf::new();
        out.put_u32(PROTO_HELLO);
        if mirror.host.persistent {
            let mut body = OutBuf::new();
            body.put_u32(1);
            out.put_raw(&request_frame(Command::Persist, body.as_slice()));
        }
        out.put_raw(&request_frame(conn.query.command, &conn.query.body));
        conn.send_buf = out.into_vec();
        conn.recv_phase = RecvPhase::Hello;
        conn.recv_target = 4;

        match connect_begin(&target) {
            Ok(start) => {
                let sock = Arc::new(start.sock);
                conn.sock = Some(Arc::clone(&sock));
                if start.established {
                    self.enter_healthy(token, conn);
                } else {
                    conn.state = AgentState::Connecting;
                    let at =
                        Instant::now() + Duration::from_millis(conn.query.connect_timeout_ms);
                    self.poller.add(token, sock, Interest::WRITABLE);
                    self.arm(token, &mut conn, at);
                    self.conns.insert(token, conn);
                }
            }
            Err(e) => {
                self.fail_attempt(
                    token,
                    conn,
                    AgentFailure::ConnectFailed(e.to_string()),
                    Counters {
                        connect_failures: 1,
                        ..Counters::default()
                    },
                    true,
                );
            }
        }
    }

    /// Handshake is done (or skipped): arm the query timeout and start the
    /// send phase.
    fn enter_healthy(&mut self, token: u64, mut conn: AgentConn) {
        conn.state = AgentState::Healthy;
        // Rented sockets never connected; they cost nothing here.
        conn.connect_ms = if conn.pooled {
            0
        } else {
            conn.attempt_started.elapsed().as_millis() as u64
        };
        let Some(sock) = conn.sock.clone() else {
            // Attempt bookkeeping bug; fail hard rather than hang the query.
            self.fail_attempt(
                token,
                conn,
                AgentFailure::Network("lost socket".into()),
                Counters {
                    network_errors: 1,
                    ..Counters::default()
                },
                true,
            );
            return;
        };
        self.poller.add(token, sock, Interest::WRITABLE);
        let at = Instant::now() + Duration::from_millis(conn.query.query_timeout_ms);
        self.arm(token, &mut conn, at);
        self.conns.insert(token, conn);
    }

    fn arm(&mut self, token: u64, conn: &mut AgentConn, at: Instant) {
        conn.r#gen += 1;
        self.deadlines.push(Reverse((at, token, conn.r#gen)));
    }

    fn step_io(&mut self, token: u64, mask: Readiness) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        match conn.state {
            AgentState::Connecting => {
                if !(mask.contains(Readiness::WRITE)
                    || mask.contains(Readiness::HUP)
                    || mask.contains(Readiness::ERR))
                {
                    self.conns.insert(token, conn);
                    return;
                }
                match conn.sock.as_deref().map(connect_finish) {
                    Some(Ok(())) => {
                        self.poller.remove(token);
                        self.enter_healthy(token, conn);
                    }
                    Some(Err(e)) => {
                        self.fail_attempt(
                            token,
                            conn,
                            AgentFailure::ConnectFailed(e.to_string()),
                            Counters {
                                connect_failures: 1,
                                ..Counters::default()
                            },
                            true,
                        );
                    }
                    None => {
                        self.fail_attempt(
                            token,
                            conn,
                            AgentFailure::Network("lost socket".into()),
                            Counters {
                                network_errors: 1,
                                ..Counters::default()
                            },
                            true,
                        );
                    }
                }
            }
            AgentState::Healthy => self.step_healthy(token, conn, mask),
            AgentState::Retry => {
                // No socket should be registered in retry state.
                self.conns.insert(token, conn);
            }
        }
    }

    fn step_healthy(&mut self, token: u64, mut conn: AgentConn, mask: Readiness) {
        if !conn.send_done() && (mask.contains(Readiness::WRITE) || mask.contains(Readiness::HUP))
        {
            match self.drive_send(&mut conn) {
                Ok(true) => {
                    if conn.mirror().host.blackhole {
                        // Replies are discarded: report success right after
                        // the send and close the socket.
                        self.finish_blackhole(token, conn);
                        return;
                    }
                    // Send completion happens-before the switch to read;
                    // the reply gets a fresh query timeout.
                    self.poller.change(token, Interest::READABLE);
                    let at =
                        Instant::now() + Duration::from_millis(conn.query.query_timeout_ms);
                    self.arm(token, &mut conn, at);
                }
                Ok(false) => {}
                Err(e) => {
                    let (failure, delta) = send_failure(e);
                    self.fail_attempt(token, conn, failure, delta, true);
                    return;
                }
            }
            self.conns.insert(token, conn);
            return;
        }

        if conn.send_done() && (mask.contains(Readiness::READ) || mask.contains(Readiness::HUP)) {
            self.drive_recv(token, conn);
            return;
        }

        if mask.contains(Readiness::ERR) {
            self.fail_attempt(
                token,
                conn,
                AgentFailure::Network("socket error readiness".into()),
                Counters {
                    network_errors: 1,
                    ..Counters::default()
                },
                true,
            );
            return;
        }

        self.conns.insert(token, conn);
    }

    /// Push buffered bytes. Ok(true) when the whole request went out.
    fn drive_send(&mut self, conn: &mut AgentConn) -> Result<bool, SockError> {
        let Some(sock) = conn.sock.clone() else {
            return Err(SockError::Reset);
        };
        while !conn.send_done() {
            match sock.try_send(&conn.send_buf[conn.sent..]) {
                Ok(0) => return Err(SockError::Reset),
                Ok(n) => conn.sent += n,
                Err(SockError::WouldBlock) => return Ok(false),
                Err(SockError::Interrupted) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn drive_recv(&mut self, token: u64, mut conn: AgentConn) {
        let Some(sock) = conn.sock.clone() else {
            self.fail_attempt(
                token,
                conn,
                AgentFailure::Network("lost socket".into()),
                Counters {
                    network_errors: 1,
                    ..Counters::default()
                },
                true,
            );
            return;
        };

        loop {
            if conn.recv_buf.len() == conn.recv_target {
                match conn.recv_phase {
                    RecvPhase::Hello => {
                        let mut inp = InBuf::new(&conn.recv_buf, 16);
                        let hello = inp.get_u32();
                        if hello < PROTO_HELLO {
                            self.fail_terminal(
                                token,
                                conn,
                                AgentFailure::Malformed(format!(
                                    "bad handshake 0x{hello:08x}"
                                )),
                                Counters {
                                    wrong_replies: 1,
                                    ..Counters::default()
                                },
                            );
                            return;
                        }
                        conn.recv_phase = RecvPhase::Header;
                        conn.recv_target = HEADER_LEN;
                        conn.recv_buf.clear();
                        continue;
                    }
                    RecvPhase::Header => {
                        let mut raw = [0u8; HEADER_LEN];
                        raw.copy_from_slice(&conn.recv_buf);
                        let hdr = ReplyHeader::parse(&raw);
                        if hdr.body_len as usize > conn.query.max_packet {
                            self.fail_terminal(
                                token,
                                conn,
                                AgentFailure::Malformed(format!(
                                    "oversized reply: {} bytes",
                                    hdr.body_len
                                )),
                                Counters {
                                    wrong_replies: 1,
                                    ..Counters::default()
                                },
                            );
                            return;
                        }
                        conn.reply_hdr = Some(hdr);
                        conn.recv_phase = RecvPhase::Body;
                        conn.recv_target = hdr.body_len as usize;
                        conn.recv_buf.clear();
                        if hdr.body_len == 0 {
                            // Release the local socket ref so a persistent
                            // socket can be returned to the pool whole.
                            drop(sock);
                            self.finish_reply(token, conn);
                            return;
                        }
                        continue;
                    }
                    RecvPhase::Body => {
                        drop(sock);
                        self.finish_reply(token, conn);
                        return;
                    }
                }
            }
            let start = conn.recv_buf.len();
            conn.recv_buf.resize(conn.recv_target, 0);
            match sock.try_recv(&mut conn.recv_buf[start..]) {
                Ok(0) => {
                    conn.recv_buf.truncate(start);
                    self.fail_attempt(
                        token,
                        conn,
                        AgentFailure::UnexpectedClose,
                        Counters {
                            unexpected_close: 1,
                            ..Counters::default()
                        },
                        true,
                    );
                    return;
                }
                Ok(n) => {
                    conn.recv_buf.truncate(start + n);
                }
                Err(SockError::WouldBlock) => {
                    conn.recv_buf.truncate(start);
                    self.conns.insert(token, conn);
                    return;
                }
                Err(SockError::Interrupted) => {
                    conn.recv_buf.truncate(start);
                }
                Err(e) => {
                    conn.recv_buf.truncate(start);
                    let (failure, delta) = recv_failure(e);
                    self.fail_attempt(token, conn, failure, delta, true);
                    return;
                }
            }
        }
    }

    /// Header and body are complete: classify the reply and report.
    fn finish_reply(&mut self, token: u64, mut conn: AgentConn) {
        self.poller.remove(token);
        let hdr = match conn.reply_hdr {
            Some(h) => h,
            None => {
                self.fail_terminal(
                    token,
                    conn,
                    AgentFailure::Malformed("missing reply header".into()),
                    Counters {
                        wrong_replies: 1,
                        ..Counters::default()
                    },
                );
                return;
            }
        };

        match ReplyStatus::from_u16(hdr.status) {
            Some(ReplyStatus::Ok) => {
                let body = std::mem::take(&mut conn.recv_buf);
                self.finish_success(conn, body, None);
            }
            Some(ReplyStatus::Warning) => {
                let mut inp = InBuf::new(&conn.recv_buf, conn.query.max_packet);
                let warning = inp.get_string();
                let rest = conn.recv_buf[inp.pos()..].to_vec();
                self.finish_success(conn, rest, Some(warning));
            }
            Some(ReplyStatus::Error) => {
                let mut inp = InBuf::new(&conn.recv_buf, conn.query.max_packet);
                let msg = inp.get_string();
                self.fail_terminal(
                    token,
                    conn,
                    AgentFailure::Remote(msg),
                    Counters {
                        wrong_replies: 1,
                        ..Counters::default()
                    },
                );
            }
            Some(ReplyStatus::Retry) => {
                let mut inp = InBuf::new(&conn.recv_buf, conn.query.max_packet);
                let msg = inp.get_string();
                self.fail_attempt(
                    token,
                    conn,
                    AgentFailure::Remote(msg),
                    Counters::default(),
                    true,
                );
            }
            None => {
                self.fail_terminal(
                    token,
                    conn,
                    AgentFailure::Malformed(format!("unknown status {}", hdr.status)),
                    Counters {
                        wrong_replies: 1,
                        ..Counters::default()
                    },
                );
            }
        }
    }

    fn finish_success(&mut self, mut conn: AgentConn, body: Vec<u8>, warning: Option<String>) {
        let elapsed_us = conn.started.elapsed().as_micros() as u64;
        let mirror = conn.mirror().clone();
        let mut delta = Counters {
            clean_successes: 1,
            ..Counters::default()
        };
        if warning.is_some() {
            delta.critical_warnings = 1;
        }
        mirror
            .dashboard
            .record(&delta, elapsed_us, 1, conn.connect_ms);

        // A healthy persistent socket goes back into the FIFO pool; its
        // framing state is clean because the whole reply was consumed.
        if let Some(sock) = conn.sock.take() {
            if mirror.host.persistent {
                if let (Some(pool), Ok(owned)) =
                    (mirror.dashboard.pool(), Arc::try_unwrap(sock))
                {
                    pool.put_back(owned);
                }
            }
        }

        conn.query.reporter.report(AgentResult {
            host_key: mirror.host.key(),
            reply: body,
            warning,
            error: None,
            elapsed_us,
        });
    }

    /// Blackhole mirrors skip reply reception entirely; only the connect
    /// attempt is recorded.
    fn finish_blackhole(&mut self, token: u64, mut conn: AgentConn) {
        self.poller.remove(token);
        let elapsed_us = conn.started.elapsed().as_micros() as u64;
        let mirror = conn.mirror().clone();
        mirror
            .dashboard
            .record(&Counters::default(), 0, 1, conn.connect_ms);
        conn.sock = None;
        conn.query.reporter.report(AgentResult {
            host_key: mirror.host.key(),
            reply: Vec::new(),
            warning: None,
            error: None,
            elapsed_us,
        });
    }

    /// Attempt failed with a possibly-transient cause: record, close the
    /// socket (never pooled), and either schedule a retry or go terminal.
    fn fail_attempt(
        &mut self,
        token: u64,
        mut conn: AgentConn,
        failure: AgentFailure,
        delta: Counters,
        retriable: bool,
    ) {
        self.poller.remove(token);
        let attempt_us = conn.attempt_started.elapsed().as_micros() as u64;
        let mirror = conn.mirror().clone();
        mirror
            .dashboard
            .record(&delta, attempt_us, 1, conn.connect_ms);
        conn.sock = None; // failed sockets are closed, never returned

        if retriable && conn.retries_left > 0 {
            conn.retries_left -= 1;
            conn.state = AgentState::Retry;
            debug!(
                "agent {} failed ({failure}), {} retries left",
                mirror.host.key(),
                conn.retries_left
            );
            let at = Instant::now() + Duration::from_millis(conn.query.retry_delay_ms);
            self.arm(token, &mut conn, at);
            self.conns.insert(token, conn);
        } else {
            let elapsed_us = conn.started.elapsed().as_micros() as u64;
            conn.query.reporter.report(AgentResult {
                host_key: mirror.host.key(),
                reply: Vec::new(),
                warning: None,
                error: Some(failure),
                elapsed_us,
            });
        }
    }

    /// Protocol and application errors skip the retry loop.
    fn fail_terminal(
        &mut self,
        token: u64,
        mut conn: AgentConn,
        failure: AgentFailure,
        delta: Counters,
    ) {
        self.poller.remove(token);
        let attempt_us = conn.attempt_started.elapsed().as_micros() as u64;
        let mirror = conn.mirror().clone();
        mirror
            .dashboard
            .record(&delta, attempt_us, 1, conn.connect_ms);
        conn.sock = None;
        let elapsed_us = conn.started.elapsed().as_micros() as u64;
        conn.query.reporter.report(AgentResult {
            host_key: mirror.host.key(),
            reply: Vec::new(),
            warning: None,
            error: Some(failure),
            elapsed_us,
        });
    }

    fn fire_timeouts(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((at, token, r#gen))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            let Some(conn) = self.conns.get(&token) else {
                continue;
            };
            if conn.r#gen != r#gen {
                continue; // re-armed since this entry was pushed
            }
            let Some(conn) = self.conns.remove(&token) else {
                continue;
            };
            match conn.state {
                AgentState::Connecting => {
                    self.fail_attempt(
                        token,
                        conn,
                        AgentFailure::ConnectTimeout,
                        Counters {
                            timeouts_connect: 1,
                            ..Counters::default()
                        },
                        true,
                    );
                }
                AgentState::Healthy => {
                    self.fail_attempt(
                        token,
                        conn,
                        AgentFailure::QueryTimeout,
                        Counters {
                            timeouts_query: 1,
                            ..Counters::default()
                        },
                        true,
                    );
                }
                AgentState::Retry => {
                    // Retry delay elapsed: go again, possibly on another
                    // mirror.
                    self.begin_attempt(token, conn);
                }
            }
        }
    }

    fn cancel_all(&mut self) {
        let tokens: Vec<u64> = self.conns.keys().copied().collect();
        for token in tokens {
            self.poller.remove(token);
            if let Some(conn) = self.conns.remove(&token) {
                conn.query.reporter.report(AgentResult {
                    host_key: conn.mirror().host.key(),
                    reply: Vec::new(),
                    warning: None,
                    error: Some(AgentFailure::Cancelled),
                    elapsed_us: conn.started.elapsed().as_micros() as u64,
                });
            }
        }
        self.deadlines.clear();
    }
}

fn send_failure(e: SockError) -> (AgentFailure, Counters) {
    match e {
        SockError::Reset => (
            AgentFailure::UnexpectedClose,
            Counters {
                unexpected_close: 1,
                ..Counters::default()
            },
        ),
        other => (
            AgentFailure::Network(other.to_string()),
            Counters {
                network_errors: 1,
                ..Counters::default()
            },
        ),
    }
}

fn recv_failure(e: SockError) -> (AgentFailure, Counters) {
    send_failure(e)
}

/// Periodic low-cost pings for HA mirror groups.
///
/// Only groups with ping enabled and more than one mirror are pinged;
/// single-mirror hosts never are. Outcomes feed the same dashboard path as
/// real queries, so selection strategies see dead mirrors between queries.
pub struct Pinger {
    handle: NetLoopHandle,
    groups: Vec<Arc<MirrorGroup>>,
    interval: Duration,
    connect_timeout_ms: u64,
    query_timeout_ms: u64,
}

impl Pinger {
    pub fn new(
        handle: NetLoopHandle,
        groups: Vec<Arc<MirrorGroup>>,
        interval_ms: u64,
        connect_timeout_ms: u64,
        query_timeout_ms: u64,
    ) -> Pinger {
        Pinger {
            handle,
            groups,
            interval: Duration::from_millis(interval_ms.max(100)),
            connect_timeout_ms,
            query_timeout_ms,
        }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            for group in &self.groups {
                if !group.ping || group.len() < 2 {
                    continue;
                }
                for (i, mirror) in group.mirrors().iter().enumerate() {
                    if mirror.host.blackhole {
                        continue;
                    }
                    let mut body = OutBuf::new();
                    body.put_u32(super::dashboard::wall_secs() as u32);
                    self.handle.dispatch(AgentQuery {
                        group: Arc::clone(group),
                        pinned_mirror: Some(i),
                        command: Command::Ping,
                        body: body.into_vec(),
                        connect_timeout_ms: self.connect_timeout_ms,
                        query_timeout_ms: self.query_timeout_ms,
                        retries: 0,
                        retry_delay_ms: 0,
                        max_packet: super::wire::DEFAULT_MAX_PACKET,
                        reporter: Reporter::new(1),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::dashboard::DashboardRegistry;
    use crate::net::mirror::{AgentDesc, HostDesc, Strategy};
    use crate::net::wire::{RequestHeader, reply_frame};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal agent-side server speaking the legacy binary protocol.
    async fn spawn_agent_server(reply_body: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut s, _)) = listener.accept().await else {
                    return;
                };
                let reply = reply_body.clone();
                tokio::spawn(async move {
                    s.write_all(&PROTO_HELLO.to_be_bytes()).await.ok();
                    let mut hello = [0u8; 4];
                    if s.read_exact(&mut hello).await.is_err() {
                        return;
                    }
                    loop {
                        let mut raw = [0u8; HEADER_LEN];
                        if s.read_exact(&mut raw).await.is_err() {
                            return;
                        }
                        let hdr = RequestHeader::parse(&raw);
                        let mut body = vec![0u8; hdr.body_len as usize];
                        if s.read_exact(&mut body).await.is_err() {
                            return;
                        }
                        if hdr.command == Command::Persist as u16 {
                            continue;
                        }
                        let frame = reply_frame(ReplyStatus::Ok, hdr.version, &reply);
                        if s.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn mirror_for(reg: &DashboardRegistry, addr: SocketAddr) -> AgentDesc {
        let host = HostDesc::inet("127.0.0.1", addr.port());
        let dashboard = reg.get_or_create(&host.key(), 0);
        AgentDesc {
            host,
            indexes: vec!["idx".into()],
            dashboard,
        }
    }

    fn query(group: Arc<MirrorGroup>, retries: u32, reporter: Arc<Reporter>) -> AgentQuery {
        AgentQuery {
            group,
            pinned_mirror: None,
            command: Command::Search,
            body: b"q".to_vec(),
            connect_timeout_ms: 1000,
            query_timeout_ms: 1000,
            retries,
            retry_delay_ms: 30,
            max_packet: 1 << 20,
            reporter,
        }
    }

    #[tokio::test]
    async fn roundtrip_reports_success() {
        let addr = spawn_agent_server(b"result".to_vec()).await;
        let reg = DashboardRegistry::new();
        let mirror = mirror_for(&reg, addr);
        let dashboard = Arc::clone(&mirror.dashboard);
        let group = Arc::new(MirrorGroup::new(vec![mirror], Strategy::Random, 0, 30, false));

        let (netloop, handle) = NetLoop::new();
        tokio::spawn(netloop.run());

        let reporter = Reporter::new(1);
        handle.dispatch(query(group, 0, Arc::clone(&reporter)));

        assert!(reporter.wait(Instant::now() + Duration::from_secs(3)).await);
        let results = reporter.take_results();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_success());
        assert_eq!(results[0].reply, b"result");
        assert_eq!(dashboard.snapshot(1).counters.clean_successes, 1);
        assert_eq!(dashboard.total_conn_attempts(), 1);
        handle.shutdown();
    }

    #[tokio::test]
    async fn retry_switches_to_live_mirror() {
        // A port that was bound once and released: connecting gets refused.
        let dead_addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let live_addr = spawn_agent_server(b"ok".to_vec()).await;

        let reg = DashboardRegistry::new();
        let dead = mirror_for(&reg, dead_addr);
        let live = mirror_for(&reg, live_addr);
        let dead_dash = Arc::clone(&dead.dashboard);
        let live_dash = Arc::clone(&live.dashboard);
        // Round-robin starts on the dead mirror, the retry lands on the
        // live one.
        let group = Arc::new(MirrorGroup::new(
            vec![dead, live],
            Strategy::RoundRobin,
            2,
            30,
            false,
        ));

        let (netloop, handle) = NetLoop::new();
        tokio::spawn(netloop.run());

        let reporter = Reporter::new(1);
        handle.dispatch(query(group, 2, Arc::clone(&reporter)));

        assert!(reporter.wait(Instant::now() + Duration::from_secs(5)).await);
        let results = reporter.take_results();
        assert!(results[0].is_success(), "got {:?}", results[0].error);
        assert_eq!(live_dash.snapshot(1).counters.clean_successes, 1);
        assert!(dead_dash.snapshot(1).counters.failures() >= 1);
        assert!(dead_dash.in_retry_state());
        handle.shutdown();
    }

    #[tokio::test]
    async fn query_timeout_is_terminal_without_retries() {
        // Server accepts and greets but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut s, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    s.write_all(&PROTO_HELLO.to_be_bytes()).await.ok();
                    tokio::time::sleep(Duration::from_secs(10)).await;
                });
            }
        });

        let reg = DashboardRegistry::new();
        let mirror = mirror_for(&reg, addr);
        let dashboard = Arc::clone(&mirror.dashboard);
        let group = Arc::new(MirrorGroup::new(vec![mirror], Strategy::Random, 0, 30, false));

        let (netloop, handle) = NetLoop::new();
        tokio::spawn(netloop.run());

        let reporter = Reporter::new(1);
        let mut q = query(group, 0, Arc::clone(&reporter));
        q.query_timeout_ms = 100;
        handle.dispatch(q);

        assert!(reporter.wait(Instant::now() + Duration::from_secs(5)).await);
        let results = reporter.take_results();
        assert!(matches!(
            results[0].error,
            Some(AgentFailure::QueryTimeout)
        ));
        assert_eq!(dashboard.snapshot(1).counters.timeouts_query, 1);
        handle.shutdown();
    }

    #[tokio::test]
    async fn reporter_wait_times_out_when_incomplete() {
        let reporter = Reporter::new(2);
        reporter.report(AgentResult {
            host_key: "h".into(),
            reply: Vec::new(),
            warning: None,
            error: None,
            elapsed_us: 1,
        });
        let done = reporter
            .wait(Instant::now() + Duration::from_millis(50))
            .await;
        assert!(!done);
        assert_eq!(reporter.finished(), 1);
    }
}
