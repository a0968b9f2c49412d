//! The search daemon core: listener multiplexor, per-protocol connection
//! handlers, and local/distributed query dispatch.
//!
//! One accept loop runs per endpoint. Accepted sockets go to cooperative
//! handler tasks; a semaphore bounds non-VIP connections. Distributed
//! queries fan out through the net loop (`net::agent`) and merge through
//! the executor seam.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::config::{BindAddr, Endpoint, Proto, ServerConfig};
use crate::index::{ExecOutput, IndexType, QueryExecutor, IndexRegistry, Served};
use crate::net::agent::{AgentQuery, NetLoop, NetLoopHandle, Pinger, Reporter};
use crate::net::buf::{InBuf, OutBuf};
use crate::net::dashboard::DashboardRegistry;
use crate::net::mirror::{AgentDesc, HostDesc, MirrorGroup};
use crate::net::sock::{Sock, SockError};
use crate::net::wire::{
    Command, HEADER_LEN, PROTO_HELLO, ReplyStatus, RequestHeader, error_reply, reply_frame,
};

/// Daemon-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bind failed on {0}: {1}")]
    Bind(String, std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server-wide counters, surfaced through the status command.
#[derive(Default)]
pub struct ServerCounters {
    pub accepted: AtomicU64,
    pub active: AtomicU64,
    pub commands: AtomicU64,
    pub errors: AtomicU64,
}

/// One bound endpoint, with the port the kernel actually assigned.
#[derive(Debug, Clone)]
pub struct BoundEndpoint {
    pub bind: BindAddr,
    pub proto: Proto,
    pub vip: bool,
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// The daemon object. Lives as long as the process serves.
pub struct SearchServer {
    config: ServerConfig,
    registry: IndexRegistry,
    dashboards: DashboardRegistry,
    executor: Arc<dyn QueryExecutor>,
    netloop: NetLoopHandle,
    counters: ServerCounters,
    conn_limit: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl SearchServer {
    /// Build the server and spawn its net loop. Call inside a runtime.
    pub fn new(config: ServerConfig, executor: Arc<dyn QueryExecutor>) -> Arc<SearchServer> {
        let (netloop, handle) = NetLoop::new();
        tokio::spawn(netloop.run());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let max_connections = config.max_connections.max(1);
        Arc::new(SearchServer {
            conn_limit: Arc::new(Semaphore::new(max_connections)),
            config,
            registry: IndexRegistry::new(),
            dashboards: DashboardRegistry::new(),
            executor,
            netloop: handle,
            counters: ServerCounters::default(),
            shutdown_tx,
            shutdown_rx,
            accept_tasks: Mutex::new(Vec::new()),
            started_at: chrono::Utc::now(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    pub fn dashboards(&self) -> &DashboardRegistry {
        &self.dashboards
    }

    pub fn counters(&self) -> &ServerCounters {
        &self.counters
    }

    pub fn net_handle(&self) -> NetLoopHandle {
        self.netloop.clone()
    }

    /// Build an agent descriptor wired to this server's dashboards,
    /// resolving host names here so the net loop only ever sees
    /// connectable addresses. A persistent host gets its FIFO pool on
    /// first sight.
    pub async fn agent_desc(
        &self,
        mut host: HostDesc,
        indexes: Vec<String>,
    ) -> Result<AgentDesc, SockError> {
        host.ensure_resolved().await?;
        let pool_capacity = if host.persistent {
            self.config.agent.persist_pool_size
        } else {
            0
        };
        let dashboard = self.dashboards.get_or_create(&host.key(), pool_capacity);
        Ok(AgentDesc {
            host,
            indexes,
            dashboard,
        })
    }

    /// Bind every configured listener and start accepting. Also starts the
    /// mirror pinger over the groups currently registered.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<BoundEndpoint>, ServerError> {
        let mut bound = Vec::new();
        for spec in self.config.listeners.clone() {
            for ep in spec.endpoints() {
                bound.push(self.spawn_listener(ep).await?);
            }
        }
        self.spawn_pinger();
        Ok(bound)
    }

    /// Bind one endpoint and spawn its accept loop. Public so tests can
    /// listen on ephemeral ports.
    pub async fn spawn_listener(
        self: &Arc<Self>,
        ep: Endpoint,
    ) -> Result<BoundEndpoint, ServerError> {
        let (listener, local) = match &ep.bind {
            BindAddr::Inet(addr) => {
                let l = TcpListener::bind(addr)
                    .await
                    .map_err(|e| ServerError::Bind(addr.to_string(), e))?;
                let local = BindAddr::Inet(l.local_addr()?);
                (Listener::Tcp(l), local)
            }
            BindAddr::Unix(path) => {
                let _ = std::fs::remove_file(path);
                let l = UnixListener::bind(path)
                    .map_err(|e| ServerError::Bind(path.display().to_string(), e))?;
                (Listener::Unix(l), BindAddr::Unix(path.clone()))
            }
        };
        info!("listening on {} ({}{})", local, ep.proto.as_str(), if ep.vip { ", vip" } else { "" });

        let server = Arc::clone(self);
        let proto = ep.proto;
        let vip = ep.vip;
        let task = tokio::spawn(async move {
            server.accept_loop(listener, proto, vip).await;
        });
        self.accept_tasks.lock().push(task);

        Ok(BoundEndpoint {
            bind: local,
            proto: ep.proto,
            vip: ep.vip,
        })
    }

    /// Start the background pinger over every HA group currently known to
    /// the registry. Single-mirror groups are skipped by the pinger itself.
    pub fn spawn_pinger(self: &Arc<Self>) {
        let mut groups: Vec<Arc<MirrorGroup>> = Vec::new();
        let mut it = self.registry.read_iter();
        while let Some((_, slot)) = it.advance() {
            let Some(served) = slot else { continue };
            if served.index_type() != IndexType::Distributed {
                continue;
            }
            if let Some(desc) = served.read().distributed.as_ref() {
                groups.extend(desc.groups.iter().cloned());
            }
        }
        if groups.is_empty() {
            return;
        }
        let pinger = Pinger::new(
            self.netloop.clone(),
            groups,
            self.config.agent.ping_interval_ms,
            self.config.agent.connect_timeout_ms,
            self.config.agent.query_timeout_ms,
        );
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(pinger.run(shutdown));
    }

    /// Graceful teardown: stop accepting, cancel in-flight agent calls,
    /// close persistent pools, release every index handle, join acceptors.
    pub async fn shutdown(&self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(true);
        self.netloop.shutdown();
        self.dashboards.shutdown_pools();
        self.registry.clear();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.accept_tasks.lock());
        for t in tasks {
            let _ = t.await;
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener, proto: Proto, vip: bool) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            let accepted = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
                res = accept_one(&listener) => res,
            };
            let sock = match accepted {
                Ok(sock) => sock,
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            self.counters.accepted.fetch_add(1, Ordering::Relaxed);

            // VIP endpoints bypass the connection cap.
            let permit = if vip {
                None
            } else {
                match Arc::clone(&self.conn_limit).try_acquire_owned() {
                    Ok(p) => Some(p),
                    Err(_) => {
                        warn!("connection limit reached, dropping client");
                        continue;
                    }
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                server.counters.active.fetch_add(1, Ordering::Relaxed);
                server.handle_conn(sock, proto).await;
                server.counters.active.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    async fn handle_conn(&self, sock: Sock, declared: Proto) {
        let proto = match (&sock, declared) {
            // Shared ports: a client that opens with an HTTP method gets
            // the http handler; the 4-byte binary hello keeps sphinx.
            (Sock::Tcp(tcp), Proto::Sphinx) => sniff_proto(tcp).await,
            _ => declared,
        };
        let label = sock.peer_label();
        debug!("client {} connected ({})", label, proto.as_str());
        let res = match proto {
            Proto::Sphinx => self.handle_sphinx(sock).await,
            Proto::Mysql41 => self.handle_mysql(sock).await,
            Proto::Http => self.handle_http(sock).await,
            Proto::Replication => {
                warn!("replication endpoint accepts no payloads in this build");
                Ok(())
            }
        };
        match res {
            Ok(()) => debug!("client {label} disconnected"),
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                debug!("client {label} dropped: {e}");
            }
        }
    }

    // ------------------------------------------------------------------
    // legacy binary frontend
    // ------------------------------------------------------------------

    async fn handle_sphinx(&self, sock: Sock) -> Result<(), SockError> {
        let sock = Arc::new(sock);
        let mut shutdown = self.shutdown_rx.clone();
        let client_timeout = Duration::from_secs(self.config.client_timeout_secs);
        let persist_timeout = Duration::from_secs(self.config.persist_timeout_secs);

        // Hello exchange: we greet, the client greets back.
        let mut out = crate::net::wire::NetOut::new(Arc::clone(&sock));
        out.buf().put_u32(PROTO_HELLO);
        out.flush(Instant::now() + client_timeout).await?;

        let mut inp = crate::net::wire::NetIn::new(Arc::clone(&sock));
        inp.read_more(4, Instant::now() + client_timeout, true, false)
            .await?;
        let client_hello = InBuf::new(inp.as_slice(), 16).get_u32();
        if client_hello < PROTO_HELLO {
            debug!("bad client handshake 0x{client_hello:08x}");
            return Ok(());
        }

        let mut persistent = false;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let idle = if persistent {
                persist_timeout
            } else {
                client_timeout
            };
            let deadline = Instant::now() + idle;

            let read = tokio::select! {
                r = inp.read_more(HEADER_LEN, deadline, true, false) => r,
                _ = shutdown.changed() => return Ok(()),
            };
            match read {
                Ok(()) => {}
                // Idle clients going away between requests is normal.
                Err(SockError::Reset) | Err(SockError::Timeout) => return Ok(()),
                Err(e) => return Err(e),
            }

            let mut raw = [0u8; HEADER_LEN];
            raw.copy_from_slice(inp.as_slice());
            let hdr = RequestHeader::parse(&raw);

            if hdr.body_len as usize > self.config.max_packet {
                // Oversized length field: protocol error, answer and drop
                // the connection (the stream cannot be resynced).
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                let frame = error_reply(
                    hdr.version,
                    &format!(
                        "oversized packet: {} bytes (max {})",
                        hdr.body_len, self.config.max_packet
                    ),
                );
                out.chain().push_front_chunk(frame);
                let _ = out.flush(Instant::now() + client_timeout).await;
                return Ok(());
            }

            inp.read_more(
                hdr.body_len as usize,
                Instant::now() + client_timeout,
                false,
                false,
            )
            .await?;

            self.counters.commands.fetch_add(1, Ordering::Relaxed);
            let body: Vec<u8> = inp.as_slice().to_vec();
            let reply = match self.dispatch_command(&hdr, &body).await {
                SphinxOutcome::Reply(frame) => frame,
                SphinxOutcome::Persist => {
                    persistent = true;
                    continue;
                }
            };
            out.chain().push_front_chunk(reply);
            out.flush(Instant::now() + client_timeout).await?;
        }
    }

    async fn dispatch_command(&self, hdr: &RequestHeader, body: &[u8]) -> SphinxOutcome {
        let Some(command) = Command::from_u16(hdr.command) else {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            return SphinxOutcome::Reply(error_reply(
                0,
                &format!("unknown command {}", hdr.command),
            ));
        };

        // Major version must match; minor differences are tolerated.
        if hdr.version >> 8 != command.version() >> 8 {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            return SphinxOutcome::Reply(error_reply(
                command.version(),
                &format!(
                    "client version mismatch: got 0x{:x}, expected 0x{:x}",
                    hdr.version,
                    command.version()
                ),
            ));
        }

        match command {
            Command::Ping => {
                let cookie = InBuf::new(body, 16).get_u32();
                let mut out = OutBuf::new();
                out.put_u32(cookie);
                SphinxOutcome::Reply(reply_frame(
                    ReplyStatus::Ok,
                    command.version(),
                    out.as_slice(),
                ))
            }
            Command::Persist => SphinxOutcome::Persist,
            Command::Status => SphinxOutcome::Reply(self.handle_status(command.version())),
            Command::Search => SphinxOutcome::Reply(self.handle_search(body).await),
            other => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                SphinxOutcome::Reply(error_reply(
                    other.version(),
                    &format!("command {:?} not supported by this build", other),
                ))
            }
        }
    }

    async fn handle_search(&self, body: &[u8]) -> Vec<u8> {
        let ver = Command::Search.version();
        let started = Instant::now();

        let name = match self.executor.target_index(body) {
            Ok(name) => name,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return error_reply(ver, &e.to_string());
            }
        };
        let Some(served) = self.registry.get(&name) else {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            return error_reply(ver, &format!("unknown index '{name}'"));
        };

        if served.index_type() != IndexType::Distributed {
            return match self.executor.execute(&served, body) {
                Ok(out) => {
                    served
                        .stats()
                        .record(out.rows, started.elapsed().as_micros() as u64);
                    reply_frame(ReplyStatus::Ok, ver, &out.body)
                }
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    error_reply(ver, &e.to_string())
                }
            };
        }

        let out = self.search_distributed(&served, body).await;
        match out {
            DistOutcome::Ok(merged) => {
                served
                    .stats()
                    .record(merged.rows, started.elapsed().as_micros() as u64);
                reply_frame(ReplyStatus::Ok, ver, &merged.body)
            }
            DistOutcome::Partial(merged, warning) => {
                served
                    .stats()
                    .record(merged.rows, started.elapsed().as_micros() as u64);
                let mut body = OutBuf::new();
                body.put_str(&warning);
                body.put_raw(&merged.body);
                reply_frame(ReplyStatus::Warning, ver, body.as_slice())
            }
            DistOutcome::Failed(msg) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                error_reply(ver, &msg)
            }
        }
    }

    /// Fan a query out across the local members and every mirror group of
    /// a distributed index, then merge in arrival order.
    async fn search_distributed(&self, served: &Arc<Served>, body: &[u8]) -> DistOutcome {
        let desc = {
            let guard = served.read();
            guard.distributed.clone().unwrap_or_default()
        };

        let mut parts: Vec<Vec<u8>> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        // Remote dispatch first so agents work while locals execute.
        let agent_cfg = &self.config.agent;
        let reporter = Reporter::new(desc.groups.len());
        for group in &desc.groups {
            let target = group
                .mirrors()
                .first()
                .map(|m| m.index_list())
                .unwrap_or_default();
            self.netloop.dispatch(AgentQuery {
                group: Arc::clone(group),
                pinned_mirror: None,
                command: Command::Search,
                body: self.executor.build_remote(body, &target),
                connect_timeout_ms: agent_cfg.connect_timeout_ms,
                query_timeout_ms: agent_cfg.query_timeout_ms,
                retries: group.retry_count,
                retry_delay_ms: group.retry_delay_ms,
                max_packet: self.config.max_packet,
                reporter: Arc::clone(&reporter),
            });
        }

        for local in &desc.locals {
            match self.registry.get(local) {
                Some(member) => match self.executor.execute(&member, body) {
                    Ok(out) => parts.push(out.body),
                    Err(e) => failures.push(format!("local {local}: {e}")),
                },
                None => failures.push(format!("local {local}: unknown index")),
            }
        }

        if !desc.groups.is_empty() {
            let attempts = u64::from(
                desc.groups
                    .iter()
                    .map(|g| g.retry_count)
                    .max()
                    .unwrap_or(0),
            ) + 1;
            let budget_ms = (agent_cfg.connect_timeout_ms + agent_cfg.query_timeout_ms)
                * attempts
                + agent_cfg.retry_delay_ms * attempts
                + 250;
            reporter
                .wait(Instant::now() + Duration::from_millis(budget_ms))
                .await;
            for res in reporter.take_results() {
                match res.error {
                    None => {
                        // Blackhole mirrors report success with no payload.
                        if !res.reply.is_empty() {
                            parts.push(res.reply);
                        }
                        if let Some(w) = res.warning {
                            warnings.push(format!("agent {}: {w}", res.host_key));
                        }
                    }
                    Some(err) => failures.push(format!("agent {}: {err}", res.host_key)),
                }
            }
        }

        if parts.is_empty() && !failures.is_empty() {
            return DistOutcome::Failed(failures.join("; "));
        }
        let merged = self.executor.merge(parts);
        if failures.is_empty() && warnings.is_empty() {
            DistOutcome::Ok(merged)
        } else {
            let mut all = warnings;
            all.extend(failures);
            DistOutcome::Partial(merged, all.join("; "))
        }
    }

    /// Status reply: a table of (name, value) string pairs.
    fn handle_status(&self, ver: u16) -> Vec<u8> {
        let mut rows: Vec<(String, String)> = vec![
            ("version".into(), env!("CARGO_PKG_VERSION").into()),
            ("started".into(), self.started_at.to_rfc3339()),
            (
                "uptime_secs".into(),
                (chrono::Utc::now() - self.started_at).num_seconds().to_string(),
            ),
            (
                "connections".into(),
                self.counters.accepted.load(Ordering::Relaxed).to_string(),
            ),
            (
                "clients".into(),
                self.counters.active.load(Ordering::Relaxed).to_string(),
            ),
            (
                "commands".into(),
                self.counters.commands.load(Ordering::Relaxed).to_string(),
            ),
            (
                "command_errors".into(),
                self.counters.errors.load(Ordering::Relaxed).to_string(),
            ),
        ];

        for dash in self.dashboards.all() {
            let snap = dash.snapshot(1);
            rows.push((
                format!("agent_{}", dash.key()),
                format!(
                    "ok={} fail={} attempts={} errors_in_a_row={} avg_connect_ms={}",
                    snap.counters.clean_successes,
                    snap.counters.failures(),
                    dash.total_conn_attempts(),
                    dash.errors_in_a_row(),
                    snap.avg_connect_ms,
                ),
            ));
        }

        let mut it = self.registry.read_iter();
        while let Some((name, slot)) = it.advance() {
            let Some(served) = slot else { continue };
            let snap = served.stats().snapshot();
            rows.push((
                format!("index_{name}"),
                format!(
                    "type={} queries={} avg_us={} p95_us={} p99_us={}",
                    served.index_type().as_str(),
                    snap.count,
                    snap.avg_time_us(),
                    snap.time_p95,
                    snap.time_p99,
                ),
            ));
        }

        let mut out = OutBuf::new();
        out.put_u32(rows.len() as u32);
        for (k, v) in &rows {
            out.put_str(k);
            out.put_str(v);
        }
        reply_frame(ReplyStatus::Ok, ver, out.as_slice())
    }

    // ------------------------------------------------------------------
    // mysql41 frontend (greeting + ping only; SQL lives outside the core)
    // ------------------------------------------------------------------

    async fn handle_mysql(&self, sock: Sock) -> Result<(), SockError> {
        let sock = Arc::new(sock);
        let deadline = Instant::now() + Duration::from_secs(self.config.client_timeout_secs);
        let mut out = crate::net::wire::NetOut::new(Arc::clone(&sock));
        let mut inp = crate::net::wire::NetIn::new(Arc::clone(&sock));

        // Server-speaks-first greeting, protocol 10 layout.
        let mut payload = OutBuf::new();
        payload.put_u8(10);
        payload.put_raw(format!("5.5.21-id-{}", env!("CARGO_PKG_VERSION")).as_bytes());
        payload.put_u8(0);
        payload.put_u32_le(self.counters.accepted.load(Ordering::Relaxed) as u32);
        payload.put_raw(b"12345678"); // auth plugin data, part 1
        payload.put_u8(0);
        payload.put_raw(&0xa28du16.to_le_bytes()); // capabilities, lower half
        payload.put_u8(0x21); // utf8
        payload.put_raw(&2u16.to_le_bytes()); // status: autocommit
        payload.put_raw(&0u16.to_le_bytes()); // capabilities, upper half
        payload.put_u8(0);
        payload.put_raw(&[0u8; 10]);
        payload.put_raw(b"123456789012\0"); // auth plugin data, part 2
        out.chain()
            .push_front_chunk(mysql_packet(0, payload.as_slice()));
        out.flush(deadline).await?;

        // Client handshake response; contents are irrelevant here.
        read_mysql_packet(&mut inp, deadline, self.config.max_packet).await?;
        out.chain().push_front_chunk(mysql_ok_packet(2));
        out.flush(deadline).await?;

        loop {
            let idle = Instant::now() + Duration::from_secs(self.config.client_timeout_secs);
            let payload = match read_mysql_packet(&mut inp, idle, self.config.max_packet).await {
                Ok(p) => p,
                Err(SockError::Reset) | Err(SockError::Timeout) => return Ok(()),
                Err(e) => return Err(e),
            };
            let Some(&cmd) = payload.first() else {
                return Ok(());
            };
            self.counters.commands.fetch_add(1, Ordering::Relaxed);
            match cmd {
                0x01 => return Ok(()), // COM_QUIT
                0x0e => {
                    out.chain().push_front_chunk(mysql_ok_packet(1));
                }
                _ => {
                    out.chain().push_front_chunk(mysql_error_packet(
                        1,
                        1064,
                        "SQL frontend not available: this build serves the binary protocol",
                    ));
                }
            }
            out.flush(Instant::now() + Duration::from_secs(self.config.client_timeout_secs))
                .await?;
        }
    }

    // ------------------------------------------------------------------
    // http frontend (ping only; the JSON surface lives outside the core)
    // ------------------------------------------------------------------

    async fn handle_http(&self, sock: Sock) -> Result<(), SockError> {
        let sock = Arc::new(sock);
        let deadline = Instant::now() + Duration::from_secs(self.config.client_timeout_secs);
        let mut head: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 1024];

        // Read the request head, bounded.
        loop {
            if head.len() > 8192 {
                return Ok(());
            }
            match tokio::time::timeout_at(deadline, sock.ready(tokio::io::Interest::READABLE))
                .await
            {
                Err(_) => return Ok(()),
                Ok(Err(_)) => return Ok(()),
                Ok(Ok(_)) => {}
            }
            match sock.try_recv(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => head.extend_from_slice(&chunk[..n]),
                Err(SockError::WouldBlock) => continue,
                Err(SockError::Interrupted) => continue,
                Err(_) => return Ok(()),
            }
            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        self.counters.commands.fetch_add(1, Ordering::Relaxed);
        let line = head.split(|&b| b == b'\r').next().unwrap_or(&[]);
        let line = String::from_utf8_lossy(line);
        let path = line.split_whitespace().nth(1).unwrap_or("/");

        let response = if path == "/ping" || path.starts_with("/ping?") {
            http_response(200, "OK", "pong")
        } else {
            http_response(
                501,
                "Not Implemented",
                "this build serves the binary protocol; the HTTP query surface is external",
            )
        };
        let mut out = crate::net::wire::NetOut::new(Arc::clone(&sock));
        out.chain().push_front_chunk(response);
        out.flush(Instant::now() + Duration::from_secs(5)).await?;
        Ok(())
    }
}

enum SphinxOutcome {
    Reply(Vec<u8>),
    Persist,
}

enum DistOutcome {
    Ok(ExecOutput),
    Partial(ExecOutput, String),
    Failed(String),
}

async fn accept_one(listener: &Listener) -> std::io::Result<Sock> {
    match listener {
        Listener::Tcp(l) => {
            let (s, _) = l.accept().await?;
            let _ = s.set_nodelay(true);
            Ok(Sock::Tcp(s))
        }
        Listener::Unix(l) => {
            let (s, _) = l.accept().await?;
            Ok(Sock::Unix(s))
        }
    }
}

/// Decide between sphinx and http on a shared port: HTTP methods start
/// with an ASCII letter, the binary hello starts with a zero byte. Clients
/// that stay quiet get the sphinx greeting (the server speaks first
/// there).
async fn sniff_proto(tcp: &TcpStream) -> Proto {
    let mut buf = [0u8; 4];
    match timeout(Duration::from_millis(50), tcp.peek(&mut buf)).await {
        Ok(Ok(n)) if n > 0 && buf[0].is_ascii_uppercase() => Proto::Http,
        _ => Proto::Sphinx,
    }
}

fn mysql_packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut pkt = Vec::with_capacity(4 + len);
    pkt.push((len & 0xff) as u8);
    pkt.push(((len >> 8) & 0xff) as u8);
    pkt.push(((len >> 16) & 0xff) as u8);
    pkt.push(seq);
    pkt.extend_from_slice(payload);
    pkt
}

fn mysql_ok_packet(seq: u8) -> Vec<u8> {
    // OK header, no affected rows, no insert id, autocommit, no warnings.
    mysql_packet(seq, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00])
}

fn mysql_error_packet(seq: u8, code: u16, msg: &str) -> Vec<u8> {
    let mut payload = OutBuf::new();
    payload.put_u8(0xff);
    payload.put_u32_le(u32::from(code)); // only the low word goes out
    let bytes = payload.into_vec();
    let mut p = bytes[..3].to_vec();
    p.extend_from_slice(b"#42000");
    p.extend_from_slice(msg.as_bytes());
    mysql_packet(seq, &p)
}

async fn read_mysql_packet(
    inp: &mut crate::net::wire::NetIn,
    deadline: Instant,
    max_packet: usize,
) -> Result<Vec<u8>, SockError> {
    inp.read_more(4, deadline, true, false).await?;
    let raw = inp.as_slice();
    let len = usize::from(raw[0]) | usize::from(raw[1]) << 8 | usize::from(raw[2]) << 16;
    if len > max_packet {
        return Err(SockError::Reset);
    }
    inp.read_more(len, deadline, false, false).await?;
    Ok(inp.as_slice().to_vec())
}

fn http_response(code: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {code} {reason}\r\nServer: indexd/{}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        env!("CARGO_PKG_VERSION"),
        body.len(),
    )
    .into_bytes()
}
