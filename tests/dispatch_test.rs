//! End-to-end dispatch tests over loopback sockets: local serving,
//! distributed fan-out, blackholes, retries, persistent pools, and the
//! auxiliary frontends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use indexd::config::{BindAddr, Endpoint, Proto, ServerConfig};
use indexd::index::Served;
use indexd::index::mem::{MemExecutor, MemIndex};
use indexd::index::served::{DistributedDesc, FileAccess, IndexType, ServedIndex};
use indexd::net::dashboard::Counters;
use indexd::net::mirror::{HostDesc, MirrorGroup, Strategy};
use indexd::net::wire::{Command, HEADER_LEN, PROTO_HELLO, ReplyStatus, request_frame};
use indexd::server::SearchServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn mem_served(docs: &[&str]) -> Arc<Served> {
    Served::new(
        IndexType::Plain,
        ServedIndex {
            index: Box::new(MemIndex::new(docs.iter().map(|d| d.to_string()).collect())),
            path: "mem://test".into(),
            new_path: None,
            preopen: true,
            kill_list_targets: Vec::new(),
            mass: 0,
            rotation_priority: 0,
            file_access: FileAccess::default(),
            distributed: None,
        },
    )
}

fn dist_served(locals: Vec<String>, groups: Vec<Arc<MirrorGroup>>) -> Arc<Served> {
    Served::new(
        IndexType::Distributed,
        ServedIndex {
            index: Box::new(MemIndex::new(Vec::new())),
            path: "dist://".into(),
            new_path: None,
            preopen: false,
            kill_list_targets: Vec::new(),
            mass: 0,
            rotation_priority: 0,
            file_access: FileAccess::default(),
            distributed: Some(DistributedDesc { locals, groups }),
        },
    )
}

fn quick_config() -> ServerConfig {
    let mut cfg = ServerConfig::default();
    cfg.agent.connect_timeout_ms = 1000;
    cfg.agent.query_timeout_ms = 1000;
    cfg.agent.retry_delay_ms = 50;
    cfg
}

async fn start_sphinx(server: &Arc<SearchServer>) -> SocketAddr {
    let bound = server
        .spawn_listener(Endpoint {
            bind: BindAddr::Inet("127.0.0.1:0".parse().unwrap()),
            proto: Proto::Sphinx,
            vip: false,
        })
        .await
        .unwrap();
    match bound.bind {
        BindAddr::Inet(a) => a,
        BindAddr::Unix(_) => unreachable!(),
    }
}

/// Spawn a complete agent daemon serving `docs` under index "shard".
async fn spawn_agent_daemon(docs: &[&str]) -> (Arc<SearchServer>, SocketAddr) {
    let server = SearchServer::new(quick_config(), Arc::new(MemExecutor::new()));
    server
        .registry()
        .add_unique("shard", mem_served(docs))
        .unwrap();
    let addr = start_sphinx(&server).await;
    (server, addr)
}

/// A mirror that answers the hello and then swallows everything.
async fn spawn_silent(reply_hello: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut s, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                if reply_hello {
                    s.write_all(&PROTO_HELLO.to_be_bytes()).await.ok();
                }
                let mut buf = [0u8; 1024];
                loop {
                    match s.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            });
        }
    });
    addr
}

struct ApiClient {
    stream: TcpStream,
}

impl ApiClient {
    async fn connect(addr: SocketAddr) -> ApiClient {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut hello = [0u8; 4];
        stream.read_exact(&mut hello).await.unwrap();
        assert_eq!(u32::from_be_bytes(hello), PROTO_HELLO);
        stream.write_all(&PROTO_HELLO.to_be_bytes()).await.unwrap();
        ApiClient { stream }
    }

    async fn request(&mut self, cmd: Command, body: &[u8]) -> (u16, Vec<u8>) {
        self.stream.write_all(&request_frame(cmd, body)).await.unwrap();
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> (u16, Vec<u8>) {
        let mut hdr = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut hdr).await.unwrap();
        let status = u16::from_be_bytes([hdr[0], hdr[1]]);
        let len = u32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]) as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await.unwrap();
        (status, body)
    }

    async fn search(&mut self, index: &str, query: &str) -> (u16, Vec<u8>) {
        self.request(Command::Search, &MemExecutor::request(index, query))
            .await
    }
}

#[tokio::test]
async fn local_search_happy_path() {
    let server = SearchServer::new(quick_config(), Arc::new(MemExecutor::new()));
    server
        .registry()
        .add_unique(
            "test",
            mem_served(&["the quick fox", "lazy dog", "quick brown"]),
        )
        .unwrap();
    let addr = start_sphinx(&server).await;

    let mut client = ApiClient::connect(addr).await;
    let (status, body) = client.search("test", "quick").await;
    assert_eq!(status, ReplyStatus::Ok as u16);
    assert_eq!(
        MemExecutor::decode_reply(&body),
        vec!["the quick fox", "quick brown"]
    );

    // Stats recorded against the served index.
    let snap = server.registry().get("test").unwrap().stats().snapshot();
    assert_eq!(snap.count, 1);
    assert_eq!(snap.rows_max, 2);

    let (status, _) = client.search("missing", "x").await;
    assert_eq!(status, ReplyStatus::Error as u16);

    server.shutdown().await;
}

#[tokio::test]
async fn distributed_fanout_with_blackhole() {
    let (_agent, agent_addr) = spawn_agent_daemon(&["alpha doc", "beta doc"]).await;
    let blackhole_addr = spawn_silent(true).await;

    let master = SearchServer::new(quick_config(), Arc::new(MemExecutor::new()));

    let healthy = master
        .agent_desc(
            HostDesc::inet("127.0.0.1", agent_addr.port()),
            vec!["shard".into()],
        )
        .await
        .unwrap();
    let mut bh_host = HostDesc::inet("127.0.0.1", blackhole_addr.port());
    bh_host.blackhole = true;
    let blackhole = master
        .agent_desc(bh_host, vec!["shard".into()])
        .await
        .unwrap();

    let healthy_key = healthy.host.key();
    let blackhole_key = blackhole.host.key();

    master
        .registry()
        .add_unique(
            "dist",
            dist_served(
                Vec::new(),
                vec![
                    Arc::new(MirrorGroup::new(
                        vec![healthy],
                        Strategy::Random,
                        0,
                        50,
                        false,
                    )),
                    Arc::new(MirrorGroup::new(
                        vec![blackhole],
                        Strategy::Random,
                        0,
                        50,
                        false,
                    )),
                ],
            ),
        )
        .unwrap();
    let addr = start_sphinx(&master).await;

    let mut client = ApiClient::connect(addr).await;
    let (status, body) = client.search("dist", "doc").await;
    assert_eq!(status, ReplyStatus::Ok as u16);
    // Exactly one set of matches: the blackhole contributes nothing.
    assert_eq!(
        MemExecutor::decode_reply(&body),
        vec!["alpha doc", "beta doc"]
    );

    let healthy_dash = master.dashboards().get(&healthy_key).unwrap();
    assert_eq!(healthy_dash.snapshot(1).counters.clean_successes, 1);
    assert_eq!(healthy_dash.total_conn_attempts(), 1);

    let bh_dash = master.dashboards().get(&blackhole_key).unwrap();
    assert_eq!(bh_dash.total_conn_attempts(), 1);
    // No outcome counters on the blackhole, attempts aside.
    assert_eq!(bh_dash.snapshot(1).counters, Counters::default());

    master.shutdown().await;
}

#[tokio::test]
async fn retry_on_timeout_moves_to_next_mirror() {
    let slow_addr = spawn_silent(true).await;
    let (_agent, live_addr) = spawn_agent_daemon(&["needle doc"]).await;

    let mut cfg = quick_config();
    cfg.agent.query_timeout_ms = 200;
    let master = SearchServer::new(cfg, Arc::new(MemExecutor::new()));

    let slow = master
        .agent_desc(
            HostDesc::inet("127.0.0.1", slow_addr.port()),
            vec!["shard".into()],
        )
        .await
        .unwrap();
    let live = master
        .agent_desc(
            HostDesc::inet("127.0.0.1", live_addr.port()),
            vec!["shard".into()],
        )
        .await
        .unwrap();
    let slow_dash = Arc::clone(&slow.dashboard);
    let live_dash = Arc::clone(&live.dashboard);

    let group = Arc::new(MirrorGroup::new(
        vec![slow, live],
        Strategy::AvoidDeadWeighted,
        2,
        50,
        false,
    ));
    // Bias the first pick heavily towards the slow mirror so the retry
    // path is the one exercised.
    let fail = Counters {
        network_errors: 1,
        ..Counters::default()
    };
    for _ in 0..5000 {
        live_dash.record(&fail, 0, 0, 0);
    }
    group.recompute_weights(true);
    let weights = group.weights();
    assert!(weights[0] > 0.99, "weights = {weights:?}");

    master
        .registry()
        .add_unique("dist", dist_served(Vec::new(), vec![group]))
        .unwrap();
    let addr = start_sphinx(&master).await;

    let mut client = ApiClient::connect(addr).await;
    let (status, body) = client.search("dist", "needle").await;
    assert_eq!(status, ReplyStatus::Ok as u16);
    assert_eq!(MemExecutor::decode_reply(&body), vec!["needle doc"]);

    // The live mirror served the query after the slow one timed out.
    assert_eq!(live_dash.snapshot(1).counters.clean_successes, 1);
    assert_eq!(live_dash.errors_in_a_row(), 0);
    let slow_timeouts = slow_dash.snapshot(1).counters.timeouts_query;
    if slow_timeouts == 0 {
        // The weighted roll went straight to the live mirror (possible,
        // the floor weight is non-zero). Nothing further to check.
        return;
    }
    assert_eq!(slow_timeouts, 1);

    master.shutdown().await;
}

#[tokio::test]
async fn persistent_pool_reuses_connections() {
    let (agent, agent_addr) = spawn_agent_daemon(&["pooled doc"]).await;

    let mut cfg = quick_config();
    cfg.agent.persist_pool_size = 2;
    let master = SearchServer::new(cfg, Arc::new(MemExecutor::new()));

    let mut host = HostDesc::inet("127.0.0.1", agent_addr.port());
    host.persistent = true;
    let desc = master
        .agent_desc(host, vec!["shard".into()])
        .await
        .unwrap();
    let key = desc.host.key();

    master
        .registry()
        .add_unique(
            "dist",
            dist_served(
                Vec::new(),
                vec![Arc::new(MirrorGroup::new(
                    vec![desc],
                    Strategy::Random,
                    0,
                    50,
                    false,
                ))],
            ),
        )
        .unwrap();
    let addr = start_sphinx(&master).await;

    let mut client = ApiClient::connect(addr).await;
    for i in 1..=3u32 {
        let (status, body) = client.search("dist", "pooled").await;
        assert_eq!(status, ReplyStatus::Ok as u16, "query {i}");
        assert_eq!(MemExecutor::decode_reply(&body), vec!["pooled doc"]);
    }

    // One agent-side connection served all three queries: the socket went
    // back to the FIFO pool after each and was rented again.
    assert_eq!(
        agent.counters().accepted.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    let pool = master.dashboards().get(&key).unwrap();
    assert_eq!(pool.pool().unwrap().available(), 1);
    assert_eq!(pool.snapshot(1).counters.clean_successes, 3);

    master.shutdown().await;
    agent.shutdown().await;
}

#[tokio::test]
async fn oversized_packet_gets_error_reply() {
    let mut cfg = quick_config();
    cfg.max_packet = 1024;
    let server = SearchServer::new(cfg, Arc::new(MemExecutor::new()));
    let addr = start_sphinx(&server).await;

    let mut client = ApiClient::connect(addr).await;
    // Hand-rolled header announcing a 2 MiB body.
    let mut frame = Vec::new();
    frame.extend_from_slice(&(Command::Search as u16).to_be_bytes());
    frame.extend_from_slice(&0x121u16.to_be_bytes());
    frame.extend_from_slice(&(2u32 << 20).to_be_bytes());
    client.stream.write_all(&frame).await.unwrap();

    let (status, body) = client.read_reply().await;
    assert_eq!(status, ReplyStatus::Error as u16);
    let msg = String::from_utf8_lossy(&body[4..]).into_owned();
    assert!(msg.contains("oversized"), "got '{msg}'");

    // The connection is dropped: the stream cannot be resynced.
    let mut probe = [0u8; 1];
    let n = client.stream.read(&mut probe).await.unwrap();
    assert_eq!(n, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn ping_echoes_cookie_and_status_reports() {
    let server = SearchServer::new(quick_config(), Arc::new(MemExecutor::new()));
    server
        .registry()
        .add_unique("test", mem_served(&["doc"]))
        .unwrap();
    let addr = start_sphinx(&server).await;

    let mut client = ApiClient::connect(addr).await;
    let (status, body) = client
        .request(Command::Ping, &0xDEAD_F00Du32.to_be_bytes())
        .await;
    assert_eq!(status, ReplyStatus::Ok as u16);
    assert_eq!(body, 0xDEAD_F00Du32.to_be_bytes());

    let (status, body) = client.request(Command::Status, &[]).await;
    assert_eq!(status, ReplyStatus::Ok as u16);
    let pairs = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    assert!(pairs >= 5);
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("version"));
    assert!(text.contains("index_test"));

    server.shutdown().await;
}

#[tokio::test]
async fn persist_command_marks_connection() {
    let server = SearchServer::new(quick_config(), Arc::new(MemExecutor::new()));
    server
        .registry()
        .add_unique("test", mem_served(&["doc"]))
        .unwrap();
    let addr = start_sphinx(&server).await;

    let mut client = ApiClient::connect(addr).await;
    // Persist has no reply; the next command must still work.
    client
        .stream
        .write_all(&request_frame(Command::Persist, &1u32.to_be_bytes()))
        .await
        .unwrap();
    let (status, _) = client.search("test", "doc").await;
    assert_eq!(status, ReplyStatus::Ok as u16);

    server.shutdown().await;
}

#[tokio::test]
async fn http_sniffed_on_sphinx_port() {
    let server = SearchServer::new(quick_config(), Arc::new(MemExecutor::new()));
    let addr = start_sphinx(&server).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let text = String::from_utf8_lossy(&buf);
    assert!(text.starts_with("HTTP/1.1 200"), "got '{text}'");
    assert!(text.contains("pong"));

    server.shutdown().await;
}

#[tokio::test]
async fn mysql_frontend_greets_and_answers_ping() {
    let server = SearchServer::new(quick_config(), Arc::new(MemExecutor::new()));
    let bound = server
        .spawn_listener(Endpoint {
            bind: BindAddr::Inet("127.0.0.1:0".parse().unwrap()),
            proto: Proto::Mysql41,
            vip: false,
        })
        .await
        .unwrap();
    let addr = match bound.bind {
        BindAddr::Inet(a) => a,
        BindAddr::Unix(_) => unreachable!(),
    };

    let mut stream = TcpStream::connect(addr).await.unwrap();

    async fn read_packet(s: &mut TcpStream) -> Vec<u8> {
        let mut hdr = [0u8; 4];
        s.read_exact(&mut hdr).await.unwrap();
        let len = usize::from(hdr[0]) | usize::from(hdr[1]) << 8 | usize::from(hdr[2]) << 16;
        let mut payload = vec![0u8; len];
        s.read_exact(&mut payload).await.unwrap();
        payload
    }

    let greeting = read_packet(&mut stream).await;
    assert_eq!(greeting[0], 10, "protocol 10 greeting");

    // Minimal handshake response; the server ignores the contents.
    stream
        .write_all(&[4, 0, 0, 1, 0x85, 0xa2, 0, 0])
        .await
        .unwrap();
    let ok = read_packet(&mut stream).await;
    assert_eq!(ok[0], 0x00);

    // COM_PING.
    stream.write_all(&[1, 0, 0, 0, 0x0e]).await.unwrap();
    let pong = read_packet(&mut stream).await;
    assert_eq!(pong[0], 0x00);

    // COM_QUERY gets a clean wire-level error.
    stream.write_all(&[9, 0, 0, 0, 0x03]).await.unwrap();
    stream.write_all(b"SELECT 1").await.unwrap();
    let err = read_packet(&mut stream).await;
    assert_eq!(err[0], 0xff);

    server.shutdown().await;
}

#[tokio::test]
async fn registry_snapshot_survives_concurrent_replace() {
    // Registry-level add-or-replace atomicity, driven through the server's
    // serving path: searches keep succeeding while the handle is swapped.
    let server = SearchServer::new(quick_config(), Arc::new(MemExecutor::new()));
    server
        .registry()
        .add_unique("test", mem_served(&["first doc"]))
        .unwrap();
    let addr = start_sphinx(&server).await;

    let swapper = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            for i in 0..50 {
                let doc = format!("doc {i}");
                server
                    .registry()
                    .add_or_replace("test", Some(mem_served(&[doc.as_str()])));
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let mut client = ApiClient::connect(addr).await;
    for _ in 0..50 {
        let (status, _) = client.search("test", "doc").await;
        // The slot is never observed empty mid-swap.
        assert_eq!(status, ReplyStatus::Ok as u16);
    }
    swapper.await.unwrap();

    server.shutdown().await;
}
