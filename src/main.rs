//! indexd daemon: serves the binary search protocol plus the MySQL and
//! HTTP frontends, with demo in-memory indexes declared on the command
//! line. Real deployments embed the library and plug in their own
//! executor.

use std::sync::Arc;

use clap::Parser;
use indexd::config::{ListenSpec, ServerConfig};
use indexd::index::mem::{MemExecutor, MemIndex};
use indexd::index::served::{FileAccess, IndexType, ServedIndex};
use indexd::index::Served;
use indexd::server::SearchServer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "indexd", version, about = "distributed full-text search daemon")]
struct Args {
    /// Listen specification, repeatable
    /// (e.g. "9312", "127.0.0.1:9306:mysql41", "/run/indexd.sock")
    #[arg(short, long)]
    listen: Vec<String>,

    /// Demo in-memory index: "name:doc one|doc two|..."
    #[arg(short, long)]
    index: Vec<String>,

    /// Hard cap on request/reply bodies, bytes
    #[arg(long, default_value_t = indexd::net::DEFAULT_MAX_PACKET)]
    max_packet: usize,

    /// Remote agent connect timeout, milliseconds
    #[arg(long, default_value_t = 1000)]
    agent_connect_timeout: u64,

    /// Remote agent query timeout, milliseconds
    #[arg(long, default_value_t = 3000)]
    agent_query_timeout: u64,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("indexd {VERSION} starting");

    let mut config = ServerConfig {
        max_packet: args.max_packet,
        ..ServerConfig::default()
    };
    config.agent.connect_timeout_ms = args.agent_connect_timeout;
    config.agent.query_timeout_ms = args.agent_query_timeout;

    let listens = if args.listen.is_empty() {
        vec![
            indexd::net::DEFAULT_PORT_SPHINX.to_string(),
            format!("{}:mysql41", indexd::net::DEFAULT_PORT_MYSQL),
        ]
    } else {
        args.listen.clone()
    };
    for spec in &listens {
        config.listeners.push(spec.parse::<ListenSpec>()?);
    }

    let server = SearchServer::new(config, Arc::new(MemExecutor::new()));

    for decl in &args.index {
        let Some((name, docs)) = decl.split_once(':') else {
            error!("bad --index '{decl}', expected name:doc|doc|...");
            continue;
        };
        let docs: Vec<String> = docs.split('|').map(str::to_string).collect();
        let served = Served::new(
            IndexType::Plain,
            ServedIndex {
                index: Box::new(MemIndex::new(docs)),
                path: std::path::PathBuf::from(format!("mem://{name}")),
                new_path: None,
                preopen: true,
                kill_list_targets: Vec::new(),
                mass: 0,
                rotation_priority: 0,
                file_access: FileAccess::default(),
                distributed: None,
            },
        );
        server.registry().add_unique(name, served)?;
        info!("serving in-memory index '{name}'");
    }

    let bound = server.start().await?;
    for ep in &bound {
        info!("ready on {} ({})", ep.bind, ep.proto.as_str());
    }

    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    info!("bye");
    Ok(())
}
