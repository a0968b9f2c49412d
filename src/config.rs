//! Server configuration: listener specifications and daemon options.
//!
//! The listen grammar is kept bit-compatible with existing deployments:
//!
//! ```text
//! listen := (address ":" port | port | path | address ":" start "-" end)
//!           [":" protocol] ["_vip"]
//! protocol := "sphinx" | "mysql41" | "http" | "replication"
//! ```
//!
//! Configuration *files* are out of scope; the embedding layer (or the
//! daemon binary's CLI) populates these structs directly.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::net::wire::DEFAULT_MAX_PACKET;

/// Frontend protocol spoken on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Sphinx,
    Mysql41,
    Http,
    Replication,
}

impl Proto {
    pub fn as_str(self) -> &'static str {
        match self {
            Proto::Sphinx => "sphinx",
            Proto::Mysql41 => "mysql41",
            Proto::Http => "http",
            Proto::Replication => "replication",
        }
    }
}

impl FromStr for Proto {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "sphinx" => Proto::Sphinx,
            "mysql41" => Proto::Mysql41,
            "http" => Proto::Http,
            "replication" => Proto::Replication,
            other => return Err(ConfigError::BadProto(other.to_string())),
        })
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listener address portion of a listen spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// Explicit interface and port.
    IpPort(Ipv4Addr, u16),
    /// Bare port, bound on all interfaces.
    Port(u16),
    /// Consecutive port range on one interface; `end` is exclusive, so the
    /// range covers `end - start` ports (at least 2).
    Range(Ipv4Addr, u16, u16),
    /// Local (unix) socket path.
    Path(PathBuf),
}

/// One parsed listen specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ListenSpec {
    pub addr: ListenAddr,
    /// Protocol as written; `None` falls back to sphinx.
    pub proto: Option<Proto>,
    pub vip: bool,
}

impl ListenSpec {
    pub fn effective_proto(&self) -> Proto {
        self.proto.unwrap_or(Proto::Sphinx)
    }

    /// Expand into concrete bind endpoints (a port range yields several).
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let proto = self.effective_proto();
        match &self.addr {
            ListenAddr::IpPort(ip, port) => vec![Endpoint {
                bind: BindAddr::Inet(SocketAddr::from((*ip, *port))),
                proto,
                vip: self.vip,
            }],
            ListenAddr::Port(port) => vec![Endpoint {
                bind: BindAddr::Inet(SocketAddr::from((Ipv4Addr::UNSPECIFIED, *port))),
                proto,
                vip: self.vip,
            }],
            ListenAddr::Range(ip, start, end) => (*start..*end)
                .map(|p| Endpoint {
                    bind: BindAddr::Inet(SocketAddr::from((*ip, p))),
                    proto,
                    vip: self.vip,
                })
                .collect(),
            ListenAddr::Path(path) => vec![Endpoint {
                bind: BindAddr::Unix(path.clone()),
                proto,
                vip: self.vip,
            }],
        }
    }
}

/// A single concrete endpoint to bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub bind: BindAddr,
    pub proto: Proto,
    pub vip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for BindAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindAddr::Inet(a) => write!(f, "{a}"),
            BindAddr::Unix(p) => write!(f, "unix://{}", p.display()),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("bad listen spec '{0}'")]
    BadSpec(String),

    #[error("bad port '{0}': expected 1..65535")]
    BadPort(String),

    #[error("bad port range '{0}': end must exceed start by at least 2")]
    BadRange(String),

    #[error("unknown protocol '{0}'")]
    BadProto(String),
}

fn parse_port(s: &str) -> Result<u16, ConfigError> {
    match s.parse::<u16>() {
        Ok(p) if p >= 1 => Ok(p),
        _ => Err(ConfigError::BadPort(s.to_string())),
    }
}

/// Port, or a `start-end` range.
enum Portish {
    One(u16),
    Range(u16, u16),
}

fn parse_portish(s: &str) -> Result<Portish, ConfigError> {
    if let Some((a, b)) = s.split_once('-') {
        let start = parse_port(a)?;
        let end = parse_port(b)?;
        if end <= start || end - start < 2 {
            return Err(ConfigError::BadRange(s.to_string()));
        }
        Ok(Portish::Range(start, end))
    } else {
        Ok(Portish::One(parse_port(s)?))
    }
}

impl FromStr for ListenSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rest = s;
        let vip = rest.ends_with("_vip");
        if vip {
            rest = &rest[..rest.len() - "_vip".len()];
        }
        if rest.is_empty() {
            return Err(ConfigError::BadSpec(s.to_string()));
        }

        // Local socket path, optionally followed by ":protocol".
        if rest.starts_with('/') {
            let (path, proto) = match rest.rsplit_once(':') {
                Some((p, tag)) => (p, Some(tag.parse::<Proto>()?)),
                None => (rest, None),
            };
            return Ok(ListenSpec {
                addr: ListenAddr::Path(PathBuf::from(path)),
                proto,
                vip,
            });
        }

        let parts: Vec<&str> = rest.split(':').collect();
        let (addr, proto) = match parts.as_slice() {
            [one] => (parse_bare(one)?, None),
            [a, b] => {
                // Either "address:port(-range)" or "port:protocol".
                if let Ok(ip) = a.parse::<Ipv4Addr>() {
                    (parse_with_ip(ip, b)?, None)
                } else {
                    (parse_bare(a)?, Some(b.parse::<Proto>()?))
                }
            }
            [a, b, c] => {
                let ip = a
                    .parse::<Ipv4Addr>()
                    .map_err(|_| ConfigError::BadSpec(s.to_string()))?;
                (parse_with_ip(ip, b)?, Some(c.parse::<Proto>()?))
            }
            _ => return Err(ConfigError::BadSpec(s.to_string())),
        };
        Ok(ListenSpec { addr, proto, vip })
    }
}

fn parse_bare(s: &str) -> Result<ListenAddr, ConfigError> {
    match parse_portish(s)? {
        Portish::One(p) => Ok(ListenAddr::Port(p)),
        // A bare range has no interface to spread over.
        Portish::Range(..) => Err(ConfigError::BadSpec(s.to_string())),
    }
}

fn parse_with_ip(ip: Ipv4Addr, s: &str) -> Result<ListenAddr, ConfigError> {
    Ok(match parse_portish(s)? {
        Portish::One(p) => ListenAddr::IpPort(ip, p),
        Portish::Range(a, b) => ListenAddr::Range(ip, a, b),
    })
}

impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            ListenAddr::IpPort(ip, port) => write!(f, "{ip}:{port}")?,
            ListenAddr::Port(port) => write!(f, "{port}")?,
            ListenAddr::Range(ip, a, b) => write!(f, "{ip}:{a}-{b}")?,
            ListenAddr::Path(p) => write!(f, "{}", p.display())?,
        }
        if let Some(proto) = self.proto {
            write!(f, ":{}", proto.as_str())?;
        }
        if self.vip {
            write!(f, "_vip")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for ListenSpec {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ListenSpec> for String {
    fn from(spec: ListenSpec) -> String {
        spec.to_string()
    }
}

/// Remote-dispatch knobs shared by every mirror group unless the group
/// overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOptions {
    pub connect_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub ping_interval_ms: u64,
    /// FIFO pool capacity attached to persistent hosts.
    pub persist_pool_size: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        AgentOptions {
            connect_timeout_ms: 1000,
            query_timeout_ms: 3000,
            retry_count: 0,
            retry_delay_ms: 500,
            ping_interval_ms: 1000,
            persist_pool_size: 4,
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listeners: Vec<ListenSpec>,
    pub max_packet: usize,
    /// Idle read timeout for plain client connections, seconds.
    pub client_timeout_secs: u64,
    /// Idle read timeout once a client sent the persist command, seconds.
    pub persist_timeout_secs: u64,
    /// Cap on concurrently served non-VIP connections.
    pub max_connections: usize,
    pub agent: AgentOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listeners: Vec::new(),
            max_packet: DEFAULT_MAX_PACKET,
            client_timeout_secs: 300,
            persist_timeout_secs: 900,
            max_connections: 256,
            agent: AgentOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> ListenSpec {
        s.parse().unwrap()
    }

    #[test]
    fn grammar_round_trips() {
        for s in [
            "9312",
            "9306:mysql41",
            "127.0.0.1:9312",
            "127.0.0.1:9312:sphinx",
            "127.0.0.1:9312:sphinx_vip",
            "0.0.0.0:9380:http",
            "192.168.0.1:9300-9304",
            "192.168.0.1:9300-9304:replication",
            "/var/run/searchd.sock",
            "/var/run/searchd.sock:sphinx",
            "9312_vip",
        ] {
            let spec = parse(s);
            assert_eq!(spec.to_string(), s, "round trip of '{s}'");
        }
    }

    #[test]
    fn parses_fields() {
        let spec = parse("127.0.0.1:9312:sphinx_vip");
        assert_eq!(spec.addr, ListenAddr::IpPort(Ipv4Addr::LOCALHOST, 9312));
        assert_eq!(spec.proto, Some(Proto::Sphinx));
        assert!(spec.vip);

        let spec = parse("9306:mysql41");
        assert_eq!(spec.addr, ListenAddr::Port(9306));
        assert_eq!(spec.effective_proto(), Proto::Mysql41);

        let spec = parse("9312");
        assert_eq!(spec.effective_proto(), Proto::Sphinx);
        assert!(!spec.vip);
    }

    #[test]
    fn range_expands_to_consecutive_ports() {
        let spec = parse("10.0.0.1:9300-9303");
        let eps = spec.endpoints();
        assert_eq!(eps.len(), 3);
        for (i, ep) in eps.iter().enumerate() {
            match &ep.bind {
                BindAddr::Inet(sa) => assert_eq!(sa.port(), 9300 + i as u16),
                BindAddr::Unix(_) => panic!("inet expected"),
            }
        }
    }

    #[test]
    fn rejects_bad_specs() {
        for s in [
            "",
            "0",
            "notaport",
            "127.0.0.1:0",
            "127.0.0.1:9312:smtp",
            "9300-9304",           // range needs an address
            "10.0.0.1:9304-9300",  // inverted
            "10.0.0.1:9300-9301",  // too narrow
            "1:2:3:4",
        ] {
            assert!(s.parse::<ListenSpec>().is_err(), "'{s}' should fail");
        }
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_packet, DEFAULT_MAX_PACKET);
        assert_eq!(cfg.agent.connect_timeout_ms, 1000);
        assert_eq!(cfg.agent.query_timeout_ms, 3000);
        assert!(cfg.max_connections > 0);
    }
}
