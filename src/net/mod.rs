//! Network core: sockets, readiness poller, framed codec, persistent
//! pools, host dashboards, mirror groups, and agent dispatch.

pub mod agent;
pub mod buf;
pub mod dashboard;
pub mod mirror;
pub mod pool;
pub mod poller;
pub mod sock;
pub mod wire;

pub use agent::{AgentFailure, AgentQuery, AgentResult, NetLoop, NetLoopHandle, Pinger, Reporter};
pub use buf::{ChainedOut, InBuf, OutBuf};
pub use dashboard::{
    Counters, DashSnapshot, DashboardRegistry, HostDashboard, KARMA_BUCKETS, KARMA_PERIOD_SECS,
};
pub use mirror::{AgentDesc, HostDesc, HostFamily, MirrorGroup, Strategy};
pub use pool::{ConnPool, Rented};
pub use poller::{PollWaker, Poller, Readiness};
pub use sock::{ConnectTarget, Sock, SockError, connect_deadline, resolve, resolve_host};
pub use wire::{
    Command, DEFAULT_MAX_PACKET, DEFAULT_PORT_MYSQL, DEFAULT_PORT_SPHINX, NetIn, NetOut,
    PROTO_HELLO, ReplyStatus,
};
