//! indexd: the network-serving core of a distributed full-text search
//! daemon.
//!
//! The crate provides the multi-protocol frontend, the framed binary
//! codec, remote-agent dispatch across mirrored backends, and the shared
//! registry of served indexes. The index engine itself sits behind the
//! [`index::QueryExecutor`] seam.

pub mod config;
pub mod index;
pub mod net;
pub mod server;

pub use config::{ListenSpec, Proto, ServerConfig};
pub use index::{ExecError, ExecOutput, IndexRegistry, IndexType, QueryExecutor, Served};
pub use net::agent::{AgentQuery, NetLoopHandle, Reporter};
pub use net::mirror::{AgentDesc, HostDesc, MirrorGroup, Strategy};
pub use server::{SearchServer, ServerError};
