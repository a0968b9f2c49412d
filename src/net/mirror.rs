//! Agent (mirror) descriptors and multi-mirror groups with pluggable
//! selection strategies.
//!
//! Weighted strategies keep a cached weight vector per group. The vector is
//! recomputed from dashboard snapshots once it is older than the karma
//! period; error spikes inside a period do not trigger recomputation.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::dashboard::{HostDashboard, KARMA_PERIOD_SECS};
use super::sock::{ConnectTarget, SockError, resolve_host};

/// Floor applied to every mirror weight.
pub const MIN_WEIGHT: f32 = 1e-3;

/// Mirror selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Random,
    RoundRobin,
    AvoidDeadWeighted,
    AvoidErrorsWeighted,
    AvoidDeadMinTime,
    AvoidErrorsMinTime,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "random" => Strategy::Random,
            "round-robin" => Strategy::RoundRobin,
            "avoid-dead-weighted" => Strategy::AvoidDeadWeighted,
            "avoid-errors-weighted" => Strategy::AvoidErrorsWeighted,
            "avoid-dead-min-time" => Strategy::AvoidDeadMinTime,
            "avoid-errors-min-time" => Strategy::AvoidErrorsMinTime,
            other => return Err(format!("unknown ha strategy '{other}'")),
        })
    }
}

/// What a penalty is computed from.
#[derive(Debug, Clone, Copy)]
enum Penalty {
    /// Consecutive failures: avoids hosts that look down.
    Dead,
    /// Accumulated network errors and timeouts over the window.
    Errors,
}

/// Address family of a remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostFamily {
    Inet,
    Unix,
}

/// One remote host: where to connect and how to treat the link.
#[derive(Debug, Clone)]
pub struct HostDesc {
    pub family: HostFamily,
    pub addr: String,
    pub port: u16,
    pub resolved: Option<Ipv4Addr>,
    pub needs_resolve: bool,
    pub blackhole: bool,
    pub persistent: bool,
}

impl HostDesc {
    pub fn inet(addr: &str, port: u16) -> HostDesc {
        let literal = addr.parse::<Ipv4Addr>().ok();
        HostDesc {
            family: HostFamily::Inet,
            addr: addr.to_string(),
            port,
            resolved: literal,
            needs_resolve: literal.is_none(),
            blackhole: false,
            persistent: false,
        }
    }

    pub fn unix(path: &str) -> HostDesc {
        HostDesc {
            family: HostFamily::Unix,
            addr: path.to_string(),
            port: 0,
            resolved: None,
            needs_resolve: false,
            blackhole: false,
            persistent: false,
        }
    }

    /// Dashboard registry key for this host.
    pub fn key(&self) -> String {
        match self.family {
            HostFamily::Inet => format!("{}:{}", self.addr, self.port),
            HostFamily::Unix => format!("unix:{}", self.addr),
        }
    }

    /// Fill in the resolved address. Host names go through the blocking
    /// pool; literals and unix paths are a no-op. Called where descriptors
    /// are built, never on the net loop.
    pub async fn ensure_resolved(&mut self) -> Result<(), SockError> {
        match self.family {
            HostFamily::Unix => Ok(()),
            HostFamily::Inet => {
                if self.resolved.is_none() {
                    self.resolved = Some(resolve_host(&self.addr, false).await?);
                }
                Ok(())
            }
        }
    }

    /// Turn an already-resolved descriptor into a connectable target.
    /// Never does DNS; an unresolved host name is an error here.
    pub fn connect_target(&self) -> Result<ConnectTarget, SockError> {
        match self.family {
            HostFamily::Unix => Ok(ConnectTarget::Unix(PathBuf::from(&self.addr))),
            HostFamily::Inet => {
                let ip = self.resolved.ok_or_else(|| {
                    SockError::Unresolvable(format!("{}: address not resolved", self.addr))
                })?;
                Ok(ConnectTarget::Inet(SocketAddr::from((ip, self.port))))
            }
        }
    }
}

/// A mirror: host plus the index names it serves, wired to its dashboard.
#[derive(Clone)]
pub struct AgentDesc {
    pub host: HostDesc,
    pub indexes: Vec<String>,
    pub dashboard: Arc<HostDashboard>,
}

impl AgentDesc {
    /// Comma-joined remote index list, as sent to the agent.
    pub fn index_list(&self) -> String {
        self.indexes.join(",")
    }
}

struct WeightState {
    weights: Vec<f32>,
    computed: Instant,
}

/// Ordered set of interchangeable mirrors for one logical index.
pub struct MirrorGroup {
    mirrors: Vec<AgentDesc>,
    rr: AtomicUsize,
    weights: RwLock<WeightState>,
    pub strategy: Strategy,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub ping: bool,
}

impl MirrorGroup {
    pub fn new(
        mirrors: Vec<AgentDesc>,
        strategy: Strategy,
        retry_count: u32,
        retry_delay_ms: u64,
        ping: bool,
    ) -> MirrorGroup {
        let n = mirrors.len().max(1);
        MirrorGroup {
            weights: RwLock::new(WeightState {
                weights: vec![1.0 / n as f32; mirrors.len()],
                computed: Instant::now(),
            }),
            mirrors,
            rr: AtomicUsize::new(0),
            strategy,
            retry_count,
            retry_delay_ms,
            ping,
        }
    }

    pub fn mirrors(&self) -> &[AgentDesc] {
        &self.mirrors
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    /// Current weight vector (clone under shared lock).
    pub fn weights(&self) -> Vec<f32> {
        self.weights.read().weights.clone()
    }

    /// Pick a mirror index according to the group strategy.
    pub fn choose(&self) -> usize {
        match self.mirrors.len() {
            0 => 0,
            1 => 0,
            n => match self.strategy {
                Strategy::Random => rand::thread_rng().gen_range(0..n),
                Strategy::RoundRobin => self.rr.fetch_add(1, Ordering::Relaxed) % n,
                Strategy::AvoidDeadWeighted => self.choose_weighted(Penalty::Dead),
                Strategy::AvoidErrorsWeighted => self.choose_weighted(Penalty::Errors),
                Strategy::AvoidDeadMinTime => self.choose_min_time(Penalty::Dead),
                Strategy::AvoidErrorsMinTime => self.choose_min_time(Penalty::Errors),
            },
        }
    }

    fn penalty(&self, mirror: &AgentDesc, kind: Penalty) -> u64 {
        let snap = mirror.dashboard.snapshot(1);
        match kind {
            Penalty::Dead => snap.errors_in_a_row,
            Penalty::Errors => {
                snap.counters.network_errors
                    + snap.counters.timeouts_query
                    + snap.counters.timeouts_connect
            }
        }
    }

    fn choose_weighted(&self, kind: Penalty) -> usize {
        self.maybe_recompute(kind);
        let weights = self.weights.read();
        let mut roll: f32 = rand::thread_rng().r#gen();
        for (i, w) in weights.weights.iter().enumerate() {
            if roll < *w {
                return i;
            }
            roll -= *w;
        }
        weights.weights.len() - 1
    }

    fn choose_min_time(&self, kind: Penalty) -> usize {
        let mut best = 0usize;
        let mut best_lat = u64::MAX;
        let mut best_penalty = u64::MAX;
        for (i, m) in self.mirrors.iter().enumerate() {
            let snap = m.dashboard.snapshot(1);
            let lat = snap.avg_query_us();
            let pen = self.penalty(m, kind);
            if lat < best_lat || (lat == best_lat && pen < best_penalty) {
                best = i;
                best_lat = lat;
                best_penalty = pen;
            }
        }
        best
    }

    fn maybe_recompute(&self, kind: Penalty) {
        let stale = {
            let w = self.weights.read();
            w.computed.elapsed().as_secs() >= KARMA_PERIOD_SECS
        };
        if stale {
            self.recompute(kind);
        }
    }

    /// Rebuild the weight vector from dashboard snapshots. Weight of mirror
    /// `i` is inversely proportional to its penalty, floored at
    /// [`MIN_WEIGHT`], and the vector always sums to 1.
    pub fn recompute_weights(&self, dead: bool) {
        let kind = if dead { Penalty::Dead } else { Penalty::Errors };
        self.recompute(kind);
    }

    fn recompute(&self, kind: Penalty) {
        let n = self.mirrors.len();
        if n == 0 {
            return;
        }
        let raw: Vec<f32> = self
            .mirrors
            .iter()
            .map(|m| 1.0 / (1.0 + self.penalty(m, kind) as f32))
            .collect();
        let sum: f32 = raw.iter().sum();
        let spread = 1.0 - MIN_WEIGHT * n as f32;
        let weights: Vec<f32> = raw
            .iter()
            .map(|r| MIN_WEIGHT + spread * (r / sum))
            .collect();

        let mut state = self.weights.write();
        state.weights = weights;
        state.computed = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::dashboard::{Counters, DashboardRegistry};

    fn group_with(strategy: Strategy, n: usize) -> (MirrorGroup, DashboardRegistry) {
        let reg = DashboardRegistry::new();
        let mirrors: Vec<AgentDesc> = (0..n)
            .map(|i| {
                let host = HostDesc::inet("127.0.0.1", 9312 + i as u16);
                let dashboard = reg.get_or_create(&host.key(), 0);
                AgentDesc {
                    host,
                    indexes: vec!["idx".into()],
                    dashboard,
                }
            })
            .collect();
        (MirrorGroup::new(mirrors, strategy, 2, 500, true), reg)
    }

    #[test]
    fn round_robin_cycles() {
        let (group, _reg) = group_with(Strategy::RoundRobin, 3);
        let picks: Vec<usize> = (0..6).map(|_| group.choose()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn weights_sum_to_one_with_floor() {
        let (group, _reg) = group_with(Strategy::AvoidDeadWeighted, 3);
        let fail = Counters {
            timeouts_connect: 1,
            ..Counters::default()
        };
        // Mirror 0 builds a failure streak.
        for _ in 0..50 {
            group.mirrors()[0].dashboard.record(&fail, 0, 1, 0);
        }
        group.recompute_weights(true);

        let w = group.weights();
        assert_eq!(w.len(), 3);
        let sum: f32 = w.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6, "sum = {sum}");
        assert!(w.iter().all(|x| *x >= MIN_WEIGHT));
        // Penalized mirror ends up lightest.
        assert!(w[0] < w[1]);
        assert!(w[0] < w[2]);
    }

    #[test]
    fn min_time_prefers_fast_mirror_then_fewer_errors() {
        let (group, _reg) = group_with(Strategy::AvoidDeadMinTime, 2);
        let ok = Counters {
            clean_successes: 1,
            ..Counters::default()
        };
        group.mirrors()[0].dashboard.record(&ok, 9_000, 1, 1);
        group.mirrors()[1].dashboard.record(&ok, 1_000, 1, 1);
        assert_eq!(group.choose(), 1);
    }

    #[test]
    fn single_mirror_short_circuits() {
        let (group, _reg) = group_with(Strategy::Random, 1);
        for _ in 0..5 {
            assert_eq!(group.choose(), 0);
        }
    }

    #[test]
    fn connect_target_requires_resolution() {
        let host = HostDesc::inet("search-backend.internal", 9312);
        assert!(host.resolved.is_none());
        assert!(host.needs_resolve);
        assert!(matches!(
            host.connect_target(),
            Err(SockError::Unresolvable(_))
        ));
    }

    #[tokio::test]
    async fn ensure_resolved_short_circuits_literals() {
        let mut host = HostDesc::inet("127.0.0.1", 9312);
        host.ensure_resolved().await.unwrap();
        assert_eq!(host.resolved, Some(Ipv4Addr::LOCALHOST));
        assert!(host.connect_target().is_ok());

        let mut unix = HostDesc::unix("/run/indexd.sock");
        unix.ensure_resolved().await.unwrap();
        assert!(unix.connect_target().is_ok());
    }
}
