//! Level-triggered readiness multiplexer over registered sockets.
//!
//! The net loop owns one `Poller`, registers every in-flight agent socket
//! under a token, and blocks in [`Poller::wait`] with an absolute deadline.
//! Readiness that persists across calls is reported again, so callers must
//! drain with `try_*` until `WouldBlock`. A cloneable [`PollWaker`] lets
//! another task interrupt a blocked `wait` with bounded latency; the wake
//! flag is consumed before `wait` returns.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{Interest, Ready};
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};

use super::sock::Sock;

/// Readiness mask reported per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const READ: Readiness = Readiness(1);
    pub const WRITE: Readiness = Readiness(1 << 1);
    pub const HUP: Readiness = Readiness(1 << 2);
    pub const ERR: Readiness = Readiness(1 << 3);
    /// Accepted in the mask type; the tokio backend never reports it.
    pub const PRI: Readiness = Readiness(1 << 4);

    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Readiness) -> Readiness {
        Readiness(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

fn mask_from(ready: Ready) -> Readiness {
    let mut m = Readiness::default();
    if ready.is_readable() {
        m = m.union(Readiness::READ);
    }
    if ready.is_writable() {
        m = m.union(Readiness::WRITE);
    }
    if ready.is_read_closed() || ready.is_write_closed() {
        m = m.union(Readiness::HUP);
    }
    m
}

/// Handle used by other tasks to interrupt a blocked [`Poller::wait`].
#[derive(Clone)]
pub struct PollWaker {
    notify: Arc<Notify>,
    pending: Arc<AtomicBool>,
}

impl PollWaker {
    pub fn wake(&self) {
        self.pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

struct PollEntry {
    sock: Arc<Sock>,
    interest: Interest,
}

/// Readiness poller over a token-keyed socket set.
pub struct Poller {
    entries: HashMap<u64, PollEntry>,
    ready: Vec<(u64, Readiness)>,
    waker: PollWaker,
}

impl Poller {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            ready: Vec::new(),
            waker: PollWaker {
                notify: Arc::new(Notify::new()),
                pending: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    pub fn waker(&self) -> PollWaker {
        self.waker.clone()
    }

    pub fn add(&mut self, token: u64, sock: Arc<Sock>, interest: Interest) {
        self.entries.insert(token, PollEntry { sock, interest });
    }

    pub fn change(&mut self, token: u64, interest: Interest) {
        if let Some(e) = self.entries.get_mut(&token) {
            e.interest = interest;
        }
    }

    pub fn remove(&mut self, token: u64) -> Option<Arc<Sock>> {
        self.entries.remove(&token).map(|e| e.sock)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Block until at least one registered socket is ready, the deadline
    /// expires, or the waker fires. Returns the number of ready events;
    /// zero means timeout or wakeup.
    pub async fn wait(&mut self, deadline: Instant) -> usize {
        self.ready.clear();

        // A wake requested before we got here must not be lost.
        if self.waker.take_pending() {
            return 0;
        }

        let notify = Arc::clone(&self.waker.notify);
        let mut futs: FuturesUnordered<_> = self
            .entries
            .iter()
            .map(|(&token, e)| {
                let sock = Arc::clone(&e.sock);
                let interest = e.interest;
                async move { (token, sock.ready(interest).await) }
            })
            .collect();

        if futs.is_empty() {
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = notify.notified() => {
                    self.waker.take_pending();
                }
            }
            return 0;
        }

        tokio::select! {
            _ = sleep_until(deadline) => return 0,
            _ = notify.notified() => {
                self.waker.take_pending();
                return 0;
            }
            Some((token, res)) = futs.next() => {
                self.push_ready(token, res);
                // Collect whatever else is already ready without blocking.
                while let Some(Some((token, res))) = futs.next().now_or_never() {
                    self.push_ready(token, res);
                }
            }
        }

        self.ready.len()
    }

    fn push_ready(&mut self, token: u64, res: std::io::Result<Ready>) {
        let mask = match res {
            Ok(ready) => mask_from(ready),
            Err(_) => Readiness::ERR,
        };
        if !mask.is_empty() {
            self.ready.push((token, mask));
        }
    }

    /// Events collected by the last `wait`.
    pub fn events(&self) -> impl Iterator<Item = (u64, Readiness)> + '_ {
        self.ready.iter().copied()
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::sock::{ConnectTarget, connect_deadline};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (Arc<Sock>, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = connect_deadline(
            &ConnectTarget::Inet(addr),
            Instant::now() + Duration::from_secs(2),
        )
        .await
        .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Arc::new(client), server)
    }

    #[tokio::test]
    async fn reports_write_readiness() {
        let (sock, _server) = connected_pair().await;
        let mut poller = Poller::new();
        poller.add(7, sock, Interest::WRITABLE);

        let n = poller.wait(Instant::now() + Duration::from_secs(1)).await;
        assert_eq!(n, 1);
        let (token, mask) = poller.events().next().unwrap();
        assert_eq!(token, 7);
        assert!(mask.contains(Readiness::WRITE));
    }

    #[tokio::test]
    async fn level_triggered_readiness_persists() {
        let (sock, mut server) = connected_pair().await;
        server.write_all(b"x").await.unwrap();

        let mut poller = Poller::new();
        poller.add(1, sock, Interest::READABLE);

        for _ in 0..2 {
            let n = poller.wait(Instant::now() + Duration::from_secs(1)).await;
            assert_eq!(n, 1, "unread data must be re-reported");
            assert!(
                poller
                    .events()
                    .next()
                    .unwrap()
                    .1
                    .contains(Readiness::READ)
            );
        }
    }

    #[tokio::test]
    async fn wait_times_out_with_no_readiness() {
        let (sock, _server) = connected_pair().await;
        let mut poller = Poller::new();
        poller.add(1, sock, Interest::READABLE);

        let start = Instant::now();
        let n = poller.wait(start + Duration::from_millis(40)).await;
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(35));
    }

    #[tokio::test]
    async fn waker_interrupts_blocked_wait() {
        let mut poller = Poller::new();
        let waker = poller.waker();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waker.wake();
        });

        let start = Instant::now();
        let n = poller.wait(start + Duration::from_secs(5)).await;
        assert_eq!(n, 0);
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn pending_wake_consumed_before_blocking() {
        let mut poller = Poller::new();
        poller.waker().wake();

        let start = Instant::now();
        let n = poller.wait(start + Duration::from_secs(5)).await;
        assert_eq!(n, 0);
        assert!(start.elapsed() < Duration::from_millis(100));

        // Flag was drained; the next wait blocks until its deadline.
        let start = Instant::now();
        poller.wait(start + Duration::from_millis(30)).await;
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
