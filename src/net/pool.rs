//! Per-host FIFO cache of live sockets for persistent mirrors.
//!
//! FIFO discipline spreads idle time evenly across the cached sockets so
//! kernel keepalive notices half-open connections early. Dropping a `Sock`
//! closes it; "close" below means drop.

use parking_lot::Mutex;

use super::sock::Sock;

/// Outcome of a rent attempt.
pub enum Rented {
    /// A cached live socket, handshake already done.
    Pooled(Sock),
    /// Nothing cached; the caller opens a fresh connection.
    OpenNew,
}

struct PoolInner {
    ring: Vec<Option<Sock>>,
    read_idx: usize,
    write_idx: usize,
    /// Sockets currently available to rent. Never exceeds capacity.
    free: usize,
    shutdown: bool,
}

/// Bounded FIFO pool of persistent connections to one host.
pub struct ConnPool {
    inner: Mutex<PoolInner>,
}

impl ConnPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                ring: (0..capacity).map(|_| None).collect(),
                read_idx: 0,
                write_idx: 0,
                free: 0,
                shutdown: false,
            }),
        }
    }

    /// Resize the ring, closing everything currently cached.
    pub fn reinit(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.ring = (0..capacity).map(|_| None).collect();
        inner.read_idx = 0;
        inner.write_idx = 0;
        inner.free = 0;
    }

    /// Take the oldest cached socket, or ask the caller to open a new one.
    pub fn rent(&self) -> Rented {
        let mut inner = self.inner.lock();
        if inner.shutdown || inner.free == 0 {
            return Rented::OpenNew;
        }
        let idx = inner.read_idx;
        let cap = inner.ring.len();
        match inner.ring[idx].take() {
            Some(sock) => {
                inner.read_idx = (idx + 1) % cap;
                inner.free -= 1;
                Rented::Pooled(sock)
            }
            None => Rented::OpenNew,
        }
    }

    /// Return a live socket to the ring. After shutdown, or when the ring
    /// is full, the socket is closed instead.
    pub fn put_back(&self, sock: Sock) {
        let mut inner = self.inner.lock();
        let cap = inner.ring.len();
        if inner.shutdown || cap == 0 || inner.free == cap {
            drop(inner);
            drop(sock);
            return;
        }
        let idx = inner.write_idx;
        inner.ring[idx] = Some(sock);
        inner.write_idx = (idx + 1) % cap;
        inner.free += 1;
    }

    /// Flip the shutdown flag and close everything cached.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        inner.free = 0;
        for slot in inner.ring.iter_mut() {
            drop(slot.take());
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().ring.len()
    }

    /// Sockets currently available to rent.
    pub fn available(&self) -> usize {
        self.inner.lock().free
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::sock::{ConnectTarget, connect_deadline};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    async fn fresh_sock(listener: &TcpListener) -> Sock {
        let addr = listener.local_addr().unwrap();
        let sock = connect_deadline(
            &ConnectTarget::Inet(addr),
            Instant::now() + Duration::from_secs(2),
        )
        .await
        .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        // Keep the server side alive for the duration of the test.
        std::mem::forget(server);
        sock
    }

    #[tokio::test]
    async fn fifo_order_and_capacity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = ConnPool::new(2);
        assert!(matches!(pool.rent(), Rented::OpenNew));

        let a = fresh_sock(&listener).await;
        let b = fresh_sock(&listener).await;
        let c = fresh_sock(&listener).await;
        let (fd_a, fd_b) = (a.raw_fd(), b.raw_fd());

        pool.put_back(a);
        pool.put_back(b);
        assert_eq!(pool.available(), 2);

        // Ring full: third return closes instead of enqueueing.
        pool.put_back(c);
        assert_eq!(pool.available(), 2);

        match pool.rent() {
            Rented::Pooled(s) => assert_eq!(s.raw_fd(), fd_a),
            Rented::OpenNew => panic!("expected pooled socket"),
        }
        match pool.rent() {
            Rented::Pooled(s) => assert_eq!(s.raw_fd(), fd_b),
            Rented::OpenNew => panic!("expected pooled socket"),
        }
        assert_eq!(pool.available(), 0);
        assert!(matches!(pool.rent(), Rented::OpenNew));
    }

    #[tokio::test]
    async fn shutdown_closes_and_rejects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = ConnPool::new(2);
        pool.put_back(fresh_sock(&listener).await);
        assert_eq!(pool.available(), 1);

        pool.shutdown();
        assert_eq!(pool.available(), 0);
        assert!(matches!(pool.rent(), Rented::OpenNew));

        // Returns after shutdown close rather than enqueue.
        pool.put_back(fresh_sock(&listener).await);
        assert_eq!(pool.available(), 0);
    }
}
