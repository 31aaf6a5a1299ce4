//! Listener ring.
//!
//! The listening sockets of one generation in configured order, scanned
//! cyclically from a cursor that always moves past the last listener serviced.
//! Under sustained load on several listeners no single one can starve the rest.
//!
//! Sockets survive restarts: [`ListenerRing::setup`] reuses the open socket of
//! the previous ring for every address configured again, so a restart never
//! trips over "address already in use". The cursor is only advanced by the
//! worker holding admission rights, as it accepts, which is why a relaxed
//! atomic suffices.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info};

use crate::error::{Error, ErrorCode, Result};

/// One listening socket in the ring.
#[derive(Debug)]
pub struct ListenerEntry {
    listener: Arc<TcpListener>,
    configured: SocketAddr,
    local: SocketAddr,
    used: AtomicBool,
}

impl ListenerEntry {
    /// Address as configured (the reuse key across restarts).
    #[must_use]
    pub const fn configured_addr(&self) -> SocketAddr {
        self.configured
    }

    /// Address the socket is actually bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Whether the next generation has taken this socket over.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }
}

/// A connection taken from the ring.
#[derive(Debug)]
pub struct Accepted {
    /// The accepted stream, Nagle disabled
    pub stream: TcpStream,
    /// Client address
    pub peer: SocketAddr,
    /// Local address of the listener that produced it
    pub local: SocketAddr,
}

/// Cyclic collection of listening sockets with a fairness cursor.
#[derive(Debug)]
pub struct ListenerRing {
    entries: Vec<ListenerEntry>,
    cursor: AtomicUsize,
}

fn bind(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::Listener {
        code: ErrorCode::ListenerSocket,
        message: "Failed to create socket".to_string(),
        address: Some(addr),
        source: Some(Box::new(e)),
    })?;

    socket
        .set_reuseaddr(true)
        .map_err(|e| Error::listener_with_source(addr, "Failed to enable address reuse", e))?;
    socket
        .bind(addr)
        .map_err(|e| Error::listener_with_source(addr, "Could not bind to address", e))?;
    socket
        .listen(backlog)
        .map_err(|e| Error::listener_with_source(addr, "Unable to listen for connections", e))
}

impl ListenerRing {
    /// Build the ring for `addresses`, reusing sockets from `previous`.
    ///
    /// Sockets of `previous` that are not configured again are closed once the
    /// last holder of the previous ring drops it; their addresses are logged.
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a fatal listener error if an address cannot be bound or the
    /// address list is empty, and a `MISSING_RUNTIME` worker error outside a
    /// tokio runtime.
    pub fn setup(
        addresses: &[SocketAddr],
        backlog: u32,
        previous: Option<&Self>,
    ) -> Result<Self> {
        if addresses.is_empty() {
            return Err(Error::listener(
                ErrorCode::ListenerEmpty,
                "No listen addresses configured",
            ));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::worker(
                ErrorCode::MissingRuntime,
                "Listeners can only be set up inside a tokio runtime",
            ));
        }

        let mut entries = Vec::with_capacity(addresses.len());
        for &addr in addresses {
            let reused = previous.and_then(|ring| ring.find_unused(addr));
            let entry = if let Some(old) = reused {
                old.used.store(true, Ordering::Release);
                debug!(addr = %addr, "reusing listener from previous generation");
                ListenerEntry {
                    listener: Arc::clone(&old.listener),
                    configured: addr,
                    local: old.local,
                    used: AtomicBool::new(false),
                }
            } else {
                let listener = bind(addr, backlog)?;
                let local = listener.local_addr()?;
                info!(addr = %local, backlog, "listening");
                ListenerEntry {
                    listener: Arc::new(listener),
                    configured: addr,
                    local,
                    used: AtomicBool::new(false),
                }
            };
            entries.push(entry);
        }

        if let Some(ring) = previous {
            for closed in ring.unused_addresses() {
                info!(addr = %closed, "closing listener no longer configured");
            }
        }

        Ok(Self {
            entries,
            cursor: AtomicUsize::new(0),
        })
    }

    fn find_unused(&self, addr: SocketAddr) -> Option<&ListenerEntry> {
        self.entries
            .iter()
            .find(|entry| entry.configured == addr && !entry.is_used())
    }

    /// Local addresses of entries the next generation did not take over.
    #[must_use]
    pub fn unused_addresses(&self) -> Vec<SocketAddr> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_used())
            .map(|entry| entry.local)
            .collect()
    }

    /// Entries in ring order.
    #[must_use]
    pub fn entries(&self) -> &[ListenerEntry] {
        &self.entries
    }

    /// Bound addresses in ring order.
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.entries.iter().map(|entry| entry.local).collect()
    }

    /// Number of listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring holds no listener.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the entry the next scan starts from.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Pick the first ready entry, scanning once around the ring from the cursor.
    ///
    /// The cursor moves past the chosen entry.
    pub fn find_ready<F>(&self, mut is_ready: F) -> Option<&ListenerEntry>
    where
        F: FnMut(&ListenerEntry) -> bool,
    {
        let n = self.entries.len();
        let start = self.cursor();
        for step in 0..n {
            let index = (start + step) % n;
            let entry = &self.entries[index];
            if is_ready(entry) {
                self.cursor.store((index + 1) % n, Ordering::Relaxed);
                return Some(entry);
            }
        }
        None
    }

    /// Poll every listener in ring order for a pending connection.
    pub fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<(SocketAddr, io::Result<(TcpStream, SocketAddr)>)> {
        let mut result = None;
        let chosen = self.find_ready(|entry| match entry.listener.poll_accept(cx) {
            Poll::Ready(accepted) => {
                result = Some(accepted);
                true
            }
            Poll::Pending => false,
        });
        match (chosen, result) {
            (Some(entry), Some(accepted)) => Poll::Ready((entry.local, accepted)),
            _ => Poll::Pending,
        }
    }

    /// Wait for the next connection on any listener.
    ///
    /// # Errors
    ///
    /// Returns the accept error of the listener that failed; the caller decides
    /// whether it is worth logging.
    pub async fn accept(&self) -> io::Result<Accepted> {
        let (local, accepted) = poll_fn(|cx| self.poll_accept(cx)).await;
        let (stream, peer) = accepted?;
        stream.set_nodelay(true)?;
        Ok(Accepted {
            stream,
            peer,
            local,
        })
    }
}

/// Accept errors that say nothing about the health of the listener.
#[must_use]
pub fn is_benign_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || err.raw_os_error() == Some(PROTOCOL_ERROR)
}

// EPROTO on Linux
const PROTOCOL_ERROR: i32 = 71;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_setup_requires_runtime() {
        let err = ListenerRing::setup(&[loopback()], 16, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingRuntime);
    }

    #[tokio::test]
    async fn test_find_ready_visits_each_listener_once() {
        let ring = ListenerRing::setup(&[loopback(), loopback(), loopback()], 16, None).unwrap();
        let addrs = ring.local_addrs();

        let visited: Vec<SocketAddr> = (0..6)
            .map(|_| ring.find_ready(|_| true).unwrap().local_addr())
            .collect();
        assert_eq!(
            visited,
            vec![addrs[0], addrs[1], addrs[2], addrs[0], addrs[1], addrs[2]]
        );
    }

    #[tokio::test]
    async fn test_find_ready_skips_idle_listeners() {
        let ring = ListenerRing::setup(&[loopback(), loopback(), loopback()], 16, None).unwrap();
        let addrs = ring.local_addrs();
        let only_c = addrs[2];

        let chosen = ring.find_ready(|entry| entry.local_addr() == only_c).unwrap();
        assert_eq!(chosen.local_addr(), only_c);
        assert_eq!(ring.cursor(), 0);

        assert!(ring.find_ready(|_| false).is_none());
        assert_eq!(ring.cursor(), 0);
    }

    #[tokio::test]
    async fn test_setup_reuses_matching_sockets() {
        let first = loopback();
        let ring = ListenerRing::setup(&[first], 16, None).unwrap();
        let bound = ring.local_addrs()[0];

        let extra: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let next = ListenerRing::setup(&[first, extra], 16, Some(&ring)).unwrap();
        assert_eq!(next.local_addrs()[0], bound);
        assert_ne!(next.local_addrs()[1], bound);
        assert!(ring.entries()[0].is_used());
        assert!(ring.unused_addresses().is_empty());

        // an address dropped from the config is left unused for closing
        let third = ListenerRing::setup(&[first], 16, Some(&next)).unwrap();
        assert_eq!(third.local_addrs(), vec![bound]);
        assert_eq!(next.unused_addresses(), vec![next.local_addrs()[1]]);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = holder.local_addr().unwrap();

        let err = ListenerRing::setup(&[taken], 16, None).unwrap_err();
        assert!(err.is_fatal_startup());
        assert_eq!(err.code(), ErrorCode::ListenerBind);
        assert!(ListenerRing::setup(&[], 16, None).is_err());
    }

    #[tokio::test]
    async fn test_accept_round_robins_between_listeners() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let ring = ListenerRing::setup(&[loopback(), loopback()], 16, None).unwrap();
            let addrs = ring.local_addrs();

            // queue two connections on each listener before accepting
            let mut clients = Vec::new();
            for addr in [addrs[0], addrs[0], addrs[1], addrs[1]] {
                clients.push(TcpStream::connect(addr).await.unwrap());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;

            let mut served = Vec::new();
            for _ in 0..4 {
                let accepted = ring.accept().await.unwrap();
                assert!(accepted.stream.nodelay().unwrap());
                served.push(accepted.local);
            }
            assert_eq!(served, vec![addrs[0], addrs[1], addrs[0], addrs[1]]);
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[test]
    fn test_benign_accept_errors() {
        assert!(is_benign_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_benign_accept_error(&io::Error::from_raw_os_error(71)));
        assert!(!is_benign_accept_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }
}
