//! Connection context.
//!
//! A [`Connection`] is owned by the worker serving it and lives until the
//! socket is closed. Output is buffered; once the output side is marked closed
//! (after an abort, or during a lingering close) further writes are discarded.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::debug;

use crate::watchdog::{AlarmBlock, Guarded, OnFire, Watchdog};

const LINGER_CHUNK: usize = 512;

/// One accepted client connection.
#[derive(Debug)]
pub struct Connection {
    stream: BufStream<TcpStream>,
    peer: SocketAddr,
    local: SocketAddr,
    watchdog: Watchdog,
    keep_alive: bool,
    kept_alive: u32,
    aborted: bool,
    output_closed: bool,
    bytes_sent: u64,
    request_bytes: u64,
}

impl Connection {
    /// Wrap an accepted stream.
    #[must_use]
    pub fn new(stream: TcpStream, peer: SocketAddr, local: SocketAddr, watchdog: Watchdog) -> Self {
        Self {
            stream: BufStream::new(stream),
            peer,
            local,
            watchdog,
            keep_alive: true,
            kept_alive: 0,
            aborted: false,
            output_closed: false,
            bytes_sent: 0,
            request_bytes: 0,
        }
    }

    /// Client address.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Local address the connection arrived on.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Read a line, including its terminator. Returns 0 at end of stream.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub async fn read_line(&mut self, buf: &mut String) -> io::Result<usize> {
        self.stream.read_line(buf).await
    }

    /// Read whatever is available into `buf`. Returns 0 at end of stream.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    /// Fill `buf` completely.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error, or `UnexpectedEof`.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.stream.read_exact(buf).await.map(|_| ())
    }

    /// Wait until request bytes are buffered, without consuming them.
    ///
    /// Returns `false` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub async fn wait_for_input(&mut self) -> io::Result<bool> {
        let buffered = self.stream.fill_buf().await?;
        Ok(!buffered.is_empty())
    }

    /// Queue response bytes. Discarded once output is closed.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.output_closed {
            return Ok(());
        }
        self.stream.write_all(data).await?;
        let len = data.len() as u64;
        self.bytes_sent += len;
        self.request_bytes += len;
        Ok(())
    }

    /// Push buffered output to the socket.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.output_closed {
            return Ok(());
        }
        self.stream.flush().await
    }

    /// Whether the connection may carry another request.
    #[must_use]
    pub const fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Allow or forbid further requests on this connection.
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Number of requests already completed on this connection.
    #[must_use]
    pub const fn kept_alive(&self) -> u32 {
        self.kept_alive
    }

    pub(crate) fn mark_kept_alive(&mut self) {
        self.kept_alive += 1;
    }

    /// Whether the connection was abandoned mid-flight.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Abandon the connection: no lingering close, no further output.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.output_closed = true;
    }

    /// Whether output is being discarded.
    #[must_use]
    pub const fn is_output_closed(&self) -> bool {
        self.output_closed
    }

    /// Total response bytes queued on this connection.
    #[must_use]
    pub const fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub(crate) fn take_request_bytes(&mut self) -> u64 {
        std::mem::take(&mut self.request_bytes)
    }

    /// Defer the worker's timeouts until the returned guard is dropped.
    pub fn block_alarms(&self) -> AlarmBlock {
        self.watchdog.block_alarms()
    }

    /// Restart the current timeout, e.g. after making progress on a slow transfer.
    pub fn reset_timeout(&self) {
        self.watchdog.reset();
    }

    /// Close gracefully: flush, half-close, then drain what the client still sends.
    ///
    /// Reading stops after `poll` without data, at end of stream or on error;
    /// the whole drain is bounded by `linger`.
    pub async fn lingering_close(mut self, linger: Duration, poll: Duration) {
        let watchdog = self.watchdog.clone();
        watchdog.arm("lingering close", linger, OnFire::StopLingering);
        let outcome = watchdog.guard(self.drain(poll)).await;
        watchdog.disarm();
        if let Guarded::TimedOut(_) = outcome {
            debug!(peer = %self.peer, "lingering close cut short");
            self.abort();
        }
    }

    async fn drain(&mut self, poll: Duration) {
        if self.stream.flush().await.is_err() {
            return;
        }
        self.output_closed = true;
        if self.aborted || self.stream.shutdown().await.is_err() {
            return;
        }

        let mut chunk = [0u8; LINGER_CHUNK];
        loop {
            match tokio::time::timeout(poll, self.stream.read(&mut chunk)).await {
                Ok(Ok(n)) if n > 0 => {}
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        (Connection::new(stream, peer, addr, Watchdog::new()), client)
    }

    #[tokio::test]
    async fn test_writes_after_abort_are_discarded() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let (mut conn, mut client) = pair().await;
            conn.write_all(b"hello\n").await.unwrap();
            conn.flush().await.unwrap();
            assert_eq!(conn.take_request_bytes(), 6);
            assert_eq!(conn.take_request_bytes(), 0);

            conn.abort();
            conn.write_all(b"lost\n").await.unwrap();
            assert!(conn.is_aborted());
            assert!(conn.is_output_closed());
            assert_eq!(conn.bytes_sent(), 6);
            drop(conn);

            let mut received = Vec::new();
            client.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, b"hello\n");
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test]
    async fn test_wait_for_input_leaves_bytes_buffered() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let (mut conn, mut client) = pair().await;
            client.write_all(b"ping\n").await.unwrap();
            assert!(conn.wait_for_input().await.unwrap());

            let mut line = String::new();
            conn.read_line(&mut line).await.unwrap();
            assert_eq!(line, "ping\n");

            client.shutdown().await.unwrap();
            assert!(!conn.wait_for_input().await.unwrap());
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test]
    async fn test_lingering_close_delivers_final_response() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let (mut conn, mut client) = pair().await;
            client.write_all(b"trailing bytes the server never reads").await.unwrap();

            conn.write_all(b"bye\n").await.unwrap();
            let closing = tokio::spawn(conn.lingering_close(
                Duration::from_secs(3),
                Duration::from_millis(200),
            ));

            let mut received = Vec::new();
            client.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, b"bye\n");
            drop(client);
            closing.await.unwrap();
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test]
    async fn test_lingering_close_is_bounded() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let (conn, mut client) = pair().await;
            let chatter = tokio::spawn(async move {
                // keep the drain busy well past the linger bound
                for _ in 0..40 {
                    if client.write_all(b"x").await.is_err() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            });

            let started = std::time::Instant::now();
            conn.lingering_close(Duration::from_millis(500), Duration::from_millis(200))
                .await;
            assert!(started.elapsed() < Duration::from_millis(1_500));
            chatter.abort();
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }
}
