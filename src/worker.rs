//! Worker loop.
//!
//! A worker owns one status slot and cycles through
//! `READY -> BUSY_READ -> BUSY_WRITE -> [BUSY_KEEPALIVE -> BUSY_READ]* -> READY`
//! until it becomes obsolete, reaches its connection ceiling, is told to retire
//! or is terminated. Generation and ceiling checks happen between connections
//! only; the one thing that can cut a request short is its watchdog.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::control::{self, Directive};
use crate::error::{Error, Result};
use crate::gate::AdmissionGate;
use crate::listener::{is_benign_accept_error, Accepted, ListenerRing};
use crate::protocol::Protocol;
use crate::scoreboard::{RequestInfo, Scoreboard, SlotHandle, WorkerStatus};
use crate::watchdog::{Fired, Guarded, Watchdog};

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(10);

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    /// A graceful restart made its generation obsolete
    Obsolete,
    /// It served its configured number of connections
    RequestLimit,
    /// The supervisor retired it as surplus idle capacity
    Retired,
    /// The supervisor terminated it
    Terminated,
    /// Single-connection mode finished its connection
    Completed,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Obsolete => "obsolete",
            Self::RequestLimit => "request limit",
            Self::Retired => "retired",
            Self::Terminated => "terminated",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

enum ConnectionEnd {
    Closed,
    TimedOut(Fired),
    WindDown,
}

/// Serves connections on behalf of one status slot.
pub(crate) struct ConnectionServer<P: Protocol> {
    protocol: Arc<P>,
    config: Arc<Config>,
    slot: SlotHandle,
    watchdog: Watchdog,
    directive: watch::Receiver<Directive>,
    generation: u64,
}

impl<P: Protocol> ConnectionServer<P> {
    pub(crate) fn new(
        protocol: Arc<P>,
        config: Arc<Config>,
        slot: SlotHandle,
        directive: watch::Receiver<Directive>,
        generation: u64,
    ) -> Self {
        Self {
            protocol,
            config,
            slot,
            watchdog: Watchdog::new(),
            directive,
            generation,
        }
    }

    fn obsolete(&self) -> bool {
        self.slot.board().exit_generation() >= self.generation
    }

    fn retiring(&self) -> bool {
        *self.directive.borrow() != Directive::Run
    }

    fn winding_down(&self) -> bool {
        self.obsolete() || self.retiring()
    }

    // busy workers of a winding-down generation show up as GRACEFUL
    fn report(&self, status: WorkerStatus, info: Option<&RequestInfo>) {
        let status = if status.is_busy() && self.winding_down() {
            WorkerStatus::Graceful
        } else {
            status
        };
        self.slot.update(status, info);
    }

    async fn serve_connection(&self, mut conn: Connection) -> ConnectionEnd {
        let peer = conn.peer_addr();
        self.report(
            WorkerStatus::BusyRead,
            Some(&RequestInfo::new(peer.to_string(), "", "")),
        );

        loop {
            if conn.kept_alive() == 0 {
                self.watchdog
                    .soft_timeout("read request", self.config.request_timeout());
            } else {
                self.watchdog
                    .keepalive_timeout("keepalive", self.config.keep_alive_timeout());

                // idle between requests, a worker told to wind down closes at once
                let mut directive = self.directive.clone();
                let waited = tokio::select! {
                    biased;
                    () = self.wind_down_requested(&mut directive) => None,
                    waited = self.watchdog.guard(conn.wait_for_input()) => Some(waited),
                };
                match waited {
                    None => {
                        debug!(peer = %peer, "closing idle persistent connection");
                        self.watchdog.disarm();
                        self.linger(conn).await;
                        return ConnectionEnd::WindDown;
                    }
                    Some(Guarded::Completed(Ok(true))) => {}
                    Some(Guarded::Completed(Ok(false) | Err(_))) => break,
                    Some(Guarded::TimedOut(fired)) => {
                        debug!(peer = %peer, label = %fired.label, "timed out waiting for request");
                        conn.abort();
                        return ConnectionEnd::TimedOut(fired);
                    }
                }
            }

            let request = match self.watchdog.guard(self.protocol.read_request(&mut conn)).await {
                Guarded::Completed(Ok(Some(request))) => request,
                Guarded::Completed(Ok(None)) => break,
                Guarded::Completed(Err(e)) => {
                    debug!(peer = %peer, error = %e, "failed to read request");
                    break;
                }
                Guarded::TimedOut(fired) => {
                    debug!(peer = %peer, label = %fired.label, "timed out waiting for request");
                    conn.abort();
                    return ConnectionEnd::TimedOut(fired);
                }
            };

            let info = self.protocol.describe(&request, &conn);
            self.report(WorkerStatus::BusyWrite, Some(&info));
            self.watchdog
                .hard_timeout("send body", self.config.request_timeout());

            let handled = self
                .watchdog
                .guard(async {
                    self.protocol.handle_request(request, &mut conn).await?;
                    conn.flush().await?;
                    Ok::<(), Error>(())
                })
                .await;
            self.watchdog.disarm();

            match handled {
                Guarded::Completed(Ok(())) => {}
                Guarded::Completed(Err(e)) => {
                    warn!(peer = %peer, error = %e, "request failed");
                    conn.set_keep_alive(false);
                }
                Guarded::TimedOut(fired) => {
                    info!(
                        peer = %peer,
                        error = %fired.to_error(),
                        request = %info.request,
                        "request timed out, aborting connection"
                    );
                    conn.abort();
                    return ConnectionEnd::TimedOut(fired);
                }
            }

            self.slot.increment(conn.take_request_bytes());
            if !conn.keep_alive() || conn.is_aborted() {
                break;
            }

            self.report(WorkerStatus::BusyKeepalive, None);
            if self.winding_down() {
                self.linger(conn).await;
                return ConnectionEnd::WindDown;
            }
            conn.mark_kept_alive();
        }

        self.watchdog.disarm();
        if !conn.is_aborted() {
            self.linger(conn).await;
        }
        ConnectionEnd::Closed
    }

    async fn wind_down_requested(&self, directive: &mut watch::Receiver<Directive>) {
        let poll = self.config.accept_poll_interval();
        loop {
            if self.obsolete() {
                return;
            }
            tokio::select! {
                biased;
                () = control::retiring(directive) => return,
                () = tokio::time::sleep(poll) => {}
            }
        }
    }

    async fn linger(&self, conn: Connection) {
        conn.lingering_close(
            self.config.linger_timeout(),
            self.config.linger_poll_interval(),
        )
        .await;
    }
}

/// A worker of one generation, bound to one slot.
pub(crate) struct Worker<P: Protocol> {
    id: u64,
    server: ConnectionServer<P>,
    listeners: Arc<ListenerRing>,
    gate: Arc<AdmissionGate>,
    connections: u64,
}

impl<P: Protocol> Worker<P> {
    pub(crate) fn new(
        id: u64,
        server: ConnectionServer<P>,
        listeners: Arc<ListenerRing>,
        gate: Arc<AdmissionGate>,
    ) -> Self {
        Self {
            id,
            server,
            listeners,
            gate,
            connections: 0,
        }
    }

    /// Serve until told otherwise, then mark the slot `DEAD`.
    #[instrument(
        name = "worker",
        skip_all,
        fields(worker_id = self.id, slot = self.server.slot.index(), generation = self.server.generation)
    )]
    pub(crate) async fn run(mut self) -> ExitReason {
        debug!("worker started");
        let mut directive = self.server.directive.clone();
        let reason = tokio::select! {
            biased;
            () = control::terminated(&mut directive) => ExitReason::Terminated,
            reason = self.serve() => reason,
        };

        self.server.watchdog.disarm();
        self.server.slot.update(WorkerStatus::Dead, None);
        info!(reason = %reason, connections = self.connections, "worker exiting");
        reason
    }

    async fn serve(&mut self) -> ExitReason {
        let max_connections = self.server.config.workers.max_requests;
        loop {
            self.server.watchdog.disarm();

            if self.server.obsolete() {
                return ExitReason::Obsolete;
            }
            if self.server.retiring() {
                return ExitReason::Retired;
            }
            if max_connections > 0 && self.connections >= max_connections {
                return ExitReason::RequestLimit;
            }

            self.server.report(WorkerStatus::Ready, None);
            let Some(accepted) = self.admit().await else {
                continue;
            };
            self.connections += 1;

            let conn = Connection::new(
                accepted.stream,
                accepted.peer,
                accepted.local,
                self.server.watchdog.clone(),
            );
            match self.server.serve_connection(conn).await {
                ConnectionEnd::WindDown => {
                    return if self.server.obsolete() {
                        ExitReason::Obsolete
                    } else {
                        ExitReason::Retired
                    };
                }
                ConnectionEnd::TimedOut(_) | ConnectionEnd::Closed => {}
            }
        }
    }

    /// Hold the gate while waiting for a connection.
    ///
    /// Returns `None` when the worker must re-check whether it is still wanted.
    async fn admit(&self) -> Option<Accepted> {
        let mut directive = self.server.directive.clone();
        let permit = tokio::select! {
            biased;
            () = control::retiring(&mut directive) => return None,
            permit = self.gate.acquire() => permit,
        };

        let poll = self.server.config.accept_poll_interval();
        loop {
            if self.server.obsolete() {
                return None;
            }
            tokio::select! {
                biased;
                () = control::retiring(&mut directive) => return None,
                accepted = self.listeners.accept() => match accepted {
                    Ok(accepted) => {
                        permit.release();
                        return Some(accepted);
                    }
                    Err(e) if is_benign_accept_error(&e) => {
                        debug!(error = %e, "transient accept failure");
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    }
                },
                () = tokio::time::sleep(poll) => {}
            }
        }
    }
}

/// Serve one already-accepted connection to completion in `slot`.
///
/// The standalone counterpart of a pooled worker: there is no accept loop to
/// return to, so any timeout ends the session.
///
/// # Errors
///
/// Returns an error if `slot` is outside the status table.
pub async fn serve_single<P: Protocol>(
    protocol: Arc<P>,
    config: Arc<Config>,
    scoreboard: &Arc<Scoreboard>,
    slot: usize,
    accepted: Accepted,
) -> Result<ExitReason> {
    let handle = scoreboard.handle(slot)?;
    scoreboard.claim(slot, u64::from(std::process::id()))?;

    // the sender must outlive the session or the worker would see a retirement
    let (_directive_tx, directive) = watch::channel(Directive::Run);
    let generation = scoreboard.exit_generation() + 1;
    let server = ConnectionServer::new(protocol, config, handle, directive, generation);

    let conn = Connection::new(
        accepted.stream,
        accepted.peer,
        accepted.local,
        server.watchdog.clone(),
    );
    if let ConnectionEnd::TimedOut(fired) = server.serve_connection(conn).await {
        debug!(label = %fired.label, "single connection ended by timeout");
    }
    server.watchdog.disarm();
    server.slot.update(WorkerStatus::Dead, None);
    Ok(ExitReason::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BoxFuture;
    use std::net::SocketAddr;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    struct Lines;

    impl Protocol for Lines {
        type Request = String;

        fn read_request<'a>(
            &'a self,
            conn: &'a mut Connection,
        ) -> BoxFuture<'a, Result<Option<String>>> {
            Box::pin(async move {
                let mut line = String::new();
                if conn.read_line(&mut line).await? == 0 {
                    return Ok(None);
                }
                Ok(Some(line.trim_end().to_string()))
            })
        }

        fn handle_request<'a>(
            &'a self,
            request: String,
            conn: &'a mut Connection,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                if let Some(ms) = request.strip_prefix("sleep ") {
                    let ms = ms.parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                if request == "close" {
                    conn.set_keep_alive(false);
                }
                conn.write_all(format!("{request}\n").as_bytes()).await?;
                Ok(())
            })
        }
    }

    struct Harness {
        board: Arc<Scoreboard>,
        addr: SocketAddr,
        directive: watch::Sender<Directive>,
        task: JoinHandle<ExitReason>,
    }

    fn config(max_requests: u64) -> Arc<Config> {
        Arc::new(
            Config::builder()
                .listen("127.0.0.1:0".parse().unwrap())
                .max_requests_per_worker(max_requests)
                .request_timeout(Duration::from_millis(400))
                .unwrap()
                .keep_alive_timeout(Duration::from_millis(400))
                .unwrap()
                .linger(Duration::from_millis(500), Duration::from_millis(50))
                .unwrap()
                .accept_poll_interval(Duration::from_millis(20))
                .unwrap()
                .build()
                .unwrap(),
        )
    }

    // idle persistent connections would otherwise outlive any test
    fn long_keepalive_config() -> Arc<Config> {
        Arc::new(
            Config::builder()
                .listen("127.0.0.1:0".parse().unwrap())
                .keep_alive_timeout(Duration::from_secs(30))
                .unwrap()
                .linger(Duration::from_millis(500), Duration::from_millis(50))
                .unwrap()
                .accept_poll_interval(Duration::from_millis(20))
                .unwrap()
                .build()
                .unwrap(),
        )
    }

    fn spawn_worker(config: Arc<Config>) -> Harness {
        let board = Arc::new(Scoreboard::new(4).unwrap());
        let listeners = Arc::new(
            ListenerRing::setup(&config.listen.addresses, config.listen.backlog, None).unwrap(),
        );
        let addr = listeners.local_addrs()[0];
        let gate = Arc::new(AdmissionGate::new(&config.admission).unwrap());
        let (directive, directive_rx) = watch::channel(Directive::Run);

        board.claim(0, 1).unwrap();
        let server = ConnectionServer::new(
            Arc::new(Lines),
            config,
            board.handle(0).unwrap(),
            directive_rx,
            1,
        );
        let task = tokio::spawn(Worker::new(1, server, listeners, gate).run());
        Harness {
            board,
            addr,
            directive,
            task,
        }
    }

    async fn wait_for_status(board: &Scoreboard, status: WorkerStatus) {
        while board.status(0) != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn roundtrip(reader: &mut BufReader<TcpStream>, line: &str) -> String {
        reader.get_mut().write_all(format!("{line}\n").as_bytes()).await.unwrap();
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_serves_persistent_connection() {
        let test_result = tokio::time::timeout(TEST_TIMEOUT, async {
            let harness = spawn_worker(config(0));
            let mut client = BufReader::new(TcpStream::connect(harness.addr).await.unwrap());

            assert_eq!(roundtrip(&mut client, "one").await, "one\n");
            assert_eq!(roundtrip(&mut client, "two").await, "two\n");
            // accounting happens right after the reply is flushed
            while harness.board.read(0).unwrap().conn_count < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let slot = harness.board.read(0).unwrap();
            assert_eq!(slot.status, WorkerStatus::BusyKeepalive);
            assert_eq!(slot.bytes_served, 8);

            assert_eq!(roundtrip(&mut client, "close").await, "close\n");
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());

            wait_for_status(&harness.board, WorkerStatus::Ready).await;
            let slot = harness.board.read(0).unwrap();
            assert_eq!(slot.access_count, 3);
            assert_eq!(slot.conn_count, 0);

            harness.directive.send_replace(Directive::Terminate);
            assert_eq!(harness.task.await.unwrap(), ExitReason::Terminated);
            assert_eq!(harness.board.status(0), WorkerStatus::Dead);
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 10 seconds");
    }

    #[tokio::test]
    async fn test_read_timeout_aborts_connection_not_worker() {
        let test_result = tokio::time::timeout(TEST_TIMEOUT, async {
            let harness = spawn_worker(config(0));
            let mut silent = TcpStream::connect(harness.addr).await.unwrap();

            let mut rest = Vec::new();
            let _ = silent.read_to_end(&mut rest).await;
            assert!(rest.is_empty());

            // the worker is back to accepting
            wait_for_status(&harness.board, WorkerStatus::Ready).await;
            let mut client = BufReader::new(TcpStream::connect(harness.addr).await.unwrap());
            assert_eq!(roundtrip(&mut client, "again").await, "again\n");
            assert!(!harness.task.is_finished());
            harness.task.abort();
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 10 seconds");
    }

    #[tokio::test]
    async fn test_handler_timeout_aborts_request() {
        let test_result = tokio::time::timeout(TEST_TIMEOUT, async {
            let harness = spawn_worker(config(0));
            let mut client = TcpStream::connect(harness.addr).await.unwrap();
            client.write_all(b"sleep 2000\n").await.unwrap();

            let mut reply = Vec::new();
            let _ = client.read_to_end(&mut reply).await;
            assert!(reply.is_empty());
            assert_eq!(harness.board.read(0).unwrap().access_count, 0);
            assert!(!harness.task.is_finished());
            harness.task.abort();
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 10 seconds");
    }

    #[tokio::test]
    async fn test_retire_finishes_in_flight_request() {
        let test_result = tokio::time::timeout(TEST_TIMEOUT, async {
            let harness = spawn_worker(config(0));
            let mut client = BufReader::new(TcpStream::connect(harness.addr).await.unwrap());
            client.get_mut().write_all(b"sleep 200\n").await.unwrap();

            wait_for_status(&harness.board, WorkerStatus::BusyWrite).await;
            harness.directive.send_replace(Directive::Retire);

            let mut reply = String::new();
            client.read_line(&mut reply).await.unwrap();
            assert_eq!(reply, "sleep 200\n");

            // the connection is closed instead of kept alive
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
            assert_eq!(harness.task.await.unwrap(), ExitReason::Retired);
            assert_eq!(harness.board.status(0), WorkerStatus::Dead);
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 10 seconds");
    }

    #[tokio::test]
    async fn test_retire_closes_idle_persistent_connection() {
        let test_result = tokio::time::timeout(TEST_TIMEOUT, async {
            let harness = spawn_worker(long_keepalive_config());
            let mut client = BufReader::new(TcpStream::connect(harness.addr).await.unwrap());
            assert_eq!(roundtrip(&mut client, "one").await, "one\n");
            wait_for_status(&harness.board, WorkerStatus::BusyKeepalive).await;

            let retired_at = tokio::time::Instant::now();
            harness.directive.send_replace(Directive::Retire);
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
            assert!(retired_at.elapsed() < Duration::from_secs(5));
            assert_eq!(harness.task.await.unwrap(), ExitReason::Retired);
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 10 seconds");
    }

    #[tokio::test]
    async fn test_generation_bump_closes_idle_persistent_connection() {
        let test_result = tokio::time::timeout(TEST_TIMEOUT, async {
            let harness = spawn_worker(long_keepalive_config());
            let mut client = BufReader::new(TcpStream::connect(harness.addr).await.unwrap());
            assert_eq!(roundtrip(&mut client, "one").await, "one\n");
            wait_for_status(&harness.board, WorkerStatus::BusyKeepalive).await;

            let bumped_at = tokio::time::Instant::now();
            harness.board.set_exit_generation(1);
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
            assert!(bumped_at.elapsed() < Duration::from_secs(5));
            assert_eq!(harness.task.await.unwrap(), ExitReason::Obsolete);
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 10 seconds");
    }

    #[tokio::test]
    async fn test_obsolete_generation_exits_while_idle() {
        let test_result = tokio::time::timeout(TEST_TIMEOUT, async {
            let harness = spawn_worker(config(0));
            wait_for_status(&harness.board, WorkerStatus::Ready).await;

            harness.board.set_exit_generation(1);
            assert_eq!(harness.task.await.unwrap(), ExitReason::Obsolete);
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 10 seconds");
    }

    #[tokio::test]
    async fn test_request_ceiling_counts_connections() {
        let test_result = tokio::time::timeout(TEST_TIMEOUT, async {
            let harness = spawn_worker(config(2));
            for _ in 0..2 {
                let mut client =
                    BufReader::new(TcpStream::connect(harness.addr).await.unwrap());
                assert_eq!(roundtrip(&mut client, "a").await, "a\n");
                assert_eq!(roundtrip(&mut client, "close").await, "close\n");
            }
            assert_eq!(harness.task.await.unwrap(), ExitReason::RequestLimit);
            assert_eq!(harness.board.read(0).unwrap().access_count, 4);
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 10 seconds");
    }

    #[tokio::test]
    async fn test_serve_single_connection() {
        let test_result = tokio::time::timeout(TEST_TIMEOUT, async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let board = Arc::new(Scoreboard::new(2).unwrap());

            let client = tokio::spawn(async move {
                let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
                let reply = roundtrip(&mut client, "hello").await;
                client.get_mut().shutdown().await.unwrap();
                reply
            });

            let (stream, peer) = listener.accept().await.unwrap();
            let accepted = Accepted {
                stream,
                peer,
                local: addr,
            };
            let reason = serve_single(Arc::new(Lines), config(0), &board, 1, accepted)
                .await
                .unwrap();
            assert_eq!(reason, ExitReason::Completed);
            assert_eq!(client.await.unwrap(), "hello\n");
            assert_eq!(board.read(1).unwrap().access_count, 1);
            assert_eq!(board.status(1), WorkerStatus::Dead);

            let (stream, peer) = {
                let pending = TcpStream::connect(addr);
                let (accepted, _client) = tokio::join!(listener.accept(), pending);
                accepted.unwrap()
            };
            let out_of_range = Accepted {
                stream,
                peer,
                local: addr,
            };
            assert!(serve_single(Arc::new(Lines), config(0), &board, 9, out_of_range)
                .await
                .is_err());
        })
        .await;
        assert!(test_result.is_ok(), "Test timed out after 10 seconds");
    }
}
