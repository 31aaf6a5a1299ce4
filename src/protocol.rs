//! Collaborator contracts.
//!
//! The core knows nothing about payloads. A [`Protocol`] reads requests off a
//! [`Connection`] and answers them through it; [`Diagnostics`] receives the
//! operator-facing messages the supervisor emits.

use std::future::Future;
use std::pin::Pin;
use tracing::warn;

use crate::connection::Connection;
use crate::error::Result;
use crate::scoreboard::RequestInfo;

/// Boxed future returned by [`Protocol`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Request reading and handling, implemented by the embedding server.
///
/// Both methods run under the worker's watchdog: when a deadline fires the
/// returned future is dropped mid-flight, so implementations must not rely on
/// running to completion.
pub trait Protocol: Send + Sync + 'static {
    /// A parsed request.
    type Request: Send + 'static;

    /// Wait for the next request, or `None` at end of stream.
    fn read_request<'a>(
        &'a self,
        conn: &'a mut Connection,
    ) -> BoxFuture<'a, Result<Option<Self::Request>>>;

    /// Execute a request, writing the response through `conn`.
    ///
    /// Clearing [`Connection::set_keep_alive`] ends the connection after this
    /// request.
    fn handle_request<'a>(
        &'a self,
        request: Self::Request,
        conn: &'a mut Connection,
    ) -> BoxFuture<'a, Result<()>>;

    /// Diagnostic description of a request for the status table.
    fn describe(&self, _request: &Self::Request, conn: &Connection) -> RequestInfo {
        RequestInfo::new(conn.peer_addr().to_string(), "", "")
    }
}

/// Fire-and-forget sink for operator diagnostics.
///
/// Implementations must not block and cannot fail the caller.
pub trait Diagnostics: Send + Sync + 'static {
    /// Report one message.
    fn report(&self, message: &str);
}

/// Emits diagnostics as `tracing` warnings.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn report(&self, message: &str) {
        warn!(target: "proc_prefork::diagnostic", "{message}");
    }
}
