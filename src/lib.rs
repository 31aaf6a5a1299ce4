#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
//! # proc-prefork: worker supervision and connection admission
//!
//! The core of a prefork network server. It decides how many workers exist,
//! which one answers each incoming connection, how their live status is
//! tracked, how they are torn down and replaced, and how a running pool is cut
//! over to a new configuration without dropping in-flight work.
//!
//! ## Components
//!
//! - **Status table** ([`Scoreboard`]): one slot per worker, written without
//!   locks by exactly one writer at a time
//! - **Admission gate** ([`AdmissionGate`]): serializes the accept step across
//!   workers, optionally backed by a lock file
//! - **Listener ring** ([`ListenerRing`]): listening sockets scanned fairly
//!   from a moving cursor, reused across restarts
//! - **Watchdog** ([`Watchdog`]): per-worker deadline that abandons stuck
//!   connection I/O
//! - **Workers and supervisor**: tokio tasks serving connections, and the
//!   controller keeping the idle pool within bounds and running full and
//!   graceful restarts
//!
//! Payloads are not this crate's business: a [`Protocol`] reads requests off a
//! [`Connection`] and answers them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use proc_prefork::{BoxFuture, Config, Connection, Protocol, Result, Server};
//!
//! struct Echo;
//!
//! impl Protocol for Echo {
//!     type Request = String;
//!
//!     fn read_request<'a>(
//!         &'a self,
//!         conn: &'a mut Connection,
//!     ) -> BoxFuture<'a, Result<Option<String>>> {
//!         Box::pin(async move {
//!             let mut line = String::new();
//!             if conn.read_line(&mut line).await? == 0 {
//!                 return Ok(None);
//!             }
//!             Ok(Some(line))
//!         })
//!     }
//!
//!     fn handle_request<'a>(
//!         &'a self,
//!         request: String,
//!         conn: &'a mut Connection,
//!     ) -> BoxFuture<'a, Result<()>> {
//!         Box::pin(async move {
//!             conn.write_all(request.as_bytes()).await?;
//!             Ok(())
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::builder()
//!         .listen("127.0.0.1:7070".parse().unwrap())
//!         .idle_workers(2, 4)
//!         .start_workers(2)
//!         .build()?;
//!
//!     // SIGHUP restarts, SIGUSR1 restarts gracefully, SIGTERM stops
//!     Server::builder(config, Echo).run().await
//! }
//! ```

mod config;
mod connection;
mod control;
mod error;
mod protocol;
mod supervisor;
mod worker;

pub mod gate;
pub mod listener;
pub mod lock;
pub mod scoreboard;
pub mod server;
pub mod signal;
pub mod watchdog;

pub use config::{
    AdmissionConfig, Config, ConfigBuilder, ConfigSource, FileSource, ListenConfig, LogConfig,
    LogLevel, SupervisorConfig, TimeoutConfig, WorkerConfig,
};
pub use connection::Connection;
pub use control::{ControlEvent, ControlHandle, Directive, Phase, SupervisorState};
pub use error::{Error, ErrorCode, Result};
pub use gate::{AdmissionGate, AdmissionPermit};
pub use listener::{Accepted, ListenerRing};
pub use protocol::{BoxFuture, Diagnostics, Protocol, TracingDiagnostics};
pub use scoreboard::{RequestInfo, Scoreboard, ScoreboardSnapshot, SlotSnapshot, WorkerStatus};
pub use server::{init_logging, Server, ServerBuilder};
pub use watchdog::{Guarded, OnFire, Watchdog};
pub use worker::{serve_single, ExitReason};

/// Version of the proc-prefork library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Compiled ceiling on the number of workers, and the size of the status table
pub const HARD_WORKER_LIMIT: usize = 256;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "prefork.toml";
