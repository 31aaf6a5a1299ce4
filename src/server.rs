//! Server entry point with builder pattern.
//!
//! A [`Server`] ties the pieces together: it loads the first configuration,
//! installs logging, writes the PID file, registers signal handlers and then
//! hands control to the supervisor until it is terminated.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument};

use crate::config::{Config, ConfigSource, LogConfig};
use crate::control::{ControlHandle, ControlPlane, Phase};
use crate::error::{Error, Result};
use crate::protocol::{Diagnostics, Protocol, TracingDiagnostics};
use crate::scoreboard::Scoreboard;
use crate::signal::SignalHandler;
use crate::supervisor::Supervisor;
use crate::HARD_WORKER_LIMIT;

struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    fn create(path: &Path) -> Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path).map_err(|e| {
            Error::io_with_source(
                format!("Failed to create PID file at {}", path.display()),
                e,
            )
        })?;
        writeln!(file, "{pid}").map_err(|e| {
            Error::io_with_source(format!("Failed to write PID file at {}", path.display()), e)
        })?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Install the global `tracing` subscriber described by `logging`.
///
/// `RUST_LOG` directives are combined with the configured level. A subscriber
/// that is already installed (by the embedding program or an earlier call) is
/// left in place.
///
/// # Errors
///
/// Returns an error if the log file cannot be opened, or if JSON output is
/// requested without the `json-logs` feature.
pub fn init_logging(logging: &LogConfig) -> Result<()> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let level: tracing::Level = logging.level.into();
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let make_writer = || -> Result<BoxMakeWriter> {
        match &logging.file {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        Error::io_with_source(
                            format!("Failed to open log file at {}", path.display()),
                            e,
                        )
                    })?;
                Ok(BoxMakeWriter::new(Arc::new(file)))
            }
            None => Ok(BoxMakeWriter::new(std::io::stdout)),
        }
    };

    let installed = if logging.json {
        #[cfg(feature = "json-logs")]
        {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(make_writer()?)
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }

        #[cfg(not(feature = "json-logs"))]
        {
            return Err(Error::config(
                "JSON logging requested but feature not enabled",
            ));
        }
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_ansi(logging.color && logging.file.is_none())
            .with_writer(make_writer()?)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };

    if installed.is_err() {
        debug!("A tracing subscriber is already installed, keeping it");
    } else {
        debug!("Logging initialized with level: {:?}", logging.level);
    }
    Ok(())
}

/// A prefork server: a supervisor and its pool of workers.
pub struct Server<P: Protocol> {
    source: Box<dyn ConfigSource>,
    protocol: Arc<P>,
    diagnostics: Arc<dyn Diagnostics>,
    scoreboard: Arc<Scoreboard>,
    plane: ControlPlane,
    control: ControlHandle,
    signals: bool,
    logging: bool,
}

impl<P: Protocol> std::fmt::Debug for Server<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.control.state())
            .field("signals", &self.signals)
            .field("logging", &self.logging)
            .finish_non_exhaustive()
    }
}

impl<P: Protocol> Server<P> {
    /// Start building a server that loads its configuration from `source` and
    /// speaks `protocol`.
    #[must_use]
    pub fn builder<S: ConfigSource>(source: S, protocol: P) -> ServerBuilder<P> {
        ServerBuilder::new(Box::new(source), protocol)
    }

    /// Handle for restarting or terminating the running server.
    #[must_use]
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// The status table shared by the supervisor and its workers.
    #[must_use]
    pub fn scoreboard(&self) -> Arc<Scoreboard> {
        Arc::clone(&self.scoreboard)
    }

    /// Serve until terminated.
    ///
    /// # Errors
    ///
    /// Returns a fatal startup error (configuration, listener, admission gate,
    /// signal registration), or the configuration error that aborted a restart.
    #[instrument(name = "server", skip_all)]
    pub async fn run(self) -> Result<()> {
        let started_at = Instant::now();
        let (config, _pid_guard, signal_handler) = match self.prepare() {
            Ok(prepared) => prepared,
            Err(e) => {
                self.plane.set_phase(Phase::Stopped);
                return Err(e);
            }
        };
        let signal_task = signal_handler.map(|handler| tokio::spawn(handler.run()));

        let supervisor = Supervisor::new(
            self.source,
            self.protocol,
            self.diagnostics,
            self.scoreboard,
            self.plane,
        )
        .with_initial_config(config);
        let outcome = supervisor.run().await;

        if let Some(task) = signal_task {
            task.abort();
        }
        match outcome {
            Ok(()) => info!(uptime = ?started_at.elapsed(), "Server stopped"),
            Err(ref e) => error!(error = %e, "Server stopped with error"),
        }
        outcome
    }

    fn prepare(&self) -> Result<(Config, Option<PidFileGuard>, Option<SignalHandler>)> {
        let config = self.source.load()?;
        if self.logging {
            init_logging(&config.logging)?;
        }
        info!(name = %config.name, "Starting server");

        let pid_guard = match config.pid_file {
            Some(ref pid_file) => Some(PidFileGuard::create(pid_file)?),
            None => None,
        };
        let signal_handler = if self.signals {
            Some(SignalHandler::register(self.plane.sender.clone())?)
        } else {
            debug!("Signal handling disabled, the server is controlled through its handle only");
            None
        };
        Ok((config, pid_guard, signal_handler))
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder<P: Protocol> {
    source: Box<dyn ConfigSource>,
    protocol: P,
    diagnostics: Arc<dyn Diagnostics>,
    signals: bool,
    logging: bool,
}

impl<P: Protocol> ServerBuilder<P> {
    fn new(source: Box<dyn ConfigSource>, protocol: P) -> Self {
        Self {
            source,
            protocol,
            diagnostics: Arc::new(TracingDiagnostics),
            signals: true,
            logging: true,
        }
    }

    /// Send operator diagnostics somewhere other than the log.
    #[must_use]
    pub fn diagnostics<D: Diagnostics>(mut self, diagnostics: D) -> Self {
        self.diagnostics = Arc::new(diagnostics);
        self
    }

    /// Do not register OS signal handlers; use [`Server::control`] instead.
    #[must_use]
    pub fn without_signals(mut self) -> Self {
        self.signals = false;
        self
    }

    /// Leave logging setup to the embedding program.
    #[must_use]
    pub fn without_logging(mut self) -> Self {
        self.logging = false;
        self
    }

    /// Build the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the status table cannot be allocated.
    pub fn build(self) -> Result<Server<P>> {
        let scoreboard = Arc::new(Scoreboard::new(HARD_WORKER_LIMIT)?);
        let (plane, control) = ControlPlane::new();
        Ok(Server {
            source: self.source,
            protocol: Arc::new(self.protocol),
            diagnostics: self.diagnostics,
            scoreboard,
            plane,
            control,
            signals: self.signals,
            logging: self.logging,
        })
    }

    /// Build and run the server in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if building fails or the server stops with an error.
    pub async fn run(self) -> Result<()> {
        self.build()?.run().await
    }
}
