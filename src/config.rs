//! Configuration management for the prefork core.
//!
//! The configuration handle exposes the resource limits the supervisor and
//! its workers run under: worker counts, timeouts, listen addresses and
//! backlog. Settings are layered with figment: built-in defaults, then an
//! optional TOML file, then `PREFORK_`-prefixed environment variables (nested
//! keys separated by `__`, e.g. `PREFORK_WORKERS__MIN_FREE=4`).
//!
//! The supervisor reloads configuration once per generation through a
//! [`ConfigSource`]. Malformed input is fatal; the core never retries a load.

use figment::providers::{Env, Serialized};
use figment::{Figment, Provider};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, ErrorCode, Result};
use crate::HARD_WORKER_LIMIT;

/// Log level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level logging (most verbose)
    Trace,
    /// Debug level logging
    Debug,
    /// Info level logging (default)
    #[default]
    Info,
    /// Warning level logging
    Warn,
    /// Error level logging
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level
    pub level: LogLevel,
    /// Enable JSON formatted logs
    pub json: bool,
    /// Enable colored output (ignored for JSON logs)
    pub color: bool,
    /// Log file path (optional)
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
            color: true,
            file: None,
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum number of concurrently running workers
    pub limit: usize,
    /// Minimum number of idle workers to keep around
    pub min_free: usize,
    /// Maximum number of idle workers before one is retired
    pub max_free: usize,
    /// Workers started on cold start and after a full restart
    pub start: usize,
    /// Connections a worker serves before exiting (0 = unlimited)
    pub max_requests: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            limit: 150,
            min_free: 5,
            max_free: 10,
            start: 5,
            max_requests: 0,
        }
    }
}

/// Connection timeouts, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Hard and soft request timeout
    pub request_ms: u64,
    /// Wait for the next request on a persistent connection
    pub keep_alive_ms: u64,
    /// Upper bound on a lingering close
    pub linger_ms: u64,
    /// Longest quiet period tolerated while draining a lingering close
    pub linger_poll_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: 300_000,
            keep_alive_ms: 15_000,
            linger_ms: 30_000,
            linger_poll_ms: 2_000,
        }
    }
}

/// Listening sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Addresses to bind, in ring order
    pub addresses: Vec<SocketAddr>,
    /// Listen backlog passed to every socket
    pub backlog: u32,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addresses: vec![SocketAddr::from(([0, 0, 0, 0], 8080))],
            backlog: 511,
        }
    }
}

/// Admission gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Serialize the accept step across workers
    pub serialize: bool,
    /// Lock file guarding the gate; the supervisor pid is appended to the name
    pub lock_file: Option<PathBuf>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            serialize: true,
            lock_file: None,
        }
    }
}

/// Supervisor pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Longest wait for a worker exit before idle maintenance runs
    pub maintenance_interval_ms: u64,
    /// How often a worker blocked in accept re-checks its generation
    pub accept_poll_ms: u64,
    /// Wait budget of each reclaim escalation stage
    pub reclaim_stage_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_ms: 1_000,
            accept_poll_ms: 1_000,
            reclaim_stage_ms: 3_000,
        }
    }
}

/// Main server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server name/identifier
    pub name: String,
    /// Worker pool sizing
    pub workers: WorkerConfig,
    /// Connection timeouts
    pub timeouts: TimeoutConfig,
    /// Listening sockets
    pub listen: ListenConfig,
    /// Admission gate
    pub admission: AdmissionConfig,
    /// Supervisor pacing
    pub supervisor: SupervisorConfig,
    /// Logging configuration
    pub logging: LogConfig,
    /// PID file location
    pub pid_file: Option<PathBuf>,
    /// Where the supervisor persists status table snapshots
    pub scoreboard_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::from("proc-prefork"),
            workers: WorkerConfig::default(),
            timeouts: TimeoutConfig::default(),
            listen: ListenConfig::default(),
            admission: AdmissionConfig::default(),
            supervisor: SupervisorConfig::default(),
            logging: LogConfig::default(),
            pid_file: None,
            scoreboard_file: None,
        }
    }
}

impl Config {
    /// Create a new config with defaults.
    ///
    /// # Errors
    ///
    /// Will return an error if the default configuration validation fails.
    pub fn new() -> Result<Self> {
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file, layered over defaults and under the environment.
    ///
    /// # Errors
    ///
    /// Will return an error if the file is missing, cannot be parsed, or
    /// contains invalid configuration data.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config {
                code: ErrorCode::ConfigMissing,
                message: format!("Configuration file not found: {}", path.display()),
                source: None,
            });
        }

        #[allow(unused_mut)]
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        #[cfg(feature = "toml")]
        {
            use figment::providers::Format;
            figment = figment.merge(figment::providers::Toml::file(path));
        }

        let config: Self = figment
            .merge(Env::prefixed("PREFORK_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config using a configuration provider.
    ///
    /// # Errors
    ///
    /// Will return an error if the provider fails to load a valid configuration.
    pub fn load_with_provider<P: Provider>(provider: P) -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(provider)
            .merge(Env::prefixed("PREFORK_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the hard/soft request timeout as a Duration.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.request_ms)
    }

    /// Get the keep-alive timeout as a Duration.
    #[must_use]
    pub const fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.keep_alive_ms)
    }

    /// Get the lingering close bound as a Duration.
    #[must_use]
    pub const fn linger_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.linger_ms)
    }

    /// Get the lingering close poll interval as a Duration.
    #[must_use]
    pub const fn linger_poll_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.linger_poll_ms)
    }

    /// Get the maintenance interval as a Duration.
    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor.maintenance_interval_ms)
    }

    /// Get the accept-wait re-check interval as a Duration.
    #[must_use]
    pub const fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor.accept_poll_ms)
    }

    /// Get the reclaim stage budget as a Duration.
    #[must_use]
    pub const fn reclaim_stage_timeout(&self) -> Duration {
        Duration::from_millis(self.supervisor.reclaim_stage_ms)
    }

    /// Idle ceiling actually enforced: never below `min_free + 1`.
    #[must_use]
    pub const fn effective_max_free(&self) -> usize {
        if self.workers.max_free < self.workers.min_free + 1 {
            self.workers.min_free + 1
        } else {
            self.workers.max_free
        }
    }

    /// Start count actually used: never above the worker limit.
    #[must_use]
    pub const fn effective_start(&self) -> usize {
        if self.workers.start > self.workers.limit {
            self.workers.limit
        } else {
            self.workers.start
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Will return an error if any configuration values are invalid or missing required fields.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("Server name cannot be empty"));
        }

        if self.workers.limit == 0 {
            return Err(Error::config("Worker limit must be greater than 0"));
        }

        if self.workers.limit > HARD_WORKER_LIMIT {
            return Err(Error::config(format!(
                "Worker limit {} exceeds the compiled ceiling of {HARD_WORKER_LIMIT}",
                self.workers.limit
            )));
        }

        if self.workers.min_free == 0 {
            return Err(Error::config("Minimum idle workers must be greater than 0"));
        }

        if self.listen.addresses.is_empty() {
            return Err(Error::config("At least one listen address is required"));
        }

        if self.listen.backlog == 0 {
            return Err(Error::config("Listen backlog must be greater than 0"));
        }

        if self.timeouts.request_ms == 0 || self.timeouts.keep_alive_ms == 0 {
            return Err(Error::config("Request timeouts must be greater than 0"));
        }

        if self.timeouts.linger_ms == 0 || self.timeouts.linger_poll_ms == 0 {
            return Err(Error::config("Linger timeouts must be greater than 0"));
        }

        if self.supervisor.maintenance_interval_ms == 0
            || self.supervisor.accept_poll_ms == 0
            || self.supervisor.reclaim_stage_ms == 0
        {
            return Err(Error::config("Supervisor intervals must be greater than 0"));
        }

        if let Some(ref pid_file) = self.pid_file {
            if let Some(parent) = pid_file.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(Error::config(format!(
                        "PID file directory does not exist: {}",
                        parent.display()
                    )));
                }
            }
        }

        if let Some(ref log_file) = self.logging.file {
            if let Some(parent) = log_file.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(Error::config(format!(
                        "Log file directory does not exist: {}",
                        parent.display()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Check if JSON logging is enabled.
    #[must_use]
    pub const fn is_json_logging(&self) -> bool {
        self.logging.json
    }

    /// Create a builder for this configuration.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Produces the configuration for each generation.
///
/// The supervisor calls [`load`](ConfigSource::load) at startup and again on
/// every restart; an error aborts the server.
pub trait ConfigSource: Send + Sync + 'static {
    /// Load or reload the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is missing or malformed.
    fn load(&self) -> Result<Config>;
}

impl ConfigSource for Config {
    fn load(&self) -> Result<Config> {
        self.validate()?;
        Ok(self.clone())
    }
}

/// Reads configuration from a TOML file on every load.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Create a source reading `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Path this source reads.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileSource {
    fn default() -> Self {
        Self::new(crate::DEFAULT_CONFIG_FILE)
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<Config> {
        Config::load_from_file(&self.path)
    }
}

/// Builder for creating configurations programmatically.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
    custom_listen: bool,
}

fn millis(value: Duration, what: &str) -> Result<u64> {
    u64::try_from(value.as_millis()).map_err(|_| Error::config(format!("{what} too large")))
}

impl ConfigBuilder {
    /// Create a new configuration builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            custom_listen: false,
        }
    }

    /// Set the server name.
    #[must_use]
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the worker limit.
    #[must_use]
    pub const fn worker_limit(mut self, limit: usize) -> Self {
        self.config.workers.limit = limit;
        self
    }

    /// Set the idle worker bounds.
    #[must_use]
    pub const fn idle_workers(mut self, min_free: usize, max_free: usize) -> Self {
        self.config.workers.min_free = min_free;
        self.config.workers.max_free = max_free;
        self
    }

    /// Set the number of workers started in a batch.
    #[must_use]
    pub const fn start_workers(mut self, start: usize) -> Self {
        self.config.workers.start = start;
        self
    }

    /// Set the number of connections a worker serves before exiting.
    #[must_use]
    pub const fn max_requests_per_worker(mut self, max: u64) -> Self {
        self.config.workers.max_requests = max;
        self
    }

    /// Add a listen address; the first call replaces the default address.
    #[must_use]
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        if !self.custom_listen {
            self.config.listen.addresses.clear();
            self.custom_listen = true;
        }
        self.config.listen.addresses.push(addr);
        self
    }

    /// Set the listen backlog.
    #[must_use]
    pub const fn backlog(mut self, backlog: u32) -> Self {
        self.config.listen.backlog = backlog;
        self
    }

    /// Set the request timeout.
    ///
    /// # Errors
    ///
    /// Will return an error if the duration exceeds `u64::MAX` milliseconds
    pub fn request_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.config.timeouts.request_ms = millis(timeout, "Request timeout")?;
        Ok(self)
    }

    /// Set the keep-alive timeout.
    ///
    /// # Errors
    ///
    /// Will return an error if the duration exceeds `u64::MAX` milliseconds
    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.config.timeouts.keep_alive_ms = millis(timeout, "Keep-alive timeout")?;
        Ok(self)
    }

    /// Set the lingering close bound and its poll interval.
    ///
    /// # Errors
    ///
    /// Will return an error if a duration exceeds `u64::MAX` milliseconds
    pub fn linger(mut self, total: Duration, poll: Duration) -> Result<Self> {
        self.config.timeouts.linger_ms = millis(total, "Linger timeout")?;
        self.config.timeouts.linger_poll_ms = millis(poll, "Linger poll interval")?;
        Ok(self)
    }

    /// Set the supervisor maintenance interval.
    ///
    /// # Errors
    ///
    /// Will return an error if the duration exceeds `u64::MAX` milliseconds
    pub fn maintenance_interval(mut self, interval: Duration) -> Result<Self> {
        self.config.supervisor.maintenance_interval_ms = millis(interval, "Maintenance interval")?;
        Ok(self)
    }

    /// Set how often a worker waiting for connections re-checks its generation.
    ///
    /// # Errors
    ///
    /// Will return an error if the duration exceeds `u64::MAX` milliseconds
    pub fn accept_poll_interval(mut self, interval: Duration) -> Result<Self> {
        self.config.supervisor.accept_poll_ms = millis(interval, "Accept poll interval")?;
        Ok(self)
    }

    /// Set the wait budget of each reclaim escalation stage.
    ///
    /// # Errors
    ///
    /// Will return an error if the duration exceeds `u64::MAX` milliseconds
    pub fn reclaim_stage_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.config.supervisor.reclaim_stage_ms = millis(timeout, "Reclaim stage timeout")?;
        Ok(self)
    }

    /// Enable or disable accept serialization.
    #[must_use]
    pub const fn serialize_accept(mut self, enabled: bool) -> Self {
        self.config.admission.serialize = enabled;
        self
    }

    /// Set the admission lock file.
    #[must_use]
    pub fn lock_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.admission.lock_file = Some(path.into());
        self
    }

    /// Set the PID file location.
    #[must_use]
    pub fn pid_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.pid_file = Some(path.into());
        self
    }

    /// Set where status table snapshots are persisted.
    #[must_use]
    pub fn scoreboard_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.scoreboard_file = Some(path.into());
        self
    }

    /// Set the log level.
    #[must_use]
    pub const fn log_level(mut self, level: LogLevel) -> Self {
        self.config.logging.level = level;
        self
    }

    /// Enable JSON logging.
    #[must_use]
    pub const fn json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Will return an error if the assembled configuration fails validation.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::new().unwrap();
        assert_eq!(config.name, "proc-prefork");
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.listen.backlog, 511);
        assert!(config.admission.serialize);
        assert_eq!(config.linger_timeout(), Duration::from_secs(30));
        assert_eq!(config.linger_poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_config_builder() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = Config::builder()
            .name("test-server")
            .worker_limit(8)
            .idle_workers(2, 4)
            .start_workers(2)
            .listen(addr)
            .request_timeout(Duration::from_secs(10))
            .unwrap()
            .keep_alive_timeout(Duration::from_secs(2))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(config.name, "test-server");
        assert_eq!(config.listen.addresses, vec![addr]);
        assert_eq!(config.workers.limit, 8);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.keep_alive_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.workers.limit = 0;
        assert!(config.validate().is_err());

        config.workers.limit = HARD_WORKER_LIMIT + 1;
        assert!(config.validate().is_err());

        config.workers.limit = HARD_WORKER_LIMIT;
        assert!(config.validate().is_ok());

        config.listen.addresses.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_free_clamped_above_min_free() {
        let config = Config::builder().idle_workers(5, 3).build().unwrap();
        assert_eq!(config.effective_max_free(), 6);

        let config = Config::builder().idle_workers(2, 4).build().unwrap();
        assert_eq!(config.effective_max_free(), 4);
    }

    #[test]
    fn test_start_count_clamped_to_limit() {
        let config = Config::builder()
            .worker_limit(3)
            .start_workers(10)
            .build()
            .unwrap();
        assert_eq!(config.effective_start(), 3);
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefork.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "name = \"from-file\"\n\n[workers]\nlimit = 12\nmin_free = 3\nmax_free = 6\n\n[listen]\naddresses = [\"127.0.0.1:7000\", \"127.0.0.1:7001\"]\nbacklog = 64"
        )
        .unwrap();

        let config = FileSource::new(&path).load().unwrap();
        assert_eq!(config.name, "from-file");
        assert_eq!(config.workers.limit, 12);
        assert_eq!(config.workers.min_free, 3);
        assert_eq!(config.listen.addresses.len(), 2);
        assert_eq!(config.listen.backlog, 64);
        // untouched sections keep their defaults
        assert_eq!(config.timeouts.keep_alive_ms, 15_000);
    }

    #[test]
    fn test_malformed_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[workers]\nlimit = \"many\"\n").unwrap();

        let err = Config::load_from_file(&path).unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(err.code(), ErrorCode::ConfigParse);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load_from_file("/nonexistent/prefork.toml").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigMissing);

        let source = FileSource::default();
        assert_eq!(source.path(), Path::new(crate::DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(tracing::Level::from(LogLevel::Info), tracing::Level::INFO);
        assert_eq!(tracing::Level::from(LogLevel::Error), tracing::Level::ERROR);
    }
}
