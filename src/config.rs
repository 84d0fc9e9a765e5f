use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the server
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener, admin API and process-level settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker pool settings
    #[serde(default)]
    pub workers: WorkerPoolConfig,

    /// Per-worker request handling settings
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the shared listen socket binds to (default: 0.0.0.0:8000)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen backlog depth
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Port for the admin API on 127.0.0.1 (0 disables it)
    #[serde(default)]
    pub admin_port: u16,

    /// Authentication token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn admin_enabled(&self) -> bool {
        self.admin_port > 0
    }

    /// Tracing filter directive for `log_level`
    ///
    /// `warning` and `critical` are accepted as aliases of `warn` and `error`.
    pub fn log_directive(&self) -> String {
        let level = match self.log_level.as_str() {
            "warning" => "warn",
            "critical" => "error",
            other => other,
        };
        format!("{level},prefork={level}")
    }

    /// Effective log filter: `RUST_LOG` when set, else [`log_directive`](Self::log_directive)
    pub fn log_filter(&self) -> String {
        std::env::var("RUST_LOG")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.log_directive())
    }

    /// Parsed bind address
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.bind, e))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            backlog: default_backlog(),
            admin_port: 0,
            admin_token: None,
            pid_file: None,
            log_level: default_log_level(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker processes (default: available CPUs)
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Time a new worker has to report ready
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Time draining workers get to finish in-flight requests before SIGKILL
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout_secs: u64,

    /// Interval between health sweeps of the pool
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// Silence after which a ready worker is presumed hung and replaced
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Crash replacements allowed per slot within `restart_window_secs`
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Sliding window for counting crash replacements
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,

    /// Recycle a worker after this many requests (0 = never)
    #[serde(default)]
    pub max_requests: u64,

    /// Random extra requests added to `max_requests` per worker
    #[serde(default)]
    pub max_requests_jitter: u64,

    /// Command used to launch workers (default: the current executable)
    pub command: Option<String>,
}

impl WorkerPoolConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    /// Interval at which workers report liveness: a few reports per health
    /// sweep so a single lost line never trips the heartbeat timeout.
    pub fn heartbeat_interval(&self) -> Duration {
        let interval = self.health_interval() / 2;
        interval.clamp(Duration::from_millis(100), Duration::from_secs(5))
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            startup_timeout_secs: default_startup_timeout(),
            graceful_timeout_secs: default_graceful_timeout(),
            health_interval_secs: default_health_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window(),
            max_requests: 0,
            max_requests_jitter: 0,
            command: None,
        }
    }
}

/// Request handling settings, shipped to every worker at spawn time
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Max time for the application to produce a response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Time to wait for the next request on a keep-alive connection
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Emit one log line per request
    #[serde(default = "default_access_log")]
    pub access_log: bool,

    /// Include fault details in error response bodies
    #[serde(default)]
    pub verbose_errors: bool,
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            keep_alive_secs: default_keep_alive(),
            access_log: default_access_log(),
            verbose_errors: false,
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_backlog() -> u32 {
    2048
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "warning", "error", "critical"];

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_graceful_timeout() -> u64 {
    30
}

fn default_health_interval() -> u64 {
    5
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_window() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    30
}

fn default_keep_alive() -> u64 {
    5
}

fn default_access_log() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Load a file and apply overrides from an arbitrary environment source
    pub fn load_with_env<P, F>(path: P, lookup: F) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration from defaults and the environment only (no file)
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the container environment contract on top of file settings.
    ///
    /// `BIND` wins over `HOST`/`PORT`; either of the latter alone replaces only
    /// its half of the current bind address.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WEB_CONCURRENCY") {
            self.workers.count = parse_env("WEB_CONCURRENCY", &v)?;
        }

        if let Some(bind) = lookup("BIND") {
            self.server.bind = bind;
        } else {
            let host = lookup("HOST");
            let port = lookup("PORT");
            if host.is_some() || port.is_some() {
                let (cur_host, cur_port) = self
                    .server
                    .bind
                    .rsplit_once(':')
                    .map(|(h, p)| (h.to_string(), p.to_string()))
                    .unwrap_or_else(|| (self.server.bind.clone(), "8000".to_string()));
                let port = match port {
                    Some(p) => parse_env::<u16>("PORT", &p)?.to_string(),
                    None => cur_port,
                };
                self.server.bind = format!("{}:{}", host.unwrap_or(cur_host), port);
            }
        }

        if let Some(v) = lookup("GRACEFUL_TIMEOUT") {
            self.workers.graceful_timeout_secs = parse_env("GRACEFUL_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("TIMEOUT") {
            self.workers.heartbeat_timeout_secs = parse_env("TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("KEEP_ALIVE") {
            self.dispatch.keep_alive_secs = parse_env("KEEP_ALIVE", &v)?;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.server.log_level = v.trim().to_lowercase();
        }

        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.workers.count == 0 {
            errors.push("'workers.count' must be greater than 0".to_string());
        }
        if self.workers.health_interval_secs == 0 {
            errors.push("'workers.health_interval_secs' must be greater than 0".to_string());
        }
        if self.workers.startup_timeout_secs == 0 {
            errors.push("'workers.startup_timeout_secs' must be greater than 0".to_string());
        }
        if self.workers.heartbeat_timeout_secs < self.workers.health_interval_secs {
            errors.push(
                "'workers.heartbeat_timeout_secs' must not be shorter than 'workers.health_interval_secs'"
                    .to_string(),
            );
        }
        if !LOG_LEVELS.contains(&self.server.log_level.as_str()) {
            errors.push(format!(
                "'server.log_level' must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.server.log_level
            ));
        }
        if self.dispatch.request_timeout_secs == 0 {
            errors.push("'dispatch.request_timeout_secs' must be greater than 0".to_string());
        }
        if self.dispatch.keep_alive_secs == 0 {
            errors.push("'dispatch.keep_alive_secs' must be greater than 0".to_string());
        }
        if let Err(e) = self.server.bind_addr() {
            errors.push(e.to_string());
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("'server.tls_cert' and 'server.tls_key' must be set together".to_string());
        }
        if let Some(ref command) = self.workers.command {
            match shell_words::split(command) {
                Ok(words) if words.is_empty() => {
                    errors.push("'workers.command' must not be empty".to_string())
                }
                Ok(_) => {}
                Err(e) => errors.push(format!("'workers.command' is not valid: {}", e)),
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn parse_env<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}='{}': {}", key, value, e))
}
