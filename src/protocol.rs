//! Supervisor/worker protocol.
//!
//! Workers report to the supervisor with newline-delimited JSON on stdout.
//! The supervisor configures a worker through a single environment variable
//! holding a JSON [`WorkerBootstrap`].

use crate::config::DispatchConfig;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Environment variable that marks a process as a worker
pub const BOOTSTRAP_ENV: &str = "PREFORK_WORKER";

/// Message from worker to supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Listener adopted, accept loop running.
    Ready,

    /// Periodic liveness report.
    Heartbeat {
        /// Requests currently being handled
        in_flight: usize,
        /// Requests served since start
        served: u64,
    },

    /// Request limit reached; the worker wants a replacement.
    Retire {
        /// Requests served since start
        served: u64,
    },

    /// The worker stopped accepting new connections.
    Draining,
}

impl WorkerMessage {
    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("WorkerMessage serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// TLS material paths handed to workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsFiles {
    pub cert: String,
    pub key: String,
}

/// Everything a worker needs to know at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerBootstrap {
    /// Unique id assigned by the supervisor
    pub worker_id: u64,
    /// Pool slot the worker occupies
    pub slot: usize,
    /// Descriptor of the inherited listen socket
    pub listen_fd: RawFd,
    /// Interval between heartbeat messages
    pub heartbeat_interval_ms: u64,
    /// Time to finish in-flight requests once draining
    pub graceful_timeout_ms: u64,
    /// Requests after which the worker asks to retire (0 = never)
    pub max_requests: u64,
    /// Upper bound of the random amount added to `max_requests`
    #[serde(default)]
    pub max_requests_jitter: u64,
    /// Request handling settings
    pub dispatch: DispatchConfig,
    /// Optional TLS termination
    pub tls: Option<TlsFiles>,
    /// Log filter directive
    pub log_filter: String,
}

impl WorkerBootstrap {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    /// Serialize for the bootstrap environment variable.
    pub fn to_env_value(&self) -> String {
        serde_json::to_string(self).expect("WorkerBootstrap serialization failed")
    }

    /// Read the bootstrap from the environment.
    ///
    /// Returns `Ok(None)` when this process is not a worker.
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        match std::env::var(BOOTSTRAP_ENV) {
            Ok(value) => Self::from_env_value(&value).map(Some),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Invalid {}: {}", BOOTSTRAP_ENV, e)),
        }
    }

    pub fn from_env_value(value: &str) -> anyhow::Result<Self> {
        serde_json::from_str(value)
            .map_err(|e| anyhow::anyhow!("Invalid {} value: {}", BOOTSTRAP_ENV, e))
    }
}
