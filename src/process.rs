use crate::binder::ListenSocket;
use crate::config::WorkerPoolConfig;
use crate::error::SupervisorError;
use crate::protocol::{WorkerBootstrap, BOOTSTRAP_ENV};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

/// Supervisor-assigned worker identifier, unique for the supervisor's lifetime
pub type WorkerId = u64;

/// Lifecycle state of a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Spawned, has not reported ready yet
    Starting,
    /// Accepting and serving connections
    Ready,
    /// No longer accepting, finishing in-flight requests
    Draining,
    /// Gone; never leaves this state
    Terminated,
}

impl WorkerState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Starting, Ready)
                | (Starting, Terminated)
                | (Ready, Draining)
                | (Ready, Terminated)
                | (Draining, Terminated)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Draining => "draining",
            WorkerState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Why the supervisor gave up on a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossReason {
    /// The process exited on its own
    Exited(String),
    /// The protocol pipe closed while the process was still around
    PipeClosed,
    /// Never reported ready within the startup timeout
    StartupTimeout,
    /// Ready, but silent for longer than the heartbeat timeout
    HeartbeatTimeout,
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossReason::Exited(status) => write!(f, "exited ({})", status),
            LossReason::PipeClosed => f.write_str("closed its status pipe"),
            LossReason::StartupTimeout => f.write_str("did not become ready in time"),
            LossReason::HeartbeatTimeout => f.write_str("stopped sending heartbeats"),
        }
    }
}

/// One worker process as tracked by the supervisor
pub struct WorkerProcess {
    id: WorkerId,
    slot: usize,
    pid: Option<u32>,
    state: WorkerState,
    /// Absent once a stop has taken ownership of the process
    child: Option<Child>,
    /// Held open for the worker's lifetime; EOF tells it the supervisor is gone
    stdin: Option<ChildStdin>,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    last_heartbeat: Option<Instant>,
    /// Crash replacements of this worker's slot so far
    restarts: u32,
    in_flight: usize,
    served: u64,
    retire_requested: bool,
    replacement_pending: bool,
    stop_requested: bool,
    pipe_closed: bool,
}

impl WorkerProcess {
    pub fn new(id: WorkerId, slot: usize, mut child: Child, restarts: u32) -> Self {
        let stdin = child.stdin.take();
        Self {
            id,
            slot,
            pid: child.id(),
            state: WorkerState::Starting,
            child: Some(child),
            stdin,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            last_heartbeat: None,
            restarts,
            in_flight: 0,
            served: 0,
            retire_requested: false,
            replacement_pending: false,
            stop_requested: false,
            pipe_closed: false,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn started_wall(&self) -> DateTime<Utc> {
        self.started_wall
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn retire_requested(&self) -> bool {
        self.retire_requested
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn pipe_closed(&self) -> bool {
        self.pipe_closed
    }

    pub fn replacement_pending(&self) -> bool {
        self.replacement_pending
    }

    pub fn set_replacement_pending(&mut self, pending: bool) {
        self.replacement_pending = pending;
    }

    /// Counts toward pool capacity: alive and not on its way out
    pub fn is_serving(&self) -> bool {
        !self.stop_requested && matches!(self.state, WorkerState::Starting | WorkerState::Ready)
    }

    /// Apply a state transition; illegal ones are logged and ignored.
    pub fn transition(&mut self, next: WorkerState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            debug!(
                worker_id = self.id,
                from = %self.state,
                to = %next,
                "Ignoring illegal worker state transition"
            );
            return false;
        }
        self.state = next;
        true
    }

    pub fn record_ready(&mut self) -> bool {
        self.last_heartbeat = Some(Instant::now());
        self.transition(WorkerState::Ready)
    }

    pub fn record_heartbeat(&mut self, in_flight: usize, served: u64) {
        self.last_heartbeat = Some(Instant::now());
        self.in_flight = in_flight;
        self.served = served;
    }

    pub fn record_retire(&mut self, served: u64) {
        self.served = served;
        self.retire_requested = true;
    }

    pub fn record_draining(&mut self) -> bool {
        self.transition(WorkerState::Draining)
    }

    pub fn record_pipe_closed(&mut self) {
        self.pipe_closed = true;
    }

    /// Hand the process over to whoever stops it. Marks the worker as
    /// draining when it was ready.
    pub fn begin_stop(&mut self) -> Option<Child> {
        self.stop_requested = true;
        if self.state == WorkerState::Ready {
            self.transition(WorkerState::Draining);
        }
        self.stdin = None;
        self.child.take()
    }

    /// Decide whether this worker is lost. Workers being stopped are never
    /// reported.
    pub fn check(
        &mut self,
        now: Instant,
        startup_timeout: Duration,
        heartbeat_timeout: Duration,
    ) -> Option<LossReason> {
        if self.stop_requested || self.state == WorkerState::Terminated {
            return None;
        }

        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => return Some(LossReason::Exited(status.to_string())),
                Ok(None) => {}
                Err(e) => return Some(LossReason::Exited(format!("wait failed: {}", e))),
            }
        }

        if self.pipe_closed {
            return Some(LossReason::PipeClosed);
        }

        match self.state {
            WorkerState::Starting if now.duration_since(self.started_at) > startup_timeout => {
                Some(LossReason::StartupTimeout)
            }
            WorkerState::Ready => {
                let last = self.last_heartbeat.unwrap_or(self.started_at);
                (now.duration_since(last) > heartbeat_timeout).then_some(LossReason::HeartbeatTimeout)
            }
            _ => None,
        }
    }
}

/// Program and arguments used to launch a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-execute the running binary
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, Vec::new()))
    }

    /// Parse a shell-style command line
    pub fn parse(command: &str) -> anyhow::Result<Self> {
        let mut words = shell_words::split(command)
            .map_err(|e| anyhow::anyhow!("Invalid worker command '{}': {}", command, e))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| anyhow::anyhow!("Worker command must not be empty"))?;
        Ok(Self::new(program, words.collect()))
    }

    /// The configured command, or the current executable
    pub fn from_config(config: &WorkerPoolConfig) -> anyhow::Result<Self> {
        match config.command {
            Some(ref command) => Self::parse(command),
            None => Self::current_exe()
                .map_err(|e| anyhow::anyhow!("Cannot locate current executable: {}", e)),
        }
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Launch a worker that inherits `socket` and reads `bootstrap` from its
    /// environment. stdin and stdout are piped; stderr is shared with the
    /// supervisor.
    pub fn spawn(
        &self,
        socket: &ListenSocket,
        bootstrap: &WorkerBootstrap,
    ) -> Result<Child, SupervisorError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.env(BOOTSTRAP_ENV, bootstrap.to_env_value());
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        socket.install_in_child(&mut cmd);

        let child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        debug!(
            worker_id = bootstrap.worker_id,
            slot = bootstrap.slot,
            pid = child.id(),
            program = %self.program.display(),
            "Worker process spawned"
        );
        Ok(child)
    }
}

/// Send a signal to a process
pub fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Stop a worker process: SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Returns `true` if the process exited within the grace period.
pub async fn stop_process(worker_id: WorkerId, child: &mut Child, grace: Duration) -> bool {
    if let Some(pid) = child.id() {
        debug!(worker_id, pid, "Sending SIGTERM to worker");
        if let Err(e) = send_signal(pid, libc::SIGTERM) {
            debug!(worker_id, pid, error = %e, "SIGTERM failed");
        }
    }

    // Wait for the process to exit (with configurable grace period)
    let wait_result = tokio::time::timeout(grace, child.wait()).await;

    match wait_result {
        Ok(Ok(status)) => {
            info!(worker_id, %status, "Worker exited");
            true
        }
        Ok(Err(e)) => {
            warn!(worker_id, error = %e, "Error waiting for worker to exit");
            false
        }
        Err(_) => {
            warn!(
                worker_id,
                grace_ms = grace.as_millis() as u64,
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
            false
        }
    }
}
