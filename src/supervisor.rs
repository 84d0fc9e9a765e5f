//! The worker supervisor
//!
//! Owns the listen socket and a fixed number of worker slots. The monitor loop
//! ([`Supervisor::run`]) reaps dead, hung and stuck workers and refills their
//! slots, enforces the per-slot restart ceiling and executes control requests.
//! A reload runs as its own task so the sweep keeps going while it replaces
//! workers; shutdown stops it at the next slot.
//!
//! # Usage
//!
//! `Supervisor` is used behind an `Arc`; [`Supervisor::new`] returns one.
//!
//! ```ignore
//! let supervisor = Supervisor::new(config, WorkerCommand::current_exe()?);
//! supervisor.start().await?;
//! let (control_tx, control_rx) = mpsc::channel(16);
//! supervisor.run(control_rx).await?;
//! ```

use crate::binder::ListenSocket;
use crate::config::Config;
use crate::error::SupervisorError;
use crate::process::{stop_process, WorkerCommand, WorkerId, WorkerProcess, WorkerState};
use crate::protocol::{TlsFiles, WorkerBootstrap, WorkerMessage};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Grace given to workers when startup is aborted
const ABORT_GRACE_MS: u64 = 1000;

/// Extra time allowed for in-progress stops to finish during shutdown
const SHUTDOWN_SLACK_MS: u64 = 1000;

/// Requests delivered to the monitor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Replace every worker without dropping capacity
    Reload,
    /// Resize the pool to the given number of workers
    Scale(usize),
    /// Drain and stop every worker, then return
    Shutdown,
}

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Outcome of a rolling reload
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    /// Slots now served by a fresh worker
    pub replaced: usize,
    /// Slots that kept their old worker because the fresh one failed
    pub failed: usize,
}

/// Crash replacements of one slot inside a sliding window
#[derive(Debug, Clone)]
pub struct RestartHistory {
    max_restarts: u32,
    window: Duration,
    recent: VecDeque<Instant>,
    total: u32,
}

impl RestartHistory {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            recent: VecDeque::new(),
            total: 0,
        }
    }

    /// Record a restart at `now`. Returns the number of restarts inside the
    /// window, or `Err` with that number once the ceiling is exceeded.
    pub fn record(&mut self, now: Instant) -> Result<usize, usize> {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.push_back(now);
        self.total = self.total.saturating_add(1);

        let count = self.recent.len();
        if count > self.max_restarts as usize {
            Err(count)
        } else {
            Ok(count)
        }
    }

    /// Restarts since the supervisor started
    pub fn total(&self) -> u32 {
        self.total
    }
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub slot: usize,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub started_at: String,
    pub uptime_secs: u64,
    /// Milliseconds since the last ready/heartbeat message
    pub last_heartbeat_ms: Option<u64>,
    pub in_flight: usize,
    pub served: u64,
    pub restarts: u32,
    pub retiring: bool,
    pub stopping: bool,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub phase: Phase,
    pub listen: Option<String>,
    pub pool_size: usize,
    pub ready: usize,
    pub workers: Vec<WorkerStatus>,
}

/// Supervises the pool of worker processes
pub struct Supervisor {
    config: Config,
    command: WorkerCommand,
    log_filter: String,
    socket: Mutex<Option<ListenSocket>>,
    workers: DashMap<WorkerId, Mutex<WorkerProcess>>,
    restart_history: DashMap<usize, RestartHistory>,
    next_id: AtomicU64,
    pool_size: AtomicUsize,
    reloading: AtomicBool,
    phase: Mutex<Phase>,
    /// Bumped whenever a worker changes state
    events: watch::Sender<u64>,
}

impl Supervisor {
    pub fn new(config: Config, command: WorkerCommand) -> Arc<Self> {
        let (events, _) = watch::channel(0);
        Arc::new(Self {
            log_filter: config.server.log_filter(),
            pool_size: AtomicUsize::new(config.workers.count),
            config,
            command,
            socket: Mutex::new(None),
            workers: DashMap::new(),
            restart_history: DashMap::new(),
            next_id: AtomicU64::new(1),
            reloading: AtomicBool::new(false),
            phase: Mutex::new(Phase::Idle),
            events,
        })
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Address of the listen socket while it is open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().as_ref().map(|s| s.local_addr())
    }

    /// Target number of workers
    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::SeqCst)
    }

    pub fn reload_in_progress(&self) -> bool {
        self.reloading.load(Ordering::SeqCst)
    }

    /// Workers currently ready and not being stopped
    pub fn ready_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|e| {
                let w = e.value().lock();
                w.state() == WorkerState::Ready && !w.stop_requested()
            })
            .count()
    }

    /// Bind the listen socket, launch the pool and wait until every worker
    /// is ready. On failure every launched worker is stopped.
    pub async fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        {
            let mut phase = self.phase.lock();
            if *phase != Phase::Idle {
                return Err(SupervisorError::InvalidState("supervisor was already started"));
            }
            *phase = Phase::Starting;
        }

        let addr = self.config.server.bind_addr().map_err(|e| SupervisorError::Bind {
            addr: self.config.server.bind.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()),
        });
        let socket = match addr.and_then(|addr| ListenSocket::bind(addr, self.config.server.backlog)) {
            Ok(socket) => socket,
            Err(e) => {
                *self.phase.lock() = Phase::Stopped;
                return Err(e);
            }
        };
        let local_addr = socket.local_addr();
        *self.socket.lock() = Some(socket);

        let size = self.pool_size();
        let startup_timeout = self.config.workers.startup_timeout();
        let mut ids = Vec::with_capacity(size);
        for slot in 0..size {
            match self.spawn_worker(slot) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    error!(slot, error = %e, "Failed to launch worker");
                    self.abort_start().await;
                    return Err(SupervisorError::Startup(format!(
                        "failed to launch worker for slot {}: {}",
                        slot, e
                    )));
                }
            }
        }

        info!(
            workers = size,
            timeout_secs = startup_timeout.as_secs(),
            "Waiting for workers to become ready"
        );

        if let Err(failed) = self.wait_for_ready(&ids, startup_timeout).await {
            error!(failed = ?failed, total = size, "Workers failed to become ready");
            self.abort_start().await;
            return Err(SupervisorError::Startup(format!(
                "{} of {} workers did not become ready within {}s",
                failed.len(),
                size,
                startup_timeout.as_secs()
            )));
        }

        *self.phase.lock() = Phase::Running;
        info!(workers = size, addr = %local_addr, "Worker pool ready");
        Ok(())
    }

    async fn abort_start(&self) {
        let ids = self.worker_ids();
        self.stop_workers(ids, Duration::from_millis(ABORT_GRACE_MS)).await;
        self.close_socket();
        *self.phase.lock() = Phase::Stopped;
    }

    /// Monitor the pool until shutdown is requested or the restart ceiling
    /// is hit.
    pub async fn run(
        self: &Arc<Self>,
        mut control_rx: mpsc::Receiver<Control>,
    ) -> Result<(), SupervisorError> {
        if self.phase() != Phase::Running {
            return Err(SupervisorError::InvalidState("worker pool is not running"));
        }

        let grace = self.config.workers.graceful_timeout();
        let mut ticker = tokio::time::interval(self.config.workers.health_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events = self.events.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = events.changed() => {}
                control = control_rx.recv() => match control {
                    Some(Control::Reload) => {
                        let supervisor = Arc::clone(self);
                        tokio::spawn(async move { supervisor.reload().await });
                    }
                    Some(Control::Scale(n)) => {
                        if let Err(e) = self.scale(n) {
                            warn!(requested = n, error = %e, "Scale request rejected");
                        }
                    }
                    Some(Control::Shutdown) | None => {
                        self.shutdown(grace).await;
                        return Ok(());
                    }
                }
            }

            if let Err(e) = self.reap().await {
                error!(error = %e, "Worker pool exhausted, shutting down");
                self.shutdown(grace).await;
                return Err(e);
            }
        }
    }

    /// One health sweep: replace lost workers, refill empty slots and start
    /// rolling replacements for workers that asked to retire.
    async fn reap(self: &Arc<Self>) -> Result<(), SupervisorError> {
        if self.phase() != Phase::Running {
            return Ok(());
        }

        let now = Instant::now();
        let size = self.pool_size();
        let startup_timeout = self.config.workers.startup_timeout();
        let heartbeat_timeout = self.config.workers.heartbeat_timeout();

        let mut lost = Vec::new();
        let mut retiring = Vec::new();
        let mut surplus = Vec::new();
        for entry in self.workers.iter() {
            let mut worker = entry.value().lock();
            if worker.slot() >= size {
                if worker.is_serving() {
                    surplus.push((worker.id(), worker.slot()));
                }
                continue;
            }
            if let Some(reason) = worker.check(now, startup_timeout, heartbeat_timeout) {
                lost.push((worker.id(), worker.slot(), worker.pid(), reason));
            } else if worker.retire_requested()
                && worker.state() == WorkerState::Ready
                && worker.is_serving()
                && !worker.replacement_pending()
            {
                worker.set_replacement_pending(true);
                retiring.push((worker.id(), worker.slot()));
            }
        }

        for (id, slot, pid, reason) in lost {
            warn!(worker_id = id, slot, pid, %reason, "Worker lost");
            self.stop_worker(id, Duration::ZERO).await;
        }

        // Replacements that finished after the pool shrank
        for (id, slot) in surplus {
            info!(worker_id = id, slot, size, "Stopping worker outside the pool");
            self.stop_in_background(id, self.config.workers.graceful_timeout());
        }

        for slot in 0..size {
            if self.slot_is_served(slot) {
                continue;
            }
            let restarts = self.record_restart(slot, now)?;
            info!(slot, restarts, "Replacing worker");
            if let Err(e) = self.spawn_worker(slot) {
                error!(slot, error = %e, "Failed to launch replacement worker");
            }
        }

        for (id, slot) in retiring {
            let supervisor = Arc::clone(self);
            tokio::spawn(async move { supervisor.retire(id, slot).await });
        }

        Ok(())
    }

    fn record_restart(&self, slot: usize, now: Instant) -> Result<usize, SupervisorError> {
        let mut history = self.restart_history.entry(slot).or_insert_with(|| {
            RestartHistory::new(
                self.config.workers.max_restarts,
                self.config.workers.restart_window(),
            )
        });

        history.record(now).map_err(|restarts| {
            error!(
                slot,
                restarts,
                window_secs = self.config.workers.restart_window_secs,
                "Restart ceiling exceeded"
            );
            SupervisorError::PoolExhausted {
                slot,
                restarts,
                window: self.config.workers.restart_window(),
            }
        })
    }

    async fn retire(self: &Arc<Self>, id: WorkerId, slot: usize) {
        info!(worker_id = id, slot, "Retiring worker");
        match self.replace_worker(id, slot).await {
            Ok(new_id) => info!(worker_id = id, replacement = new_id, slot, "Worker retired"),
            Err(e) => {
                warn!(worker_id = id, slot, error = %e, "Retirement failed, keeping worker");
                self.release_replacement(id);
            }
        }
    }

    /// Replace every worker one slot at a time. A slot whose fresh worker
    /// fails keeps its old worker. Only one reload runs at a time; a request
    /// made while one is running is ignored.
    pub async fn reload(self: &Arc<Self>) -> ReloadReport {
        let mut report = ReloadReport::default();
        if self.phase() != Phase::Running {
            warn!("Reload ignored, worker pool is not running");
            return report;
        }
        if self.reloading.swap(true, Ordering::SeqCst) {
            warn!("Reload ignored, a reload is already running");
            return report;
        }

        let mut targets: Vec<(usize, WorkerId)> = self
            .workers
            .iter()
            .filter_map(|e| {
                let w = e.value().lock();
                w.is_serving().then(|| (w.slot(), w.id()))
            })
            .collect();
        targets.sort_unstable();

        info!(workers = targets.len(), "Reloading worker pool");

        for (slot, old_id) in targets {
            if self.phase() != Phase::Running {
                break;
            }
            if !self.claim_replacement(old_id) {
                debug!(worker_id = old_id, slot, "Worker already being replaced, skipping");
                continue;
            }

            match self.replace_worker(old_id, slot).await {
                Ok(new_id) => {
                    report.replaced += 1;
                    info!(slot, worker_id = old_id, replacement = new_id, "Slot reloaded");
                }
                Err(e) => {
                    report.failed += 1;
                    self.release_replacement(old_id);
                    error!(slot, worker_id = old_id, error = %e, "Reload failed for slot, keeping old worker");
                }
            }
        }

        self.reloading.store(false, Ordering::SeqCst);
        info!(replaced = report.replaced, failed = report.failed, "Reload finished");
        report
    }

    /// Start a fresh worker in `slot`, wait until it is ready, then drain the
    /// old one in the background.
    async fn replace_worker(
        self: &Arc<Self>,
        old_id: WorkerId,
        slot: usize,
    ) -> Result<WorkerId, SupervisorError> {
        let new_id = self.spawn_worker(slot)?;
        let startup_timeout = self.config.workers.startup_timeout();

        if self.wait_for_ready(&[new_id], startup_timeout).await.is_err() {
            self.stop_worker(new_id, Duration::ZERO).await;
            return Err(SupervisorError::Startup(format!(
                "replacement worker {} for slot {} did not become ready within {}s",
                new_id,
                slot,
                startup_timeout.as_secs()
            )));
        }

        if self.phase() != Phase::Running {
            self.stop_worker(new_id, Duration::ZERO).await;
            return Err(SupervisorError::InvalidState("worker pool is shutting down"));
        }

        self.stop_in_background(old_id, self.config.workers.graceful_timeout());
        Ok(new_id)
    }

    fn claim_replacement(&self, id: WorkerId) -> bool {
        match self.workers.get(&id) {
            Some(entry) => {
                let mut worker = entry.lock();
                if !worker.is_serving() || worker.replacement_pending() {
                    return false;
                }
                worker.set_replacement_pending(true);
                true
            }
            None => false,
        }
    }

    fn release_replacement(&self, id: WorkerId) {
        if let Some(entry) = self.workers.get(&id) {
            entry.lock().set_replacement_pending(false);
        }
    }

    /// Resize the pool. Growing launches workers in new slots; shrinking
    /// drains the workers of the highest slots. Returns the previous size.
    pub fn scale(self: &Arc<Self>, size: usize) -> Result<usize, SupervisorError> {
        if size == 0 {
            return Err(SupervisorError::InvalidState("pool size must be at least 1"));
        }
        if self.phase() != Phase::Running {
            return Err(SupervisorError::InvalidState("worker pool is not running"));
        }

        let previous = self.pool_size.swap(size, Ordering::SeqCst);
        if size > previous {
            info!(from = previous, to = size, "Growing worker pool");
            for slot in previous..size {
                if let Err(e) = self.spawn_worker(slot) {
                    error!(slot, error = %e, "Failed to launch worker");
                }
            }
        } else if size < previous {
            info!(from = previous, to = size, "Shrinking worker pool");
            let surplus: Vec<WorkerId> = self
                .workers
                .iter()
                .filter_map(|e| {
                    let w = e.value().lock();
                    (w.slot() >= size).then(|| w.id())
                })
                .collect();
            for id in surplus {
                self.stop_in_background(id, self.config.workers.graceful_timeout());
            }
            self.restart_history.retain(|slot, _| *slot < size);
        }

        self.notify();
        Ok(previous)
    }

    /// Drain every worker, wait up to `grace`, kill stragglers, then close
    /// the listen socket.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut phase = self.phase.lock();
            if matches!(*phase, Phase::Stopping | Phase::Stopped) {
                return;
            }
            *phase = Phase::Stopping;
        }

        let ids = self.worker_ids();
        info!(
            workers = ids.len(),
            grace_secs = grace.as_secs(),
            "Shutting down worker pool"
        );
        self.stop_workers(ids, grace).await;

        // Stops started earlier by reload, retirement or scaling finish on their own
        let slack = grace + Duration::from_millis(SHUTDOWN_SLACK_MS);
        if !self.wait_until(slack, |s| s.workers.is_empty()).await {
            let leftover = self.worker_ids();
            warn!(workers = leftover.len(), "Killing workers that outlived shutdown");
            self.stop_workers(leftover, Duration::ZERO).await;
        }

        self.close_socket();
        *self.phase.lock() = Phase::Stopped;
        info!("Worker pool stopped");
    }

    /// Snapshot of the pool for health reporting
    pub fn status(&self) -> PoolStatus {
        let now = Instant::now();
        let mut workers: Vec<WorkerStatus> = self
            .workers
            .iter()
            .map(|e| {
                let w = e.value().lock();
                WorkerStatus {
                    id: w.id(),
                    slot: w.slot(),
                    pid: w.pid(),
                    state: w.state(),
                    started_at: w.started_wall().to_rfc3339(),
                    uptime_secs: w.uptime().as_secs(),
                    last_heartbeat_ms: w
                        .last_heartbeat()
                        .map(|t| now.saturating_duration_since(t).as_millis() as u64),
                    in_flight: w.in_flight(),
                    served: w.served(),
                    restarts: w.restarts(),
                    retiring: w.retire_requested(),
                    stopping: w.stop_requested(),
                }
            })
            .collect();
        workers.sort_by_key(|w| (w.slot, w.id));

        PoolStatus {
            phase: self.phase(),
            listen: self.local_addr().map(|a| a.to_string()),
            pool_size: self.pool_size(),
            ready: workers
                .iter()
                .filter(|w| w.state == WorkerState::Ready && !w.stopping)
                .count(),
            workers,
        }
    }

    fn notify(&self) {
        self.events.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|e| *e.key()).collect()
    }

    fn slot_is_served(&self, slot: usize) -> bool {
        self.workers.iter().any(|e| {
            let w = e.value().lock();
            w.slot() == slot && w.is_serving()
        })
    }

    fn close_socket(&self) {
        let socket = self.socket.lock().take();
        if let Some(socket) = socket {
            socket.close();
        }
    }

    fn bootstrap(&self, worker_id: WorkerId, slot: usize) -> WorkerBootstrap {
        let server = &self.config.server;
        let workers = &self.config.workers;
        WorkerBootstrap {
            worker_id,
            slot,
            listen_fd: crate::binder::LISTEN_FD,
            heartbeat_interval_ms: workers.heartbeat_interval().as_millis() as u64,
            graceful_timeout_ms: workers.graceful_timeout().as_millis() as u64,
            max_requests: workers.max_requests,
            max_requests_jitter: workers.max_requests_jitter,
            dispatch: self.config.dispatch.clone(),
            tls: match (&server.tls_cert, &server.tls_key) {
                (Some(cert), Some(key)) => Some(TlsFiles {
                    cert: cert.clone(),
                    key: key.clone(),
                }),
                _ => None,
            },
            log_filter: self.log_filter.clone(),
        }
    }

    fn spawn_worker(self: &Arc<Self>, slot: usize) -> Result<WorkerId, SupervisorError> {
        if matches!(self.phase(), Phase::Stopping | Phase::Stopped) {
            return Err(SupervisorError::InvalidState("worker pool is shutting down"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let bootstrap = self.bootstrap(id, slot);

        let mut child = {
            let socket = self.socket.lock();
            let socket = socket
                .as_ref()
                .ok_or(SupervisorError::InvalidState("listen socket is closed"))?;
            self.command.spawn(socket, &bootstrap)?
        };

        let stdout = child.stdout.take();
        let restarts = self
            .restart_history
            .get(&slot)
            .map(|h| h.total())
            .unwrap_or(0);
        let worker = WorkerProcess::new(id, slot, child, restarts);
        let pid = worker.pid();
        self.workers.insert(id, Mutex::new(worker));

        if let Some(stdout) = stdout {
            self.spawn_reader(id, stdout);
        }

        info!(worker_id = id, slot, pid, "Worker started");
        self.notify();
        Ok(id)
    }

    fn spawn_reader(self: &Arc<Self>, id: WorkerId, stdout: ChildStdout) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => supervisor.handle_line(id, &line),
                    Ok(None) => break,
                    Err(e) => {
                        debug!(worker_id = id, error = %e, "Failed to read worker output");
                        break;
                    }
                }
            }

            if let Some(entry) = supervisor.workers.get(&id) {
                entry.lock().record_pipe_closed();
            }
            supervisor.notify();
        });
    }

    fn handle_line(&self, id: WorkerId, line: &str) {
        let message = match WorkerMessage::from_line(line) {
            Ok(message) => message,
            Err(_) => {
                debug!(worker_id = id, line, "Ignoring non-protocol worker output");
                return;
            }
        };

        let changed = {
            let Some(entry) = self.workers.get(&id) else {
                return;
            };
            let mut worker = entry.lock();
            match message {
                WorkerMessage::Ready => {
                    let became_ready = worker.record_ready();
                    if became_ready {
                        info!(
                            worker_id = id,
                            slot = worker.slot(),
                            pid = worker.pid(),
                            startup_ms = worker.uptime().as_millis() as u64,
                            "Worker ready"
                        );
                    }
                    became_ready
                }
                WorkerMessage::Heartbeat { in_flight, served } => {
                    worker.record_heartbeat(in_flight, served);
                    false
                }
                WorkerMessage::Retire { served } => {
                    info!(worker_id = id, served, "Worker asked to retire");
                    worker.record_retire(served);
                    true
                }
                WorkerMessage::Draining => {
                    let draining = worker.record_draining();
                    if draining && !worker.stop_requested() {
                        info!(worker_id = id, "Worker started draining on its own");
                    }
                    draining
                }
            }
        };

        if changed {
            self.notify();
        }
    }

    /// `Some(true)` once ready, `Some(false)` once it can no longer become
    /// ready, `None` while still starting.
    fn ready_outcome(&self, id: WorkerId) -> Option<bool> {
        let entry = match self.workers.get(&id) {
            Some(entry) => entry,
            None => return Some(false),
        };
        let worker = entry.lock();
        match worker.state() {
            WorkerState::Ready => Some(true),
            WorkerState::Starting if !worker.pipe_closed() && !worker.stop_requested() => None,
            _ => Some(false),
        }
    }

    /// Wait until every worker in `ids` is ready. Returns the ones that
    /// failed or timed out.
    async fn wait_for_ready(&self, ids: &[WorkerId], timeout: Duration) -> Result<(), Vec<WorkerId>> {
        self.wait_until(timeout, |s| ids.iter().all(|id| s.ready_outcome(*id).is_some()))
            .await;

        let failed: Vec<WorkerId> = ids
            .iter()
            .copied()
            .filter(|id| self.ready_outcome(*id) != Some(true))
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(failed)
        }
    }

    async fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        let mut events = self.events.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            match tokio::time::timeout_at(deadline, events.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return condition(self),
            }
        }
    }

    fn begin_stop(&self, id: WorkerId) -> Option<Child> {
        let child = self.workers.get(&id).and_then(|entry| entry.lock().begin_stop());
        self.notify();
        child
    }

    async fn finish_stop(&self, id: WorkerId, mut child: Child, grace: Duration) {
        stop_process(id, &mut child, grace).await;

        if let Some((_, worker)) = self.workers.remove(&id) {
            let mut worker = worker.into_inner();
            worker.transition(WorkerState::Terminated);
            debug!(worker_id = id, slot = worker.slot(), "Worker removed from pool");
        }
        self.notify();
    }

    /// Stop a worker and wait for it. A worker already being stopped is left
    /// to whoever started that stop.
    async fn stop_worker(&self, id: WorkerId, grace: Duration) {
        if let Some(child) = self.begin_stop(id) {
            self.finish_stop(id, child, grace).await;
        }
    }

    fn stop_in_background(self: &Arc<Self>, id: WorkerId, grace: Duration) {
        if let Some(child) = self.begin_stop(id) {
            let supervisor = Arc::clone(self);
            tokio::spawn(async move { supervisor.finish_stop(id, child, grace).await });
        }
    }

    async fn stop_workers(&self, ids: Vec<WorkerId>, grace: Duration) {
        futures::future::join_all(ids.into_iter().map(|id| self.stop_worker(id, grace))).await;
    }
}
