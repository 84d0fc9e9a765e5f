//! Worker process runtime
//!
//! A worker adopts the listen socket it inherited from the supervisor, runs
//! one [`Dispatcher`] on a single-threaded Tokio runtime and reports to the
//! supervisor over stdout. It drains and exits when it receives SIGTERM or
//! SIGINT, or when its stdin reaches EOF because the supervisor went away.

use crate::app::Application;
use crate::binder::inherited_listener;
use crate::dispatcher::{Dispatcher, WorkerStats};
use crate::protocol::{WorkerBootstrap, WorkerMessage};
use crate::tls;
use rand::Rng;
use std::io::{Read, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, Instrument};

/// How long to wait for the runtime to wind down after draining
const RUNTIME_SHUTDOWN_TIMEOUT_MS: u64 = 500;

/// Run a worker until it has drained. Never returns early on request errors.
pub fn run_worker(bootstrap: WorkerBootstrap, app: Arc<dyn Application>) -> ExitCode {
    init_logging(&bootstrap.log_filter);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to build worker runtime");
            return ExitCode::FAILURE;
        }
    };

    let span = info_span!(
        "worker",
        id = bootstrap.worker_id,
        slot = bootstrap.slot,
        pid = std::process::id()
    );

    let result = runtime.block_on(serve(bootstrap, app).instrument(span));
    runtime.shutdown_timeout(Duration::from_millis(RUNTIME_SHUTDOWN_TIMEOUT_MS));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Worker failed");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(filter: &str) {
    // stdout carries the supervisor protocol
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .try_init();
}

async fn serve(bootstrap: WorkerBootstrap, app: Arc<dyn Application>) -> anyhow::Result<()> {
    let listener = inherited_listener(bootstrap.listen_fd).map_err(|e| {
        anyhow::anyhow!(
            "Failed to adopt listen socket (fd {}): {}",
            bootstrap.listen_fd,
            e
        )
    })?;

    let tls_acceptor = match bootstrap.tls {
        Some(ref files) => Some(tls::acceptor(&files.cert, &files.key)?),
        None => None,
    };

    let dispatcher = Dispatcher::new(app, bootstrap.dispatch.clone());
    let stats = dispatcher.stats();

    let (drain_tx, drain_rx) = watch::channel(false);
    let drain = Arc::new(DrainTrigger { drain_tx });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let signal_drain = Arc::clone(&drain);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => signal_drain.fire("SIGTERM"),
            _ = sigint.recv() => signal_drain.fire("SIGINT"),
        }
    });

    watch_stdin(Arc::clone(&drain));

    let retire_at = retire_threshold(bootstrap.max_requests, bootstrap.max_requests_jitter);
    let heartbeat = tokio::spawn(heartbeat_loop(
        Arc::clone(&stats),
        bootstrap.heartbeat_interval(),
        retire_at,
    ));

    report(&WorkerMessage::Ready);
    info!(
        addr = ?listener.local_addr().ok(),
        tls = tls_acceptor.is_some(),
        retire_at,
        "Worker ready"
    );

    let outcome = dispatcher
        .serve(listener, tls_acceptor, drain_rx, bootstrap.graceful_timeout())
        .await;

    heartbeat.abort();

    info!(
        completed = outcome.completed,
        aborted = outcome.aborted,
        served = stats.served(),
        faults = stats.faults(),
        "Worker exiting"
    );

    Ok(())
}

/// Flips the drain flag once and tells the supervisor
struct DrainTrigger {
    drain_tx: watch::Sender<bool>,
}

impl DrainTrigger {
    fn fire(&self, reason: &str) {
        if !self.drain_tx.send_replace(true) {
            info!(reason, "Draining");
            report(&WorkerMessage::Draining);
        }
    }
}

/// Treat EOF on stdin as a drain request: the supervisor holds the other end
/// and only closes it by exiting.
fn watch_stdin(drain: Arc<DrainTrigger>) {
    let spawned = std::thread::Builder::new()
        .name("stdin-watch".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = [0u8; 256];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
            drain.fire("supervisor pipe closed");
        });

    if let Err(e) = spawned {
        error!(error = %e, "Failed to start stdin watcher");
    }
}

async fn heartbeat_loop(stats: Arc<WorkerStats>, interval: Duration, retire_at: Option<u64>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut retire_sent = false;

    loop {
        ticker.tick().await;

        let served = stats.served();
        report(&WorkerMessage::Heartbeat {
            in_flight: stats.in_flight(),
            served,
        });

        if let Some(limit) = retire_at {
            if !retire_sent && served >= limit {
                info!(served, limit, "Request limit reached, asking to retire");
                report(&WorkerMessage::Retire { served });
                retire_sent = true;
            }
        }
    }
}

/// Request count after which this worker asks to be replaced
fn retire_threshold(max_requests: u64, jitter: u64) -> Option<u64> {
    if max_requests == 0 {
        return None;
    }
    let extra = if jitter > 0 {
        rand::thread_rng().gen_range(0..=jitter)
    } else {
        0
    };
    Some(max_requests.saturating_add(extra))
}

/// Write one protocol line to stdout. A broken pipe means the supervisor is
/// gone, which the stdin watcher turns into a drain.
fn report(message: &WorkerMessage) {
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = stdout
        .write_all(message.to_line().as_bytes())
        .and_then(|_| stdout.flush())
    {
        debug!(error = %e, ?message, "Failed to report to supervisor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retire_threshold_disabled() {
        assert_eq!(retire_threshold(0, 100), None);
    }

    #[test]
    fn test_retire_threshold_without_jitter() {
        assert_eq!(retire_threshold(500, 0), Some(500));
    }

    #[test]
    fn test_retire_threshold_jitter_range() {
        for _ in 0..100 {
            let limit = retire_threshold(1000, 50).unwrap();
            assert!((1000..=1050).contains(&limit));
        }
    }

    #[test]
    fn test_drain_trigger_fires_once() {
        let (drain_tx, drain_rx) = watch::channel(false);
        let trigger = DrainTrigger { drain_tx };

        trigger.fire("first");
        assert!(*drain_rx.borrow());
        trigger.fire("second");
        assert!(*drain_rx.borrow());
    }
}
