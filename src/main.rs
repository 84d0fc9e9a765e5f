use prefork::admin::{AdminServer, PKG_NAME, VERSION};
use prefork::config::Config;
use prefork::demo::DemoApp;
use prefork::error::SupervisorError;
use prefork::process::WorkerCommand;
use prefork::protocol::WorkerBootstrap;
use prefork::supervisor::{Control, Supervisor};
use prefork::{tls, worker};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Default configuration file, used only if it exists
const DEFAULT_CONFIG_PATH: &str = "prefork.toml";

/// Time the admin server gets to stop after the pool is down
const ADMIN_STOP_TIMEOUT_SECS: u64 = 5;

fn main() -> ExitCode {
    // Workers are re-executions of this binary with a bootstrap in the environment
    match WorkerBootstrap::from_env() {
        Ok(Some(bootstrap)) => return worker::run_worker(bootstrap, Arc::new(DemoApp::new())),
        Ok(None) => {}
        Err(e) => {
            eprintln!("{}: {:#}", PKG_NAME, e);
            return ExitCode::FAILURE;
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: failed to build runtime: {}", PKG_NAME, e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run_supervisor()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<SupervisorError>()
                .map(SupervisorError::exit_code)
                .unwrap_or(1);
            error!(error = %format!("{:#}", e), exit_code = code, "Exiting with error");
            ExitCode::from(code)
        }
    }
}

fn init_logging(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .try_init();
}

fn load_config() -> anyhow::Result<(Config, Option<PathBuf>)> {
    match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load {}: {:#}", path.display(), e))?;
            Ok((config, Some(path)))
        }
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if path.exists() {
                let config = Config::load(&path)
                    .map_err(|e| anyhow::anyhow!("Failed to load {}: {:#}", path.display(), e))?;
                Ok((config, Some(path)))
            } else {
                Ok((Config::from_env()?, None))
            }
        }
    }
}

async fn run_supervisor() -> anyhow::Result<()> {
    let (config, config_path) = match load_config() {
        Ok(loaded) => loaded,
        Err(e) => {
            init_logging("info");
            return Err(e);
        }
    };

    init_logging(&config.server.log_filter());

    match config_path {
        Some(ref path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("No configuration file, using defaults and environment"),
    }

    print_startup_banner(&config);

    // Fail before forking anything if the certificate cannot be used
    if let (Some(cert), Some(key)) = (&config.server.tls_cert, &config.server.tls_key) {
        tls::acceptor(cert, key)?;
        info!(cert = %cert, "TLS certificate loaded");
    }

    // Write PID file if configured (with exclusive lock)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let result = serve(config).await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    if result.is_ok() {
        info!("Shutdown complete");
    }
    result
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let command = WorkerCommand::from_config(&config.workers)?;
    debug!(program = %command.program().display(), args = ?command.args(), "Worker command");

    let admin = if config.server.admin_enabled() {
        let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid admin bind address: {}", e))?;

        // Generate or use configured admin token
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });
        Some((admin_addr, admin_token))
    } else {
        None
    };

    let supervisor = Supervisor::new(config, command);
    supervisor.start().await?;

    let (control_tx, control_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_handle = admin.map(|(addr, token)| {
        let server = AdminServer::new(
            addr,
            Arc::clone(&supervisor),
            control_tx.clone(),
            shutdown_rx,
            token,
        );
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Admin server error");
            }
        })
    });

    let monitor = Arc::clone(&supervisor);
    let mut run_handle = tokio::spawn(async move { monitor.run(control_rx).await });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigttin = signal(SignalKind::from_raw(libc::SIGTTIN))?;
    let mut sigttou = signal(SignalKind::from_raw(libc::SIGTTOU))?;

    let outcome = loop {
        let control = tokio::select! {
            joined = &mut run_handle => break joined,
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                Control::Shutdown
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                Control::Shutdown
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading workers...");
                Control::Reload
            }
            _ = sigttin.recv() => {
                let size = supervisor.pool_size() + 1;
                info!(size, "Received SIGTTIN, adding a worker");
                Control::Scale(size)
            }
            _ = sigttou.recv() => {
                let size = supervisor.pool_size();
                if size <= 1 {
                    warn!("Received SIGTTOU, pool is already at one worker");
                    continue;
                }
                info!(size = size - 1, "Received SIGTTOU, removing a worker");
                Control::Scale(size - 1)
            }
        };

        if control_tx.send(control).await.is_err() {
            debug!(?control, "Supervisor no longer accepts control requests");
        }
    };

    // Stop admin server
    let _ = shutdown_tx.send(true);
    if let Some(handle) = admin_handle {
        let _ = tokio::time::timeout(Duration::from_secs(ADMIN_STOP_TIMEOUT_SECS), handle).await;
    }

    match outcome {
        Ok(result) => result.map_err(Into::into),
        Err(e) => Err(anyhow::anyhow!("Supervisor task failed: {}", e)),
    }
}

/// PID file handle that maintains an exclusive lock
struct PidFile {
    _file: std::fs::File,
}

impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Write PID
        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting prefork server");
    info!(
        bind = %config.server.bind,
        backlog = config.server.backlog,
        admin_port = config.server.admin_port,
        tls = config.server.tls_enabled(),
        "Server configuration"
    );
    info!(
        workers = config.workers.count,
        command = config.workers.command.as_deref().unwrap_or("<self>"),
        max_requests = config.workers.max_requests,
        max_requests_jitter = config.workers.max_requests_jitter,
        "Worker pool settings"
    );
    info!(
        startup_timeout_secs = config.workers.startup_timeout_secs,
        health_interval_secs = config.workers.health_interval_secs,
        heartbeat_timeout_secs = config.workers.heartbeat_timeout_secs,
        max_restarts = config.workers.max_restarts,
        restart_window_secs = config.workers.restart_window_secs,
        "Health check settings"
    );
    info!(
        request_timeout_secs = config.dispatch.request_timeout_secs,
        keep_alive_secs = config.dispatch.keep_alive_secs,
        graceful_timeout_secs = config.workers.graceful_timeout_secs,
        "Request handling settings"
    );
}
