//! End-to-end tests against the prefork binary

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const ADMIN_TOKEN: &str = "integration-token";

/// Environment variables that would override the test configuration
const OVERRIDE_VARS: &[&str] = &[
    "WEB_CONCURRENCY",
    "BIND",
    "HOST",
    "PORT",
    "GRACEFUL_TIMEOUT",
    "TIMEOUT",
    "KEEP_ALIVE",
    "LOG_LEVEL",
    "RUST_LOG",
    "PREFORK_WORKER",
];

/// Pick a port that is free right now
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A running prefork supervisor, killed on drop
struct Prefork {
    child: Child,
    port: u16,
    admin_port: u16,
    pid_file: PathBuf,
    _dir: tempfile::TempDir,
}

impl Prefork {
    fn spawn(workers: usize, extra: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let admin_port = free_port();
        let pid_file = dir.path().join("prefork.pid");

        let config = format!(
            r#"
[server]
bind = "127.0.0.1:{port}"
admin_port = {admin_port}
admin_token = "{ADMIN_TOKEN}"
pid_file = "{pid_file}"
log_level = "info"

[workers]
count = {workers}
startup_timeout_secs = 20
graceful_timeout_secs = 5
health_interval_secs = 1
heartbeat_timeout_secs = 10
{extra}
"#,
            pid_file = pid_file.display(),
        );
        let config_path = write_config(dir.path(), &config);

        let child = command(&config_path).spawn().unwrap();

        Self {
            child,
            port,
            admin_port,
            pid_file,
            _dir: dir,
        }
    }

    async fn start(workers: usize, extra: &str) -> Self {
        let server = Self::spawn(workers, extra);
        server.wait_ready(workers).await;
        server
    }

    fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    fn signal(&self, sig: i32) {
        unsafe {
            libc::kill(self.pid(), sig);
        }
    }

    async fn wait_ready(&self, workers: usize) {
        wait_for("pool to become ready", Duration::from_secs(30), move || async move {
            match self.status().await {
                Some(status) => {
                    status["ready"].as_u64() == Some(workers as u64)
                        && status["workers"].as_array().map(|w| w.len()) == Some(workers)
                }
                None => false,
            }
        })
        .await;
    }

    /// Pool status from the admin API
    async fn status(&self) -> Option<serde_json::Value> {
        let (status, body) = http(self.admin_port, "GET", "/workers", Some(ADMIN_TOKEN))
            .await
            .ok()?;
        if status != 200 {
            return None;
        }
        serde_json::from_str(&body).ok()
    }

    async fn worker_pids(&self) -> HashSet<u64> {
        self.status()
            .await
            .and_then(|status| {
                status["workers"].as_array().map(|workers| {
                    workers
                        .iter()
                        .filter(|w| w["state"] == "ready")
                        .filter_map(|w| w["pid"].as_u64())
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    async fn wait_exit(&mut self, timeout: Duration) -> Option<i32> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status.code();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }
}

impl Drop for Prefork {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.signal(libc::SIGTERM);
            let start = Instant::now();
            while start.elapsed() < Duration::from_secs(10) {
                if let Ok(Some(_)) = self.child.try_wait() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("prefork.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

fn command(config_path: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_prefork"));
    cmd.arg(config_path).stdin(Stdio::null());
    for var in OVERRIDE_VARS {
        cmd.env_remove(var);
    }
    cmd
}

/// Poll `condition` until it holds or `timeout` passes
async fn wait_for<F, Fut>(what: &str, timeout: Duration, condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Send one request on a fresh connection and read the whole response
async fn http(
    port: u16,
    method: &str,
    path: &str,
    token: Option<&str>,
) -> Result<(u16, String), Box<dyn std::error::Error + Send + Sync>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let auth = token
        .map(|t| format!("Authorization: Bearer {}\r\n", t))
        .unwrap_or_default();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
        method, path, port, auth
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or("missing status line")?;
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

#[tokio::test]
async fn test_pool_starts_and_serves() {
    let server = Prefork::start(2, "").await;

    let (status, body) = http(server.port, "GET", "/", None).await.unwrap();
    assert_eq!(status, 200);
    assert!(body.starts_with("Hello from worker"));

    // Every worker is a separate process
    let pids = server.worker_pids().await;
    assert_eq!(pids.len(), 2);
    assert!(!pids.contains(&(server.pid() as u64)));

    // PID file holds the supervisor pid
    let written = std::fs::read_to_string(&server.pid_file).unwrap();
    assert_eq!(written.trim(), server.pid().to_string());
}

#[tokio::test]
async fn test_killed_worker_is_replaced() {
    let server = Prefork::start(2, "").await;
    let before = server.worker_pids().await;
    let victim = *before.iter().next().unwrap();

    unsafe {
        libc::kill(victim as i32, libc::SIGKILL);
    }

    let server = &server;
    wait_for("replacement worker", Duration::from_secs(20), move || async move {
        let pids = server.worker_pids().await;
        pids.len() == 2 && !pids.contains(&victim)
    })
    .await;

    let status = server.status().await.unwrap();
    let restarts: u64 = status["workers"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|w| w["restarts"].as_u64())
        .sum();
    assert_eq!(restarts, 1);

    let (status, _) = http(server.port, "GET", "/health", None).await.unwrap();
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_reload_keeps_serving() {
    let server = Prefork::start(2, "").await;
    let before = server.worker_pids().await;

    server.signal(libc::SIGHUP);

    // Sample the listener and the ready count throughout the reload
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut samples = 0;
    loop {
        let (status, _) = http(server.port, "GET", "/health", None)
            .await
            .expect("request failed during reload");
        assert_eq!(status, 200);
        samples += 1;

        let ready = server.status().await.expect("admin API unavailable during reload")["ready"]
            .as_u64()
            .unwrap();
        assert!(ready >= 2, "ready workers dropped to {} during reload", ready);

        let pids = server.worker_pids().await;
        if pids.len() == 2 && pids.is_disjoint(&before) {
            break;
        }
        assert!(Instant::now() < deadline, "reload did not replace every worker");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(samples > 0);
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_requests() {
    let mut server = Prefork::start(1, "").await;
    let port = server.port;
    let pid_file = server.pid_file.clone();

    let request = tokio::spawn(async move { http(port, "GET", "/sleep?ms=1500", None).await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    server.signal(libc::SIGTERM);

    let (status, body) = request.await.unwrap().unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "slept 1500ms\n");

    assert_eq!(server.wait_exit(Duration::from_secs(15)).await, Some(0));
    assert!(!pid_file.exists());

    // Listen socket is closed
    assert!(TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_err());
}

#[tokio::test]
async fn test_scale_with_signals() {
    let server = Prefork::start(2, "").await;

    server.signal(libc::SIGTTIN);
    server.wait_ready(3).await;

    server.signal(libc::SIGTTOU);
    server.wait_ready(2).await;

    let status = server.status().await.unwrap();
    assert_eq!(status["pool_size"], 2);
}

#[tokio::test]
async fn test_admin_api() {
    let server = Prefork::start(1, "").await;

    let (status, body) = http(server.admin_port, "GET", "/health", None).await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "ok");

    let (status, body) = http(server.admin_port, "GET", "/version", None).await.unwrap();
    assert_eq!(status, 200);
    let version: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(version["name"], "prefork");

    let (status, _) = http(server.admin_port, "GET", "/workers", None).await.unwrap();
    assert_eq!(status, 401);

    let (status, _) = http(server.admin_port, "POST", "/scale/2", Some(ADMIN_TOKEN))
        .await
        .unwrap();
    assert_eq!(status, 202);
    server.wait_ready(2).await;

    let before = server.worker_pids().await;
    let (status, _) = http(server.admin_port, "POST", "/reload", Some(ADMIN_TOKEN))
        .await
        .unwrap();
    assert_eq!(status, 202);
    let before = &before;
    let server = &server;
    wait_for("admin reload", Duration::from_secs(30), move || async move {
        let pids = server.worker_pids().await;
        pids.len() == 2 && pids.is_disjoint(before)
    })
    .await;
}

#[tokio::test]
async fn test_retiring_workers_are_replaced() {
    let server = Prefork::start(1, "max_requests = 3").await;
    let before = server.worker_pids().await;

    for _ in 0..3 {
        let (status, _) = http(server.port, "GET", "/health", None).await.unwrap();
        assert_eq!(status, 200);
    }

    let before = &before;
    let server = &server;
    wait_for("retired worker replacement", Duration::from_secs(30), move || async move {
        let pids = server.worker_pids().await;
        pids.len() == 1 && pids.is_disjoint(before)
    })
    .await;
}

#[tokio::test]
async fn test_invalid_config_exits_with_1() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[workers]\ncount = 0\n");

    let status = command(&path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[tokio::test]
async fn test_failed_startup_exits_with_3() {
    let dir = tempfile::tempdir().unwrap();
    let config = format!(
        "[server]\nbind = \"127.0.0.1:{}\"\n\n[workers]\ncount = 2\nstartup_timeout_secs = 5\ncommand = \"sh -c 'exit 1'\"\n",
        free_port()
    );
    let path = write_config(dir.path(), &config);

    let status = command(&path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(3));
}
