use crate::supervisor::{Control, Supervisor};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Version information for the server
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Shared state for admin request handlers
struct AdminState {
    supervisor: Arc<Supervisor>,
    control_tx: mpsc::Sender<Control>,
    auth_token: String,
}

/// Admin API for pool health and control, served by the supervisor
pub struct AdminServer {
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    state: Arc<AdminState>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        control_tx: mpsc::Sender<Control>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            shutdown_rx,
            state: Arc::new(AdminState {
                supervisor,
                control_tx,
                auth_token,
            }),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            anyhow::anyhow!("Failed to bind admin API on {}: {}", self.bind_addr, e)
        })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(stream: S, state: Arc<AdminState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<hyper::body::Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token == expected_token)
        .unwrap_or(false)
}

fn queue(state: &AdminState, control: Control) -> Response<Full<Bytes>> {
    match state.control_tx.try_send(control) {
        Ok(()) => {
            info!(?control, "Control request queued via admin API");
            json_response(
                StatusCode::ACCEPTED,
                serde_json::json!({ "queued": format!("{:?}", control) }).to_string(),
            )
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            response(StatusCode::SERVICE_UNAVAILABLE, "control queue full")
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            response(StatusCode::SERVICE_UNAVAILABLE, "supervisor is shutting down")
        }
    }
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let requires_auth = !matches!(
        (method, path),
        (&Method::GET, "/health") | (&Method::GET, "/version")
    );
    if requires_auth && !check_auth(&req, &state.auth_token) {
        warn!(%method, path, "Unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match (method, path) {
        // Healthy while at least one worker can take traffic (no auth required)
        (&Method::GET, "/health") => {
            let ready = state.supervisor.ready_count();
            if ready > 0 {
                response(StatusCode::OK, "ok")
            } else {
                response(StatusCode::SERVICE_UNAVAILABLE, "no ready workers")
            }
        }

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Pool status: GET /workers
        (&Method::GET, "/workers") => match serde_json::to_string(&state.supervisor.status()) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => {
                error!(error = %e, "Failed to serialize pool status");
                response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        },

        // Rolling reload: POST /reload
        (&Method::POST, "/reload") => queue(&state, Control::Reload),

        // Resize: POST /scale/{n}
        (&Method::POST, path) if path.starts_with("/scale/") => {
            match path.trim_start_matches("/scale/").parse::<usize>() {
                Ok(n) if n > 0 => queue(&state, Control::Scale(n)),
                _ => response(StatusCode::BAD_REQUEST, "worker count must be a positive integer"),
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
