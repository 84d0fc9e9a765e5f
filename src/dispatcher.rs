//! Per-worker request dispatcher
//!
//! Accepts connections on the shared listener, speaks HTTP/1.1 on each of
//! them and hands every request to the [`Application`]. Failures of a single
//! request never take the worker down: faults and panics become a 500, slow
//! handlers a 504, and malformed input is answered with a 400 by hyper before
//! the application ever sees it.

use crate::app::{AppRequest, Application, BoxError, ResponseBody};
use crate::config::DispatchConfig;
use crate::error::{json_error_response, DispatchErrorCode};
use futures::FutureExt;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Pause after a failed accept (e.g. descriptor exhaustion)
const ACCEPT_BACKOFF_MS: u64 = 50;

/// Request counters for one worker
#[derive(Debug, Default)]
pub struct WorkerStats {
    in_flight: AtomicUsize,
    served: AtomicU64,
    faults: AtomicU64,
}

impl WorkerStats {
    /// Requests currently being handled
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Requests answered since start
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Requests that ended in a fault, panic or timeout
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }
}

/// Keeps `in_flight` accurate even when the request future is dropped
struct InFlightGuard<'a>(&'a WorkerStats);

impl<'a> InFlightGuard<'a> {
    fn new(stats: &'a WorkerStats) -> Self {
        stats.in_flight.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Result of draining the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Every connection finished within the grace period
    pub completed: bool,
    /// Connections cut off when the grace period ran out
    pub aborted: usize,
}

/// Serves one application over HTTP/1.1
#[derive(Clone)]
pub struct Dispatcher {
    app: Arc<dyn Application>,
    config: Arc<DispatchConfig>,
    stats: Arc<WorkerStats>,
}

impl Dispatcher {
    pub fn new(app: Arc<dyn Application>, config: DispatchConfig) -> Self {
        Self {
            app,
            config: Arc::new(config),
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept and serve connections until `drain_rx` turns true (or its
    /// sender goes away), then drain.
    ///
    /// Draining stops accepting, lets every connection finish the request it
    /// is working on and closes it. Connections still open after `grace` are
    /// aborted.
    pub async fn serve(
        &self,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        mut drain_rx: watch::Receiver<bool>,
        grace: Duration,
    ) -> DrainOutcome {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = drain_requested(&mut drain_rx) => break,

                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let _ = stream.set_nodelay(true);
                            let dispatcher = self.clone();
                            let tls = tls.clone();
                            let drain_rx = drain_rx.clone();

                            connections.spawn(async move {
                                match tls {
                                    Some(acceptor) => match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            dispatcher.serve_connection(tls_stream, addr, drain_rx).await
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    },
                                    None => dispatcher.serve_connection(stream, addr, drain_rx).await,
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(Duration::from_millis(ACCEPT_BACKOFF_MS)).await;
                        }
                    }
                }

                // Reap finished connection tasks so the set stays small
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        info!(
            connections = connections.len(),
            in_flight = self.stats.in_flight(),
            "Stopped accepting, draining connections"
        );

        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => DrainOutcome {
                completed: true,
                aborted: 0,
            },
            Err(_) => {
                let aborted = connections.len();
                warn!(
                    aborted,
                    grace_ms = grace.as_millis() as u64,
                    "Grace period expired, aborting connections"
                );
                connections.shutdown().await;
                DrainOutcome {
                    completed: false,
                    aborted,
                }
            }
        }
    }

    /// Serve a single connection until the peer closes it or a drain finishes it
    pub async fn serve_connection<S>(
        &self,
        stream: S,
        addr: SocketAddr,
        mut drain_rx: watch::Receiver<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let dispatcher = self.clone();
        let request_seen = Arc::new(Notify::new());
        let service_seen = Arc::clone(&request_seen);
        let service = service_fn(move |req: Request<Incoming>| {
            let dispatcher = dispatcher.clone();
            service_seen.notify_one();
            async move { Ok::<_, Infallible>(dispatcher.handle_request(req, addr).await) }
        });

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .keep_alive(true)
            .header_read_timeout(self.config.keep_alive());

        let conn = builder.serve_connection(TokioIo::new(stream), service);
        tokio::pin!(conn);

        // graceful_shutdown closes an idle connection at once, so a fresh
        // connection is only shut down after its first request was read
        let mut started = false;
        let mut draining = false;

        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!(addr = %addr, error = %e, "Connection error");
                    }
                    break;
                }
                _ = request_seen.notified(), if !started => {
                    started = true;
                    if draining {
                        conn.as_mut().graceful_shutdown();
                    }
                }
                _ = drain_requested(&mut drain_rx), if !draining => {
                    draining = true;
                    if started {
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }
        }
    }

    async fn handle_request(&self, req: Request<Incoming>, addr: SocketAddr) -> Response<ResponseBody> {
        let start = Instant::now();
        let _in_flight = InFlightGuard::new(&self.stats);

        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (parts, body) = req.into_parts();
        let method = parts.method.clone();
        let path = parts.uri.path().to_string();

        let app_request = AppRequest::new(
            parts.method,
            path.clone(),
            parts.uri.query().map(String::from),
            parts.headers,
            body.boxed(),
            addr,
            request_id.clone(),
        );

        let call = AssertUnwindSafe(self.app.call(app_request)).catch_unwind();
        let mut response = match tokio::time::timeout(self.config.request_timeout(), call).await {
            Ok(Ok(Ok(response))) => response.into_http(),
            Ok(Ok(Err(fault))) => {
                self.stats.faults.fetch_add(1, Ordering::Relaxed);
                error!(request_id, method = %method, path, error = %fault, "Handler fault");
                self.fault_response(fault.message())
            }
            Ok(Err(panic)) => {
                self.stats.faults.fetch_add(1, Ordering::Relaxed);
                let message = panic_message(panic.as_ref());
                error!(request_id, method = %method, path, panic = %message, "Handler panicked");
                self.fault_response(&message)
            }
            Err(_) => {
                self.stats.faults.fetch_add(1, Ordering::Relaxed);
                warn!(
                    request_id,
                    method = %method,
                    path,
                    timeout_secs = self.config.request_timeout_secs,
                    "Request timed out"
                );
                error_response(DispatchErrorCode::RequestTimeout, "Request timed out")
            }
        };

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }

        self.stats.served.fetch_add(1, Ordering::Relaxed);

        if self.config.access_log {
            info!(
                target: "prefork::access",
                remote = %addr,
                method = %method,
                path,
                status = response.status().as_u16(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                request_id,
                "request"
            );
        }

        response
    }

    fn fault_response(&self, detail: &str) -> Response<ResponseBody> {
        if self.config.verbose_errors {
            error_response(DispatchErrorCode::HandlerFault, detail)
        } else {
            error_response(DispatchErrorCode::HandlerFault, "Internal server error")
        }
    }
}

fn error_response(code: DispatchErrorCode, message: impl Into<String>) -> Response<ResponseBody> {
    json_error_response(code, message).map(|body| body.map_err(BoxError::from).boxed_unsync())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Resolves once a drain has been requested or the sender is gone
async fn drain_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_guard() {
        let stats = WorkerStats::default();
        {
            let _a = InFlightGuard::new(&stats);
            let _b = InFlightGuard::new(&stats);
            assert_eq!(stats.in_flight(), 2);
        }
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[tokio::test]
    async fn test_drain_requested_on_sender_drop() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), drain_requested(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_requested_on_true() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { drain_requested(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
