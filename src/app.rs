//! The application boundary.
//!
//! The dispatcher turns every HTTP request into an [`AppRequest`], hands it to
//! the registered [`Application`] and writes back whatever [`AppResponse`]
//! comes out. This is the only calling convention the server knows about.

use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use http_body_util::combinators::{BoxBody, UnsyncBoxBody};
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{HeaderValue, IntoHeaderName, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Response, StatusCode};
use std::future::Future;
use std::net::SocketAddr;
use tracing::debug;

/// Boxed error type for streaming bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request body stream as handed to the application
pub type RequestBody = BoxBody<Bytes, hyper::Error>;

/// Response body written by the dispatcher
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

/// A fault raised by the application while handling a request.
///
/// Produces a 500 response; the worker keeps serving.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerFault {
    message: String,
}

impl HandlerFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for HandlerFault {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

impl From<hyper::Error> for HandlerFault {
    fn from(err: hyper::Error) -> Self {
        Self::new(format!("failed to read request body: {}", err))
    }
}

/// Normalized request representation
pub struct AppRequest {
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: RequestBody,
    remote_addr: SocketAddr,
    request_id: String,
}

impl AppRequest {
    pub fn new(
        method: Method,
        path: impl Into<String>,
        query: Option<String>,
        headers: HeaderMap,
        body: RequestBody,
        remote_addr: SocketAddr,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            query,
            headers,
            body,
            remote_addr,
            request_id: request_id.into(),
        }
    }

    /// Build a request with an in-memory body (useful for driving an
    /// application directly)
    pub fn from_parts(method: Method, target: &str, body: impl Into<Bytes>) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (target.to_string(), None),
        };
        Self::new(
            method,
            path,
            query,
            HeaderMap::new(),
            Full::new(body.into()).map_err(|never| match never {}).boxed(),
            SocketAddr::from(([127, 0, 0, 1], 0)),
            uuid::Uuid::new_v4().to_string(),
        )
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string, without the leading `?`
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// First value of a query parameter, percent-decoded
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key != name {
                return None;
            }
            urlencoding::decode(&value.replace('+', " "))
                .ok()
                .map(|v| v.into_owned())
        })
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Take the body stream, leaving an empty body behind
    pub fn take_body(&mut self) -> RequestBody {
        std::mem::replace(
            &mut self.body,
            Empty::new().map_err(|never| match never {}).boxed(),
        )
    }

    /// Read the whole body into memory
    pub async fn collect_body(&mut self) -> Result<Bytes, hyper::Error> {
        Ok(self.take_body().collect().await?.to_bytes())
    }
}

/// Normalized response representation
pub struct AppResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
}

impl AppResponse {
    /// Empty response with the given status
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Empty::new().map_err(|never| match never {}).boxed_unsync(),
        }
    }

    /// Fixed-length response
    pub fn bytes(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Full::new(body.into())
                .map_err(|never| match never {})
                .boxed_unsync(),
        }
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::bytes(status, body.into())
            .with_header(CONTENT_TYPE, "text/plain; charset=utf-8")
    }

    pub fn json(status: StatusCode, body: &serde_json::Value) -> Self {
        Self::bytes(status, body.to_string()).with_header(CONTENT_TYPE, "application/json")
    }

    /// Streamed response, sent with chunked transfer-encoding
    pub fn stream<S>(status: StatusCode, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        Self {
            status,
            headers: HeaderMap::new(),
            body: StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync(),
        }
    }

    /// Set a header; invalid values are dropped
    pub fn with_header<K, V>(mut self, name: K, value: V) -> Self
    where
        K: IntoHeaderName,
        V: AsRef<str>,
    {
        match HeaderValue::from_str(value.as_ref()) {
            Ok(v) => {
                self.headers.insert(name, v);
            }
            Err(e) => debug!(error = %e, "Dropping invalid response header value"),
        }
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Convert into the HTTP response the dispatcher writes
    pub fn into_http(self) -> Response<ResponseBody> {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// The single entry point the dispatcher invokes for every request.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    async fn call(&self, req: AppRequest) -> Result<AppResponse, HandlerFault>;
}

/// Closure-backed [`Application`].
pub struct AppFn<F> {
    f: F,
}

impl<F> AppFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Application for AppFn<F>
where
    F: Fn(AppRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AppResponse, HandlerFault>> + Send + 'static,
{
    async fn call(&self, req: AppRequest) -> Result<AppResponse, HandlerFault> {
        (self.f)(req).await
    }
}
