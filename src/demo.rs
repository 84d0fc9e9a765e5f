//! Built-in demo application served by `prefork` workers

use crate::app::{AppRequest, AppResponse, Application, BoxError, HandlerFault};
use crate::error::{DispatchErrorCode, ErrorResponse};
use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, StatusCode};
use std::time::Duration;

/// Upper bound for `/sleep`
const MAX_SLEEP_MS: u64 = 600_000;
/// Upper bound for `/stream`
const MAX_CHUNKS: usize = 1024;

/// Small application used to exercise the server
#[derive(Debug, Default, Clone)]
pub struct DemoApp;

impl DemoApp {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Application for DemoApp {
    async fn call(&self, mut req: AppRequest) -> Result<AppResponse, HandlerFault> {
        let method = req.method().clone();
        let path = req.path().to_string();

        match (method, path.as_str()) {
            (Method::GET, "/") => Ok(AppResponse::text(
                StatusCode::OK,
                format!("Hello from worker {}\n", std::process::id()),
            )),

            (Method::GET, "/health") => Ok(AppResponse::text(StatusCode::OK, "ok")),

            (Method::GET, "/pid") => Ok(AppResponse::json(
                StatusCode::OK,
                &serde_json::json!({ "pid": std::process::id() }),
            )),

            (_, "/echo") => {
                let content_type = req.headers().get(CONTENT_TYPE).cloned();
                let body = req.collect_body().await?;
                let mut response = AppResponse::bytes(StatusCode::OK, body);
                if let Some(ct) = content_type.as_ref().and_then(|v| v.to_str().ok()) {
                    response = response.with_header(CONTENT_TYPE, ct);
                }
                Ok(response)
            }

            (Method::GET, "/headers") => {
                let headers: serde_json::Map<String, serde_json::Value> = req
                    .headers()
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.as_str().to_string(),
                            serde_json::Value::String(
                                String::from_utf8_lossy(value.as_bytes()).into_owned(),
                            ),
                        )
                    })
                    .collect();
                Ok(AppResponse::json(
                    StatusCode::OK,
                    &serde_json::Value::Object(headers),
                ))
            }

            (Method::GET, "/sleep") => {
                let ms = match parse_param(&req, "ms", 1000u64) {
                    Ok(ms) => ms.min(MAX_SLEEP_MS),
                    Err(response) => return Ok(response),
                };
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(AppResponse::text(StatusCode::OK, format!("slept {}ms\n", ms)))
            }

            (Method::GET, "/stream") => {
                let chunks = match parse_param(&req, "chunks", 5usize) {
                    Ok(n) => n.min(MAX_CHUNKS),
                    Err(response) => return Ok(response),
                };
                let stream = futures::stream::iter(
                    (0..chunks).map(|i| Ok::<_, BoxError>(Bytes::from(format!("chunk {}\n", i)))),
                );
                Ok(AppResponse::stream(StatusCode::OK, stream)
                    .with_header(CONTENT_TYPE, "text/plain; charset=utf-8"))
            }

            (Method::GET, "/fault") => Err(HandlerFault::new("requested fault")),

            (Method::GET, "/panic") => panic!("requested panic"),

            _ => Ok(error_response(DispatchErrorCode::NotFound, "Not found")),
        }
    }
}

fn error_response(code: DispatchErrorCode, message: impl Into<String>) -> AppResponse {
    AppResponse::bytes(code.status_code(), ErrorResponse::new(code, message).to_json())
        .with_header(CONTENT_TYPE, "application/json")
        .with_header("x-dispatch-error", code.as_header_value())
}

/// Parse a query parameter, answering 400 when it is malformed
fn parse_param<T: std::str::FromStr>(
    req: &AppRequest,
    name: &str,
    default: T,
) -> Result<T, AppResponse> {
    match req.query_param(name) {
        Some(raw) => raw.parse().map_err(|_| {
            error_response(
                DispatchErrorCode::BadRequest,
                format!("invalid {} parameter: {:?}", name, raw),
            )
        }),
        None => Ok(default),
    }
}
