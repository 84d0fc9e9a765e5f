//! Dispatcher tests over real TCP connections

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use prefork::config::DispatchConfig;
use prefork::demo::DemoApp;
use prefork::dispatcher::{Dispatcher, DrainOutcome, WorkerStats};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Server {
    addr: SocketAddr,
    drain_tx: watch::Sender<bool>,
    handle: JoinHandle<DrainOutcome>,
    stats: Arc<WorkerStats>,
}

async fn start_server(config: DispatchConfig, grace: Duration) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dispatcher = Dispatcher::new(Arc::new(DemoApp::new()), config);
    let stats = dispatcher.stats();
    let (drain_tx, drain_rx) = watch::channel(false);

    let handle = tokio::spawn(async move { dispatcher.serve(listener, None, drain_rx, grace).await });

    Server {
        addr,
        drain_tx,
        handle,
        stats,
    }
}

async fn default_server() -> Server {
    start_server(DispatchConfig::default(), Duration::from_secs(5)).await
}

/// A parsed HTTP/1.1 response
#[derive(Debug)]
struct HttpResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read one response from a keep-alive connection (Content-Length or chunked)
async fn read_response(reader: &mut BufReader<OwnedReadHalf>) -> Option<HttpResponse> {
    let mut status_line = String::new();
    if reader.read_line(&mut status_line).await.ok()? == 0 {
        return None;
    }
    let status = status_line.split_whitespace().nth(1)?.parse().ok()?;

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let mut response = HttpResponse {
        status,
        headers,
        body: String::new(),
    };

    if response
        .header("transfer-encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
    {
        loop {
            let mut size_line = String::new();
            reader.read_line(&mut size_line).await.ok()?;
            let size = usize::from_str_radix(size_line.trim(), 16).ok()?;
            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).await.ok()?;
            if size == 0 {
                break;
            }
            response.body.push_str(&String::from_utf8_lossy(&chunk[..size]));
        }
    } else {
        let length: usize = response
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await.ok()?;
        response.body = String::from_utf8_lossy(&body).into_owned();
    }

    Some(response)
}

/// Open a connection and return its read and write halves
async fn connect(addr: SocketAddr) -> (BufReader<OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, write) = stream.into_split();
    (BufReader::new(read), write)
}

fn get(path: &str) -> String {
    format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path)
}

fn post(path: &str, body: &str) -> String {
    format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        path,
        body.len(),
        body
    )
}

/// Assert the peer closes the connection without sending anything more
async fn assert_closed(reader: &mut BufReader<OwnedReadHalf>) {
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), reader.read_to_end(&mut rest))
        .await
        .expect("connection was not closed");
    assert!(read.is_err() || rest.is_empty(), "unexpected data: {:?}", rest);
}

#[tokio::test]
async fn test_serves_demo_root() {
    let server = default_server().await;
    let (mut reader, mut writer) = connect(server.addr).await;

    writer.write_all(get("/").as_bytes()).await.unwrap();
    let response = read_response(&mut reader).await.unwrap();

    assert_eq!(response.status, 200);
    assert!(response.body.starts_with("Hello from worker"));
    assert_eq!(server.stats.served(), 1);
}

#[tokio::test]
async fn test_fault_does_not_affect_next_request() {
    let server = default_server().await;
    let (mut reader, mut writer) = connect(server.addr).await;

    writer.write_all(get("/fault").as_bytes()).await.unwrap();
    let response = read_response(&mut reader).await.unwrap();
    assert_eq!(response.status, 500);
    assert_eq!(response.header("x-dispatch-error"), Some("HANDLER_FAULT"));
    let json: serde_json::Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(json["code"], "HANDLER_FAULT");
    // Fault detail stays hidden unless verbose errors are enabled
    assert!(!response.body.contains("requested fault"));

    // Same connection keeps working
    writer.write_all(get("/health").as_bytes()).await.unwrap();
    let response = read_response(&mut reader).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "ok");

    assert_eq!(server.stats.faults(), 1);
    assert_eq!(server.stats.served(), 2);
}

#[tokio::test]
async fn test_panic_becomes_500() {
    let config = DispatchConfig {
        verbose_errors: true,
        ..DispatchConfig::default()
    };
    let server = start_server(config, Duration::from_secs(5)).await;
    let (mut reader, mut writer) = connect(server.addr).await;

    writer.write_all(get("/panic").as_bytes()).await.unwrap();
    let response = read_response(&mut reader).await.unwrap();
    assert_eq!(response.status, 500);
    assert!(response.body.contains("requested panic"));

    writer.write_all(get("/health").as_bytes()).await.unwrap();
    let response = read_response(&mut reader).await.unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_malformed_request_gets_400() {
    let server = default_server().await;
    let (mut reader, mut writer) = connect(server.addr).await;

    writer
        .write_all(b"THIS IS NOT HTTP\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut reader).await.unwrap();
    assert_eq!(response.status, 400);
    assert_closed(&mut reader).await;

    // Request line without a version token
    let (mut reader, mut writer) = connect(server.addr).await;
    writer.write_all(b"GET /\r\n\r\n").await.unwrap();
    let response = read_response(&mut reader).await.unwrap();
    assert_eq!(response.status, 400);

    // Other connections are unaffected
    let (mut reader, mut writer) = connect(server.addr).await;
    writer.write_all(get("/health").as_bytes()).await.unwrap();
    assert_eq!(read_response(&mut reader).await.unwrap().status, 200);
}

#[tokio::test]
async fn test_bad_query_parameter_gets_400() {
    let server = default_server().await;
    let (mut reader, mut writer) = connect(server.addr).await;

    writer.write_all(get("/stream?chunks=lots").as_bytes()).await.unwrap();
    let response = read_response(&mut reader).await.unwrap();
    assert_eq!(response.status, 400);
    assert_eq!(response.header("x-dispatch-error"), Some("BAD_REQUEST"));
}

#[tokio::test]
async fn test_timeout_gets_504_and_closes() {
    let config = DispatchConfig {
        request_timeout_secs: 1,
        ..DispatchConfig::default()
    };
    let server = start_server(config, Duration::from_secs(5)).await;
    let (mut reader, mut writer) = connect(server.addr).await;

    writer.write_all(get("/sleep?ms=10000").as_bytes()).await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), read_response(&mut reader))
        .await
        .expect("no response before timeout")
        .unwrap();

    assert_eq!(response.status, 504);
    assert_eq!(response.header("x-dispatch-error"), Some("REQUEST_TIMEOUT"));
    assert_eq!(response.header("connection"), Some("close"));
    assert_closed(&mut reader).await;
    assert_eq!(server.stats.faults(), 1);
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let server = default_server().await;
    let (mut reader, mut writer) = connect(server.addr).await;

    let pipeline = format!(
        "{}{}{}",
        post("/echo", "first"),
        get("/sleep?ms=100"),
        post("/echo", "third")
    );
    writer.write_all(pipeline.as_bytes()).await.unwrap();

    let first = read_response(&mut reader).await.unwrap();
    let second = read_response(&mut reader).await.unwrap();
    let third = read_response(&mut reader).await.unwrap();

    assert_eq!(first.body, "first");
    assert_eq!(first.header("content-type"), Some("text/plain"));
    assert_eq!(second.body, "slept 100ms\n");
    assert_eq!(third.body, "third");
}

#[tokio::test]
async fn test_streamed_response_is_chunked() {
    let server = default_server().await;
    let (mut reader, mut writer) = connect(server.addr).await;

    writer.write_all(get("/stream?chunks=3").as_bytes()).await.unwrap();
    let response = read_response(&mut reader).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("transfer-encoding"), Some("chunked"));
    assert_eq!(response.body, "chunk 0\nchunk 1\nchunk 2\n");
}

#[tokio::test]
async fn test_request_id_propagated_or_generated() {
    let server = default_server().await;
    let (mut reader, mut writer) = connect(server.addr).await;

    writer
        .write_all(b"GET /headers HTTP/1.1\r\nHost: localhost\r\nX-Request-ID: abc-123\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut reader).await.unwrap();
    assert_eq!(response.header("x-request-id"), Some("abc-123"));
    let json: serde_json::Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(json["x-request-id"], "abc-123");

    writer.write_all(get("/").as_bytes()).await.unwrap();
    let response = read_response(&mut reader).await.unwrap();
    let generated = response.header("x-request-id").unwrap();
    assert!(uuid::Uuid::parse_str(generated).is_ok());
}

#[tokio::test]
async fn test_drain_finishes_in_flight_request() {
    let server = default_server().await;
    let (mut reader, mut writer) = connect(server.addr).await;

    writer.write_all(get("/sleep?ms=500").as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.stats.in_flight(), 1);

    server.drain_tx.send(true).unwrap();

    let response = read_response(&mut reader).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "slept 500ms\n");
    assert_closed(&mut reader).await;

    let outcome = server.handle.await.unwrap();
    assert_eq!(
        outcome,
        DrainOutcome {
            completed: true,
            aborted: 0
        }
    );

    // Listener is gone
    assert!(TcpStream::connect(server.addr).await.is_err());
}

#[tokio::test]
async fn test_drain_closes_idle_connections() {
    let server = default_server().await;
    let (mut reader, mut writer) = connect(server.addr).await;

    writer.write_all(get("/health").as_bytes()).await.unwrap();
    assert_eq!(read_response(&mut reader).await.unwrap().status, 200);

    server.drain_tx.send(true).unwrap();
    assert_closed(&mut reader).await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), server.handle)
        .await
        .expect("idle connection held up the drain")
        .unwrap();
    assert!(outcome.completed);
}

#[tokio::test]
async fn test_drain_serves_first_request_of_accepted_connection() {
    let server = default_server().await;
    let (mut reader, mut writer) = connect(server.addr).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.drain_tx.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    writer.write_all(get("/health").as_bytes()).await.unwrap();
    let response = read_response(&mut reader).await.unwrap();
    assert_eq!(response.status, 200);
    assert_closed(&mut reader).await;

    assert!(server.handle.await.unwrap().completed);
}

#[tokio::test]
async fn test_drain_aborts_after_grace() {
    let server = start_server(DispatchConfig::default(), Duration::from_millis(200)).await;
    let (mut reader, mut writer) = connect(server.addr).await;

    writer.write_all(get("/sleep?ms=10000").as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.drain_tx.send(true).unwrap();
    let outcome = server.handle.await.unwrap();
    assert_eq!(
        outcome,
        DrainOutcome {
            completed: false,
            aborted: 1
        }
    );

    // The client never gets a response
    assert!(read_response(&mut reader).await.is_none());
    assert_eq!(server.stats.in_flight(), 0);
}

#[tokio::test]
async fn test_dropped_drain_sender_stops_serving() {
    let server = default_server().await;
    drop(server.drain_tx);

    let outcome = tokio::time::timeout(Duration::from_secs(2), server.handle)
        .await
        .expect("dispatcher kept running")
        .unwrap();
    assert!(outcome.completed);
}
