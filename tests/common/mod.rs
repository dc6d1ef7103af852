//! Shared utilities for integration tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use hoptrace::config::ServiceConfig;
use hoptrace::http::HttpServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

#[allow(dead_code)]
/// Request head as seen by a mock backend. Header names are lowercase.
#[derive(Debug)]
pub struct SeenRequest {
    pub request_line: String,
    pub headers: HashMap<String, String>,
}

/// Start an instrumented service on `addr`. Dropping the returned sender
/// shuts it down.
pub async fn start_service(addr: SocketAddr, mut config: ServiceConfig) -> oneshot::Sender<()> {
    config.listener.bind_address = addr.to_string();
    let server = HttpServer::new(config).unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let _ = server
            .run(listener, async move {
                let _ = stop_rx.await;
            })
            .await;
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    stop_tx
}

#[allow(dead_code)]
/// Start a mock backend that reports every request head on the returned
/// channel and answers with a fixed body.
pub async fn start_recording_backend(
    addr: SocketAddr,
    response: &'static str,
) -> mpsc::UnboundedReceiver<SeenRequest> {
    let listener = TcpListener::bind(addr).await.unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let seen_tx = seen_tx.clone();
                    tokio::spawn(async move {
                        if let Some(seen) = read_head(&mut socket).await {
                            let _ = seen_tx.send(seen);
                        }
                        let response_str = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            response.len(),
                            response
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    seen_rx
}

async fn read_head(socket: &mut tokio::net::TcpStream) -> Option<SeenRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let text = String::from_utf8_lossy(&buf);
    let head = text.split("\r\n\r\n").next()?;
    let mut lines = head.lines();
    let request_line = lines.next()?.to_string();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    Some(SeenRequest {
        request_line,
        headers,
    })
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
