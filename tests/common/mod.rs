#![allow(dead_code)]

use std::time::Duration;

use chatwire::{Client, Config, RetryConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Client for a test server with retries disabled unless overridden.
pub fn test_client(base_url: &str) -> Client {
    Client::new(Config {
        base_url: Some(base_url.to_string()),
        retry: Some(RetryConfig::disabled()),
        ..Default::default()
    })
    .expect("client")
}

/// Client with one retry and a short backoff step.
pub fn retrying_client(base_url: &str) -> Client {
    Client::new(Config {
        base_url: Some(base_url.to_string()),
        retry: Some(RetryConfig {
            max_retries: 1,
            backoff_step: Duration::from_millis(10),
        }),
        ..Default::default()
    })
    .expect("client")
}

/// Start a one-shot HTTP server that writes each step as its own chunk.
///
/// Each step is `(delay before writing, raw bytes)`. The terminating chunk is
/// written after `finish_after`, or never when it is `None`.
pub async fn start_chunked_server(
    steps: Vec<(Duration, Vec<u8>)>,
    finish_after: Option<Duration>,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    tokio::spawn(async move {
        let (mut socket, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };

        // Read request headers and the declared body.
        let mut buf = [0u8; 4096];
        let mut received = Vec::new();
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(n) => n,
                Err(_) => return,
            };
            if n == 0 {
                return;
            }
            received.extend_from_slice(&buf[..n]);
            if let Some(pos) = received.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&received[..pos]).to_lowercase();
                let body_len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if received.len() >= pos + 4 + body_len {
                    break;
                }
            }
        }

        let headers = concat!(
            "HTTP/1.1 200 OK\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "Transfer-Encoding: chunked\r\n",
            "\r\n"
        );
        if socket.write_all(headers.as_bytes()).await.is_err() {
            return;
        }

        for (delay, payload) in steps {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let mut chunk = format!("{:X}\r\n", payload.len()).into_bytes();
            chunk.extend_from_slice(&payload);
            chunk.extend_from_slice(b"\r\n");
            if socket.write_all(&chunk).await.is_err() {
                return;
            }
            let _ = socket.flush().await;
        }

        match finish_after {
            Some(delay) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let _ = socket.write_all(b"0\r\n\r\n").await;
            }
            None => {
                // Hold the connection open until the client goes away.
                let _ = socket.read(&mut buf).await;
            }
        }
    });

    format!("http://{}", addr)
}
