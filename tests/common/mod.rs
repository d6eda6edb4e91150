//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use droplet_router::config::RouterConfig;
use droplet_router::mbus::{subjects, LocalBus, MessageBus};
use droplet_router::{start, RouterHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Router config with every listener on an ephemeral loopback port.
pub fn test_config() -> RouterConfig {
    let mut config = RouterConfig::default();
    config.ip = "127.0.0.1".to_string();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.status.bind_address = "127.0.0.1:0".to_string();
    config
}

pub async fn start_router(config: RouterConfig) -> (RouterHandle, Arc<LocalBus>) {
    let bus = Arc::new(LocalBus::new());
    let router = start(config, bus.clone()).await.unwrap();
    (router, bus)
}

/// Register `addr` for `uri` over the bus and wait until the registry has it.
pub async fn register(router: &RouterHandle, bus: &LocalBus, addr: SocketAddr, uri: &str, app: &str, instance: &str) {
    let payload = serde_json::json!({
        "host": addr.ip().to_string(),
        "port": addr.port(),
        "uris": [uri],
        "app": app,
        "private_instance_id": instance,
    });
    bus.publish(subjects::REGISTER, payload.to_string().as_bytes()).unwrap();

    let expected = serde_json::Value::String(addr.to_string());
    let uri = uri.to_lowercase();
    wait_for(|| {
        let routes = serde_json::to_value(&**router.registry()).unwrap();
        routes[&uri]
            .as_array()
            .is_some_and(|backends| backends.contains(&expected))
    })
    .await;
}

pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Read one request head from `socket`.
async fn read_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Start a backend that answers every request with `status`, `extra_headers`
/// and `body`.
pub async fn start_mock_backend(status: &'static str, extra_headers: &'static str, body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_head(&mut socket).await;
                let response = format!(
                    "HTTP/1.1 {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    extra_headers,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Start a backend that answers with the request head it received.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let head = read_head(&mut socket).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    head.len(),
                    head
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Send raw bytes to `addr` and read until the peer closes.
pub async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .unwrap()
        .unwrap();
    out
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
