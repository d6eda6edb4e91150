//! WebSocket upgrades tunnelled through the router.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

mod common;

/// Backend that echoes every WebSocket message back.
async fn start_ws_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_close() {
                        break;
                    }
                    if ws.send(message).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

#[tokio::test]
async fn test_websocket_echo_through_router() {
    let (router, bus) = common::start_router(common::test_config()).await;
    let backend = start_ws_echo_backend().await;
    common::register(&router, &bus, backend, "ws.vcap.me", "chat", "").await;

    let request = "ws://ws.vcap.me/chat".into_client_request().unwrap();
    let stream = TcpStream::connect(router.proxy_addr()).await.unwrap();
    let (mut ws, response) = tokio_tungstenite::client_async(request, stream).await.unwrap();
    assert_eq!(response.status(), 101);

    for text in ["hello", "world"] {
        ws.send(Message::text(text)).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, Message::text(text));
    }

    ws.close(None).await.unwrap();
    assert_eq!(router.varz().snapshot().all.requests, 1);

    router.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_websocket_rejection_is_relayed() {
    let (router, bus) = common::start_router(common::test_config()).await;
    let backend = common::start_mock_backend("403 Forbidden", "", "no").await;
    common::register(&router, &bus, backend, "ws-deny.vcap.me", "", "").await;

    let request = "ws://ws-deny.vcap.me/".into_client_request().unwrap();
    let stream = TcpStream::connect(router.proxy_addr()).await.unwrap();
    let err = tokio_tungstenite::client_async(request, stream).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => assert_eq!(response.status(), 403),
        other => panic!("unexpected error: {:?}", other),
    }

    router.shutdown(Duration::from_secs(1)).await;
}
