//! Integration tests: client and server over loopback WebSockets

use std::sync::Arc;
use std::time::Duration;

use proven_duplex_rpc::{Client, Endpoint, Error, Server, Value};
use proven_duplex_rpc_ws::{WsConnector, WsListener};
use serde_json::json;
use tokio::time::timeout;

async fn start_server() -> (Server, String) {
    let listener = WsListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr());

    let server = Server::default();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });

    (server, url)
}

#[tokio::test]
async fn test_request_and_callback_over_websocket() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (server, url) = start_server().await;
    server.register_request_method("add", |_endpoint: Arc<Endpoint>, data: Value| async move {
        let [a, b]: [i64; 2] = serde_json::from_value(data)?;
        Ok::<_, anyhow::Error>(json!(a + b))
    });
    server.register_request_method("ask", |endpoint: Arc<Endpoint>, _data: Value| async move {
        let name = endpoint.request("name", Value::Null).await?;
        Ok::<_, anyhow::Error>(json!({ "asked": name }))
    });

    let client = Client::builder()
        .request_handler("name", |_endpoint: Arc<Endpoint>, _data: Value| async {
            Ok::<_, anyhow::Error>(json!("ws-client"))
        })
        .connect(&WsConnector::new(), &url)
        .await
        .unwrap();

    assert_eq!(client.request("add", json!([2, 40])).await.unwrap(), json!(42));
    assert_eq!(
        client.request("ask", Value::Null).await.unwrap(),
        json!({ "asked": "ws-client" })
    );
}

#[tokio::test]
async fn test_disconnect_releases_server_connection() {
    let (server, url) = start_server().await;

    let mut client = Client::connect(&WsConnector::new(), &url).await.unwrap();
    timeout(Duration::from_secs(2), async {
        while server.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    client.close();
    client.closed().await;

    timeout(Duration::from_secs(2), async {
        while server.connection_count() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(matches!(
        client.request("add", json!([1, 1])).await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn test_silent_socket_does_not_block_other_clients() {
    let (server, url) = start_server().await;
    let addr = url.trim_start_matches("ws://").to_string();

    // Connects but never sends a handshake.
    let _silent = tokio::net::TcpStream::connect(&addr).await.unwrap();

    let client = timeout(Duration::from_secs(3), Client::connect(&WsConnector::new(), &url))
        .await
        .expect("handshake blocked behind a silent socket")
        .unwrap();

    timeout(Duration::from_secs(3), async {
        while server.connection_count() != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(client.is_connected());
}

#[tokio::test]
async fn test_connect_to_invalid_url_fails() {
    let err = Client::connect(&WsConnector::new(), "localhost:1")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Transport(_)));
}
