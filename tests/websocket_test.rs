// End-to-end tests over a real WebSocket.
//
// A minimal echo hub runs on 127.0.0.1 with tokio-tungstenite; the client
// connects through the default WebSocketTransport.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use hubsocket::{method_handler, ConnectionState, HubConnectionBuilder, HubError};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

const RS: char = '\u{1e}';

/// Echo hub: answers `Echo` with its first argument and any other method with
/// an error. Calls the client's `Notify` once the handshake is done.
///
/// Reports the upgrade request's Authorization header on `auth`.
async fn spawn_echo_hub() -> (SocketAddr, oneshot::Receiver<Option<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (auth_tx, auth_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |request: &Request,
                             response: Response|
              -> Result<Response, ErrorResponse> {
            let auth = request
                .headers()
                .get("Authorization")
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let _ = auth_tx.send(auth);
            Ok(response)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();

        // Handshake
        let Some(Ok(Message::Text(handshake))) = ws.next().await else {
            return;
        };
        assert_eq!(handshake, format!(r#"{{"protocol":"json","version":1}}{RS}"#));
        ws.send(Message::Text(format!("{{}}{RS}"))).await.unwrap();

        let notify = json!({"type": 1, "target": "Notify", "arguments": ["welcome"]});
        ws.send(Message::Text(format!("{notify}{RS}"))).await.unwrap();

        while let Some(Ok(frame)) = ws.next().await {
            let Message::Text(text) = frame else {
                continue;
            };
            for record in text.split(RS).filter(|r| !r.is_empty()) {
                let message: Value = serde_json::from_str(record).unwrap();
                if message["type"] == 7 {
                    let _ = ws.close(None).await;
                    return;
                }
                if message["type"] != 1 {
                    continue;
                }
                let Some(id) = message["invocationId"].as_str() else {
                    continue;
                };
                let reply = match message["target"].as_str() {
                    Some("Echo") => json!({"type": 3, "invocationId": id, "result": message["arguments"][0]}),
                    _ => json!({"type": 3, "invocationId": id, "error": "Unknown hub method"}),
                };
                ws.send(Message::Text(format!("{reply}{RS}"))).await.unwrap();
            }
        }
    });

    (addr, auth_rx)
}

#[tokio::test]
async fn test_echo_over_websocket() {
    let (addr, auth) = spawn_echo_hub().await;
    let connection = HubConnectionBuilder::new(format!("http://{addr}/hub"))
        .access_token("secret-token")
        .build();

    let (notified_tx, mut notified_rx) = mpsc::unbounded_channel();
    connection.on(
        "notify",
        method_handler(move |args| {
            let _ = notified_tx.send(args.to_vec());
            Ok(Value::Null)
        }),
    );

    connection.start().await.unwrap();
    assert_eq!(connection.connection_state(), ConnectionState::Connected);
    assert_eq!(auth.await.unwrap().as_deref(), Some("Bearer secret-token"));
    assert_eq!(notified_rx.recv().await, Some(vec![json!("welcome")]));

    let echoed = connection
        .invoke("Echo", vec![json!({"nested": [1, 2, 3]})])
        .await
        .unwrap();
    assert_eq!(echoed, json!({"nested": [1, 2, 3]}));

    assert_eq!(
        connection.invoke("Missing", vec![]).await,
        Err(HubError::Server("Unknown hub method".to_string()))
    );

    connection.stop().await.unwrap();
    assert_eq!(connection.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_start_against_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let connection = HubConnectionBuilder::new(format!("ws://{addr}/hub")).build();
    let result = connection.start().await;
    assert!(matches!(result, Err(HubError::Transport(_))), "{result:?}");
    assert_eq!(connection.connection_state(), ConnectionState::Disconnected);
}
