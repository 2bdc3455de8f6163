// Scripted in-memory transport for driving HubConnection in tests.
//
// MockTransport is handed to the builder; every open() it serves shows up on
// the paired MockServer as a ServerConn, which lets the test read what the
// client wrote and push frames, closures and errors back.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hubsocket::{
    FrameSink, FrameStream, HubConnectionBuilder, SocketPair, Transport, TransportFrame,
};
use serde_json::Value;
use tokio::sync::mpsc;

pub const HUB_URL: &str = "http://hub.test/chat";
const RS: char = '\u{1e}';

/// Client side of the mock. Clones share the same server.
#[derive(Debug, Clone)]
pub struct MockTransport {
    accepted: mpsc::UnboundedSender<ServerConn>,
    refuse: Arc<AtomicBool>,
    opens: Arc<AtomicUsize>,
}

/// Test side of the mock: receives one [`ServerConn`] per open.
#[derive(Debug)]
pub struct MockServer {
    accepted: mpsc::UnboundedReceiver<ServerConn>,
}

/// One open socket, seen from the server.
#[derive(Debug)]
pub struct ServerConn {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<anyhow::Result<TransportFrame>>,
    closed_by_client: Arc<AtomicBool>,
}

struct MockSink {
    to_server: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

struct MockStream {
    from_server: mpsc::UnboundedReceiver<anyhow::Result<TransportFrame>>,
}

pub fn mock_transport() -> (MockTransport, MockServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MockTransport {
            accepted: tx,
            refuse: Arc::new(AtomicBool::new(false)),
            opens: Arc::new(AtomicUsize::new(0)),
        },
        MockServer { accepted: rx },
    )
}

/// Builder wired to `transport`, with keep-alive and server timeout pushed out
/// of the way so only the test's own timers fire.
pub fn builder(transport: &MockTransport) -> HubConnectionBuilder {
    HubConnectionBuilder::new(HUB_URL)
        .transport(Arc::new(transport.clone()))
        .keep_alive_interval(Duration::from_secs(3600))
        .server_timeout(Duration::from_secs(3600))
}

impl MockTransport {
    /// Make every following open() fail (or succeed again).
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of open() calls so far, refused ones included.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &str) -> anyhow::Result<SocketPair> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        assert_eq!(url, HUB_URL);
        if self.refuse.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let conn = ServerConn {
            from_client,
            to_client,
            closed_by_client: Arc::clone(&closed),
        };
        if self.accepted.send(conn).is_err() {
            anyhow::bail!("mock server is gone");
        }

        Ok((
            Box::new(MockSink { to_server, closed }),
            Box::new(MockStream { from_server }),
        ))
    }
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("socket closed");
        }
        self.to_server
            .send(text.to_string())
            .map_err(|_| anyhow::anyhow!("peer is gone"))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl FrameStream for MockStream {
    async fn recv(&mut self) -> Option<anyhow::Result<TransportFrame>> {
        self.from_server.recv().await
    }
}

impl MockServer {
    /// Next opened socket, handshake not yet answered.
    pub async fn accept_raw(&mut self) -> ServerConn {
        self.accepted.recv().await.expect("transport dropped")
    }

    /// Next opened socket, with the handshake accepted.
    pub async fn accept(&mut self) -> ServerConn {
        let mut conn = self.accept_raw().await;
        let handshake = conn.recv_raw().await;
        assert_eq!(handshake, format!(r#"{{"protocol":"json","version":1}}{RS}"#));
        conn.send_raw(&format!("{{}}{RS}"));
        conn
    }
}

impl ServerConn {
    /// Next frame written by the client, verbatim.
    pub async fn recv_raw(&mut self) -> String {
        self.from_client.recv().await.expect("client socket dropped")
    }

    /// Next message written by the client, Pings skipped.
    pub async fn recv_message(&mut self) -> Value {
        loop {
            let message = self.recv_any().await;
            if message["type"] != 6 {
                return message;
            }
        }
    }

    /// Next message written by the client, Pings included.
    pub async fn recv_any(&mut self) -> Value {
        let raw = self.recv_raw().await;
        let body = raw.strip_suffix(RS).expect("record separator");
        serde_json::from_str(body).expect("client wrote invalid JSON")
    }

    /// Messages already written by the client and not yet read.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut messages = Vec::new();
        while let Ok(raw) = self.from_client.try_recv() {
            let body = raw.trim_end_matches(RS);
            messages.push(serde_json::from_str(body).expect("client wrote invalid JSON"));
        }
        messages
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(Ok(TransportFrame::Text(text.to_string())));
    }

    pub fn send_message(&self, message: &Value) {
        self.send_raw(&format!("{message}{RS}"));
    }

    /// Remote close frame.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(Ok(TransportFrame::Closed {
            code,
            reason: reason.to_string(),
        }));
    }

    /// Socket-level error.
    pub fn fail(&self, error: &str) {
        let _ = self.to_client.send(Err(anyhow::anyhow!(error.to_string())));
    }

    pub fn closed_by_client(&self) -> bool {
        self.closed_by_client.load(Ordering::SeqCst)
    }
}
