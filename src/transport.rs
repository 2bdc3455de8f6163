//! Socket collaborator contract.
//!
//! The connection needs very little from its socket: open it, send text
//! frames, close it, and hear about inbound frames and closure. [`Transport`]
//! opens; the returned [`FrameSink`] / [`FrameStream`] halves cover the rest,
//! so they can live in separate `tokio::select!` branches.
//!
//! ```text
//! open()            -> Transport::open resolves   (onOpen)
//! send(text)        -> FrameSink::send_text
//! close()           -> FrameSink::close
//! onMessage(text)   -> FrameStream::recv = Some(Ok(Text))
//! onClose(reason)   -> FrameStream::recv = Some(Ok(Closed)) | None
//! onError(err)      -> FrameStream::recv = Some(Err(_))
//! ```
//!
//! [`WebSocketTransport`] is the production implementation.

// Rust guideline compliant 2026-02

use async_trait::async_trait;

/// Inbound event from an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    /// A complete text frame.
    Text(String),
    /// The remote side closed the socket.
    Closed {
        /// Close code (1000 = normal, 1005 = none given).
        code: u16,
        /// Close reason text.
        reason: String,
    },
}

/// Write half of an open socket.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one text frame.
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()>;

    /// Close the socket. Safe to call on an already closed socket.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Read half of an open socket.
#[async_trait]
pub trait FrameStream: Send {
    /// Next inbound event, `None` once the stream has ended.
    async fn recv(&mut self) -> Option<anyhow::Result<TransportFrame>>;
}

/// Opened socket halves.
pub type SocketPair = (Box<dyn FrameSink>, Box<dyn FrameStream>);

/// Opens duplex text-frame sockets.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Open a socket to `url`. Resolves once the socket reports open.
    async fn open(&self, url: &str) -> anyhow::Result<SocketPair>;
}

/// WebSocket transport over `tokio-tungstenite`.
///
/// `http(s)://` URLs are rewritten to `ws(s)://`. Every configured header is
/// sent with the upgrade request.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    headers: Vec<(String, String)>,
}

impl WebSocketTransport {
    /// Transport without extra headers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header to the upgrade request.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add `Authorization: Bearer <token>`.
    #[must_use]
    pub fn with_bearer_token(self, token: &str) -> Self {
        self.with_header("Authorization", format!("Bearer {token}"))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> anyhow::Result<SocketPair> {
        let ws_url = crate::ws::http_to_ws_scheme(url);
        let (writer, reader) = crate::ws::connect(&ws_url, &self.headers).await?;
        Ok((Box::new(writer), Box::new(reader)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_header() {
        let transport = WebSocketTransport::new().with_bearer_token("secret");
        assert_eq!(
            transport.headers,
            vec![("Authorization".to_string(), "Bearer secret".to_string())]
        );
    }

    #[tokio::test]
    async fn test_open_unreachable_host_fails() {
        let result = WebSocketTransport::new().open("ws://127.0.0.1:1/hub").await;
        assert!(result.is_err());
    }
}
