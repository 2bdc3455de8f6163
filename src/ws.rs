//! WebSocket plumbing.
//!
//! Thin wrapper around `tokio-tungstenite` that exposes the connection as
//! type-isolated writer/reader halves implementing [`FrameSink`] and
//! [`FrameStream`]. Only [`crate::transport::WebSocketTransport`] uses it.
//!
//! Protocol-level pings are answered by tungstenite itself while reading;
//! binary and pong frames carry nothing for the hub protocol and are skipped.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::transport::{FrameSink, FrameStream, TransportFrame};

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

#[async_trait]
impl FrameSink for WsWriter {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsReader {
    async fn recv(&mut self) -> Option<Result<TransportFrame>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    return Some(Ok(TransportFrame::Text(text.to_string())));
                }
                Ok(tungstenite::Message::Close(close_frame)) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(TransportFrame::Closed { code, reason }));
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    log::trace!("[WebSocket] Ignoring {} byte binary frame", data.len());
                }
                Ok(
                    tungstenite::Message::Ping(_)
                    | tungstenite::Message::Pong(_)
                    | tungstenite::Message::Frame(_),
                ) => {}
                Err(e) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
            }
        }
    }
}

/// Open a WebSocket to `url`, sending every `(name, value)` in `headers` with
/// the upgrade request.
pub async fn connect(url: &str, headers: &[(String, String)]) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;
    use tungstenite::http::{HeaderName, HeaderValue};

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    let request_headers = request.headers_mut();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for header {name}"))?;
        request_headers.insert(name, value);
    }

    log::debug!("[WebSocket] Opening {}", url);
    let (socket, response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("WebSocket upgrade to {url} failed"))?;
    log::debug!("[WebSocket] Upgraded with status {}", response.status());

    let (sink, stream) = socket.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
