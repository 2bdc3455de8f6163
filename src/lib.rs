//! hubsocket - reconnecting client for SignalR-style JSON hubs.
//!
//! A hub is an RPC endpoint reached over a single WebSocket. Both sides can
//! call named methods on the other; calls that expect a result are correlated
//! by invocation id.
//!
//! # Architecture
//!
//! - **HubConnection** - handle used by the application (start/stop, invoke,
//!   send, method handlers, lifecycle listeners)
//! - **Connection actor** - tokio task that owns the socket, the pending
//!   invocation table and the reconnect state machine
//! - **Protocol** - JSON hub message codec (records end with `0x1E`)
//! - **Retry** - attempt-indexed reconnect delay policies
//! - **Transport** - socket contract, WebSocket implementation in [`ws`]
//!
//! # Modules
//!
//! - [`connection`] - handle, builder, state machine
//! - [`protocol`] - message types and codec
//! - [`retry`] - retry policies
//! - [`events`] - named-event emitter used for lifecycle notifications
//! - [`config`] - configuration file and environment overrides

// Rust guideline compliant 2026-02

pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod events;
pub mod protocol;
pub mod retry;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use config::ClientConfig;
pub use connection::{
    lifecycle, method_handler, ConnectionState, DisconnectReason, HubConnection,
    HubConnectionBuilder, LifecycleEvent, MethodHandler,
};
pub use error::{HubError, ProtocolError};
pub use retry::{CustomLadder, ExponentialBackoff, FixedInterval, NoRetry, RetryConfig, RetryPolicy};
pub use transport::{FrameSink, FrameStream, SocketPair, Transport, TransportFrame, WebSocketTransport};
