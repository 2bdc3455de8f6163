//! Connection defaults.
//!
//! Keep-alive values match what hub servers expect from clients: the server
//! pings every 15 s, so 30 s of silence means the server is gone.

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Time allowed for opening the socket plus the protocol handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Time an invocation may wait for its Completion.
pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Silence from the server after which the connection counts as lost.
///
/// Should be at least twice the server's keep-alive interval so a single late
/// ping does not trigger a reconnect.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Keep-alive
// ============================================================================

/// Outbound silence after which the client sends a Ping.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

// ============================================================================
// Messages
// ============================================================================

/// Error text returned to the server when a correlated invocation has no
/// client handler.
pub const NO_CLIENT_RESULT: &str = "Client didn't provide a result.";

/// Reason attached to invocations failed by a local `stop()`.
pub const STOPPED_REASON: &str =
    "Invocation canceled due to the underlying connection being closed.";

/// Reason used when the server stays silent past the server timeout.
pub const SERVER_TIMEOUT_REASON: &str =
    "Server timeout elapsed without receiving a message from the server.";
