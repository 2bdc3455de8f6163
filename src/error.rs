//! Error types for the hub client.
//!
//! Two layers:
//!
//! - [`ProtocolError`] - a wire payload could not be decoded. Always handled
//!   locally by the connection (the offending record is dropped).
//! - [`HubError`] - what callers of [`crate::HubConnection`] see.

/// Malformed or invariant-violating wire payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload is not well-formed JSON.
    InvalidJson(String),
    /// Payload is JSON but not an object.
    NotAnObject,
    /// The `type` discriminator is missing or not an integer.
    MissingType,
    /// The `type` discriminator names a message kind this client does not handle.
    UnknownType(u64),
    /// A required field is absent.
    MissingField(&'static str),
    /// A field is present but has the wrong JSON type.
    InvalidField(&'static str),
    /// A Completion carries both `result` and `error`.
    CompletionWithResultAndError,
    /// A Completion carries neither `result` nor `error`.
    CompletionWithoutOutcome,
    /// A framed payload did not contain the record separator.
    MissingRecordSeparator,
    /// The server answered the handshake with an error.
    HandshakeRejected(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson(msg) => write!(f, "Invalid JSON payload: {msg}"),
            Self::NotAnObject => write!(f, "Message is not a JSON object"),
            Self::MissingType => write!(f, "Message has no type discriminator"),
            Self::UnknownType(t) => write!(f, "Unknown message type: {t}"),
            Self::MissingField(name) => write!(f, "Missing field '{name}'"),
            Self::InvalidField(name) => write!(f, "Invalid value for field '{name}'"),
            Self::CompletionWithResultAndError => {
                write!(f, "Completion carries both a result and an error")
            }
            Self::CompletionWithoutOutcome => {
                write!(f, "Completion carries neither a result nor an error")
            }
            Self::MissingRecordSeparator => write!(f, "Message is missing the record separator"),
            Self::HandshakeRejected(msg) => write!(f, "Server rejected handshake: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Errors surfaced by [`crate::HubConnection`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Operation requires the `Connected` state.
    NotConnected,
    /// Invocation deadline or connect timeout elapsed.
    Timeout,
    /// Socket dropped or `stop()` was called before the call settled.
    ConnectionClosed(Option<String>),
    /// `start()` called while not `Disconnected`.
    AlreadyStarted,
    /// Wire protocol violation (including a rejected handshake).
    Protocol(ProtocolError),
    /// The hub answered the invocation with an error.
    Server(String),
    /// The transport failed to open or to send.
    Transport(String),
    /// The connection task is gone.
    Shutdown,
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Connection is not in the Connected state"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::ConnectionClosed(Some(reason)) => write!(f, "Connection closed: {reason}"),
            Self::ConnectionClosed(None) => write!(f, "Connection closed"),
            Self::AlreadyStarted => write!(f, "Connection already started"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Server(msg) => write!(f, "Server error: {msg}"),
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::Shutdown => write!(f, "Connection task has shut down"),
        }
    }
}

impl std::error::Error for HubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for HubError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}
