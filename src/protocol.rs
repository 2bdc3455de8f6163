//! JSON hub protocol codec.
//!
//! Every message is a JSON object terminated by the ASCII record separator
//! (`0x1E`). The `type` field selects the message kind:
//!
//! ```text
//! {"type":1,"invocationId":"0","target":"Echo","arguments":["hi"]}\x1e   Invocation
//! {"type":3,"invocationId":"0","result":"hi"}\x1e                        Completion
//! {"type":3,"invocationId":"0","error":"boom"}\x1e                       Completion
//! {"type":6}\x1e                                                         Ping
//! {"type":7,"error":"shutting down","allowReconnect":true}\x1e           Close
//! ```
//!
//! Before any of these, the client sends a handshake request
//! (`{"protocol":"json","version":1}\x1e`) and the server answers with `{}`
//! or `{"error":"..."}`.
//!
//! Everything here is pure: no socket, timer or connection state.

// Rust guideline compliant 2026-02

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ProtocolError;

/// Terminator appended to every serialized message.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Hub protocol name sent in the handshake.
pub const PROTOCOL_NAME: &str = "json";

/// Hub protocol version sent in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire values of the `type` discriminator.
pub mod message_type {
    /// Method call, optionally correlated.
    pub const INVOCATION: u64 = 1;
    /// Result or error of a correlated invocation.
    pub const COMPLETION: u64 = 3;
    /// Keep-alive.
    pub const PING: u64 = 6;
    /// Remote side is closing the connection.
    pub const CLOSE: u64 = 7;
}

/// A decoded hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Remote method call.
    Invocation(InvocationMessage),
    /// Outcome of an earlier correlated invocation.
    Completion(CompletionMessage),
    /// Keep-alive, no payload.
    Ping,
    /// Remote side is closing.
    Close(CloseMessage),
}

/// Remote method call.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationMessage {
    /// Correlation id. `None` means fire-and-forget.
    pub invocation_id: Option<String>,
    /// Method name on the receiving side.
    pub target: String,
    /// Positional arguments.
    pub arguments: Vec<Value>,
}

/// Outcome of a correlated invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMessage {
    /// Correlation id of the invocation this answers.
    pub invocation_id: String,
    /// Result value or error text, never both.
    pub outcome: CompletionOutcome,
}

/// Either half of a Completion.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// The method returned this value (`null` for no value).
    Result(Value),
    /// The method failed with this message.
    Error(String),
}

/// Graceful or erroneous termination notice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseMessage {
    /// Why the connection is closing, if it is an error.
    pub error: Option<String>,
    /// Whether the client may reconnect afterwards.
    pub allow_reconnect: bool,
}

impl Message {
    /// `true` for [`Message::Invocation`].
    #[must_use]
    pub fn is_invocation(&self) -> bool {
        matches!(self, Self::Invocation(_))
    }

    /// `true` for [`Message::Completion`].
    #[must_use]
    pub fn is_completion(&self) -> bool {
        matches!(self, Self::Completion(_))
    }

    /// `true` for [`Message::Ping`].
    #[must_use]
    pub fn is_ping(&self) -> bool {
        matches!(self, Self::Ping)
    }

    /// `true` for [`Message::Close`].
    #[must_use]
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}

/// Handshake request sent right after the socket opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Protocol name, always [`PROTOCOL_NAME`].
    pub protocol: String,
    /// Protocol version, always [`PROTOCOL_VERSION`].
    pub version: u32,
}

/// Server answer to the handshake. An empty object means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Construction
// ============================================================================

/// Invocation that expects a Completion with the same `id`.
#[must_use]
pub fn write_invocation(id: impl Into<String>, target: &str, args: Vec<Value>) -> Message {
    Message::Invocation(InvocationMessage {
        invocation_id: Some(id.into()),
        target: target.to_string(),
        arguments: args,
    })
}

/// Fire-and-forget invocation.
#[must_use]
pub fn write_message(target: &str, args: Vec<Value>) -> Message {
    Message::Invocation(InvocationMessage {
        invocation_id: None,
        target: target.to_string(),
        arguments: args,
    })
}

/// Answer to a correlated server-to-client invocation.
#[must_use]
pub fn write_completion(id: impl Into<String>, outcome: CompletionOutcome) -> Message {
    Message::Completion(CompletionMessage {
        invocation_id: id.into(),
        outcome,
    })
}

/// Keep-alive.
#[must_use]
pub fn write_ping() -> Message {
    Message::Ping
}

/// Close notice, optionally carrying an error.
#[must_use]
pub fn write_close(error: Option<String>) -> Message {
    Message::Close(CloseMessage {
        error,
        allow_reconnect: false,
    })
}

/// Serialized handshake request, separator included.
#[must_use]
pub fn write_handshake_request() -> String {
    let request = HandshakeRequest {
        protocol: PROTOCOL_NAME.to_string(),
        version: PROTOCOL_VERSION,
    };
    // A struct of a String and a u32 always serializes.
    let body = serde_json::to_string(&request).unwrap_or_default();
    format!("{body}{RECORD_SEPARATOR}")
}

// ============================================================================
// Encoding
// ============================================================================

/// Render `message` as one wire record, separator included.
#[must_use]
pub fn serialize_message(message: &Message) -> String {
    let value = match message {
        Message::Invocation(inv) => {
            let mut obj = json!({
                "type": message_type::INVOCATION,
                "target": inv.target,
                "arguments": inv.arguments,
            });
            if let Some(id) = &inv.invocation_id {
                obj["invocationId"] = Value::String(id.clone());
            }
            obj
        }
        Message::Completion(completion) => {
            let mut obj = json!({
                "type": message_type::COMPLETION,
                "invocationId": completion.invocation_id,
            });
            match &completion.outcome {
                CompletionOutcome::Result(value) => obj["result"] = value.clone(),
                CompletionOutcome::Error(error) => obj["error"] = Value::String(error.clone()),
            }
            obj
        }
        Message::Ping => json!({ "type": message_type::PING }),
        Message::Close(close) => {
            let mut obj = json!({ "type": message_type::CLOSE });
            if let Some(error) = &close.error {
                obj["error"] = Value::String(error.clone());
            }
            if close.allow_reconnect {
                obj["allowReconnect"] = Value::Bool(true);
            }
            obj
        }
    };
    format!("{value}{RECORD_SEPARATOR}")
}

// ============================================================================
// Decoding
// ============================================================================

/// Parse one record. A single trailing separator is accepted and ignored.
pub fn parse_message(data: &str) -> Result<Message, ProtocolError> {
    let record = data.strip_suffix(RECORD_SEPARATOR).unwrap_or(data);
    let value: Value =
        serde_json::from_str(record).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let kind = obj
        .get("type")
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MissingType)?;

    match kind {
        message_type::INVOCATION => parse_invocation(&obj).map(Message::Invocation),
        message_type::COMPLETION => parse_completion(&obj).map(Message::Completion),
        message_type::PING => Ok(Message::Ping),
        message_type::CLOSE => parse_close(&obj).map(Message::Close),
        other => Err(ProtocolError::UnknownType(other)),
    }
}

/// Split a transport frame into records and parse each one on its own.
///
/// One bad record does not poison its neighbours. A frame without any
/// separator yields a single [`ProtocolError::MissingRecordSeparator`].
pub fn parse_messages(frame: &str) -> Vec<Result<Message, ProtocolError>> {
    if !frame.ends_with(RECORD_SEPARATOR) {
        return vec![Err(ProtocolError::MissingRecordSeparator)];
    }
    frame
        .split(RECORD_SEPARATOR)
        .filter(|record| !record.is_empty())
        .map(parse_message)
        .collect()
}

/// Parse the handshake answer at the start of `frame`.
///
/// Returns the response and whatever followed its separator, which the server
/// may have batched into the same frame. A response carrying an error becomes
/// [`ProtocolError::HandshakeRejected`].
pub fn parse_handshake_response(frame: &str) -> Result<(HandshakeResponse, &str), ProtocolError> {
    let Some((record, rest)) = frame.split_once(RECORD_SEPARATOR) else {
        return Err(ProtocolError::MissingRecordSeparator);
    };
    let response: HandshakeResponse =
        serde_json::from_str(record).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    if let Some(error) = response.error {
        return Err(ProtocolError::HandshakeRejected(error));
    }
    Ok((response, rest))
}

fn parse_invocation(obj: &Map<String, Value>) -> Result<InvocationMessage, ProtocolError> {
    let target = match obj.get("target") {
        Some(Value::String(t)) => t.clone(),
        Some(_) => return Err(ProtocolError::InvalidField("target")),
        None => return Err(ProtocolError::MissingField("target")),
    };
    let arguments = match obj.get("arguments") {
        Some(Value::Array(args)) => args.clone(),
        None | Some(Value::Null) => Vec::new(),
        Some(_) => return Err(ProtocolError::InvalidField("arguments")),
    };
    Ok(InvocationMessage {
        invocation_id: optional_invocation_id(obj)?,
        target,
        arguments,
    })
}

fn parse_completion(obj: &Map<String, Value>) -> Result<CompletionMessage, ProtocolError> {
    let invocation_id =
        optional_invocation_id(obj)?.ok_or(ProtocolError::MissingField("invocationId"))?;

    // Presence of the key matters, not its value: `"result": null` is a result.
    let outcome = match (obj.get("result"), obj.get("error")) {
        (Some(_), Some(_)) => return Err(ProtocolError::CompletionWithResultAndError),
        (None, None) => return Err(ProtocolError::CompletionWithoutOutcome),
        (Some(result), None) => CompletionOutcome::Result(result.clone()),
        (None, Some(Value::String(error))) => CompletionOutcome::Error(error.clone()),
        (None, Some(_)) => return Err(ProtocolError::InvalidField("error")),
    };
    Ok(CompletionMessage {
        invocation_id,
        outcome,
    })
}

fn parse_close(obj: &Map<String, Value>) -> Result<CloseMessage, ProtocolError> {
    let error = match obj.get("error") {
        Some(Value::String(e)) => Some(e.clone()),
        None | Some(Value::Null) => None,
        Some(_) => return Err(ProtocolError::InvalidField("error")),
    };
    let allow_reconnect = match obj.get("allowReconnect") {
        Some(Value::Bool(b)) => *b,
        None | Some(Value::Null) => false,
        Some(_) => return Err(ProtocolError::InvalidField("allowReconnect")),
    };
    Ok(CloseMessage {
        error,
        allow_reconnect,
    })
}

fn optional_invocation_id(obj: &Map<String, Value>) -> Result<Option<String>, ProtocolError> {
    match obj.get("invocationId") {
        Some(Value::String(id)) => Ok(Some(id.clone())),
        None | Some(Value::Null) => Ok(None),
        Some(_) => Err(ProtocolError::InvalidField("invocationId")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: &Message) -> Message {
        parse_message(&serialize_message(message)).expect("round trip parses")
    }

    #[test]
    fn test_round_trip_every_message_kind() {
        let messages = [
            write_invocation("7", "Echo", vec![json!("hi"), json!({"n": 1})]),
            write_message("Notify", vec![]),
            write_completion("7", CompletionOutcome::Result(json!([1, 2]))),
            write_completion("8", CompletionOutcome::Result(Value::Null)),
            write_completion("9", CompletionOutcome::Error("nope".into())),
            write_ping(),
            write_close(None),
            write_close(Some("bye".into())),
            Message::Close(CloseMessage {
                error: None,
                allow_reconnect: true,
            }),
        ];
        for message in &messages {
            assert_eq!(&round_trip(message), message);
        }
    }

    #[test]
    fn test_invocation_wire_format() {
        let text = serialize_message(&write_invocation("0", "Echo", vec![json!("hi")]));
        assert!(text.ends_with(RECORD_SEPARATOR));

        let value: Value = serde_json::from_str(text.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(value["type"], 1);
        assert_eq!(value["invocationId"], "0");
        assert_eq!(value["target"], "Echo");
        assert_eq!(value["arguments"], json!(["hi"]));
    }

    #[test]
    fn test_fire_and_forget_has_no_invocation_id() {
        let text = serialize_message(&write_message("Notify", vec![]));
        let value: Value = serde_json::from_str(text.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert!(value.get("invocationId").is_none());
        assert_eq!(value["arguments"], json!([]));
    }

    #[test]
    fn test_ping_and_close_wire_format() {
        assert_eq!(serialize_message(&write_ping()), "{\"type\":6}\u{1e}");
        assert_eq!(serialize_message(&write_close(None)), "{\"type\":7}\u{1e}");
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(matches!(
            parse_message("not json\u{1e}"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(parse_message("[1,2]"), Err(ProtocolError::NotAnObject));
    }

    #[test]
    fn test_parse_rejects_missing_or_unknown_type() {
        assert_eq!(
            parse_message(r#"{"target":"Echo"}"#),
            Err(ProtocolError::MissingType)
        );
        assert_eq!(
            parse_message(r#"{"type":"1"}"#),
            Err(ProtocolError::MissingType)
        );
        assert_eq!(
            parse_message(r#"{"type":2,"invocationId":"1","item":1}"#),
            Err(ProtocolError::UnknownType(2))
        );
    }

    #[test]
    fn test_parse_completion_requires_exactly_one_outcome() {
        assert_eq!(
            parse_message(r#"{"type":3,"invocationId":"1","result":1,"error":"x"}"#),
            Err(ProtocolError::CompletionWithResultAndError)
        );
        assert_eq!(
            parse_message(r#"{"type":3,"invocationId":"1"}"#),
            Err(ProtocolError::CompletionWithoutOutcome)
        );
        assert_eq!(
            parse_message(r#"{"type":3,"result":1}"#),
            Err(ProtocolError::MissingField("invocationId"))
        );
    }

    #[test]
    fn test_parse_completion_null_result_is_a_result() {
        let message = parse_message(r#"{"type":3,"invocationId":"4","result":null}"#).unwrap();
        assert_eq!(
            message,
            write_completion("4", CompletionOutcome::Result(Value::Null))
        );
    }

    #[test]
    fn test_parse_invocation_without_arguments() {
        let message = parse_message(r#"{"type":1,"target":"Refresh"}"#).unwrap();
        assert!(message.is_invocation());
        assert_eq!(message, write_message("Refresh", vec![]));
    }

    #[test]
    fn test_parse_invocation_field_types() {
        assert_eq!(
            parse_message(r#"{"type":1}"#),
            Err(ProtocolError::MissingField("target"))
        );
        assert_eq!(
            parse_message(r#"{"type":1,"target":5}"#),
            Err(ProtocolError::InvalidField("target"))
        );
        assert_eq!(
            parse_message(r#"{"type":1,"target":"A","arguments":"x"}"#),
            Err(ProtocolError::InvalidField("arguments"))
        );
        assert_eq!(
            parse_message(r#"{"type":1,"target":"A","invocationId":3}"#),
            Err(ProtocolError::InvalidField("invocationId"))
        );
    }

    #[test]
    fn test_predicates() {
        assert!(write_ping().is_ping());
        assert!(!write_ping().is_close());
        assert!(write_close(None).is_close());
        assert!(write_completion("1", CompletionOutcome::Result(Value::Null)).is_completion());
        assert!(!write_message("A", vec![]).is_completion());
    }

    #[test]
    fn test_parse_messages_splits_batched_frame() {
        let frame = format!(
            "{}{}{}",
            serialize_message(&write_ping()),
            "garbage\u{1e}",
            serialize_message(&write_message("A", vec![]))
        );
        let parsed = parse_messages(&frame);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], Ok(Message::Ping));
        assert!(parsed[1].is_err());
        assert_eq!(parsed[2], Ok(write_message("A", vec![])));
    }

    #[test]
    fn test_parse_messages_requires_separator() {
        assert_eq!(
            parse_messages(r#"{"type":6}"#),
            vec![Err(ProtocolError::MissingRecordSeparator)]
        );
    }

    #[test]
    fn test_handshake_request_format() {
        assert_eq!(
            write_handshake_request(),
            "{\"protocol\":\"json\",\"version\":1}\u{1e}"
        );
    }

    #[test]
    fn test_handshake_response_success_with_trailing_messages() {
        let frame = "{}\u{1e}{\"type\":6}\u{1e}";
        let (response, rest) = parse_handshake_response(frame).unwrap();
        assert_eq!(response, HandshakeResponse::default());
        assert_eq!(rest, "{\"type\":6}\u{1e}");
    }

    #[test]
    fn test_handshake_response_error() {
        assert_eq!(
            parse_handshake_response("{\"error\":\"bad protocol\"}\u{1e}"),
            Err(ProtocolError::HandshakeRejected("bad protocol".into()))
        );
        assert_eq!(
            parse_handshake_response("{}"),
            Err(ProtocolError::MissingRecordSeparator)
        );
    }
}
