//! graphql-ws frame model
//!
//! GraphQL subscriptions ride inside ordinary WebSocket TEXT frames using the
//! `subscriptions-transport-ws` message format: `connection_init`/
//! `connection_ack` for the handshake, `start`/`stop` to begin and end a
//! subscription operation, and `data`/`complete` for server pushes.
//!
//! The gateway only interprets the client-to-server frames it needs for
//! channel management; everything else passes through untouched so ordinary
//! queries and mutations sharing the socket are not intercepted.

use crate::error::{Error, Result};
use async_graphql::parser::types::{DocumentOperations, Selection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of a graphql-ws `start` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPayload {
    /// GraphQL query document.
    pub query: String,
    /// Operation name within the document, if the client sent one.
    #[serde(
        rename = "operationName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,
    /// Variables passed to the operation.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub variables: Value,
}

/// A graphql-ws `start` frame: the client wants to begin a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartMessage {
    /// Client-chosen operation id, echoed on every `data` frame.
    pub id: String,
    pub payload: StartPayload,
}

impl StartMessage {
    /// Serialize back to the canonical wire form, `type` field included.
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "id": self.id,
            "type": "start",
            "payload": self.payload,
        })
        .to_string()
    }
}

/// A graphql-ws `stop` frame: the client ends one subscription operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopMessage {
    pub id: String,
}

/// One parsed client-to-server graphql-ws frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    ConnectionInit,
    Start(StartMessage),
    Stop(StopMessage),
    /// Any other frame type; carried through without interpretation.
    Other(String),
}

/// Parse a TEXT message into a graphql-ws frame.
///
/// Returns `Frame::Other` for frame types the gateway does not manage, and
/// an error for messages that are not graphql-ws frames at all or that
/// carry a malformed `start`/`stop` shape.
pub fn parse_frame(message: &str) -> Result<Frame> {
    let value: Value = serde_json::from_str(message)
        .map_err(|e| Error::Protocol(format!("message is not JSON: {e}")))?;
    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("frame has no type field".into()))?;
    match frame_type {
        "connection_init" => Ok(Frame::ConnectionInit),
        "start" => {
            let start: StartMessage = serde_json::from_value(value)
                .map_err(|e| Error::Protocol(format!("invalid start message: {e}")))?;
            Ok(Frame::Start(start))
        }
        "stop" => {
            let stop: StopMessage = serde_json::from_value(value)
                .map_err(|e| Error::Protocol(format!("invalid stop message: {e}")))?;
            Ok(Frame::Stop(stop))
        }
        other => Ok(Frame::Other(other.to_string())),
    }
}

/// Parse a stored start message back into its typed form.
pub fn parse_start_message(message: &str) -> Result<StartMessage> {
    match parse_frame(message)? {
        Frame::Start(start) => Ok(start),
        _ => Err(Error::Protocol(format!(
            "stored message is not a graphql-ws start message: {message}"
        ))),
    }
}

/// Minimal graphql-ws handshake responder.
///
/// Accepts every incoming subscription without sending anything to the
/// subscriber itself; data frames are published to subscribers out of band
/// at mutation time.
pub fn acceptance_response(frame: &Frame) -> Option<String> {
    match frame {
        Frame::ConnectionInit => Some(
            serde_json::json!({ "type": "connection_ack" }).to_string(),
        ),
        Frame::Stop(stop) => Some(
            serde_json::json!({
                "id": stop.id,
                "payload": null,
                "type": "complete",
            })
            .to_string(),
        ),
        Frame::Start(_) | Frame::Other(_) => None,
    }
}

/// Build the graphql-ws `data` frame that delivers one execution result to
/// the subscriber identified by `operation_id`.
pub fn data_message(operation_id: &str, payload: &Value) -> String {
    serde_json::json!({
        "id": operation_id,
        "payload": payload,
        "type": "data",
    })
    .to_string()
}

/// Extract the name of the root field being subscribed to.
///
/// This is the first top-level selection of the document's operation. Errors
/// when the document fails to parse, has no operation, has an operation with
/// no selections, or when the first selection is not a plain field. These
/// errors are fatal for the frame carrying the query, never for the
/// connection.
pub fn subscription_field_name(query: &str) -> Result<String> {
    let document = async_graphql::parser::parse_query(query)
        .map_err(|e| Error::Protocol(format!("unparseable graphql query: {e}")))?;
    let operation = match &document.operations {
        DocumentOperations::Single(operation) => &operation.node,
        DocumentOperations::Multiple(operations) => {
            &operations
                .values()
                .next()
                .ok_or_else(|| Error::Protocol("document has no operation".into()))?
                .node
        }
    };
    let selection = operation
        .selection_set
        .node
        .items
        .first()
        .ok_or_else(|| Error::Protocol("operation has no selections".into()))?;
    match &selection.node {
        Selection::Field(field) => Ok(field.node.name.node.as_str().to_owned()),
        _ => Err(Error::Protocol(
            "first selection of the operation is not a field".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_frame() {
        let message = r#"{
            "id": "op1",
            "type": "start",
            "payload": {
                "query": "subscription { postAdded { author comment } }",
                "variables": {}
            }
        }"#;

        let frame = parse_frame(message).unwrap();
        let Frame::Start(start) = frame else {
            panic!("expected start frame");
        };
        assert_eq!(start.id, "op1");
        assert!(start.payload.query.contains("postAdded"));
        assert_eq!(start.payload.operation_name, None);
    }

    #[test]
    fn test_parse_stop_frame() {
        let frame = parse_frame(r#"{"id":"op1","type":"stop"}"#).unwrap();
        assert_eq!(frame, Frame::Stop(StopMessage { id: "op1".into() }));
    }

    #[test]
    fn test_parse_connection_init() {
        let frame = parse_frame(r#"{"type":"connection_init","payload":{}}"#).unwrap();
        assert_eq!(frame, Frame::ConnectionInit);
    }

    #[test]
    fn test_unknown_frame_type_passes_through() {
        let frame = parse_frame(r#"{"type":"ka"}"#).unwrap();
        assert_eq!(frame, Frame::Other("ka".into()));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_frame("not json at all").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_parse_rejects_start_without_query() {
        let err = parse_frame(r#"{"id":"op1","type":"start","payload":{}}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_parse_rejects_frame_without_type() {
        let err = parse_frame(r#"{"id":"op1"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_start_message_json_roundtrip() {
        let start = StartMessage {
            id: "op1".into(),
            payload: StartPayload {
                query: "subscription { postAdded { author } }".into(),
                operation_name: Some("OnPost".into()),
                variables: serde_json::json!({ "a": 1 }),
            },
        };

        let parsed = parse_start_message(&start.to_json()).unwrap();
        assert_eq!(parsed, start);
    }

    #[test]
    fn test_parse_start_message_rejects_stop() {
        let err = parse_start_message(r#"{"id":"op1","type":"stop"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_acceptance_connection_init_acks() {
        let response = acceptance_response(&Frame::ConnectionInit).unwrap();
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["type"], "connection_ack");
    }

    #[test]
    fn test_acceptance_stop_completes() {
        let frame = Frame::Stop(StopMessage { id: "op1".into() });
        let response = acceptance_response(&frame).unwrap();
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["type"], "complete");
        assert_eq!(value["id"], "op1");
        assert_eq!(value["payload"], Value::Null);
    }

    #[test]
    fn test_acceptance_start_and_other_are_silent() {
        assert_eq!(acceptance_response(&Frame::Other("ka".into())), None);
        let start = parse_frame(
            r#"{"id":"op1","type":"start","payload":{"query":"subscription{a}"}}"#,
        )
        .unwrap();
        assert_eq!(acceptance_response(&start), None);
    }

    #[test]
    fn test_data_message_envelope() {
        let message = data_message("op1", &serde_json::json!({ "data": { "x": 1 } }));
        let value: Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["type"], "data");
        assert_eq!(value["id"], "op1");
        assert_eq!(value["payload"]["data"]["x"], 1);
    }

    #[test]
    fn test_field_name_simple_subscription() {
        let name =
            subscription_field_name("subscription { postAdded { author comment } }").unwrap();
        assert_eq!(name, "postAdded");
    }

    #[test]
    fn test_field_name_named_operation() {
        let name =
            subscription_field_name("subscription OnPost { postAdded { author } }").unwrap();
        assert_eq!(name, "postAdded");
    }

    #[test]
    fn test_field_name_unparseable_query() {
        let err = subscription_field_name("subscription {").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_field_name_first_selection_not_a_field() {
        let query = "subscription { ...postFields } fragment postFields on Subscription { postAdded { author } }";
        let err = subscription_field_name(query).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
