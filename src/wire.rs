//! WebSocket-Over-HTTP wire codec and per-connection GRIP context
//!
//! On the WebSocket-Over-HTTP transport every frame of a logical WebSocket
//! session arrives inside an HTTP request body as a sequence of encoded
//! lifecycle events. Each event is encoded as
//!
//! ```text
//! TYPE[ SP hex-content-size]\r\n[content\r\n]
//! ```
//!
//! e.g. `OPEN\r\n` or `TEXT 5\r\nhello\r\n`.
//!
//! Control instructions back to the GRIP proxy (subscribe a channel,
//! unsubscribe, disconnect) are accumulated per connection on a
//! [`WebSocketContext`] and encoded as TEXT events whose content is `c:`
//! followed by a JSON control message.

use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Content type identifying WebSocket-Over-HTTP requests and responses.
pub const WEBSOCKET_EVENTS_CONTENT_TYPE: &str = "application/websocket-events";

/// Kind of a WebSocket lifecycle event on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Open,
    Text,
    Binary,
    Ping,
    Pong,
    Close,
    Disconnect,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Open => "OPEN",
            EventKind::Text => "TEXT",
            EventKind::Binary => "BINARY",
            EventKind::Ping => "PING",
            EventKind::Pong => "PONG",
            EventKind::Close => "CLOSE",
            EventKind::Disconnect => "DISCONNECT",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "OPEN" => Some(EventKind::Open),
            "TEXT" => Some(EventKind::Text),
            "BINARY" => Some(EventKind::Binary),
            "PING" => Some(EventKind::Ping),
            "PONG" => Some(EventKind::Pong),
            "CLOSE" => Some(EventKind::Close),
            "DISCONNECT" => Some(EventKind::Disconnect),
            _ => None,
        }
    }
}

/// One decoded WebSocket lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketEvent {
    pub kind: EventKind,
    pub content: Option<Bytes>,
}

impl WebSocketEvent {
    pub fn new(kind: EventKind, content: Option<Bytes>) -> Self {
        Self { kind, content }
    }

    pub fn open() -> Self {
        Self::new(EventKind::Open, None)
    }

    pub fn text(content: impl Into<Bytes>) -> Self {
        Self::new(EventKind::Text, Some(content.into()))
    }

    pub fn close(code: u16) -> Self {
        Self::new(EventKind::Close, Some(Bytes::from(code.to_be_bytes().to_vec())))
    }

    pub fn disconnect() -> Self {
        Self::new(EventKind::Disconnect, None)
    }

    /// The 16-bit close code carried by a CLOSE event, either as two
    /// big-endian bytes (the wire form) or as ASCII digits.
    pub fn close_code(&self) -> Option<u16> {
        let content = self.content.as_ref()?;
        if content.len() == 2 {
            return Some(u16::from_be_bytes([content[0], content[1]]));
        }
        std::str::from_utf8(content).ok()?.trim().parse().ok()
    }

    /// Event content as UTF-8 text.
    pub fn content_str(&self) -> Result<Option<&str>> {
        match &self.content {
            None => Ok(None),
            Some(content) => std::str::from_utf8(content)
                .map(Some)
                .map_err(|e| Error::InvalidRequest(format!("event content is not UTF-8: {e}"))),
        }
    }
}

/// Decode a request body into its ordered list of WebSocket events.
pub fn decode_events(body: &[u8]) -> Result<Vec<WebSocketEvent>> {
    let mut events = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let line_end = find_crlf(body, pos)
            .ok_or_else(|| Error::InvalidRequest("unterminated event header line".into()))?;
        let header = std::str::from_utf8(&body[pos..line_end])
            .map_err(|_| Error::InvalidRequest("event header is not UTF-8".into()))?;
        pos = line_end + 2;
        if header.is_empty() {
            continue;
        }

        let mut parts = header.splitn(2, ' ');
        let name = parts.next().unwrap_or_default();
        let kind = EventKind::parse(name)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown event type {name:?}")))?;

        let content = match parts.next() {
            None => None,
            Some(size_hex) => {
                let size = usize::from_str_radix(size_hex.trim(), 16).map_err(|_| {
                    Error::InvalidRequest(format!("invalid event content size {size_hex:?}"))
                })?;
                if pos + size > body.len() {
                    return Err(Error::InvalidRequest(
                        "event content extends past end of body".into(),
                    ));
                }
                let content = Bytes::copy_from_slice(&body[pos..pos + size]);
                pos += size;
                if body.get(pos..pos + 2) != Some(b"\r\n".as_slice()) {
                    return Err(Error::InvalidRequest(
                        "event content missing trailing CRLF".into(),
                    ));
                }
                pos += 2;
                Some(content)
            }
        };
        events.push(WebSocketEvent::new(kind, content));
    }
    Ok(events)
}

/// Encode events into a response body.
pub fn encode_events(events: &[WebSocketEvent]) -> Vec<u8> {
    let mut out = Vec::new();
    for event in events {
        out.extend_from_slice(event.kind.as_str().as_bytes());
        match &event.content {
            None => out.extend_from_slice(b"\r\n"),
            Some(content) => {
                out.extend_from_slice(format!(" {:x}\r\n", content.len()).as_bytes());
                out.extend_from_slice(content);
                out.extend_from_slice(b"\r\n");
            }
        }
    }
    out
}

fn find_crlf(body: &[u8], from: usize) -> Option<usize> {
    body[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

#[derive(Serialize)]
struct ControlMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
}

/// Per-connection context for GRIP control instructions.
///
/// Listeners issue subscribe/unsubscribe/disconnect instructions here while
/// handling events; the gateway drains them into the response body ahead of
/// the listener's own outbound events.
#[derive(Debug)]
pub struct WebSocketContext {
    connection_id: String,
    message_prefix: String,
    out_events: Mutex<Vec<WebSocketEvent>>,
}

impl WebSocketContext {
    pub fn new(connection_id: impl Into<String>, message_prefix: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            message_prefix: message_prefix.into(),
            out_events: Mutex::new(Vec::new()),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Ask the GRIP proxy to subscribe this connection to a channel.
    pub fn subscribe(&self, channel: &str) {
        self.push_control("subscribe", Some(channel));
    }

    /// Ask the GRIP proxy to unsubscribe this connection from a channel.
    pub fn unsubscribe(&self, channel: &str) {
        self.push_control("unsubscribe", Some(channel));
    }

    /// Tell the GRIP proxy to forget this connection entirely.
    pub fn disconnect(&self) {
        self.out_events.lock().push(WebSocketEvent::disconnect());
    }

    /// Drain the accumulated control out-events.
    pub fn take_out_events(&self) -> Vec<WebSocketEvent> {
        std::mem::take(&mut *self.out_events.lock())
    }

    fn push_control(&self, kind: &str, channel: Option<&str>) {
        let message = ControlMessage {
            kind,
            channel: channel.map(|c| format!("{}{}", self.message_prefix, c)),
        };
        let content = format!(
            "c:{}",
            serde_json::to_string(&message).expect("control message serializes")
        );
        self.out_events.lock().push(WebSocketEvent::text(content));
    }
}

/// Identity of the WebSocket-Over-HTTP connection a request belongs to.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Connection id assigned by the GRIP proxy, stable for the session.
    pub id: String,
    /// `Sec-WebSocket-Protocol` requested by the client, if any.
    pub protocol: Option<String>,
    /// Control context for issuing GRIP instructions during handling.
    pub context: Arc<WebSocketContext>,
}
