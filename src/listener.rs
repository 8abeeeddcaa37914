//! Connection listeners and their composition
//!
//! A [`ConnectionListener`] reacts to the lifecycle events of one logical
//! WebSocket connection delivered over HTTP. Independent listeners (connection
//! tracking, subscription registration, GRIP channel emulation, ...) are
//! combined with [`ComposedListener`], which dispatches each event to every
//! listener in order and merges their responses deterministically:
//!
//! - `on_message` responses concatenate with a newline separator
//! - `on_open`/`on_http_request` header maps merge; two listeners setting the
//!   same header is a fail-fast [`Error::HeaderConflict`]
//! - `on_close`/`on_disconnect` run in order, defaulting to no-ops
//!
//! Ordering is significant: a listener that persists a subscription record
//! must run before one that reacts to the record existing, and a listener
//! that deletes the record on stop must run after any listener that still
//! needs to read it.

use crate::error::{Error, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Response headers returned from `on_open`/`on_http_request` handlers.
pub type ListenerHeaders = BTreeMap<String, String>;

/// Listener for the lifecycle of one WebSocket-Over-HTTP connection.
///
/// Every handler has a no-op default so partial listeners only implement
/// the events they care about.
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    /// Called when the connection opens. May return response headers.
    async fn on_open(&self) -> Result<Option<ListenerHeaders>> {
        Ok(None)
    }

    /// Called for each TEXT message. A returned string is emitted as an
    /// outbound TEXT event.
    async fn on_message(&self, _message: &str) -> Result<Option<String>> {
        Ok(None)
    }

    /// Called when the connection is closed explicitly.
    async fn on_close(&self, _close_code: Option<u16>) -> Result<()> {
        Ok(())
    }

    /// Called when the connection closed uncleanly or no longer exists.
    async fn on_disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Called once per HTTP request after all events have been dispatched,
    /// including requests carrying zero events (keep-alives).
    async fn on_http_request(&self, _headers: &HeaderMap) -> Result<Option<ListenerHeaders>> {
        Ok(None)
    }
}

/// Merge header maps, failing fast when the same header name (compared
/// case-insensitively) is set more than once.
pub fn merge_headers(
    mut merged: ListenerHeaders,
    additional: ListenerHeaders,
) -> Result<ListenerHeaders> {
    for (name, value) in additional {
        let duplicate = merged
            .keys()
            .any(|existing| existing.eq_ignore_ascii_case(&name));
        if duplicate {
            return Err(Error::HeaderConflict(format!(
                "header {name} already set by an earlier listener"
            )));
        }
        merged.insert(name, value);
    }
    Ok(merged)
}

/// An ordered composition of connection listeners.
pub struct ComposedListener {
    listeners: Vec<Arc<dyn ConnectionListener>>,
}

impl ComposedListener {
    pub fn new(listeners: Vec<Arc<dyn ConnectionListener>>) -> Self {
        Self { listeners }
    }
}

#[async_trait]
impl ConnectionListener for ComposedListener {
    async fn on_open(&self) -> Result<Option<ListenerHeaders>> {
        let mut merged = ListenerHeaders::new();
        for listener in &self.listeners {
            if let Some(headers) = listener.on_open().await? {
                merged = merge_headers(merged, headers)?;
            }
        }
        Ok(Some(merged))
    }

    async fn on_message(&self, message: &str) -> Result<Option<String>> {
        let mut responses = Vec::new();
        for listener in &self.listeners {
            if let Some(response) = listener.on_message(message).await? {
                if !response.is_empty() {
                    responses.push(response);
                }
            }
        }
        if responses.is_empty() {
            Ok(None)
        } else {
            Ok(Some(responses.join("\n")))
        }
    }

    async fn on_close(&self, close_code: Option<u16>) -> Result<()> {
        for listener in &self.listeners {
            listener.on_close(close_code).await?;
        }
        Ok(())
    }

    async fn on_disconnect(&self) -> Result<()> {
        for listener in &self.listeners {
            listener.on_disconnect().await?;
        }
        Ok(())
    }

    async fn on_http_request(&self, headers: &HeaderMap) -> Result<Option<ListenerHeaders>> {
        let mut merged = ListenerHeaders::new();
        for listener in &self.listeners {
            if let Some(response) = listener.on_http_request(headers).await? {
                merged = merge_headers(merged, response)?;
            }
        }
        Ok(Some(merged))
    }
}
