//! WebSocket-Over-HTTP gateway surface
//!
//! One axum middleware recognizes requests the GRIP proxy forwards on behalf
//! of a logical WebSocket connection (`Grip-Sig` header plus the
//! `application/websocket-events` content type) and hands everything else to
//! the next handler, so the gateway coexists with ordinary HTTP traffic on
//! the same listener.
//!
//! For a recognized request the gateway decodes the body's event sequence,
//! dispatches each event in order to the composed connection listener,
//! gives the listener a final look at the raw HTTP request, and encodes the
//! response: accumulated GRIP control instructions first, then the
//! listener's outbound events.
//!
//! ```rust,no_run
//! use axum::{middleware, Router};
//! use graphql_grip_gateway::gateway::{websocket_over_http, GripGateway};
//! use std::sync::Arc;
//!
//! let gateway = Arc::new(GripGateway::builder().build());
//! let app: Router = Router::new()
//!     .layer(middleware::from_fn_with_state(gateway, websocket_over_http));
//! ```

use crate::config::GatewayConfig;
use crate::epcp::ChannelPublisher;
use crate::error::{Error, Result};
use crate::lifecycle::{ConnectionTrackingListener, StorageCleaner, StoredConnection};
use crate::listener::{ComposedListener, ConnectionListener};
use crate::publish::SubscriptionPublisher;
use crate::pubsub::{NullExecutor, SubscriptionExecutor};
use crate::storage::{MemoryTable, Storage};
use crate::subscriptions::{
    GraphqlWsListener, StoredSubscription, SubscriptionCallbacksListener,
    SubscriptionDeletingListener, SubscriptionEventCallback, SubscriptionRegistrationListener,
};
use crate::wire::{
    decode_events, encode_events, ConnectionInfo, EventKind, WebSocketContext, WebSocketEvent,
    WEBSOCKET_EVENTS_CONTENT_TYPE,
};
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Header carrying the GRIP proxy's request signature.
pub const GRIP_SIG_HEADER: &str = "grip-sig";
/// Header carrying the proxy-assigned connection id.
pub const CONNECTION_ID_HEADER: &str = "connection-id";

/// Cap on a WebSocket-events request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// The WebSocket-Over-HTTP subscription gateway.
///
/// Holds the storage tables, the external execution engine, and the
/// configuration shared by every request. Construct with
/// [`GripGateway::builder`].
pub struct GripGateway {
    config: GatewayConfig,
    connections: Arc<dyn Storage<StoredConnection>>,
    subscriptions: Arc<dyn Storage<StoredSubscription>>,
    executor: Arc<dyn SubscriptionExecutor>,
    on_subscription_start: Option<SubscriptionEventCallback>,
    on_subscription_stop: Option<SubscriptionEventCallback>,
}

impl GripGateway {
    pub fn builder() -> GripGatewayBuilder {
        GripGatewayBuilder::default()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn connections(&self) -> Arc<dyn Storage<StoredConnection>> {
        self.connections.clone()
    }

    pub fn subscriptions(&self) -> Arc<dyn Storage<StoredSubscription>> {
        self.subscriptions.clone()
    }

    /// Cleanup sweep over this gateway's storage tables.
    pub fn storage_cleaner(&self) -> StorageCleaner {
        StorageCleaner::new(self.connections.clone(), self.subscriptions.clone())
    }

    /// Publish/replay engine wired to this gateway's subscription storage,
    /// executor, and channel naming, so publishes land on the same channels
    /// the gateway subscribed.
    pub fn subscription_publisher(
        &self,
        publisher: Arc<dyn ChannelPublisher>,
    ) -> SubscriptionPublisher {
        SubscriptionPublisher::new(self.subscriptions.clone(), self.executor.clone(), publisher)
            .with_channel_namer(self.config.channel_namer.clone())
    }

    /// Whether a request is a WebSocket-Over-HTTP request from the GRIP
    /// proxy rather than ordinary HTTP traffic.
    pub fn is_websocket_over_http(headers: &HeaderMap) -> bool {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or_default().trim())
            .unwrap_or_default();
        headers.contains_key(GRIP_SIG_HEADER) && content_type == WEBSOCKET_EVENTS_CONTENT_TYPE
    }

    /// Handle one WebSocket-Over-HTTP request.
    pub async fn handle(&self, headers: &HeaderMap, body: &[u8]) -> Result<Response> {
        let connection_id = headers
            .get(CONNECTION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                Error::InvalidRequest("expected Connection-Id header but none is present".into())
            })?;
        let protocol = headers
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let events = decode_events(body)?;
        if events.is_empty() {
            debug!(connection_id, "request with zero events; may be a keep-alive");
        }

        let context = Arc::new(WebSocketContext::new(
            connection_id,
            &self.config.message_prefix,
        ));
        let connection = ConnectionInfo {
            id: connection_id.to_string(),
            protocol,
            context: context.clone(),
        };
        let listener = self.connection_listener(&connection);

        let mut response_headers: Vec<(String, String)> = Vec::new();
        let mut events_out: Vec<WebSocketEvent> = Vec::new();
        for event in &events {
            match event.kind {
                EventKind::Open => {
                    if let Some(headers) = listener.on_open().await? {
                        response_headers.extend(headers);
                    }
                    events_out.push(WebSocketEvent::open());
                }
                EventKind::Text => {
                    let Some(message) = event.content_str()? else {
                        continue;
                    };
                    if message.is_empty() {
                        continue;
                    }
                    if let Some(response) = listener.on_message(message).await? {
                        events_out.push(WebSocketEvent::text(response));
                    }
                }
                EventKind::Close => {
                    listener.on_close(event.close_code()).await?;
                    // acknowledge with the close code echoed verbatim
                    events_out.push(event.clone());
                }
                EventKind::Disconnect => {
                    listener.on_disconnect().await?;
                    events_out.push(WebSocketEvent::disconnect());
                }
                other => {
                    return Err(Error::InvalidRequest(format!(
                        "unexpected event type {}",
                        other.as_str()
                    )));
                }
            }
        }

        if let Some(headers) = listener.on_http_request(headers).await? {
            response_headers.extend(headers);
        }

        let mut body_out = encode_events(&context.take_out_events());
        body_out.extend(encode_events(&events_out));

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, WEBSOCKET_EVENTS_CONTENT_TYPE)
            .header(
                header::SEC_WEBSOCKET_EXTENSIONS,
                format!("grip; message-prefix=\"{}\"", self.config.message_prefix),
            );
        for (name, value) in response_headers {
            response = response.header(name, value);
        }
        response
            .body(Body::from(body_out))
            .map_err(|e| Error::Internal(format!("could not build response: {e}")))
    }

    /// Assemble the composed listener for one connection.
    ///
    /// Registration runs first so later listeners can rely on the stored
    /// subscription existing; deletion runs after the channel emulation has
    /// read the records a stop frame refers to; callbacks run last so they
    /// observe storage in its settled state.
    fn connection_listener(&self, connection: &ConnectionInfo) -> ComposedListener {
        ComposedListener::new(vec![
            Arc::new(ConnectionTrackingListener::new(
                connection.clone(),
                self.connections.clone(),
                self.config.keep_alive_interval_seconds,
            )),
            Arc::new(SubscriptionRegistrationListener::new(
                connection.clone(),
                self.subscriptions.clone(),
                self.executor.clone(),
            )),
            Arc::new(GraphqlWsListener::new(
                connection.clone(),
                self.connections.clone(),
                self.subscriptions.clone(),
                self.config.channel_namer.clone(),
                self.config.keep_alive_interval_seconds,
            )),
            Arc::new(SubscriptionDeletingListener::new(
                connection.clone(),
                self.subscriptions.clone(),
            )),
            Arc::new(SubscriptionCallbacksListener {
                on_subscription_start: self.on_subscription_start.clone(),
                on_subscription_stop: self.on_subscription_stop.clone(),
            }),
        ])
    }
}

/// Builder for [`GripGateway`].
#[derive(Default)]
pub struct GripGatewayBuilder {
    config: GatewayConfig,
    connections: Option<Arc<dyn Storage<StoredConnection>>>,
    subscriptions: Option<Arc<dyn Storage<StoredSubscription>>>,
    executor: Option<Arc<dyn SubscriptionExecutor>>,
    on_subscription_start: Option<SubscriptionEventCallback>,
    on_subscription_stop: Option<SubscriptionEventCallback>,
}

impl GripGatewayBuilder {
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Backing store for connection records (default: in-memory).
    pub fn connection_storage(mut self, storage: Arc<dyn Storage<StoredConnection>>) -> Self {
        self.connections = Some(storage);
        self
    }

    /// Backing store for subscription records (default: in-memory).
    pub fn subscription_storage(mut self, storage: Arc<dyn Storage<StoredSubscription>>) -> Self {
        self.subscriptions = Some(storage);
        self
    }

    /// External GraphQL execution engine used for the registration pass and
    /// publish-time replays (default: a null executor; trigger matching then
    /// falls back to the subscribed field name).
    pub fn executor(mut self, executor: Arc<dyn SubscriptionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Called after a subscription has been persisted.
    pub fn on_subscription_start(mut self, callback: SubscriptionEventCallback) -> Self {
        self.on_subscription_start = Some(callback);
        self
    }

    /// Called after a subscription has been deleted by a stop frame.
    pub fn on_subscription_stop(mut self, callback: SubscriptionEventCallback) -> Self {
        self.on_subscription_stop = Some(callback);
        self
    }

    pub fn build(self) -> GripGateway {
        GripGateway {
            config: self.config,
            connections: self
                .connections
                .unwrap_or_else(|| Arc::new(MemoryTable::new())),
            subscriptions: self
                .subscriptions
                .unwrap_or_else(|| Arc::new(MemoryTable::new())),
            executor: self.executor.unwrap_or_else(|| Arc::new(NullExecutor)),
            on_subscription_start: self.on_subscription_start,
            on_subscription_stop: self.on_subscription_stop,
        }
    }
}

/// Axum middleware serving WebSocket-Over-HTTP requests and passing all
/// other traffic through to the next handler.
pub async fn websocket_over_http(
    State(gateway): State<Arc<GripGateway>>,
    request: Request,
    next: Next,
) -> Response {
    if !GripGateway::is_websocket_over_http(request.headers()) {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "could not read websocket-events body");
            return (StatusCode::BAD_REQUEST, "unreadable request body").into_response();
        }
    };

    match gateway.handle(&parts.headers, &body).await {
        Ok(response) => response,
        Err(e) if e.is_client_error() => {
            warn!(error = %e, "rejecting websocket-over-http request");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e) => {
            error!(error = %e, "websocket-over-http request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}
