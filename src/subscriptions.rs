//! Subscription protocol emulation
//!
//! These listeners reconstruct graphql-ws subscription semantics from the
//! discrete WebSocket-Over-HTTP events the GRIP proxy delivers. A start
//! frame persists a [`StoredSubscription`] and asks the proxy to subscribe
//! the connection to the subscription's channel; a stop frame unsubscribes
//! and deletes the record; close/disconnect tears down everything the
//! connection owns. Data frames are not produced here: they are published
//! to channels out of band at mutation time (see `publish.rs`).
//!
//! Listener order matters. The registration listener runs first so every
//! later listener can rely on the record being in storage, and the deleting
//! listener runs after the channel emulation has read the records a stop
//! frame refers to.

use crate::channels::{ChannelNamer, ChannelSelector};
use crate::error::Result;
use crate::lifecycle::StoredConnection;
use crate::listener::{ConnectionListener, ListenerHeaders};
use crate::protocol::{
    acceptance_response, parse_frame, parse_start_message, subscription_field_name, Frame,
};
use crate::pubsub::{record_subscription_triggers, SubscriptionExecutor};
use crate::storage::{filter_records, Storage, TableRecord};
use crate::wire::ConnectionInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Stored record of one active subscription operation on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSubscription {
    /// Generated unique identifier.
    pub id: String,
    /// Owning connection; many subscriptions per connection.
    pub connection_id: String,
    /// Client-supplied id from the start frame, echoed on data frames and
    /// matched against stop frames.
    pub operation_id: String,
    /// The verbatim start frame, replayed at publish time.
    pub start_message: String,
    /// Root field of the subscribed operation, extracted once at start time
    /// so publishes can match without re-parsing every stored query.
    pub subscription_field_name: String,
    /// Pub/sub triggers the resolver subscribed to during registration.
    pub trigger_names: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl TableRecord for StoredSubscription {
    fn id(&self) -> &str {
        &self.id
    }
}

impl StoredSubscription {
    /// Whether a publish under `trigger` should replay this subscription.
    /// Falls back to the field name when registration recorded no triggers.
    pub fn matches_trigger(&self, trigger: &str) -> bool {
        if self.trigger_names.is_empty() {
            self.subscription_field_name == trigger
        } else {
            self.trigger_names.iter().any(|name| name == trigger)
        }
    }
}

/// All stored subscriptions owned by a connection.
pub async fn subscriptions_for_connection(
    storage: &dyn Storage<StoredSubscription>,
    connection_id: &str,
) -> Result<Vec<StoredSubscription>> {
    filter_records(storage, |s: &StoredSubscription| {
        s.connection_id == connection_id
    })
    .await
}

/// The stored subscription(s) for one `(connection, operation)` pair.
pub async fn subscriptions_for_operation(
    storage: &dyn Storage<StoredSubscription>,
    connection_id: &str,
    operation_id: &str,
) -> Result<Vec<StoredSubscription>> {
    filter_records(storage, |s: &StoredSubscription| {
        s.connection_id == connection_id && s.operation_id == operation_id
    })
    .await
}

/// Cascade-delete every subscription owned by a connection. A single
/// record's delete failure is logged and does not abort the rest.
pub async fn delete_subscriptions_for_connection(
    storage: &dyn Storage<StoredSubscription>,
    connection_id: &str,
) -> Result<()> {
    for subscription in subscriptions_for_connection(storage, connection_id).await? {
        if let Err(e) = storage.delete(&subscription.id).await {
            warn!(
                subscription_id = %subscription.id,
                error = %e,
                "failed to delete subscription during connection cleanup"
            );
        }
    }
    Ok(())
}

/// Resolve a channel selector to the GRIP channel names it refers to.
///
/// Stored records whose start message no longer parses are logged and
/// skipped; they cannot be delivered to anyway.
pub async fn channels_for_selector(
    storage: &dyn Storage<StoredSubscription>,
    namer: &ChannelNamer,
    connection_id: &str,
    selector: &ChannelSelector,
) -> Result<Vec<String>> {
    let stored = match selector {
        ChannelSelector::Start(start) => {
            return Ok(vec![namer.channel_for(connection_id, start)?]);
        }
        ChannelSelector::Stop(stop) => {
            subscriptions_for_operation(storage, connection_id, &stop.id).await?
        }
        ChannelSelector::Connection { id } => subscriptions_for_connection(storage, id).await?,
    };

    let mut channels = Vec::with_capacity(stored.len());
    for subscription in stored {
        match parse_start_message(&subscription.start_message)
            .and_then(|start| namer.channel_for(&subscription.connection_id, &start))
        {
            Ok(channel) => channels.push(channel),
            Err(e) => warn!(
                subscription_id = %subscription.id,
                error = %e,
                "could not derive channel for stored subscription"
            ),
        }
    }
    Ok(channels)
}

/// Listener that persists a [`StoredSubscription`] for every start frame.
///
/// Runs the registration pass against the external executor so the record
/// captures the resolver's trigger names, and keeps exactly one record per
/// `(connection, operation)` pair: a re-sent start frame replaces the
/// previous registration.
pub struct SubscriptionRegistrationListener {
    connection: ConnectionInfo,
    subscriptions: Arc<dyn Storage<StoredSubscription>>,
    executor: Arc<dyn SubscriptionExecutor>,
}

impl SubscriptionRegistrationListener {
    pub fn new(
        connection: ConnectionInfo,
        subscriptions: Arc<dyn Storage<StoredSubscription>>,
        executor: Arc<dyn SubscriptionExecutor>,
    ) -> Self {
        Self {
            connection,
            subscriptions,
            executor,
        }
    }
}

#[async_trait]
impl ConnectionListener for SubscriptionRegistrationListener {
    async fn on_message(&self, message: &str) -> Result<Option<String>> {
        let start = match parse_frame(message) {
            Ok(Frame::Start(start)) => start,
            Ok(_) => return Ok(None),
            Err(e) => {
                debug!(error = %e, "ignoring unparseable frame");
                return Ok(None);
            }
        };

        let field_name = match subscription_field_name(&start.payload.query) {
            Ok(field_name) => field_name,
            Err(e) => {
                warn!(
                    connection_id = %self.connection.id,
                    operation_id = %start.id,
                    error = %e,
                    "rejecting start frame with unusable query"
                );
                return Ok(None);
            }
        };

        let trigger_names = match record_subscription_triggers(self.executor.as_ref(), &start).await
        {
            Ok(triggers) => triggers,
            Err(e) => {
                warn!(
                    connection_id = %self.connection.id,
                    operation_id = %start.id,
                    error = %e,
                    "subscription registration pass failed; matching falls back to field name"
                );
                Vec::new()
            }
        };

        // Replace any previous registration for this operation id.
        for previous in
            subscriptions_for_operation(self.subscriptions.as_ref(), &self.connection.id, &start.id)
                .await?
        {
            self.subscriptions.delete(&previous.id).await?;
        }

        self.subscriptions
            .insert(StoredSubscription {
                id: uuid::Uuid::new_v4().to_string(),
                connection_id: self.connection.id.clone(),
                operation_id: start.id.clone(),
                start_message: message.to_string(),
                subscription_field_name: field_name,
                trigger_names,
                created_at: Utc::now(),
            })
            .await?;
        Ok(None)
    }
}

/// Listener emulating graphql-ws over WebSocket-Over-HTTP.
///
/// Issues GRIP channel subscribe/unsubscribe instructions for start and stop
/// frames, answers the protocol handshake, and tears the connection's state
/// down on close/disconnect.
pub struct GraphqlWsListener {
    connection: ConnectionInfo,
    connections: Arc<dyn Storage<StoredConnection>>,
    subscriptions: Arc<dyn Storage<StoredSubscription>>,
    namer: ChannelNamer,
    keep_alive_interval_seconds: u64,
}

impl GraphqlWsListener {
    pub fn new(
        connection: ConnectionInfo,
        connections: Arc<dyn Storage<StoredConnection>>,
        subscriptions: Arc<dyn Storage<StoredSubscription>>,
        namer: ChannelNamer,
        keep_alive_interval_seconds: u64,
    ) -> Self {
        Self {
            connection,
            connections,
            subscriptions,
            namer,
            keep_alive_interval_seconds,
        }
    }

    /// Unsubscribe every channel the connection still holds, then delete its
    /// subscription records and the connection record itself.
    async fn end_connection(&self) -> Result<()> {
        let selector = ChannelSelector::Connection {
            id: self.connection.id.clone(),
        };
        for channel in channels_for_selector(
            self.subscriptions.as_ref(),
            &self.namer,
            &self.connection.id,
            &selector,
        )
        .await?
        {
            debug!(%channel, "unsubscribing channel for ended connection");
            self.connection.context.unsubscribe(&channel);
        }
        delete_subscriptions_for_connection(self.subscriptions.as_ref(), &self.connection.id)
            .await?;
        self.connections.delete(&self.connection.id).await?;
        Ok(())
    }
}

#[async_trait]
impl ConnectionListener for GraphqlWsListener {
    async fn on_open(&self) -> Result<Option<ListenerHeaders>> {
        let mut headers = ListenerHeaders::new();
        if let Some(protocol) = &self.connection.protocol {
            headers.insert("Sec-WebSocket-Protocol".to_string(), protocol.clone());
        }
        headers.insert(
            "Keep-Alive-Interval".to_string(),
            self.keep_alive_interval_seconds.to_string(),
        );
        Ok(Some(headers))
    }

    async fn on_message(&self, message: &str) -> Result<Option<String>> {
        let frame = match parse_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "ignoring unparseable frame");
                return Ok(None);
            }
        };

        match &frame {
            Frame::Start(start) => {
                let selector = ChannelSelector::Start(start.clone());
                match channels_for_selector(
                    self.subscriptions.as_ref(),
                    &self.namer,
                    &self.connection.id,
                    &selector,
                )
                .await
                {
                    Ok(channels) => {
                        for channel in channels {
                            debug!(%channel, "requesting grip subscribe");
                            self.connection.context.subscribe(&channel);
                        }
                    }
                    Err(e) => {
                        warn!(
                            operation_id = %start.id,
                            error = %e,
                            "could not derive channels for start frame"
                        );
                        return Ok(None);
                    }
                }
            }
            Frame::Stop(stop) => {
                let selector = ChannelSelector::Stop(stop.clone());
                for channel in channels_for_selector(
                    self.subscriptions.as_ref(),
                    &self.namer,
                    &self.connection.id,
                    &selector,
                )
                .await?
                {
                    debug!(%channel, "requesting grip unsubscribe");
                    self.connection.context.unsubscribe(&channel);
                }
            }
            Frame::ConnectionInit | Frame::Other(_) => {}
        }

        Ok(acceptance_response(&frame))
    }

    async fn on_close(&self, _close_code: Option<u16>) -> Result<()> {
        debug!(connection_id = %self.connection.id, "connection closed");
        self.end_connection().await
    }

    async fn on_disconnect(&self) -> Result<()> {
        debug!(connection_id = %self.connection.id, "connection disconnected");
        self.end_connection().await
    }
}

/// Listener that deletes the stored subscription(s) a stop frame refers to.
///
/// Composed after [`GraphqlWsListener`] so the unsubscribe instructions can
/// still read the records.
pub struct SubscriptionDeletingListener {
    connection: ConnectionInfo,
    subscriptions: Arc<dyn Storage<StoredSubscription>>,
}

impl SubscriptionDeletingListener {
    pub fn new(
        connection: ConnectionInfo,
        subscriptions: Arc<dyn Storage<StoredSubscription>>,
    ) -> Self {
        Self {
            connection,
            subscriptions,
        }
    }
}

#[async_trait]
impl ConnectionListener for SubscriptionDeletingListener {
    async fn on_message(&self, message: &str) -> Result<Option<String>> {
        let stop = match parse_frame(message) {
            Ok(Frame::Stop(stop)) => stop,
            _ => return Ok(None),
        };
        for subscription in
            subscriptions_for_operation(self.subscriptions.as_ref(), &self.connection.id, &stop.id)
                .await?
        {
            self.subscriptions.delete(&subscription.id).await?;
        }
        Ok(None)
    }
}

/// Callback invoked after a subscription starts or stops.
pub type SubscriptionEventCallback = Arc<dyn Fn() + Send + Sync>;

/// Listener invoking caller-provided callbacks once storage reflects a
/// start or stop frame. Composed last for exactly that guarantee.
#[derive(Default)]
pub struct SubscriptionCallbacksListener {
    pub on_subscription_start: Option<SubscriptionEventCallback>,
    pub on_subscription_stop: Option<SubscriptionEventCallback>,
}

#[async_trait]
impl ConnectionListener for SubscriptionCallbacksListener {
    async fn on_message(&self, message: &str) -> Result<Option<String>> {
        match parse_frame(message) {
            Ok(Frame::Start(_)) => {
                if let Some(callback) = &self.on_subscription_start {
                    callback();
                }
            }
            Ok(Frame::Stop(_)) => {
                if let Some(callback) = &self.on_subscription_stop {
                    callback();
                }
            }
            _ => {}
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{ExecutionReply, NullExecutor, PubSubEngine, SubscriptionRequest};
    use crate::storage::MemoryTable;
    use crate::wire::WebSocketContext;

    fn connection(id: &str) -> ConnectionInfo {
        ConnectionInfo {
            id: id.to_string(),
            protocol: Some("graphql-ws".to_string()),
            context: Arc::new(WebSocketContext::new(id, "")),
        }
    }

    fn start_frame(operation_id: &str, query: &str) -> String {
        serde_json::json!({
            "id": operation_id,
            "type": "start",
            "payload": { "query": query },
        })
        .to_string()
    }

    struct PostExecutor;

    #[async_trait]
    impl SubscriptionExecutor for PostExecutor {
        async fn subscribe(
            &self,
            _request: SubscriptionRequest,
            events: Arc<dyn PubSubEngine>,
        ) -> Result<ExecutionReply> {
            Ok(ExecutionReply::Stream(events.subscribe("POST_ADDED").await?))
        }
    }

    #[tokio::test]
    async fn test_start_frame_persists_one_record() {
        let subscriptions: Arc<MemoryTable<StoredSubscription>> = Arc::new(MemoryTable::new());
        let listener = SubscriptionRegistrationListener::new(
            connection("c1"),
            subscriptions.clone(),
            Arc::new(PostExecutor),
        );

        let frame = start_frame("op1", "subscription { postAdded { author comment } }");
        listener.on_message(&frame).await.unwrap();

        let stored = subscriptions.scan().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].connection_id, "c1");
        assert_eq!(stored[0].operation_id, "op1");
        assert_eq!(stored[0].subscription_field_name, "postAdded");
        assert_eq!(stored[0].trigger_names, vec!["POST_ADDED".to_string()]);
        assert_eq!(stored[0].start_message, frame);
    }

    #[tokio::test]
    async fn test_resent_start_frame_replaces_record() {
        let subscriptions: Arc<MemoryTable<StoredSubscription>> = Arc::new(MemoryTable::new());
        let listener = SubscriptionRegistrationListener::new(
            connection("c1"),
            subscriptions.clone(),
            Arc::new(NullExecutor),
        );

        let frame = start_frame("op1", "subscription { postAdded { author } }");
        listener.on_message(&frame).await.unwrap();
        listener.on_message(&frame).await.unwrap();

        assert_eq!(subscriptions.len().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_start_is_ignored() {
        let subscriptions: Arc<MemoryTable<StoredSubscription>> = Arc::new(MemoryTable::new());
        let listener = SubscriptionRegistrationListener::new(
            connection("c1"),
            subscriptions.clone(),
            Arc::new(NullExecutor),
        );

        // not JSON at all
        assert_eq!(listener.on_message("garbage").await.unwrap(), None);
        // start frame with an unparseable query
        let frame = start_frame("op1", "subscription {");
        assert_eq!(listener.on_message(&frame).await.unwrap(), None);

        assert!(subscriptions.is_empty().await);
    }

    #[tokio::test]
    async fn test_matches_trigger_prefers_recorded_triggers() {
        let with_triggers = StoredSubscription {
            id: "s1".into(),
            connection_id: "c1".into(),
            operation_id: "op1".into(),
            start_message: start_frame("op1", "subscription { postAdded { author } }"),
            subscription_field_name: "postAdded".into(),
            trigger_names: vec!["POST_ADDED".into()],
            created_at: Utc::now(),
        };
        assert!(with_triggers.matches_trigger("POST_ADDED"));
        assert!(!with_triggers.matches_trigger("postAdded"));

        let without_triggers = StoredSubscription {
            trigger_names: Vec::new(),
            ..with_triggers
        };
        assert!(without_triggers.matches_trigger("postAdded"));
        assert!(!without_triggers.matches_trigger("POST_ADDED"));
    }

    #[tokio::test]
    async fn test_graphql_ws_listener_subscribes_on_start() {
        let conn = connection("c1");
        let listener = GraphqlWsListener::new(
            conn.clone(),
            Arc::new(MemoryTable::new()),
            Arc::new(MemoryTable::new()),
            ChannelNamer::SharedByField,
            120,
        );

        let frame = start_frame("op1", "subscription { postAdded { author } }");
        let response = listener.on_message(&frame).await.unwrap();
        assert_eq!(response, None);

        let events = conn.context.take_out_events();
        assert_eq!(events.len(), 1);
        let content = events[0].content_str().unwrap().unwrap();
        assert!(content.contains("subscribe"));
        assert!(content.contains("postAdded?subscription.operation.id=op1"));
    }

    #[tokio::test]
    async fn test_graphql_ws_listener_handshake() {
        let conn = connection("c1");
        let listener = GraphqlWsListener::new(
            conn.clone(),
            Arc::new(MemoryTable::new()),
            Arc::new(MemoryTable::new()),
            ChannelNamer::SharedByField,
            120,
        );

        let ack = listener
            .on_message(r#"{"type":"connection_init","payload":{}}"#)
            .await
            .unwrap()
            .unwrap();
        assert!(ack.contains("connection_ack"));

        let headers = listener.on_open().await.unwrap().unwrap();
        assert_eq!(headers["Keep-Alive-Interval"], "120");
        assert_eq!(headers["Sec-WebSocket-Protocol"], "graphql-ws");
    }

    #[tokio::test]
    async fn test_stop_unsubscribes_then_deletes() {
        let conn = connection("c1");
        let connections: Arc<MemoryTable<StoredConnection>> = Arc::new(MemoryTable::new());
        let subscriptions: Arc<MemoryTable<StoredSubscription>> = Arc::new(MemoryTable::new());

        let registration = SubscriptionRegistrationListener::new(
            conn.clone(),
            subscriptions.clone(),
            Arc::new(NullExecutor),
        );
        let grip = GraphqlWsListener::new(
            conn.clone(),
            connections,
            subscriptions.clone(),
            ChannelNamer::SharedByField,
            120,
        );
        let deleting = SubscriptionDeletingListener::new(conn.clone(), subscriptions.clone());

        let start = start_frame("op1", "subscription { postAdded { author } }");
        registration.on_message(&start).await.unwrap();
        grip.on_message(&start).await.unwrap();
        conn.context.take_out_events();

        let stop = r#"{"id":"op1","type":"stop"}"#;
        grip.on_message(stop).await.unwrap();
        deleting.on_message(stop).await.unwrap();

        let events = conn.context.take_out_events();
        assert_eq!(events.len(), 1);
        assert!(events[0]
            .content_str()
            .unwrap()
            .unwrap()
            .contains("unsubscribe"));
        assert!(subscriptions.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_cascades_connection_state() {
        let conn = connection("c1");
        let connections: Arc<MemoryTable<StoredConnection>> = Arc::new(MemoryTable::new());
        let subscriptions: Arc<MemoryTable<StoredSubscription>> = Arc::new(MemoryTable::new());
        connections
            .insert(StoredConnection {
                id: "c1".into(),
                created_at: Utc::now(),
                expires_at: Utc::now(),
            })
            .await
            .unwrap();

        let registration = SubscriptionRegistrationListener::new(
            conn.clone(),
            subscriptions.clone(),
            Arc::new(NullExecutor),
        );
        registration
            .on_message(&start_frame("op1", "subscription { postAdded { author } }"))
            .await
            .unwrap();
        registration
            .on_message(&start_frame("op2", "subscription { commentAdded { text } }"))
            .await
            .unwrap();

        let grip = GraphqlWsListener::new(
            conn.clone(),
            connections.clone(),
            subscriptions.clone(),
            ChannelNamer::SharedByField,
            120,
        );
        grip.on_close(Some(1000)).await.unwrap();

        let events = conn.context.take_out_events();
        assert_eq!(events.len(), 2);
        assert!(subscriptions.is_empty().await);
        assert!(connections.get("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_callbacks_fire_on_start_and_stop() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let listener = SubscriptionCallbacksListener {
            on_subscription_start: Some({
                let starts = starts.clone();
                Arc::new(move || {
                    starts.fetch_add(1, Ordering::SeqCst);
                })
            }),
            on_subscription_stop: Some({
                let stops = stops.clone();
                Arc::new(move || {
                    stops.fetch_add(1, Ordering::SeqCst);
                })
            }),
        };

        listener
            .on_message(&start_frame("op1", "subscription { postAdded { author } }"))
            .await
            .unwrap();
        listener
            .on_message(r#"{"id":"op1","type":"stop"}"#)
            .await
            .unwrap();
        listener
            .on_message(r#"{"type":"connection_init"}"#)
            .await
            .unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channels_for_selector_connection() {
        let subscriptions: Arc<MemoryTable<StoredSubscription>> = Arc::new(MemoryTable::new());
        let registration = SubscriptionRegistrationListener::new(
            connection("c1"),
            subscriptions.clone(),
            Arc::new(NullExecutor),
        );
        registration
            .on_message(&start_frame("op1", "subscription { postAdded { author } }"))
            .await
            .unwrap();

        let channels = channels_for_selector(
            subscriptions.as_ref(),
            &ChannelNamer::SharedByField,
            "c1",
            &ChannelSelector::Connection { id: "c1".into() },
        )
        .await
        .unwrap();
        assert_eq!(channels, vec!["postAdded?subscription.operation.id=op1"]);
    }
}
