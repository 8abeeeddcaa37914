//! # graphql-grip-gateway
//!
//! GraphQL subscriptions over WebSocket-Over-HTTP: serve `graphql-ws`
//! subscription traffic from a stateless HTTP application behind a GRIP
//! proxy (e.g. Pushpin), with data frames delivered by publishing to named
//! channels over the EPCP control protocol.
//!
//! The proxy holds the real client sockets and forwards every WebSocket
//! lifecycle event as one HTTP request. This crate reconstructs continuous
//! subscription semantics from those discrete exchanges: connection
//! identity and expiry, subscription registration and selective
//! unsubscribe, de-duplicated channel fanout, and publish-time replay of
//! stored subscriptions against your GraphQL execution engine.
//!
//! ## Main Components
//!
//! - [`GripGateway`]: the request surface; plug [`websocket_over_http`]
//!   into any axum `Router` and non-GRIP traffic passes through untouched.
//! - [`Storage`] / [`MemoryTable`]: pluggable keyed storage for connection
//!   and subscription records.
//! - [`SubscriptionExecutor`]: the seam to your GraphQL execution engine.
//! - [`SubscriptionPublisher`] / [`FanoutPubSub`]: replay stored
//!   subscriptions on mutation and publish the results over EPCP.
//! - [`StorageCleaner`]: sweep for expired connections and their records.
//!
//! ## Example
//!
//! ```rust,no_run
//! use axum::{middleware, routing::get, Router};
//! use graphql_grip_gateway::{EpcpPublisher, GripGateway};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Arc::new(GripGateway::builder().build());
//!     let publisher = gateway
//!         .subscription_publisher(Arc::new(EpcpPublisher::new("http://localhost:5561")?));
//!
//!     let app = Router::new()
//!         .route("/", get(|| async { "ok" }))
//!         .layer(middleware::from_fn_with_state(
//!             gateway,
//!             graphql_grip_gateway::websocket_over_http,
//!         ));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!     # let _ = publisher;
//!     Ok(())
//! }
//! ```

pub mod channels;
pub mod config;
pub mod epcp;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod listener;
pub mod protocol;
pub mod publish;
pub mod pubsub;
pub mod storage;
pub mod subscriptions;
pub mod wire;

pub use channels::{ChannelNamer, ChannelSelector, SubscriptionFilter};
pub use config::GatewayConfig;
pub use epcp::{parse_grip_uri, ChannelPublisher, EpcpPublisher, GripUri};
pub use error::{Error, Result};
pub use gateway::{websocket_over_http, GripGateway, GripGatewayBuilder};
pub use lifecycle::{ConnectionTrackingListener, StorageCleaner, StoredConnection};
pub use listener::{ComposedListener, ConnectionListener, ListenerHeaders};
pub use protocol::{Frame, StartMessage, StartPayload, StopMessage};
pub use publish::{FanoutPubSub, PublishFailure, PublishOutcome, SubscriptionPublisher};
pub use pubsub::{
    ExecutionReply, InMemoryPubSub, PubSubEngine, SingleShotPubSub, SubscriptionExecutor,
    SubscriptionRequest, TriggerRecordingPubSub,
};
pub use storage::{MemoryTable, Storage, TableRecord};
pub use subscriptions::{GraphqlWsListener, StoredSubscription};
pub use wire::{ConnectionInfo, EventKind, WebSocketContext, WebSocketEvent};
