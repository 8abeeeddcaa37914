//! Connection lifecycle tracking and expiry cleanup
//!
//! The GRIP proxy holds the real client socket; this side only ever sees
//! discrete HTTP requests. A connection's liveness is therefore tracked in
//! storage: opening a connection persists a [`StoredConnection`] whose
//! `expires_at` sits two keep-alive intervals in the future, and every
//! subsequent request renews it on a schedule carried in the
//! `Meta-Connection-Expiration-Delay-At` header so renewal costs one storage
//! write per keep-alive interval rather than one per request.
//!
//! Connections that stop renewing are reaped by [`StorageCleaner`], which
//! cascade-deletes their subscriptions. A request arriving for an already
//! swept connection gets a DISCONNECT instruction so the proxy promptly
//! forgets the dead session instead of leaking a zombie.

use crate::error::Result;
use crate::listener::{ConnectionListener, ListenerHeaders};
use crate::storage::{Storage, TableRecord};
use crate::subscriptions::{delete_subscriptions_for_connection, StoredSubscription};
use crate::wire::ConnectionInfo;
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Request header carrying the previously issued renewal deadline.
pub const EXPIRATION_DELAY_AT_HEADER: &str = "meta-connection-expiration-delay-at";
/// Response header instructing the proxy to send the renewal deadline back
/// on future requests for this connection.
pub const SET_EXPIRATION_DELAY_AT_HEADER: &str = "Set-Meta-Connection-Expiration-Delay-At";

/// Stored record of one WebSocket-Over-HTTP connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConnection {
    /// Connection id assigned by the GRIP proxy.
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// When the connection is considered dead absent renewal.
    pub expires_at: DateTime<Utc>,
}

impl TableRecord for StoredConnection {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Listener that persists connections and renews their expiry.
pub struct ConnectionTrackingListener {
    connection: ConnectionInfo,
    connections: Arc<dyn Storage<StoredConnection>>,
    keep_alive_interval_seconds: u64,
}

impl ConnectionTrackingListener {
    pub fn new(
        connection: ConnectionInfo,
        connections: Arc<dyn Storage<StoredConnection>>,
        keep_alive_interval_seconds: u64,
    ) -> Self {
        Self {
            connection,
            connections,
            keep_alive_interval_seconds,
        }
    }

    fn keep_alive(&self) -> Duration {
        Duration::seconds(self.keep_alive_interval_seconds as i64)
    }

    /// When the connection should be considered expired: two keep-alive
    /// intervals from now.
    fn next_expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.keep_alive() * 2
    }

    /// When expiration next needs to be delayed: one keep-alive from now.
    fn next_delay_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.keep_alive()
    }

    fn delay_headers(&self, now: DateTime<Utc>) -> ListenerHeaders {
        let mut headers = ListenerHeaders::new();
        headers.insert(
            SET_EXPIRATION_DELAY_AT_HEADER.to_string(),
            self.next_delay_at(now).to_rfc3339(),
        );
        headers
    }
}

#[async_trait]
impl ConnectionListener for ConnectionTrackingListener {
    async fn on_open(&self) -> Result<Option<ListenerHeaders>> {
        let now = Utc::now();
        self.connections
            .insert(StoredConnection {
                id: self.connection.id.clone(),
                created_at: now,
                expires_at: self.next_expires_at(now),
            })
            .await?;
        Ok(Some(self.delay_headers(now)))
    }

    async fn on_http_request(&self, headers: &HeaderMap) -> Result<Option<ListenerHeaders>> {
        let Some(delay_at_value) = headers.get(EXPIRATION_DELAY_AT_HEADER) else {
            // Probably the open request; the connection was just created.
            return Ok(None);
        };

        let now = Utc::now();
        let due = match delay_at_value
            .to_str()
            .ok()
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        {
            Some(delay_at) => now >= delay_at.with_timezone(&Utc),
            None => {
                warn!(
                    connection_id = %self.connection.id,
                    "unparseable expiration-delay-at header; renewing now"
                );
                true
            }
        };
        if !due {
            return Ok(None);
        }

        let stored = self.connections.get(&self.connection.id).await?;
        if stored.is_none() {
            // Already swept. Tell the proxy to forget the session.
            warn!(
                connection_id = %self.connection.id,
                "renewal request for unknown connection; responding with DISCONNECT"
            );
            self.connection.context.disconnect();
            return Ok(None);
        }

        self.connections
            .update(
                &self.connection.id,
                serde_json::json!({
                    "expires_at": serde_json::to_value(self.next_expires_at(now))?,
                }),
            )
            .await?;
        debug!(connection_id = %self.connection.id, "renewed connection expiry");
        Ok(Some(self.delay_headers(now)))
    }
}

/// Sweep that deletes expired connections and their dependent records.
pub struct StorageCleaner {
    connections: Arc<dyn Storage<StoredConnection>>,
    subscriptions: Arc<dyn Storage<StoredSubscription>>,
}

impl StorageCleaner {
    pub fn new(
        connections: Arc<dyn Storage<StoredConnection>>,
        subscriptions: Arc<dyn Storage<StoredSubscription>>,
    ) -> Self {
        Self {
            connections,
            subscriptions,
        }
    }

    /// Delete every connection whose `expires_at` has passed, cascading to
    /// its subscriptions first so no orphan records survive.
    ///
    /// `now` overrides the comparison time, e.g. to simulate a future
    /// instant in tests; `None` means the current time. One record's
    /// failure is logged and does not abort the sweep.
    pub async fn clean(&self, now: Option<DateTime<Utc>>) -> Result<()> {
        let now = now.unwrap_or_else(Utc::now);
        let mut batches = self.connections.scan_batches();
        while let Some(batch) = batches.next().await {
            let connections = match batch {
                Ok(connections) => connections,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable batch during cleanup");
                    continue;
                }
            };
            for connection in connections {
                if now < connection.expires_at {
                    continue;
                }
                debug!(connection_id = %connection.id, "sweeping expired connection");
                if let Err(e) = delete_subscriptions_for_connection(
                    self.subscriptions.as_ref(),
                    &connection.id,
                )
                .await
                {
                    warn!(
                        connection_id = %connection.id,
                        error = %e,
                        "could not delete subscriptions for expired connection"
                    );
                    continue;
                }
                if let Err(e) = self.connections.delete(&connection.id).await {
                    warn!(
                        connection_id = %connection.id,
                        error = %e,
                        "could not delete expired connection"
                    );
                }
            }
        }
        Ok(())
    }
}
