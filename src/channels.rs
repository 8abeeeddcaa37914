//! GRIP channel naming and subscription de-duplication
//!
//! A channel namer is a pure function of `(connection id, start message)`
//! to the GRIP channel the proxy should fan a subscription's data out on.
//! Two built-in policies exist:
//!
//! - [`ChannelNamer::PerConnection`] never shares: every connection gets its
//!   own delivery channel, at the cost of one proxy subscription each.
//! - [`ChannelNamer::SharedByField`] collapses identical subscriptions onto
//!   one channel derived from the subscribed field name and the operation
//!   id. Publishing then needs [`filter_unique_channels`] so a shared
//!   channel is not published to once per subscriber.

use crate::error::Result;
use crate::protocol::{parse_start_message, subscription_field_name, StartMessage, StopMessage};
use crate::subscriptions::StoredSubscription;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Strategy for deriving a GRIP channel name from a subscription.
#[derive(Clone)]
pub enum ChannelNamer {
    /// One channel per connection; never shared.
    PerConnection,
    /// `field?subscription.operation.id=<id>`; identical subscriptions share.
    SharedByField,
    /// Caller-provided naming function.
    Custom(Arc<dyn Fn(&str, &StartMessage) -> Result<String> + Send + Sync>),
}

impl ChannelNamer {
    /// Derive the channel name for a subscription. Deterministic for a given
    /// `(connection_id, start)` pair within one process configuration.
    pub fn channel_for(&self, connection_id: &str, start: &StartMessage) -> Result<String> {
        match self {
            ChannelNamer::PerConnection => Ok(connection_id.to_string()),
            ChannelNamer::SharedByField => {
                let field = subscription_field_name(&start.payload.query)?;
                let query = sorted_query_string(&[("subscription.operation.id", &start.id)]);
                Ok(format!("{field}?{query}"))
            }
            ChannelNamer::Custom(namer) => namer(connection_id, start),
        }
    }
}

impl fmt::Debug for ChannelNamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelNamer::PerConnection => f.write_str("ChannelNamer::PerConnection"),
            ChannelNamer::SharedByField => f.write_str("ChannelNamer::SharedByField"),
            ChannelNamer::Custom(_) => f.write_str("ChannelNamer::Custom(..)"),
        }
    }
}

/// Which subscription(s) a channel lookup is for.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSelector {
    /// The subscription being started by this start message.
    Start(StartMessage),
    /// The stored subscription(s) matching this stop message's operation id.
    Stop(StopMessage),
    /// Every subscription still owned by a connection.
    Connection { id: String },
}

/// Encode query-string pairs with the keys in sorted order.
fn sorted_query_string(pairs: &[(&str, &str)]) -> String {
    let mut sorted: Vec<_> = pairs.to_vec();
    sorted.sort_by_key(|(key, _)| *key);
    sorted
        .iter()
        .map(|(key, value)| {
            format!("{}={}", urlencoding::encode(key), urlencoding::encode(value))
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Policy for de-duplicating the subscriptions matched by a publish trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionFilter {
    /// Yield one representative subscription per distinct channel name.
    UniqueChannel,
    /// Yield every subscription; for policies where each subscription must
    /// always be replayed independently.
    Passthrough,
}

impl SubscriptionFilter {
    pub fn apply<'a>(
        &self,
        subscriptions: BoxStream<'a, StoredSubscription>,
        namer: &ChannelNamer,
    ) -> BoxStream<'a, StoredSubscription> {
        match self {
            SubscriptionFilter::UniqueChannel => {
                filter_unique_channels(subscriptions, namer.clone())
            }
            SubscriptionFilter::Passthrough => subscriptions,
        }
    }
}

/// Filter a stream of stored subscriptions down to the first one observed
/// for each distinct channel name, additionally dropping repeats of the same
/// `(connection id, operation id)` pair.
///
/// Order-preserving. A subscription whose channel cannot be derived is left
/// in the stream so the replay loop surfaces the failure per item.
pub fn filter_unique_channels(
    subscriptions: BoxStream<'_, StoredSubscription>,
    namer: ChannelNamer,
) -> BoxStream<'_, StoredSubscription> {
    let mut seen_channels: HashSet<String> = HashSet::new();
    let mut seen_operations: HashSet<(String, String)> = HashSet::new();
    subscriptions
        .filter_map(move |subscription| {
            let keep = match parse_start_message(&subscription.start_message)
                .and_then(|start| namer.channel_for(&subscription.connection_id, &start))
            {
                Ok(channel) => {
                    let operation_key = (
                        subscription.connection_id.clone(),
                        subscription.operation_id.clone(),
                    );
                    let fresh = !seen_channels.contains(&channel)
                        && !seen_operations.contains(&operation_key);
                    seen_channels.insert(channel);
                    seen_operations.insert(operation_key);
                    fresh
                }
                Err(e) => {
                    warn!(
                        subscription_id = %subscription.id,
                        error = %e,
                        "could not derive channel for stored subscription"
                    );
                    true
                }
            };
            futures::future::ready(keep.then_some(subscription))
        })
        .boxed()
}
