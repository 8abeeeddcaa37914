//! Publish/replay engine
//!
//! When a mutation publishes a trigger, no subscriber stream is live on this
//! side: subscriptions exist only as stored records. Delivery therefore
//! replays each stored subscription against the external execution engine,
//! seeding it with a single-shot event source that emits exactly the one
//! mutation payload, and publishes the resulting graphql-ws `data` frame to
//! the subscription's GRIP channel over EPCP.
//!
//! The de-duplication filter runs first so a channel shared by several
//! identical subscriptions is published to once, not once per subscriber.

use crate::channels::{ChannelNamer, SubscriptionFilter};
use crate::epcp::ChannelPublisher;
use crate::error::{Error, Result};
use crate::protocol::{data_message, parse_start_message};
use crate::pubsub::{PayloadStream, PubSubEngine, SingleShotPubSub, SubscriptionExecutor, SubscriptionRequest};
use crate::storage::Storage;
use crate::subscriptions::StoredSubscription;
use async_trait::async_trait;
use futures::stream::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What happened while publishing one trigger.
#[derive(Debug, Default)]
pub struct PublishOutcome {
    /// Channels a data frame was published to.
    pub delivered: usize,
    /// Subscriptions whose replay produced no result.
    pub skipped: usize,
    /// Per-subscription failures; the rest of the batch still ran.
    pub failures: Vec<PublishFailure>,
}

/// One subscription's replay or publish failure.
#[derive(Debug)]
pub struct PublishFailure {
    pub subscription_id: String,
    pub error: Error,
}

/// Replays stored subscriptions for a trigger and publishes the results.
pub struct SubscriptionPublisher {
    subscriptions: Arc<dyn Storage<StoredSubscription>>,
    executor: Arc<dyn SubscriptionExecutor>,
    publisher: Arc<dyn ChannelPublisher>,
    namer: ChannelNamer,
    filter: SubscriptionFilter,
}

impl SubscriptionPublisher {
    pub fn new(
        subscriptions: Arc<dyn Storage<StoredSubscription>>,
        executor: Arc<dyn SubscriptionExecutor>,
        publisher: Arc<dyn ChannelPublisher>,
    ) -> Self {
        Self {
            subscriptions,
            executor,
            publisher,
            namer: ChannelNamer::SharedByField,
            filter: SubscriptionFilter::UniqueChannel,
        }
    }

    /// Override the channel naming strategy. Must match the namer the
    /// gateway used when issuing subscribe instructions.
    pub fn with_channel_namer(mut self, namer: ChannelNamer) -> Self {
        self.namer = namer;
        self
    }

    /// Override the de-duplication policy.
    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Publish `payload` under `trigger` to every distinct channel with a
    /// stored subscription matching the trigger.
    ///
    /// One subscription's failure never aborts the others; failures are
    /// collected on the returned outcome and logged.
    pub async fn publish_trigger(&self, trigger: &str, payload: &Value) -> Result<PublishOutcome> {
        let matching = self
            .subscriptions
            .scan_batches()
            .filter_map(|batch| {
                futures::future::ready(match batch {
                    Ok(batch) => Some(futures::stream::iter(batch)),
                    Err(e) => {
                        warn!(error = %e, "skipping unreadable batch during publish");
                        None
                    }
                })
            })
            .flatten()
            .filter(|subscription| {
                futures::future::ready(subscription.matches_trigger(trigger))
            })
            .boxed();

        let mut surviving = self.filter.apply(matching, &self.namer);
        let mut outcome = PublishOutcome::default();
        while let Some(subscription) = surviving.next().await {
            match self.replay(&subscription, trigger, payload).await {
                Ok(Some(channel)) => {
                    debug!(
                        subscription_id = %subscription.id,
                        %channel,
                        trigger,
                        "published data frame"
                    );
                    outcome.delivered += 1;
                }
                Ok(None) => outcome.skipped += 1,
                Err(e) => {
                    error!(
                        subscription_id = %subscription.id,
                        trigger,
                        error = %e,
                        "failed to publish to subscription"
                    );
                    outcome.failures.push(PublishFailure {
                        subscription_id: subscription.id.clone(),
                        error: e,
                    });
                }
            }
        }
        Ok(outcome)
    }

    /// Replay one stored subscription against a synthetic single-shot event
    /// source and publish the result, if any, to its channel. Returns the
    /// channel published to, or `None` when the replay produced no result.
    async fn replay(
        &self,
        subscription: &StoredSubscription,
        trigger: &str,
        payload: &Value,
    ) -> Result<Option<String>> {
        let start = parse_start_message(&subscription.start_message)?;
        let channel = self.namer.channel_for(&subscription.connection_id, &start)?;

        let events: Arc<dyn PubSubEngine> =
            Arc::new(SingleShotPubSub::seeded(trigger, payload.clone()));
        let reply = self
            .executor
            .subscribe(SubscriptionRequest::from_start(&start), events)
            .await
            .map_err(|e| Error::Execution(format!("replay failed: {e}")))?;

        // A subscription resolver observes only this one synthetic event.
        let Some(result) = reply.first().await else {
            return Ok(None);
        };

        self.publisher
            .publish(&channel, &data_message(&start.id, &result))
            .await?;
        Ok(Some(channel))
    }
}

/// [`PubSubEngine`] decorator that fans publishes out to stored
/// subscriptions after delegating to the wrapped engine.
///
/// Applications compose this around their in-process engine at construction
/// time; mutation resolvers keep calling plain `publish`.
pub struct FanoutPubSub {
    inner: Arc<dyn PubSubEngine>,
    replay: Arc<SubscriptionPublisher>,
}

impl FanoutPubSub {
    pub fn new(inner: Arc<dyn PubSubEngine>, replay: Arc<SubscriptionPublisher>) -> Self {
        Self { inner, replay }
    }
}

#[async_trait]
impl PubSubEngine for FanoutPubSub {
    async fn publish(&self, trigger: &str, payload: Value) -> Result<()> {
        self.inner.publish(trigger, payload.clone()).await?;
        let outcome = self.replay.publish_trigger(trigger, &payload).await?;
        if !outcome.failures.is_empty() {
            // Per-subscription failures were already logged; the mutation
            // resolver is not the one to handle them.
            warn!(
                trigger,
                failed = outcome.failures.len(),
                delivered = outcome.delivered,
                "some subscriptions could not be published to"
            );
        }
        Ok(())
    }

    async fn subscribe(&self, trigger: &str) -> Result<PayloadStream> {
        self.inner.subscribe(trigger).await
    }
}
