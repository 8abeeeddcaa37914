//! Pub/sub engines and the subscription execution seam
//!
//! Subscription resolvers observe mutations through the [`PubSubEngine`]
//! interface. Engines compose as an explicit decorator chain built at
//! construction time: the in-memory broadcast engine at the core, a
//! trigger-recording decorator during subscription registration, and the
//! EPCP fanout decorator (see `publish.rs`) wrapping whatever the
//! application uses for in-process delivery.
//!
//! The GraphQL execution engine itself is external; the gateway drives it
//! through [`SubscriptionExecutor`], handing it an engine to subscribe on
//! and consuming at most one result per replay.

use crate::error::{Error, Result};
use crate::protocol::StartMessage;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stream of payloads delivered to one subscriber of a trigger.
pub type PayloadStream = BoxStream<'static, Value>;

/// Publish/subscribe interface observed by subscription resolvers.
#[async_trait]
pub trait PubSubEngine: Send + Sync {
    /// Publish a payload under a trigger name.
    async fn publish(&self, trigger: &str, payload: Value) -> Result<()>;

    /// Subscribe to a trigger, receiving each published payload.
    async fn subscribe(&self, trigger: &str) -> Result<PayloadStream>;
}

/// In-process [`PubSubEngine`] fanning payloads out to every subscriber of
/// a trigger.
#[derive(Default)]
pub struct InMemoryPubSub {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSubEngine for InMemoryPubSub {
    async fn publish(&self, trigger: &str, payload: Value) -> Result<()> {
        let mut subscribers = self.subscribers.lock();
        if let Some(senders) = subscribers.get_mut(trigger) {
            senders.retain(|sender| sender.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, trigger: &str) -> Result<PayloadStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(trigger.to_string())
            .or_default()
            .push(sender);
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|payload| (payload, receiver))
        });
        Ok(stream.boxed())
    }
}

/// Subscribe-only engine pre-seeded with a finite set of publishes.
///
/// Used to replay a stored subscription against exactly one synthetic
/// mutation event: subscribing to a trigger yields the seeded payloads for
/// that trigger and nothing else. `publish` is accepted and discarded.
pub struct SingleShotPubSub {
    publishes: Vec<(String, Value)>,
}

impl SingleShotPubSub {
    /// Engine that will emit exactly one payload for one trigger.
    pub fn seeded(trigger: impl Into<String>, payload: Value) -> Self {
        Self {
            publishes: vec![(trigger.into(), payload)],
        }
    }

    /// Engine with nothing to emit; every subscription is immediately dry.
    pub fn empty() -> Self {
        Self {
            publishes: Vec::new(),
        }
    }
}

#[async_trait]
impl PubSubEngine for SingleShotPubSub {
    async fn publish(&self, _trigger: &str, _payload: Value) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, trigger: &str) -> Result<PayloadStream> {
        let payloads: Vec<Value> = self
            .publishes
            .iter()
            .filter(|(name, _)| name == trigger)
            .map(|(_, payload)| payload.clone())
            .collect();
        Ok(futures::stream::iter(payloads).boxed())
    }
}

/// Decorator that records every trigger name passed to `subscribe`.
///
/// Wrapped around an engine during subscription registration so the stored
/// subscription record captures which triggers its resolver listens to.
pub struct TriggerRecordingPubSub {
    inner: Arc<dyn PubSubEngine>,
    recorded: Mutex<Vec<String>>,
}

impl TriggerRecordingPubSub {
    pub fn new(inner: Arc<dyn PubSubEngine>) -> Self {
        Self {
            inner,
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Trigger names recorded so far, in subscription order, de-duplicated.
    pub fn recorded_triggers(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.recorded
            .lock()
            .iter()
            .filter(|name| seen.insert(name.to_string()))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PubSubEngine for TriggerRecordingPubSub {
    async fn publish(&self, trigger: &str, payload: Value) -> Result<()> {
        self.inner.publish(trigger, payload).await
    }

    async fn subscribe(&self, trigger: &str) -> Result<PayloadStream> {
        self.recorded.lock().push(trigger.to_string());
        self.inner.subscribe(trigger).await
    }
}

/// One subscription operation handed to the external execution engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    pub query: String,
    pub operation_name: Option<String>,
    pub variables: Value,
}

impl SubscriptionRequest {
    pub fn from_start(start: &StartMessage) -> Self {
        Self {
            query: start.payload.query.clone(),
            operation_name: start.payload.operation_name.clone(),
            variables: start.payload.variables.clone(),
        }
    }
}

/// Result of driving a subscription operation: either a single execution
/// result (e.g. a validation error payload) or an asynchronous sequence of
/// results.
pub enum ExecutionReply {
    Single(Value),
    Stream(PayloadStream),
}

impl ExecutionReply {
    /// Consume at most one result from the reply.
    pub async fn first(self) -> Option<Value> {
        match self {
            ExecutionReply::Single(value) => Some(value),
            ExecutionReply::Stream(mut stream) => stream.next().await,
        }
    }
}

/// External GraphQL execution engine, treated as a black box.
///
/// Implementations evaluate the subscription operation against their schema,
/// subscribing on `events` for the payloads the operation's resolver
/// observes.
#[async_trait]
pub trait SubscriptionExecutor: Send + Sync {
    async fn subscribe(
        &self,
        request: SubscriptionRequest,
        events: Arc<dyn PubSubEngine>,
    ) -> Result<ExecutionReply>;
}

/// Executor that evaluates nothing: registration records no triggers and
/// replays produce no results. The default when a gateway is used purely
/// for channel management.
pub struct NullExecutor;

#[async_trait]
impl SubscriptionExecutor for NullExecutor {
    async fn subscribe(
        &self,
        _request: SubscriptionRequest,
        _events: Arc<dyn PubSubEngine>,
    ) -> Result<ExecutionReply> {
        Ok(ExecutionReply::Stream(futures::stream::empty().boxed()))
    }
}

/// Run the registration pass for a start message: drive the executor once
/// with a recording engine and return the trigger names its resolver
/// subscribed to. Executor failures surface as [`Error::Execution`].
pub async fn record_subscription_triggers(
    executor: &dyn SubscriptionExecutor,
    start: &StartMessage,
) -> Result<Vec<String>> {
    let recorder = Arc::new(TriggerRecordingPubSub::new(Arc::new(
        SingleShotPubSub::empty(),
    )));
    let reply = executor
        .subscribe(SubscriptionRequest::from_start(start), recorder.clone())
        .await
        .map_err(|e| Error::Execution(format!("subscription registration failed: {e}")))?;
    // The stream is dropped immediately; delivery happens out of band at
    // mutation time.
    drop(reply);
    Ok(recorder.recorded_triggers())
}
