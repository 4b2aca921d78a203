//! JetStream consumers and producer
//!
//! Each topic is read through a durable pull consumer shared by every
//! instance of the service (one consumer group). A fetched batch is split by
//! workspace: workspaces run side by side, messages of one workspace run in
//! delivery order.
//!
//! Acknowledgement policy:
//! - handler succeeded: ack
//! - retryable error (storage, queue, HTTP, calculator closing): nak, so the
//!   message is redelivered
//! - anything else, including undecodable payloads: ack and log
//!
//! Once a message of a workspace is nak'd, the rest of that workspace's batch
//! is nak'd unhandled so it is redelivered behind it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::client::NatsClient;
use super::messages::{subject, topic_filter, workspace_from_subject, RatingEvent, TOPIC_RATING};
use crate::types::{RatingError, Result};

/// How long one fetch waits for messages
const FETCH_EXPIRES: Duration = Duration::from_secs(5);

/// Grace period for a consumer loop to notice it was stopped
const STOP_GRACE: Duration = Duration::from_secs(10);

// ============================================================================
// Control channel
// ============================================================================

/// Lets long-running handlers keep their message alive
#[async_trait]
pub trait ConsumerControl: Send + Sync {
    /// Extend the acknowledgement deadline of the message being handled
    async fn heartbeat(&self);
}

/// Control for work that is not tied to a queue message
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopControl;

#[async_trait]
impl ConsumerControl for NoopControl {
    async fn heartbeat(&self) {}
}

/// Control backed by an in-flight JetStream message
pub struct JetStreamControl<'a> {
    message: &'a jetstream::Message,
}

impl<'a> JetStreamControl<'a> {
    pub fn new(message: &'a jetstream::Message) -> Self {
        Self { message }
    }
}

#[async_trait]
impl<'a> ConsumerControl for JetStreamControl<'a> {
    async fn heartbeat(&self) {
        if let Err(e) = self.message.ack_with(AckKind::Progress).await {
            warn!("Failed to send progress heartbeat: {}", e);
        }
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Handles decoded messages of one topic
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn handle(&self, workspace: &str, message: T, control: &dyn ConsumerControl) -> Result<()>;
}

/// Split a delivery batch by workspace, keeping first-seen workspace order
/// and delivery order inside each workspace
pub fn group_by_workspace<M>(items: Vec<(String, M)>) -> Vec<(String, Vec<M>)> {
    let mut groups: Vec<(String, Vec<M>)> = Vec::new();
    for (workspace, item) in items {
        match groups.iter_mut().find(|(ws, _)| *ws == workspace) {
            Some((_, group)) => group.push(item),
            None => groups.push((workspace, vec![item])),
        }
    }
    groups
}

/// How a handled message is settled with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Redeliver,
}

/// Handle messages in order until one asks for redelivery; returns the
/// messages left unhandled
pub async fn handle_in_order<M, F, Fut>(messages: Vec<M>, mut handle: F) -> Vec<M>
where
    F: FnMut(M) -> Fut,
    Fut: Future<Output = Settlement>,
{
    let mut messages = messages.into_iter();
    for message in messages.by_ref() {
        if handle(message).await == Settlement::Redeliver {
            break;
        }
    }
    messages.collect()
}

/// Durable pull consumer of one topic
pub struct QueueConsumer<T> {
    topic: String,
    group: String,
    client: NatsClient,
    handler: Arc<dyn MessageHandler<T>>,
    batch_size: usize,
    running: Arc<RwLock<bool>>,
}

/// Running consumer loop
pub struct ConsumerHandle {
    topic: String,
    running: Arc<RwLock<bool>>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop fetching and wait for the in-flight batch
    pub async fn stop(self) {
        *self.running.write().await = false;

        let abort = self.task.abort_handle();
        if tokio::time::timeout(STOP_GRACE, self.task).await.is_err() {
            warn!(topic = %self.topic, "Consumer did not stop in time, aborting");
            abort.abort();
        }
        info!(topic = %self.topic, "Consumer stopped");
    }
}

impl<T> QueueConsumer<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(
        client: NatsClient,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler<T>>,
        batch_size: usize,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            group: group.to_string(),
            client,
            handler,
            batch_size: batch_size.max(1),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Run the consumer loop on its own task
    pub fn spawn(self) -> ConsumerHandle {
        let topic = self.topic.clone();
        let running = self.running.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!(topic = %self.topic, "Consumer failed: {}", e);
            }
        });
        ConsumerHandle { topic, running, task }
    }

    /// Process messages until stopped
    pub async fn run(&self) -> Result<()> {
        *self.running.write().await = true;

        let stream = self.client.ensure_stream(&self.topic).await?;
        let consumer = self.ensure_consumer(&stream).await?;

        info!(topic = %self.topic, group = %self.group, "Starting consumer loop");

        while *self.running.read().await {
            match self.process_batch(&consumer).await {
                Ok(count) => {
                    if count > 0 {
                        debug!(topic = %self.topic, "Processed {} messages", count);
                    }
                }
                Err(e) => {
                    error!(topic = %self.topic, "Error processing batch: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(topic = %self.topic, "Consumer loop stopped");
        Ok(())
    }

    async fn ensure_consumer(&self, stream: &jetstream::stream::Stream) -> Result<PullConsumer> {
        let name = format!("{}_{}", self.group, self.topic);

        let consumer = stream
            .get_or_create_consumer(
                &name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(name.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    filter_subject: topic_filter(&self.topic),
                    max_ack_pending: (self.batch_size * 4) as i64,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RatingError::Nats(format!("Failed to create consumer: {}", e)))?;

        info!("Using consumer {}", name);
        Ok(consumer)
    }

    async fn process_batch(&self, consumer: &PullConsumer) -> Result<usize> {
        let mut messages = consumer
            .fetch()
            .max_messages(self.batch_size)
            .expires(FETCH_EXPIRES)
            .messages()
            .await
            .map_err(|e| RatingError::Nats(format!("Failed to fetch messages: {}", e)))?;

        let mut received = Vec::new();
        while let Some(msg_result) = messages.next().await {
            match msg_result {
                Ok(msg) => match workspace_from_subject(&self.topic, msg.subject.as_str()) {
                    Some(ws) => received.push((ws.to_string(), msg)),
                    None => {
                        warn!(topic = %self.topic, subject = %msg.subject, "Message without workspace, dropping");
                        if let Err(e) = msg.ack().await {
                            warn!("Failed to ack message: {}", e);
                        }
                    }
                },
                Err(e) => {
                    warn!("Error receiving message: {}", e);
                }
            }
        }

        let count = received.len();
        let groups = group_by_workspace(received);
        futures::future::join_all(
            groups
                .into_iter()
                .map(|(ws, msgs)| self.process_workspace(ws, msgs)),
        )
        .await;

        Ok(count)
    }

    async fn process_workspace(&self, workspace: String, messages: Vec<jetstream::Message>) {
        let held = handle_in_order(messages, |msg| self.process_message(&workspace, msg)).await;
        if held.is_empty() {
            return;
        }

        debug!(workspace = %workspace, topic = %self.topic, count = held.len(), "Holding back later messages");
        for msg in held {
            if let Err(e) = msg.ack_with(AckKind::Nak(None)).await {
                warn!("Failed to nak message: {}", e);
            }
        }
    }

    async fn process_message(&self, workspace: &str, msg: jetstream::Message) -> Settlement {
        let payload: T = match serde_json::from_slice(&msg.payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!(workspace = %workspace, topic = %self.topic, "Failed to parse message: {}", e);
                if let Err(e) = msg.ack().await {
                    warn!("Failed to ack malformed message: {}", e);
                }
                return Settlement::Ack;
            }
        };

        let result = {
            let control = JetStreamControl::new(&msg);
            self.handler.handle(workspace, payload, &control).await
        };

        let settlement = match result {
            Ok(()) => Settlement::Ack,
            Err(e) if e.is_retryable() => {
                warn!(workspace = %workspace, topic = %self.topic, "Handler failed, requesting redelivery: {}", e);
                Settlement::Redeliver
            }
            Err(e) => {
                error!(workspace = %workspace, topic = %self.topic, "Handler failed, dropping message: {}", e);
                Settlement::Ack
            }
        };

        let ack = match settlement {
            Settlement::Ack => msg.ack().await,
            Settlement::Redeliver => msg.ack_with(AckKind::Nak(None)).await,
        };
        if let Err(e) = ack {
            warn!("Failed to ack message: {}", e);
        }
        settlement
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Publishes rating control events
#[async_trait]
pub trait RatingProducer: Send + Sync {
    async fn send(&self, workspace: &str, events: Vec<RatingEvent>) -> Result<()>;
}

/// Producer publishing to the rating stream
pub struct JetStreamProducer {
    client: NatsClient,
}

impl JetStreamProducer {
    pub fn new(client: NatsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RatingProducer for JetStreamProducer {
    async fn send(&self, workspace: &str, events: Vec<RatingEvent>) -> Result<()> {
        let subject = subject(TOPIC_RATING, workspace);
        for event in events {
            let payload = event.to_bytes()?;
            self.client
                .jetstream()
                .publish(subject.clone(), payload)
                .await
                .map_err(|e| RatingError::Nats(format!("Failed to publish to {}: {}", subject, e)))?
                .await
                .map_err(|e| RatingError::Nats(format!("Publish to {} not acknowledged: {}", subject, e)))?;
        }
        debug!(workspace = %workspace, "Published rating events");
        Ok(())
    }
}
