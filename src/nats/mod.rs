//! NATS JetStream transport
//!
//! Three topics partitioned by workspace: lifecycle events, rating control
//! events and raw change records.

pub mod client;
pub mod consumer;
pub mod messages;

pub use client::NatsClient;
pub use consumer::{
    group_by_workspace, ConsumerControl, ConsumerHandle, JetStreamControl, JetStreamProducer,
    MessageHandler, NoopControl, QueueConsumer, RatingProducer,
};
pub use messages::{RatingEvent, WorkspaceEvent, TOPIC_RATING, TOPIC_TX, TOPIC_WORKSPACE};
