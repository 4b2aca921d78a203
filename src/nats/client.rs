//! NATS client wrapper
//!
//! Connection management plus access to the JetStream context used by the
//! consumers and the producer.

use std::time::Duration;

use async_nats::jetstream::{self, stream::Stream};
use async_nats::{Client, ConnectOptions};
use tracing::info;

use crate::config::NatsArgs;
use crate::types::{RatingError, Result};

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Retention of queue streams
const STREAM_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

/// NATS client wrapper with JetStream support
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
    jetstream: jetstream::Context,
    name: String,
}

impl NatsClient {
    /// Connect to the server
    pub async fn new(args: &NatsArgs, name: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", args.nats_url);

        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5));

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&args.nats_url)
            .await
            .map_err(|e| RatingError::Nats(format!("Failed to connect: {}", e)))?;

        info!("Connected to NATS at {}", args.nats_url);

        Ok(Self {
            jetstream: jetstream::new(client.clone()),
            client,
            name: name.to_string(),
        })
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the stream of a topic if it does not exist yet
    pub async fn ensure_stream(&self, topic: &str) -> Result<Stream> {
        let name = super::messages::stream_name(topic);
        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: name.clone(),
                subjects: vec![super::messages::topic_filter(topic)],
                max_age: STREAM_MAX_AGE,
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| RatingError::Nats(format!("Failed to create stream {}: {}", name, e)))?;

        info!("Using stream {} for topic {}", name, topic);
        Ok(stream)
    }

    /// Delete the stream of a topic
    pub async fn delete_stream(&self, topic: &str) -> Result<()> {
        let name = super::messages::stream_name(topic);
        self.jetstream
            .delete_stream(&name)
            .await
            .map_err(|e| RatingError::Nats(format!("Failed to delete stream {}: {}", name, e)))?;
        info!("Deleted stream {}", name);
        Ok(())
    }

    /// Flush pending messages
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| RatingError::Nats(format!("Flush failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    // Integration tests would require a running NATS server
}
