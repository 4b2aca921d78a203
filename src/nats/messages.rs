//! Queue message types
//!
//! Every topic is partitioned by workspace through the subject:
//! `{topic}.{workspace}`. Payloads are JSON.

use serde::{Deserialize, Serialize};

use crate::model::ChangeRecord;

/// Workspace lifecycle events
pub const TOPIC_WORKSPACE: &str = "workspace";

/// Rating control events produced by this service
pub const TOPIC_RATING: &str = "rating";

/// Raw change records
pub const TOPIC_TX: &str = "tx";

/// JetStream stream backing a topic
pub fn stream_name(topic: &str) -> String {
    format!("RATING_{}", topic.to_uppercase())
}

/// Subject of a workspace's partition of a topic
pub fn subject(topic: &str, workspace: &str) -> String {
    format!("{}.{}", topic, workspace)
}

/// Subject filter covering every workspace of a topic
pub fn topic_filter(topic: &str) -> String {
    format!("{}.>", topic)
}

/// Workspace key of a subject produced by [`subject`]
pub fn workspace_from_subject<'a>(topic: &str, subject: &'a str) -> Option<&'a str> {
    subject
        .strip_prefix(topic)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|ws| !ws.is_empty())
}

/// Workspace lifecycle event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkspaceEvent {
    Created,
    Restored,
    Restoring,
    Upgraded,
    FullReindex,
}

/// Rating control event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RatingEvent {
    /// Replay the whole change log of the workspace
    Reindex,
    /// Apply one change record
    Calculate { tx: Box<ChangeRecord> },
}

impl RatingEvent {
    pub fn calculate(record: ChangeRecord) -> Self {
        Self::Calculate {
            tx: Box::new(record),
        }
    }
}

macro_rules! json_payload {
    ($($ty:ty),*) => {
        $(
            impl $ty {
                /// Serialize to JSON bytes
                pub fn to_bytes(&self) -> Result<bytes::Bytes, serde_json::Error> {
                    serde_json::to_vec(self).map(Into::into)
                }

                /// Deserialize from JSON bytes
                pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
                    serde_json::from_slice(data)
                }
            }
        )*
    };
}

json_payload!(WorkspaceEvent, RatingEvent);
