//! Change records consumed from the workspace transaction log
//!
//! Records are opaque to the engine apart from the handful of fields the
//! aggregation needs: kind, target class, author, parent and timestamps.

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Raw author identity as written into the change log
pub type IdentityId = String;

/// Stable account identifier resolved from an author identity
pub type AccountId = String;

/// Class reference, e.g. `tracker:class:Issue`
pub type ClassRef = String;

/// Storage domain name, e.g. `task`
pub type Domain = String;

/// Space holding derived records that never contribute to ratings
pub const DERIVED_SPACE: &str = "core:space:DerivedTx";

/// Kind of change carried by a record
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// Reaction attached to a document
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Reaction {
    /// Star rating with an integer value
    Star { value: i64 },
    /// Emoji reaction, always worth one
    Emoji,
}

/// One entry of the change log
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Record ID
    #[serde(rename = "_id")]
    pub id: String,

    /// Create, update or delete
    pub kind: ChangeKind,

    /// Document the change applies to
    pub object_id: String,

    /// Class of the changed document
    pub object_class: ClassRef,

    /// Space of the changed document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_space: Option<String>,

    /// Identity that performed the change
    pub modified_by: IdentityId,

    /// Identity that created the record, when it differs from the modifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<IdentityId>,

    /// When the change was applied
    pub modified_on: Timestamp,

    /// When the record was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_on: Option<Timestamp>,

    /// Parent document for attached records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<String>,

    /// Class of the parent document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to_class: Option<ClassRef>,

    /// Reaction payload for reaction creates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<Reaction>,
}

impl ChangeRecord {
    /// Create a new record with a generated ID
    pub fn new(
        kind: ChangeKind,
        object_id: impl Into<String>,
        object_class: impl Into<ClassRef>,
        author: impl Into<IdentityId>,
        modified_on: Timestamp,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            object_id: object_id.into(),
            object_class: object_class.into(),
            object_space: None,
            modified_by: author.into(),
            created_by: None,
            modified_on,
            created_on: None,
            attached_to: None,
            attached_to_class: None,
            reaction: None,
        }
    }

    /// Set the parent document
    pub fn with_parent(mut self, parent: impl Into<String>, parent_class: impl Into<ClassRef>) -> Self {
        self.attached_to = Some(parent.into());
        self.attached_to_class = Some(parent_class.into());
        self
    }

    /// Set the reaction payload
    pub fn with_reaction(mut self, reaction: Reaction) -> Self {
        self.reaction = Some(reaction);
        self
    }

    /// Set the object space
    pub fn with_space(mut self, space: impl Into<String>) -> Self {
        self.object_space = Some(space.into());
        self
    }

    /// Identity that authored the document, used for parent lookups
    pub fn author(&self) -> &str {
        self.created_by.as_deref().unwrap_or(&self.modified_by)
    }

    /// Identity that performed this change and is credited with it
    pub fn actor(&self) -> &str {
        &self.modified_by
    }

    /// Timestamp used for monthly bucketing
    pub fn occurred_on(&self) -> Timestamp {
        self.created_on.unwrap_or(self.modified_on)
    }

    /// Records in the derived space are bookkeeping, not user activity
    pub fn is_derived(&self) -> bool {
        self.object_space.as_deref() == Some(DERIVED_SPACE)
    }

    /// Parent reference and class, when both are present
    pub fn parent(&self) -> Option<(&str, &str)> {
        match (&self.attached_to, &self.attached_to_class) {
            (Some(id), Some(class)) => Some((id.as_str(), class.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_author_prefers_creator() {
        let mut record = ChangeRecord::new(ChangeKind::Update, "doc-1", "task:class:Task", "id:bob", 10);
        assert_eq!(record.author(), "id:bob");

        record.created_by = Some("id:alice".into());
        assert_eq!(record.author(), "id:alice");
        // The change itself is still bob's
        assert_eq!(record.actor(), "id:bob");
    }

    #[test]
    fn test_wire_format() {
        let record = ChangeRecord::new(ChangeKind::Create, "r-1", "rating:class:DocReaction", "id:a", 5)
            .with_parent("doc-1", "document:class:Document")
            .with_reaction(Reaction::Star { value: 3 });

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "create");
        assert_eq!(json["objectClass"], "rating:class:DocReaction");
        assert_eq!(json["attachedTo"], "doc-1");
        assert_eq!(json["reaction"]["kind"], "star");
        assert_eq!(json["reaction"]["value"], 3);
        assert!(json.get("createdOn").is_none());

        let emoji: Reaction = serde_json::from_str(r#"{"kind":"emoji"}"#).unwrap();
        assert_eq!(emoji, Reaction::Emoji);
    }

    #[test]
    fn test_derived_space() {
        let record = ChangeRecord::new(ChangeKind::Create, "d", "task:class:Task", "id:a", 1)
            .with_space(DERIVED_SPACE);
        assert!(record.is_derived());
        assert_eq!(record.parent(), None);
    }
}
