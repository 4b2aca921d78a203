//! Data model: change records, reputation aggregates and the content model

pub mod hierarchy;
pub mod rating;
pub mod record;

pub use hierarchy::{ClassDef, ContentModel, DomainIndex, ModelVersion};
pub use rating::{
    ActivityCounts, MigrationMarker, MonthStats, PersonDoc, PersonRating, RatingChanged,
    SocialIdentityDoc, SYSTEM_ACCOUNT,
};
pub use record::{
    AccountId, ChangeKind, ChangeRecord, ClassRef, Domain, IdentityId, Reaction, Timestamp,
    DERIVED_SPACE,
};

/// Change log
pub const DOMAIN_TX: &str = "tx";

/// Persisted reputation aggregates
pub const DOMAIN_PERSON_RATING: &str = "person_rating";

/// Migration markers
pub const DOMAIN_MIGRATION: &str = "migration";

/// Social identities
pub const DOMAIN_CHANNEL: &str = "channel";

/// Person records
pub const DOMAIN_CONTACT: &str = "contact";

/// Reactions on documents
pub const DOMAIN_RATING_REACTION: &str = "rating_reaction";

pub const CLASS_REACTION: &str = "rating:class:DocReaction";
pub const CLASS_SOCIAL_IDENTITY: &str = "contact:class:SocialIdentity";
pub const CLASS_PERSON: &str = "contact:class:Person";

/// Current wall-clock time in milliseconds
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}
