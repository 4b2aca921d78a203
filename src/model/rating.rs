//! Reputation aggregate and the records stored next to it
//!
//! One [`PersonRating`] exists per account per workspace. It is persisted as
//! a whole by overwrite-upsert keyed on the account ID.

use std::collections::BTreeMap;

use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::record::{AccountId, ChangeKind, Reaction, Timestamp};

/// Account ID of the workspace-level aggregate
pub const SYSTEM_ACCOUNT: &str = "system";

/// Plugin name recorded in the migration marker
pub const RATING_PLUGIN: &str = "rating";

/// Migration state written once the backfill completes
pub const MIGRATION_STATE: &str = "v1";

/// Create/update/delete counters
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActivityCounts {
    #[serde(default)]
    pub creates: i64,
    #[serde(default)]
    pub updates: i64,
    #[serde(default)]
    pub deletes: i64,
}

impl ActivityCounts {
    pub fn bump(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Create => self.creates += 1,
            ChangeKind::Update => self.updates += 1,
            ChangeKind::Delete => self.deletes += 1,
        }
    }
}

/// Activity within one calendar month (UTC)
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MonthStats {
    /// `year * 100 + month`, e.g. 202405
    pub year_month: i32,
    #[serde(default)]
    pub creates: i64,
    #[serde(default)]
    pub updates: i64,
    #[serde(default)]
    pub deletes: i64,
}

impl MonthStats {
    pub fn new(year_month: i32) -> Self {
        Self {
            year_month,
            ..Default::default()
        }
    }

    pub fn bump(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Create => self.creates += 1,
            ChangeKind::Update => self.updates += 1,
            ChangeKind::Delete => self.deletes += 1,
        }
    }
}

/// `year * 100 + month` for a millisecond timestamp, in UTC
pub fn year_month(ts: Timestamp) -> i32 {
    match Utc.timestamp_millis_opt(ts).single() {
        Some(date) => date.year() * 100 + date.month() as i32,
        None => 0,
    }
}

/// Running reputation record for one account
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersonRating {
    /// Account this aggregate belongs to (also the document ID)
    #[serde(rename = "_id")]
    pub account_id: AccountId,

    /// Derived score, always equal to the rating formula over the counters
    #[serde(default)]
    pub rating: f64,

    /// Monthly activity, unique per month, newest first
    #[serde(default)]
    pub months: Vec<MonthStats>,

    /// Activity per content domain
    #[serde(default)]
    pub domain_stats: BTreeMap<String, ActivityCounts>,

    /// How often each raw author identity contributed
    #[serde(default, with = "counted_pairs")]
    pub author_identities: BTreeMap<String, i64>,

    #[serde(default)]
    pub reactions_given: i64,
    #[serde(default)]
    pub stars_given: i64,
    #[serde(default)]
    pub reactions_earned: i64,
    #[serde(default)]
    pub stars_earned: i64,

    /// Operations suppressed by the burst limiter
    #[serde(default)]
    pub burst_operations: i64,

    /// Timestamp of the last change applied
    #[serde(default)]
    pub modified_on: Timestamp,
}

impl PersonRating {
    /// Create an empty aggregate
    pub fn new(account_id: impl Into<AccountId>) -> Self {
        Self {
            account_id: account_id.into(),
            rating: 0.0,
            months: Vec::new(),
            domain_stats: BTreeMap::new(),
            author_identities: BTreeMap::new(),
            reactions_given: 0,
            stars_given: 0,
            reactions_earned: 0,
            stars_earned: 0,
            burst_operations: 0,
            modified_on: 0,
        }
    }

    /// Empty workspace-level aggregate
    pub fn system() -> Self {
        Self::new(SYSTEM_ACCOUNT)
    }

    pub fn is_system(&self) -> bool {
        self.account_id == SYSTEM_ACCOUNT
    }

    /// Activity summed over all months
    pub fn total_activity(&self) -> ActivityCounts {
        self.months.iter().fold(ActivityCounts::default(), |mut acc, m| {
            acc.creates += m.creates;
            acc.updates += m.updates;
            acc.deletes += m.deletes;
            acc
        })
    }

    /// Number of distinct months with any recorded activity
    pub fn months_active(&self) -> usize {
        self.months.len()
    }

    /// Record one counted operation
    pub fn record_activity(
        &mut self,
        occurred_on: Timestamp,
        kind: ChangeKind,
        domain: Option<&str>,
        identity: Option<&str>,
    ) {
        if let Some(identity) = identity {
            *self.author_identities.entry(identity.to_string()).or_insert(0) += 1;
        }

        let key = year_month(occurred_on);
        match self.months.iter_mut().find(|m| m.year_month == key) {
            Some(month) => month.bump(kind),
            None => {
                let mut month = MonthStats::new(key);
                month.bump(kind);
                self.months.push(month);
                self.months.sort_by(|a, b| b.year_month.cmp(&a.year_month));
            }
        }

        if let Some(domain) = domain {
            self.domain_stats.entry(domain.to_string()).or_default().bump(kind);
        }
    }

    /// Credit a reaction received on one of this account's documents
    pub fn earn_reaction(&mut self, reaction: &Reaction) {
        match reaction {
            Reaction::Star { value } => self.stars_earned += value,
            Reaction::Emoji => self.reactions_earned += 1,
        }
    }

    /// Credit a reaction this account gave
    pub fn give_reaction(&mut self, reaction: &Reaction) {
        match reaction {
            Reaction::Star { value } => self.stars_given += value,
            Reaction::Emoji => self.reactions_given += 1,
        }
    }

    /// Move the modification time forward, never backwards
    pub fn touch(&mut self, ts: Timestamp) {
        self.modified_on = self.modified_on.max(ts);
    }
}

/// Identity maps are stored as `[identity, count]` pairs since identities
/// may contain characters that are not valid document keys.
mod counted_pairs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(map: &BTreeMap<String, i64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let pairs: Vec<(&String, &i64)> = map.iter().collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pairs = Vec::<(String, i64)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

/// Marker written once the full backfill of a workspace has completed
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationMarker {
    #[serde(rename = "_id")]
    pub id: String,
    pub plugin: String,
    pub state: String,
    pub modified_on: Timestamp,
}

impl MigrationMarker {
    pub fn completed(now: Timestamp) -> Self {
        Self {
            id: format!("{}-{}", RATING_PLUGIN, MIGRATION_STATE),
            plugin: RATING_PLUGIN.to_string(),
            state: MIGRATION_STATE.to_string(),
            modified_on: now,
        }
    }
}

/// Lightweight notification pushed to live clients
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RatingChanged {
    #[serde(rename = "_id")]
    pub id: String,
    pub account_id: AccountId,
    pub rating: f64,
    pub modified_on: Timestamp,
}

impl RatingChanged {
    pub fn new(rating: &PersonRating) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: rating.account_id.clone(),
            rating: rating.rating,
            modified_on: rating.modified_on,
        }
    }
}

/// Social identity linked to a person record
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SocialIdentityDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_class")]
    pub class: String,
    pub attached_to: String,
}

/// Person record carrying the account it belongs to
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PersonDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_class")]
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person_uuid: Option<AccountId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-05-10T12:00:00Z
    const MAY_2024: Timestamp = 1_715_342_400_000;
    // 2024-06-01T00:00:01Z
    const JUNE_2024: Timestamp = 1_717_200_001_000;

    #[test]
    fn test_year_month() {
        assert_eq!(year_month(MAY_2024), 202405);
        assert_eq!(year_month(JUNE_2024), 202406);
        assert_eq!(year_month(0), 197001);
    }

    #[test]
    fn test_months_unique_and_sorted() {
        let mut rating = PersonRating::new("acc-1");
        rating.record_activity(MAY_2024, ChangeKind::Create, Some("task"), Some("id:a"));
        rating.record_activity(JUNE_2024, ChangeKind::Update, Some("task"), Some("id:a"));
        rating.record_activity(MAY_2024 + 1000, ChangeKind::Delete, None, Some("id:b"));

        assert_eq!(rating.months.len(), 2);
        assert_eq!(rating.months[0].year_month, 202406);
        assert_eq!(rating.months[1].year_month, 202405);
        assert_eq!(rating.months[1].creates, 1);
        assert_eq!(rating.months[1].deletes, 1);

        let task = rating.domain_stats["task"];
        assert_eq!((task.creates, task.updates, task.deletes), (1, 1, 0));
        assert_eq!(rating.author_identities["id:a"], 2);
        assert_eq!(rating.author_identities["id:b"], 1);

        let total = rating.total_activity();
        assert_eq!((total.creates, total.updates, total.deletes), (1, 1, 1));
    }

    #[test]
    fn test_reactions() {
        let mut rating = PersonRating::new("acc-1");
        rating.earn_reaction(&Reaction::Star { value: 4 });
        rating.earn_reaction(&Reaction::Emoji);
        rating.give_reaction(&Reaction::Star { value: 2 });
        rating.give_reaction(&Reaction::Emoji);
        rating.give_reaction(&Reaction::Emoji);

        assert_eq!(rating.stars_earned, 4);
        assert_eq!(rating.reactions_earned, 1);
        assert_eq!(rating.stars_given, 2);
        assert_eq!(rating.reactions_given, 2);
    }

    #[test]
    fn test_document_shape() {
        let mut rating = PersonRating::new("acc-1");
        rating.record_activity(MAY_2024, ChangeKind::Create, Some("task"), Some("email:a@example.com"));

        let doc = bson::to_document(&rating).unwrap();
        assert_eq!(doc.get_str("_id").unwrap(), "acc-1");
        // Identity with dots is stored as a pair, not as a key
        assert!(doc.get_array("authorIdentities").is_ok());

        let back: PersonRating = bson::from_document(doc).unwrap();
        assert_eq!(back, rating);
    }
}
