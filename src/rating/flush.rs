//! Flush coordinator
//!
//! Collects modified aggregates, writes them as one upsert batch and tells
//! live clients about ratings that visibly changed. The workspace-level
//! aggregate stays resident; it is written by forced flushes after it
//! changed, never by a write triggered by a full batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error};

use super::formula::rounded;
use crate::db::{to_row, LowLevelStorage};
use crate::model::{AccountId, PersonRating, RatingChanged, DOMAIN_PERSON_RATING};
use crate::services::LiveNotifier;
use crate::types::Result;

pub const DEFAULT_FLUSH_BATCH: usize = 1_000;

/// Rating last announced and the aggregate it changed into
struct PendingNotice {
    old_rating: f64,
    current: PersonRating,
}

pub struct FlushCoordinator {
    storage: Arc<dyn LowLevelStorage>,
    notifier: Arc<dyn LiveNotifier>,
    pending: BTreeMap<AccountId, PersonRating>,
    resident: PersonRating,
    resident_dirty: bool,
    notices: BTreeMap<AccountId, PendingNotice>,
    max_batch: usize,
    flushes: u64,
}

impl FlushCoordinator {
    pub fn new(
        storage: Arc<dyn LowLevelStorage>,
        notifier: Arc<dyn LiveNotifier>,
        resident: PersonRating,
        max_batch: usize,
    ) -> Self {
        Self {
            storage,
            notifier,
            pending: BTreeMap::new(),
            resident,
            resident_dirty: false,
            notices: BTreeMap::new(),
            max_batch: max_batch.max(1),
            flushes: 0,
        }
    }

    /// Add or overwrite a pending aggregate.
    ///
    /// A full batch is written out before a new account is added, so no
    /// single write carries more than the batch size of accounts.
    pub async fn stage(&mut self, rating: PersonRating, previous_rating: f64) {
        if rating.account_id == self.resident.account_id {
            self.stage_resident(rating);
            return;
        }

        if !self.pending.contains_key(&rating.account_id) && self.pending.len() >= self.max_batch {
            if let Err(e) = self.write(false).await {
                error!("Error flushing full batch: {}", e);
            }
        }

        self.notices
            .entry(rating.account_id.clone())
            .and_modify(|n| n.current = rating.clone())
            .or_insert_with(|| PendingNotice {
                old_rating: previous_rating,
                current: rating.clone(),
            });
        self.pending.insert(rating.account_id.clone(), rating);
    }

    /// Replace the resident aggregate
    pub fn stage_resident(&mut self, rating: PersonRating) {
        self.resident = rating;
        self.resident_dirty = true;
    }

    /// Write when the batch overflows, or whenever anything is pending if forced
    pub async fn maybe_flush(&mut self, force: bool) -> Result<usize> {
        if force {
            self.flush().await
        } else if self.pending.len() > self.max_batch {
            self.write(false).await
        } else {
            Ok(0)
        }
    }

    /// Write every pending aggregate and the resident one; returns the number
    /// of rows written
    pub async fn flush(&mut self) -> Result<usize> {
        self.write(true).await
    }

    async fn write(&mut self, with_resident: bool) -> Result<usize> {
        let with_resident = with_resident && self.resident_dirty;
        let mut rows = Vec::with_capacity(self.pending.len() + 1);
        for rating in self.pending.values() {
            rows.push(to_row(rating)?);
        }
        if with_resident {
            rows.push(to_row(&self.resident)?);
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let count = rows.len();
        self.storage.upload(DOMAIN_PERSON_RATING, rows).await?;

        // Only a successful write releases the batch
        self.pending.clear();
        if with_resident {
            self.resident_dirty = false;
        }
        self.flushes += 1;
        debug!(count, "Flushed ratings");

        let changes: Vec<RatingChanged> = std::mem::take(&mut self.notices)
            .into_values()
            .filter(|n| rounded(n.old_rating) != rounded(n.current.rating))
            .map(|n| RatingChanged::new(&n.current))
            .collect();
        if !changes.is_empty() {
            self.notifier.broadcast(changes);
        }

        Ok(count)
    }

    /// Pending aggregate of an account, including the resident one
    pub fn get(&self, account: &str) -> Option<&PersonRating> {
        if account == self.resident.account_id {
            return Some(&self.resident);
        }
        self.pending.get(account)
    }

    pub fn resident(&self) -> &PersonRating {
        &self.resident
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_resident_dirty(&self) -> bool {
        self.resident_dirty
    }

    /// Number of successful writes so far
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Drop everything pending and start over from a fresh resident aggregate
    pub fn reset(&mut self, resident: PersonRating) {
        self.pending.clear();
        self.notices.clear();
        self.resident = resident;
        self.resident_dirty = false;
    }
}
