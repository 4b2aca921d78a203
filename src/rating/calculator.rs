//! Per-workspace rating calculator
//!
//! Owns migration replay and incremental processing for one workspace.
//! Work inside a calculator is strictly sequential; parallelism comes from
//! running many workspaces side by side.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bson::Bson;
use tracing::{debug, error, info, warn};

use super::burst::{BurstLimiter, DEFAULT_BURST_CACHE_SIZE, DEFAULT_BURST_WINDOW_MS};
use super::cache::{AggregateCache, ParentCache, DEFAULT_AGGREGATE_CACHE_SIZE, DEFAULT_PARENT_CACHE_SIZE};
use super::flush::{FlushCoordinator, DEFAULT_FLUSH_BATCH};
use super::formula;
use super::resolver::PersonResolver;
use crate::db::{decode_rows, from_row, to_row, LowLevelStorage, Query, Row, Sort};
use crate::model::{
    now_ms, AccountId, ChangeKind, ChangeRecord, DomainIndex, IdentityId, MigrationMarker,
    PersonRating, DOMAIN_MIGRATION, DOMAIN_PERSON_RATING, DOMAIN_TX, SYSTEM_ACCOUNT,
};
use crate::model::rating::{MIGRATION_STATE, RATING_PLUGIN};
use crate::nats::ConsumerControl;
use crate::services::{IdentityService, LiveNotifier};
use crate::types::{RatingError, Result};

/// Tuning of one calculator
#[derive(Debug, Clone)]
pub struct CalculatorConfig {
    /// Change records per migration page
    pub migration_page_size: usize,
    /// Social identities per seeding page
    pub identity_page_size: usize,
    /// Accounts per flush write
    pub flush_batch_size: usize,
    /// Period of the background flush
    pub flush_interval: Duration,
    pub burst_window_ms: i64,
    pub burst_cache_size: usize,
    pub aggregate_cache_size: usize,
    pub parent_cache_size: usize,
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            migration_page_size: 250,
            identity_page_size: 500,
            flush_batch_size: DEFAULT_FLUSH_BATCH,
            flush_interval: Duration::from_secs(5),
            burst_window_ms: DEFAULT_BURST_WINDOW_MS,
            burst_cache_size: DEFAULT_BURST_CACHE_SIZE,
            aggregate_cache_size: DEFAULT_AGGREGATE_CACHE_SIZE,
            parent_cache_size: DEFAULT_PARENT_CACHE_SIZE,
        }
    }
}

/// Collaborators a calculator is built from
#[derive(Clone)]
pub struct CalculatorDeps {
    pub storage: Arc<dyn LowLevelStorage>,
    pub index: Arc<DomainIndex>,
    pub identities: Arc<dyn IdentityService>,
    pub notifier: Arc<dyn LiveNotifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculatorState {
    Initializing,
    Migrating,
    Live,
    Draining,
    Closed,
}

pub struct RatingCalculator {
    workspace: String,
    config: CalculatorConfig,
    storage: Arc<dyn LowLevelStorage>,
    index: Arc<DomainIndex>,
    state: CalculatorState,
    resolver: PersonResolver,
    burst: BurstLimiter,
    aggregates: AggregateCache,
    parents: ParentCache,
    flush: FlushCoordinator,
    /// Set when creation ran the full replay and nothing happened since
    fresh_migration: bool,
}

impl RatingCalculator {
    /// Build a calculator, running the one-time backfill when the workspace has none
    pub async fn create(
        workspace: &str,
        config: CalculatorConfig,
        deps: CalculatorDeps,
        control: &dyn ConsumerControl,
    ) -> Result<Self> {
        let CalculatorDeps {
            storage,
            index,
            identities,
            notifier,
        } = deps;

        let mut resolver = PersonResolver::new(identities);
        resolver
            .seed(storage.as_ref(), config.identity_page_size)
            .await?;

        let system = Self::load_system(storage.as_ref()).await?;

        let mut calculator = Self {
            workspace: workspace.to_string(),
            burst: BurstLimiter::new(config.burst_cache_size, config.burst_window_ms),
            aggregates: AggregateCache::new(config.aggregate_cache_size),
            parents: ParentCache::new(config.parent_cache_size),
            flush: FlushCoordinator::new(storage.clone(), notifier, system, config.flush_batch_size),
            config,
            storage,
            index,
            state: CalculatorState::Initializing,
            resolver,
            fresh_migration: false,
        };

        if !calculator.has_migration_marker().await? {
            calculator.recalculate_all(control).await?;
            calculator
                .storage
                .upload(DOMAIN_MIGRATION, vec![to_row(&MigrationMarker::completed(now_ms()))?])
                .await?;
            calculator.fresh_migration = true;
        }

        calculator.state = CalculatorState::Live;
        info!(workspace = %calculator.workspace, "Rating calculator created");
        Ok(calculator)
    }

    async fn load_system(storage: &dyn LowLevelStorage) -> Result<PersonRating> {
        let rows = storage
            .raw_find_all(DOMAIN_PERSON_RATING, &Query::eq("_id", SYSTEM_ACCOUNT))
            .await?;
        match rows.into_iter().next() {
            Some(row) => from_row(row),
            None => Ok(PersonRating::system()),
        }
    }

    async fn has_migration_marker(&self) -> Result<bool> {
        let rows = self
            .storage
            .raw_find_all(
                DOMAIN_MIGRATION,
                &Query::And(vec![
                    Query::eq("plugin", RATING_PLUGIN),
                    Query::eq("state", MIGRATION_STATE),
                ]),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn state(&self) -> CalculatorState {
        self.state
    }

    pub fn index(&self) -> &DomainIndex {
        &self.index
    }

    /// Clear every aggregate and replay the whole change log
    pub async fn recalculate_all(&mut self, control: &dyn ConsumerControl) -> Result<usize> {
        info!(workspace = %self.workspace, "Starting full rating recalculation");
        let previous = self.state;
        self.state = CalculatorState::Migrating;

        let result = self.replay(control).await;

        self.state = if previous == CalculatorState::Initializing {
            CalculatorState::Initializing
        } else {
            CalculatorState::Live
        };

        match &result {
            Ok(processed) => {
                info!(workspace = %self.workspace, processed, "Full rating recalculation done")
            }
            Err(e) => error!(workspace = %self.workspace, "Full rating recalculation failed: {}", e),
        }
        result
    }

    async fn replay(&mut self, control: &dyn ConsumerControl) -> Result<usize> {
        self.aggregates.clear();
        self.parents.clear();
        self.burst.clear();
        self.flush.reset(PersonRating::system());

        self.storage.raw_delete_many(DOMAIN_PERSON_RATING, &Query::All).await?;

        let mut cursor = self
            .storage
            .traverse(DOMAIN_TX, &Query::All, Some(Sort::ascending("modifiedOn")))
            .await?;

        let mut processed = 0;
        let result: Result<()> = async {
            loop {
                let rows = cursor.next(self.config.migration_page_size).await?;
                control.heartbeat().await;
                if rows.is_empty() {
                    break;
                }
                let records: Vec<ChangeRecord> = decode_rows(DOMAIN_TX, rows);
                self.stage_batch(&records, control).await?;
                // A page that cannot be written fails the migration
                self.flush.maybe_flush(true).await?;
                processed += records.len();
                debug!(workspace = %self.workspace, processed, "Replayed change records");
            }
            // Nothing may stay pending once the marker is written
            self.flush.flush().await?;
            Ok(())
        }
        .await;

        cursor.close().await?;
        result?;
        Ok(processed)
    }

    /// Full replay on request, unless creation has just done one
    pub async fn reindex(&mut self, control: &dyn ConsumerControl) -> Result<bool> {
        if std::mem::take(&mut self.fresh_migration) {
            info!(workspace = %self.workspace, "Skipping reindex, migration just completed");
            return Ok(false);
        }
        self.recalculate_all(control).await?;
        Ok(true)
    }

    /// Apply records delivered by the queue
    pub async fn calculate(&mut self, records: &[ChangeRecord], control: &dyn ConsumerControl) -> Result<usize> {
        self.fresh_migration = false;
        self.process_batch(records, control).await
    }

    /// Apply a batch of change records and write the result; returns how
    /// many were relevant.
    ///
    /// A failed write is logged and the batch stays pending for the next one.
    pub async fn process_batch(&mut self, records: &[ChangeRecord], control: &dyn ConsumerControl) -> Result<usize> {
        let relevant = self.stage_batch(records, control).await?;
        if let Err(e) = self.flush.maybe_flush(true).await {
            error!(workspace = %self.workspace, "Error flushing ratings: {}", e);
        }
        Ok(relevant)
    }

    /// Fold a batch into the pending aggregates.
    ///
    /// Every storage read happens before any aggregate is modified, so a
    /// batch that fails can be redelivered safely.
    async fn stage_batch(&mut self, records: &[ChangeRecord], control: &dyn ConsumerControl) -> Result<usize> {
        if matches!(self.state, CalculatorState::Draining | CalculatorState::Closed) {
            return Err(RatingError::Closing(self.workspace.clone()));
        }

        // Every create teaches us who authored that document
        for record in records.iter().filter(|r| r.kind == ChangeKind::Create) {
            self.parents.put(record.object_id.clone(), record.author());
        }

        let tracked: Vec<&ChangeRecord> = records
            .iter()
            .filter(|r| self.index.is_tracked(&r.object_class))
            .collect();
        if tracked.is_empty() {
            return Ok(0);
        }
        control.heartbeat().await;

        let parent_authors = self.parent_authors(&tracked).await?;

        let mut identities: BTreeSet<IdentityId> =
            tracked.iter().map(|r| r.actor().to_string()).collect();
        identities.extend(parent_authors.values().cloned());
        let resolved = self.resolver.resolve_batch(&identities, &self.aggregates).await;

        let accounts: BTreeSet<AccountId> = resolved
            .values()
            .filter(|a| a.as_str() != SYSTEM_ACCOUNT)
            .cloned()
            .collect();
        let mut working = self.load_aggregates(&accounts).await?;
        let previous: HashMap<AccountId, f64> = working
            .iter()
            .map(|(account, rating)| (account.clone(), rating.rating))
            .collect();
        let mut system = self.flush.resident().clone();

        let touched = Self::apply(
            &self.index,
            &mut self.burst,
            &tracked,
            &parent_authors,
            &resolved,
            &mut working,
            &mut system,
        );

        for account in touched {
            if let Some(mut rating) = working.remove(&account) {
                formula::apply(&mut rating);
                let old = previous.get(&account).copied().unwrap_or(0.0);
                self.flush.stage(rating.clone(), old).await;
                self.aggregates.put(rating);
            }
        }
        formula::apply(&mut system);
        self.flush.stage_resident(system);

        Ok(tracked.len())
    }

    /// Authors of the parents referenced by create records, from the parent
    /// cache or one storage query per parent domain
    async fn parent_authors(&mut self, tracked: &[&ChangeRecord]) -> Result<HashMap<String, IdentityId>> {
        let mut authors: HashMap<String, IdentityId> = HashMap::new();
        let mut by_domain: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for record in tracked.iter().filter(|r| r.kind == ChangeKind::Create) {
            let Some((parent, parent_class)) = record.parent() else {
                continue;
            };
            if let Some(author) = self.parents.get(parent) {
                authors.insert(parent.to_string(), author.clone());
                continue;
            }
            match self.index.domain_of(parent_class) {
                Some(domain) => {
                    by_domain
                        .entry(domain.to_string())
                        .or_default()
                        .insert(parent.to_string());
                }
                None => debug!(class = parent_class, "Parent class has no domain"),
            }
        }

        for (domain, ids) in by_domain {
            let rows = self
                .storage
                .raw_find_all(&domain, &Query::within("_id", ids))
                .await?;
            for row in rows {
                if let Some((id, author)) = parent_author(&row) {
                    self.parents.put(id.clone(), author.clone());
                    authors.insert(id, author);
                }
            }
        }

        Ok(authors)
    }

    /// Working copies of the aggregates, from pending, cache, storage or fresh
    async fn load_aggregates(&mut self, accounts: &BTreeSet<AccountId>) -> Result<HashMap<AccountId, PersonRating>> {
        let mut working = HashMap::new();
        let mut to_load = Vec::new();

        for account in accounts {
            if let Some(rating) = self.flush.get(account) {
                working.insert(account.clone(), rating.clone());
            } else if let Some(rating) = self.aggregates.get(account) {
                working.insert(account.clone(), rating.clone());
            } else {
                to_load.push(account.clone());
            }
        }

        if !to_load.is_empty() {
            let rows = self
                .storage
                .raw_find_all(DOMAIN_PERSON_RATING, &Query::within("_id", to_load.clone()))
                .await?;
            for rating in decode_rows::<PersonRating>(DOMAIN_PERSON_RATING, rows) {
                working.insert(rating.account_id.clone(), rating);
            }
            for account in to_load {
                working
                    .entry(account.clone())
                    .or_insert_with(|| PersonRating::new(account));
            }
        }

        Ok(working)
    }

    /// Fold the records into the working aggregates; returns touched accounts
    fn apply(
        index: &DomainIndex,
        burst: &mut BurstLimiter,
        records: &[&ChangeRecord],
        parent_authors: &HashMap<String, IdentityId>,
        resolved: &HashMap<IdentityId, AccountId>,
        working: &mut HashMap<AccountId, PersonRating>,
        system: &mut PersonRating,
    ) -> BTreeSet<AccountId> {
        let mut touched = BTreeSet::new();

        for record in records {
            let domain = index.domain_of(&record.object_class);
            let occurred_on = record.occurred_on();

            system.record_activity(occurred_on, record.kind, domain, None);
            system.touch(record.modified_on);

            let actor = resolved
                .get(record.actor())
                .filter(|account| working.contains_key(*account))
                .cloned();

            if record.kind == ChangeKind::Create && index.is_reaction(&record.object_class) {
                let Some(reaction) = record.reaction.as_ref() else {
                    warn!(object = %record.object_id, "Reaction without payload, nothing credited");
                    continue;
                };

                let parent_account = record
                    .attached_to
                    .as_ref()
                    .and_then(|parent| parent_authors.get(parent))
                    .and_then(|author| resolved.get(author));
                if let Some(rating) = parent_account.and_then(|a| working.get_mut(a)) {
                    rating.earn_reaction(reaction);
                    rating.touch(record.modified_on);
                    touched.insert(rating.account_id.clone());
                }

                if let Some(rating) = actor.as_ref().and_then(|a| working.get_mut(a)) {
                    rating.give_reaction(reaction);
                    rating.touch(record.modified_on);
                    touched.insert(rating.account_id.clone());
                }
                continue;
            }

            if let Some(rating) = actor.as_ref().and_then(|a| working.get_mut(a)) {
                if burst.should_count(&rating.account_id, record.modified_on) {
                    rating.record_activity(occurred_on, record.kind, domain, Some(record.actor()));
                } else {
                    rating.burst_operations += 1;
                }
                rating.touch(record.modified_on);
                touched.insert(rating.account_id.clone());
            }
        }

        touched
    }

    /// Periodic flush; a closed calculator has nothing left to write
    pub async fn flush_pending(&mut self) {
        if self.state == CalculatorState::Closed {
            return;
        }
        if let Err(e) = self.flush.maybe_flush(true).await {
            error!(workspace = %self.workspace, "Error during periodic flush: {}", e);
        }
    }

    /// Final flush and release of storage
    pub async fn close(&mut self) -> Result<()> {
        if self.state == CalculatorState::Closed {
            return Ok(());
        }
        self.state = CalculatorState::Draining;

        let flushed = self.flush.flush().await;
        if let Err(e) = &flushed {
            warn!(workspace = %self.workspace, "Final flush failed: {}", e);
        }

        self.state = CalculatorState::Closed;
        self.storage.close().await?;
        info!(workspace = %self.workspace, "Rating calculator closed");
        flushed.map(|_| ())
    }

    pub fn pending_len(&self) -> usize {
        self.flush.pending_len()
    }

    /// Resident workspace-level aggregate
    pub fn system_rating(&self) -> &PersonRating {
        self.flush.resident()
    }
}

/// `(document id, author)` of a stored parent row
fn parent_author(row: &Row) -> Option<(String, IdentityId)> {
    let id = match row.get("_id")? {
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    };
    let author = row
        .get_str("createdBy")
        .or_else(|_| row.get_str("modifiedBy"))
        .ok()?;
    Some((id, author.to_string()))
}
