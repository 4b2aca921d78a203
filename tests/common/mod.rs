//! Shared collaborators for the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use rating_service::db::{from_row, InMemoryStorage, InMemoryStorageProvider};
use rating_service::manager::{ManagerConfig, ManagerDeps, WorkspaceManager};
use rating_service::model::{
    AccountId, ContentModel, DomainIndex, IdentityId, ModelVersion, PersonRating, RatingChanged,
};
use rating_service::nats::{ConsumerControl, RatingEvent, RatingProducer};
use rating_service::rating::{CalculatorConfig, CalculatorDeps};
use rating_service::services::{
    IdentityService, LiveNotifier, NotifierFactory, WorkspaceDirectory, WorkspaceInfo,
};
use rating_service::Result;

/// 2024-05-10T12:00:00Z
pub const T0: i64 = 1_715_342_400_000;

/// 2024-06-03T08:00:00Z
pub const T1: i64 = 1_717_401_600_000;

pub fn builtin_index() -> Arc<DomainIndex> {
    Arc::new(DomainIndex::build(&ContentModel::builtin().unwrap()).unwrap())
}

// ============================================================================
// Identity service
// ============================================================================

/// Fixed identity → account table, counting calls
#[derive(Default)]
pub struct StaticIdentities {
    accounts: HashMap<IdentityId, AccountId>,
    calls: AtomicUsize,
}

impl StaticIdentities {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self {
            accounts: pairs
                .iter()
                .map(|(identity, account)| (identity.to_string(), account.to_string()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityService for StaticIdentities {
    async fn resolve_single(&self, identity: &str) -> Result<Option<AccountId>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.accounts.get(identity).cloned())
    }

    async fn resolve_batch(&self, identities: &[IdentityId]) -> Result<HashMap<IdentityId, AccountId>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(identities
            .iter()
            .filter_map(|i| self.accounts.get(i).map(|a| (i.clone(), a.clone())))
            .collect())
    }
}

/// Accounts of the usual test authors
pub fn authors() -> Arc<StaticIdentities> {
    Arc::new(StaticIdentities::new(&[
        ("id:alice", "acc-alice"),
        ("id:bob", "acc-bob"),
        ("id:carol", "acc-carol"),
    ]))
}

// ============================================================================
// Live notifications
// ============================================================================

/// Keeps every broadcast change, for all workspaces it was created for
#[derive(Default, Clone)]
pub struct RecordingNotifier {
    changes: Arc<Mutex<Vec<RatingChanged>>>,
}

impl RecordingNotifier {
    pub fn changes(&self) -> Vec<RatingChanged> {
        self.changes.lock().unwrap().clone()
    }
}

impl LiveNotifier for RecordingNotifier {
    fn broadcast(&self, changes: Vec<RatingChanged>) {
        self.changes.lock().unwrap().extend(changes);
    }
}

impl NotifierFactory for RecordingNotifier {
    fn create(&self, _workspace: &str) -> Result<Arc<dyn LiveNotifier>> {
        Ok(Arc::new(self.clone()))
    }
}

// ============================================================================
// Producer and workspace directory
// ============================================================================

#[derive(Default)]
pub struct RecordingProducer {
    sent: Mutex<Vec<(String, RatingEvent)>>,
}

impl RecordingProducer {
    pub fn sent(&self) -> Vec<(String, RatingEvent)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl RatingProducer for RecordingProducer {
    async fn send(&self, workspace: &str, events: Vec<RatingEvent>) -> Result<()> {
        let mut sent = self.sent.lock().unwrap();
        sent.extend(events.into_iter().map(|e| (workspace.to_string(), e)));
        Ok(())
    }
}

/// Every workspace runs the same model version, which tests can change
pub struct StaticDirectory {
    version: Mutex<ModelVersion>,
    lookups: AtomicUsize,
}

impl StaticDirectory {
    pub fn new(version: ModelVersion) -> Self {
        Self {
            version: Mutex::new(version),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn set_version(&self, version: ModelVersion) {
        *self.version.lock().unwrap() = version;
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkspaceDirectory for StaticDirectory {
    async fn workspace_info(&self, workspace: &str) -> Result<Option<WorkspaceInfo>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let version = *self.version.lock().unwrap();
        Ok(Some(WorkspaceInfo {
            uuid: workspace.to_string(),
            version_major: version.major,
            version_minor: version.minor,
            version_patch: version.patch,
            data_id: None,
            url: None,
        }))
    }
}

/// Counts heartbeats sent while a message is handled
#[derive(Default)]
pub struct CountingControl {
    beats: AtomicUsize,
}

impl CountingControl {
    pub fn beats(&self) -> usize {
        self.beats.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsumerControl for CountingControl {
    async fn heartbeat(&self) {
        self.beats.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn calculator_deps(storage: Arc<InMemoryStorage>, notifier: RecordingNotifier) -> CalculatorDeps {
    CalculatorDeps {
        storage,
        index: builtin_index(),
        identities: authors(),
        notifier: Arc::new(notifier),
    }
}

/// Calculator tuning with a background flush that never fires during a test
pub fn quiet_calculator() -> CalculatorConfig {
    CalculatorConfig {
        flush_interval: Duration::from_secs(3600),
        ..CalculatorConfig::default()
    }
}

pub struct TestManager {
    pub manager: Arc<WorkspaceManager>,
    pub storage: Arc<InMemoryStorageProvider>,
    pub producer: Arc<RecordingProducer>,
    pub directory: Arc<StaticDirectory>,
    pub notifier: RecordingNotifier,
}

pub fn test_manager(config: ManagerConfig) -> TestManager {
    let index = builtin_index();
    let storage = Arc::new(InMemoryStorageProvider::new());
    let producer = Arc::new(RecordingProducer::default());
    let directory = Arc::new(StaticDirectory::new(index.version()));
    let notifier = RecordingNotifier::default();

    let manager = WorkspaceManager::new(
        config,
        ManagerDeps {
            index,
            storage: storage.clone(),
            directory: directory.clone(),
            identities: authors(),
            notifiers: Arc::new(notifier.clone()),
            producer: producer.clone(),
        },
    );

    TestManager {
        manager,
        storage,
        producer,
        directory,
        notifier,
    }
}

pub fn manager_config() -> ManagerConfig {
    ManagerConfig {
        version_attempts: 2,
        version_delay: Duration::from_millis(10),
        calculator: quiet_calculator(),
        ..ManagerConfig::default()
    }
}

/// Stored aggregate of an account
pub async fn stored(storage: &InMemoryStorage, account: &str) -> Option<PersonRating> {
    storage
        .rows("person_rating")
        .await
        .into_iter()
        .map(|row| from_row::<PersonRating>(row).unwrap())
        .find(|r| r.account_id == account)
}

/// All stored aggregates, ordered by account
pub async fn stored_all(storage: &InMemoryStorage) -> Vec<PersonRating> {
    storage
        .rows("person_rating")
        .await
        .into_iter()
        .map(|row| from_row::<PersonRating>(row).unwrap())
        .collect()
}
