//! Workspace manager
//!
//! Owns one rating calculator per active workspace and drives them from the
//! three queue topics:
//!
//! - raw change records are filtered and forwarded as `Calculate` events
//! - lifecycle events schedule reindexing or force calculators closed
//! - rating events are applied by the workspace's calculator, created lazily
//!   behind the model version gate
//!
//! Idle calculators are closed after `close_timeout`. A workspace that is
//! being restored has its calculator closed and its rating events discarded
//! until it is restored.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::StorageProvider;
use crate::model::{now_ms, ChangeRecord, DomainIndex, ModelVersion, Timestamp};
use crate::nats::{
    ConsumerControl, ConsumerHandle, MessageHandler, NatsClient, QueueConsumer, RatingEvent,
    RatingProducer, WorkspaceEvent, TOPIC_RATING, TOPIC_TX, TOPIC_WORKSPACE,
};
use crate::rating::{CalculatorConfig, CalculatorDeps, CalculatorHandle, RatingCalculator};
use crate::services::{IdentityService, NotifierFactory, WorkspaceDirectory};
use crate::types::{RatingError, Result};

/// Period of the ingestion log line
const INGESTION_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Attempts at handing a rating event to a calculator that is closing
const CLOSING_RETRIES: usize = 3;

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Idle time after which a calculator is closed
    pub close_timeout: Duration,
    /// How often idle calculators are looked for
    pub eviction_interval: Duration,
    /// Version gate attempts before a workspace is marked unavailable
    pub version_attempts: u32,
    pub version_delay: Duration,
    /// Overrides the content model version
    pub supported_version: Option<ModelVersion>,
    /// Durable consumer group shared by all instances
    pub consumer_group: String,
    pub consumer_batch: usize,
    pub calculator: CalculatorConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(5 * 60),
            eviction_interval: Duration::from_secs(30),
            version_attempts: 4,
            version_delay: Duration::from_secs(10),
            supported_version: None,
            consumer_group: "rating".to_string(),
            consumer_batch: 100,
            calculator: CalculatorConfig::default(),
        }
    }
}

/// Collaborators shared by every workspace
#[derive(Clone)]
pub struct ManagerDeps {
    pub index: Arc<DomainIndex>,
    pub storage: Arc<dyn StorageProvider>,
    pub directory: Arc<dyn WorkspaceDirectory>,
    pub identities: Arc<dyn IdentityService>,
    pub notifiers: Arc<dyn NotifierFactory>,
    pub producer: Arc<dyn RatingProducer>,
}

type CalculatorSlot = Arc<OnceCell<Arc<CalculatorHandle>>>;

pub struct WorkspaceManager {
    config: ManagerConfig,
    deps: ManagerDeps,
    supported_version: ModelVersion,
    calculators: DashMap<String, CalculatorSlot>,
    restoring: DashSet<String>,
    unavailable: DashSet<String>,
    ingested: AtomicU64,
    shutting_down: AtomicBool,
    consumers: Mutex<Vec<ConsumerHandle>>,
    timers: StdMutex<Vec<JoinHandle<()>>>,
    transport: StdMutex<Option<NatsClient>>,
}

impl WorkspaceManager {
    pub fn new(config: ManagerConfig, deps: ManagerDeps) -> Arc<Self> {
        let supported_version = config
            .supported_version
            .unwrap_or_else(|| deps.index.version());

        Arc::new(Self {
            config,
            deps,
            supported_version,
            calculators: DashMap::new(),
            restoring: DashSet::new(),
            unavailable: DashSet::new(),
            ingested: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            timers: StdMutex::new(Vec::new()),
            transport: StdMutex::new(None),
        })
    }

    pub fn supported_version(&self) -> ModelVersion {
        self.supported_version
    }

    pub fn is_restoring(&self, workspace: &str) -> bool {
        self.restoring.contains(workspace)
    }

    pub fn is_unavailable(&self, workspace: &str) -> bool {
        self.unavailable.contains(workspace)
    }

    /// Workspaces with a live or initializing calculator
    pub fn active_workspaces(&self) -> Vec<String> {
        self.calculators.iter().map(|e| e.key().clone()).collect()
    }

    /// Calculator of a workspace, if one is running
    pub fn calculator(&self, workspace: &str) -> Option<Arc<CalculatorHandle>> {
        self.calculators
            .get(workspace)
            .and_then(|slot| slot.value().get().cloned())
    }

    // ========================================================================
    // Event processing
    // ========================================================================

    /// Forward a raw change record as a `Calculate` event; `true` when forwarded
    pub async fn process_tx(&self, workspace: &str, record: ChangeRecord) -> Result<bool> {
        self.ingested.fetch_add(1, Ordering::Relaxed);

        if record.is_derived() || self.is_restoring(workspace) {
            return Ok(false);
        }
        if self.deps.index.is_ignored(&record.object_class) {
            return Ok(false);
        }

        self.deps
            .producer
            .send(workspace, vec![RatingEvent::calculate(record)])
            .await?;
        Ok(true)
    }

    pub async fn process_workspace_event(&self, workspace: &str, event: WorkspaceEvent) -> Result<()> {
        info!(workspace = %workspace, event = ?event, "Workspace event");

        match event {
            WorkspaceEvent::Restoring => {
                self.restoring.insert(workspace.to_string());
                self.close_workspace(workspace).await;
            }
            WorkspaceEvent::Restored => {
                self.restoring.remove(workspace);
                self.deps
                    .producer
                    .send(workspace, vec![RatingEvent::Reindex])
                    .await?;
            }
            WorkspaceEvent::Created | WorkspaceEvent::FullReindex => {
                if self.is_restoring(workspace) {
                    debug!(workspace = %workspace, "Workspace is restoring, reindex deferred");
                    return Ok(());
                }
                self.deps
                    .producer
                    .send(workspace, vec![RatingEvent::Reindex])
                    .await?;
            }
            WorkspaceEvent::Upgraded => {
                self.unavailable.remove(workspace);
                self.close_workspace(workspace).await;
            }
        }
        Ok(())
    }

    pub async fn process_rating_event(
        &self,
        workspace: &str,
        event: RatingEvent,
        control: &dyn ConsumerControl,
    ) -> Result<()> {
        if self.is_restoring(workspace) {
            debug!(workspace = %workspace, "Workspace is restoring, rating event discarded");
            return Ok(());
        }
        if self.is_unavailable(workspace) {
            debug!(workspace = %workspace, "Workspace is unavailable, rating event discarded");
            return Ok(());
        }

        for _ in 0..CLOSING_RETRIES {
            let handle = self.get_or_create(workspace, control).await?;
            let result = match &event {
                RatingEvent::Reindex => handle.reindex(control).await.map(|ran| {
                    if !ran {
                        debug!(workspace = %workspace, "Reindex skipped, workspace just migrated");
                    }
                }),
                RatingEvent::Calculate { tx } => handle
                    .calculate(std::slice::from_ref(tx.as_ref()), control)
                    .await
                    .map(|_| ()),
            };

            match result {
                Err(RatingError::Closing(_)) => {
                    handle.wait_released().await;
                    continue;
                }
                other => return other,
            }
        }
        Err(RatingError::Closing(workspace.to_string()))
    }

    // ========================================================================
    // Calculator lifecycle
    // ========================================================================

    /// Running calculator of a workspace, creating it on first use
    pub async fn get_or_create(
        &self,
        workspace: &str,
        control: &dyn ConsumerControl,
    ) -> Result<Arc<CalculatorHandle>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RatingError::Closing(workspace.to_string()));
        }

        loop {
            let slot = self
                .calculators
                .entry(workspace.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value()
                .clone();

            let created = slot
                .get_or_try_init(|| self.create_calculator(workspace, control))
                .await
                .cloned();

            let handle = match created {
                Ok(handle) => handle,
                Err(e) => {
                    self.forget(workspace, &slot);
                    if matches!(e, RatingError::VersionMismatch { .. }) {
                        error!(workspace = %workspace, "{}, workspace marked unavailable", e);
                        self.unavailable.insert(workspace.to_string());
                    }
                    return Err(e);
                }
            };

            if handle.is_closing() {
                handle.wait_released().await;
                self.forget(workspace, &slot);
                continue;
            }

            // Closed while it was being created
            if !self.is_current(workspace, &slot) {
                handle.close().await;
                return Err(RatingError::Closing(workspace.to_string()));
            }

            return Ok(handle);
        }
    }

    async fn create_calculator(
        &self,
        workspace: &str,
        control: &dyn ConsumerControl,
    ) -> Result<Arc<CalculatorHandle>> {
        self.check_version(workspace, control).await?;

        let deps = CalculatorDeps {
            storage: self.deps.storage.open(workspace).await?,
            index: self.deps.index.clone(),
            identities: self.deps.identities.clone(),
            notifier: self.deps.notifiers.create(workspace)?,
        };

        let calculator =
            RatingCalculator::create(workspace, self.config.calculator.clone(), deps, control).await?;
        Ok(CalculatorHandle::start(
            calculator,
            self.config.calculator.flush_interval,
        ))
    }

    /// Wait until the workspace runs the supported model version.
    ///
    /// Keeps the triggering message alive while waiting between attempts.
    async fn check_version(&self, workspace: &str, control: &dyn ConsumerControl) -> Result<()> {
        let attempts = self.config.version_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let info = self
                .deps
                .directory
                .workspace_info(workspace)
                .await?
                .ok_or_else(|| RatingError::NotFound(format!("Workspace {}", workspace)))?;

            let found = info.version();
            if found == self.supported_version {
                return Ok(());
            }
            if attempt >= attempts {
                return Err(RatingError::VersionMismatch {
                    workspace: workspace.to_string(),
                    found: found.to_string(),
                    supported: self.supported_version.to_string(),
                });
            }

            warn!(
                workspace = %workspace,
                found = %found,
                supported = %self.supported_version,
                "Workspace model version mismatch, attempt {}/{}",
                attempt,
                attempts
            );
            control.heartbeat().await;
            tokio::time::sleep(self.config.version_delay).await;
        }
    }

    fn is_current(&self, workspace: &str, slot: &CalculatorSlot) -> bool {
        self.calculators
            .get(workspace)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    fn forget(&self, workspace: &str, slot: &CalculatorSlot) -> bool {
        self.calculators
            .remove_if(workspace, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
    }

    /// Force the calculator of a workspace closed; `true` if one was running
    pub async fn close_workspace(&self, workspace: &str) -> bool {
        let Some((_, slot)) = self.calculators.remove(workspace) else {
            return false;
        };
        if let Some(handle) = slot.get() {
            info!(workspace = %workspace, "Closing rating calculator");
            handle.close().await;
        }
        true
    }

    /// Close calculators idle for longer than the close timeout
    pub async fn evict_idle(&self, now: Timestamp) -> usize {
        let timeout_ms = self.config.close_timeout.as_millis() as i64;
        let idle: Vec<(String, CalculatorSlot)> = self
            .calculators
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .get()
                    .is_some_and(|handle| handle.operations() == 0 && handle.idle_for(now) > timeout_ms)
            })
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut evicted = 0;
        for (workspace, slot) in idle {
            if !self.forget(&workspace, &slot) {
                continue;
            }
            if let Some(handle) = slot.get() {
                info!(workspace = %workspace, "Closing idle rating calculator");
                handle.close().await;
                evicted += 1;
            }
        }
        evicted
    }

    // ========================================================================
    // Service lifecycle
    // ========================================================================

    /// Start the consumers and background timers
    pub async fn start(self: &Arc<Self>, client: NatsClient) -> Result<()> {
        for topic in [TOPIC_WORKSPACE, TOPIC_RATING, TOPIC_TX] {
            client.ensure_stream(topic).await?;
        }

        let group = self.config.consumer_group.as_str();
        let batch = self.config.consumer_batch;

        let lifecycle: Arc<dyn MessageHandler<WorkspaceEvent>> = self.clone();
        let rating: Arc<dyn MessageHandler<RatingEvent>> = self.clone();
        let raw: Arc<dyn MessageHandler<ChangeRecord>> = self.clone();

        let handles = vec![
            QueueConsumer::new(client.clone(), TOPIC_WORKSPACE, group, lifecycle, batch).spawn(),
            QueueConsumer::new(client.clone(), TOPIC_RATING, group, rating, batch).spawn(),
            QueueConsumer::new(client.clone(), TOPIC_TX, group, raw, batch).spawn(),
        ];
        self.consumers.lock().await.extend(handles);

        let eviction = {
            let weak = Arc::downgrade(self);
            let period = self.config.eviction_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(manager) = weak.upgrade() else {
                        break;
                    };
                    let evicted = manager.evict_idle(now_ms()).await;
                    if evicted > 0 {
                        debug!("Evicted {} idle calculators", evicted);
                    }
                }
            })
        };

        let ingestion = {
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(INGESTION_LOG_INTERVAL);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(manager) = weak.upgrade() else {
                        break;
                    };
                    let count = manager.ingested.swap(0, Ordering::Relaxed);
                    if count > 0 {
                        info!(
                            count,
                            active = manager.calculators.len(),
                            "Change records ingested in the last {}s",
                            INGESTION_LOG_INTERVAL.as_secs()
                        );
                    }
                }
            })
        };

        if let Ok(mut timers) = self.timers.lock() {
            timers.push(eviction);
            timers.push(ingestion);
        }
        if let Ok(mut transport) = self.transport.lock() {
            *transport = Some(client);
        }

        info!(group = %group, "Workspace manager started");
        Ok(())
    }

    /// Stop consuming and close every calculator
    pub async fn shutdown(&self, delete_topics: bool) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);

        let consumers: Vec<ConsumerHandle> = self.consumers.lock().await.drain(..).collect();
        for consumer in consumers {
            consumer.stop().await;
        }

        if let Ok(mut timers) = self.timers.lock() {
            for timer in timers.drain(..) {
                timer.abort();
            }
        }

        let workspaces = self.active_workspaces();
        for workspace in &workspaces {
            self.close_workspace(workspace).await;
        }
        info!("Closed {} rating calculators", workspaces.len());

        let transport = self.transport.lock().ok().and_then(|mut t| t.take());
        if let Some(client) = transport {
            if delete_topics {
                for topic in [TOPIC_WORKSPACE, TOPIC_RATING, TOPIC_TX] {
                    client.delete_stream(topic).await?;
                }
            }
            client.flush().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler<ChangeRecord> for WorkspaceManager {
    async fn handle(&self, workspace: &str, message: ChangeRecord, _control: &dyn ConsumerControl) -> Result<()> {
        self.process_tx(workspace, message).await.map(|_| ())
    }
}

#[async_trait]
impl MessageHandler<WorkspaceEvent> for WorkspaceManager {
    async fn handle(&self, workspace: &str, message: WorkspaceEvent, _control: &dyn ConsumerControl) -> Result<()> {
        self.process_workspace_event(workspace, message).await
    }
}

#[async_trait]
impl MessageHandler<RatingEvent> for WorkspaceManager {
    async fn handle(&self, workspace: &str, message: RatingEvent, control: &dyn ConsumerControl) -> Result<()> {
        self.process_rating_event(workspace, message, control).await
    }
}
