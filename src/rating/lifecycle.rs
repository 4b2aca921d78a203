//! Calculator lifecycle
//!
//! Wraps a calculator with an in-flight operation counter so it can be
//! closed from any task. `close()` releases immediately when idle; otherwise
//! the last operation to finish does it. Work requested while closing is
//! refused with [`RatingError::Closing`].

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::calculator::RatingCalculator;
use crate::model::{now_ms, ChangeRecord, Timestamp};
use crate::nats::ConsumerControl;
use crate::types::{RatingError, Result};

pub struct CalculatorHandle {
    workspace: String,
    calculator: Mutex<RatingCalculator>,
    operations: AtomicUsize,
    closing: AtomicBool,
    released: AtomicBool,
    last_update: AtomicI64,
    flush_task: StdMutex<Option<JoinHandle<()>>>,
    released_tx: watch::Sender<bool>,
}

impl CalculatorHandle {
    /// Wrap a calculator and start its periodic flush
    pub fn start(calculator: RatingCalculator, flush_interval: Duration) -> Arc<Self> {
        let (released_tx, _) = watch::channel(false);
        let handle = Arc::new(Self {
            workspace: calculator.workspace().to_string(),
            calculator: Mutex::new(calculator),
            operations: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            released: AtomicBool::new(false),
            last_update: AtomicI64::new(now_ms()),
            flush_task: StdMutex::new(None),
            released_tx,
        });

        let weak = Arc::downgrade(&handle);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(handle) = weak.upgrade() else {
                    break;
                };
                if handle.is_closing() {
                    break;
                }
                // Periodic flushes do not count as activity
                handle.calculator.lock().await.flush_pending().await;
            }
        });
        if let Ok(mut slot) = handle.flush_task.lock() {
            *slot = Some(task);
        }

        handle
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    pub fn last_update(&self) -> Timestamp {
        self.last_update.load(Ordering::SeqCst)
    }

    /// Milliseconds since the last operation started or finished
    pub fn idle_for(&self, now: Timestamp) -> i64 {
        now - self.last_update()
    }

    fn touch(&self) {
        self.last_update.store(now_ms(), Ordering::SeqCst);
    }

    async fn begin(&self) -> Result<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.is_closing() {
            self.end().await;
            return Err(RatingError::Closing(self.workspace.clone()));
        }
        self.touch();
        Ok(())
    }

    async fn end(&self) {
        let previous = self.operations.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && self.is_closing() {
            self.release().await;
        }
    }

    /// Apply change records
    pub async fn calculate(&self, records: &[ChangeRecord], control: &dyn ConsumerControl) -> Result<usize> {
        self.begin().await?;
        let result = {
            let mut calculator = self.calculator.lock().await;
            calculator.calculate(records, control).await
        };
        self.touch();
        self.end().await;
        result
    }

    /// Full replay; `false` when skipped right after the initial migration
    pub async fn reindex(&self, control: &dyn ConsumerControl) -> Result<bool> {
        self.begin().await?;
        let result = {
            let mut calculator = self.calculator.lock().await;
            calculator.reindex(control).await
        };
        self.touch();
        self.end().await;
        result
    }

    /// Stop accepting work; returns whether resources were released already
    pub async fn close(&self) -> bool {
        self.closing.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.flush_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }

        if self.operations() == 0 {
            self.release().await;
        }
        self.is_released()
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(workspace = %self.workspace, "Releasing rating calculator");

        if let Err(e) = self.calculator.lock().await.close().await {
            error!(workspace = %self.workspace, "Error closing rating calculator: {}", e);
        }
        let _ = self.released_tx.send(true);
    }

    /// Resolves once the calculator has been released
    pub async fn wait_released(&self) {
        let mut rx = self.released_tx.subscribe();
        let _ = rx.wait_for(|released| *released).await;
    }
}

impl Drop for CalculatorHandle {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.flush_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}
