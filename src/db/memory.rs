//! In-memory storage adapter
//!
//! Used when MongoDB is unavailable in dev mode, and by the test suite.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};

use super::{
    compare_values, row_id, LowLevelStorage, Query, Row, Sort, StorageCursor, StorageProvider,
};
use crate::types::{RatingError, Result};

/// Rows of one workspace, per domain, keyed by `_id`
#[derive(Default)]
pub struct InMemoryStorage {
    domains: RwLock<HashMap<String, BTreeMap<String, Row>>>,
    /// `(domain, row count)` of every successful upload
    uploads: Mutex<Vec<(String, usize)>>,
    fail_uploads: AtomicBool,
    /// Domain whose uploads are rejected while every other domain works
    failing_domain: StdMutex<Option<String>>,
    closed: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert rows directly, bypassing the upload log
    pub async fn seed(&self, domain: &str, rows: Vec<Row>) -> Result<()> {
        let mut domains = self.domains.write().await;
        let table = domains.entry(domain.to_string()).or_default();
        for row in rows {
            table.insert(row_id(&row)?, row);
        }
        Ok(())
    }

    /// All rows of a domain in `_id` order
    pub async fn rows(&self, domain: &str) -> Vec<Row> {
        self.domains
            .read()
            .await
            .get(domain)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn uploads(&self) -> Vec<(String, usize)> {
        self.uploads.lock().await.clone()
    }

    /// Make every following upload fail until reset
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Reject uploads to one domain only, or none
    pub fn set_failing_domain(&self, domain: Option<&str>) {
        if let Ok(mut failing) = self.failing_domain.lock() {
            *failing = domain.map(str::to_string);
        }
    }

    fn rejects(&self, domain: &str) -> bool {
        self.fail_uploads.load(Ordering::SeqCst)
            || self
                .failing_domain
                .lock()
                .map(|failing| failing.as_deref() == Some(domain))
                .unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LowLevelStorage for InMemoryStorage {
    async fn raw_find_all(&self, domain: &str, query: &Query) -> Result<Vec<Row>> {
        let domains = self.domains.read().await;
        Ok(domains
            .get(domain)
            .map(|t| t.values().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn upload(&self, domain: &str, rows: Vec<Row>) -> Result<()> {
        if self.rejects(domain) {
            return Err(RatingError::Database(format!("Upload to {} rejected", domain)));
        }

        let count = rows.len();
        {
            let mut domains = self.domains.write().await;
            let table = domains.entry(domain.to_string()).or_default();
            for row in rows {
                table.insert(row_id(&row)?, row);
            }
        }
        self.uploads.lock().await.push((domain.to_string(), count));
        Ok(())
    }

    async fn raw_delete_many(&self, domain: &str, query: &Query) -> Result<u64> {
        let mut domains = self.domains.write().await;
        let Some(table) = domains.get_mut(domain) else {
            return Ok(0);
        };
        let before = table.len();
        table.retain(|_, row| !query.matches(row));
        Ok((before - table.len()) as u64)
    }

    async fn traverse(
        &self,
        domain: &str,
        query: &Query,
        sort: Option<Sort>,
    ) -> Result<Box<dyn StorageCursor>> {
        let mut rows = self.raw_find_all(domain, query).await?;
        if let Some(sort) = sort {
            // Rows arrive in `_id` order, so a stable sort keeps `_id` as tie-break
            rows.sort_by(|a, b| {
                let ordering = compare_values(a.get(&sort.field), b.get(&sort.field));
                if sort.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        Ok(Box::new(MemoryCursor { rows: rows.into() }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Cursor over a snapshot taken when the traversal started
pub struct MemoryCursor {
    rows: VecDeque<Row>,
}

#[async_trait]
impl StorageCursor for MemoryCursor {
    async fn next(&mut self, page_size: usize) -> Result<Vec<Row>> {
        let take = page_size.min(self.rows.len());
        Ok(self.rows.drain(..take).collect())
    }

    async fn close(&mut self) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}

/// In-memory storage for any number of workspaces
#[derive(Default)]
pub struct InMemoryStorageProvider {
    workspaces: DashMap<String, Arc<InMemoryStorage>>,
}

impl InMemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage of a workspace, created on first use
    pub fn workspace(&self, workspace: &str) -> Arc<InMemoryStorage> {
        self.workspaces
            .entry(workspace.to_string())
            .or_insert_with(|| Arc::new(InMemoryStorage::new()))
            .clone()
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorageProvider {
    async fn open(&self, workspace: &str) -> Result<Arc<dyn LowLevelStorage>> {
        Ok(self.workspace(workspace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[tokio::test]
    async fn test_upload_overwrites() {
        let storage = InMemoryStorage::new();
        storage
            .upload("d", vec![doc! { "_id": "a", "v": 1 }, doc! { "_id": "b", "v": 1 }])
            .await
            .unwrap();
        storage.upload("d", vec![doc! { "_id": "a", "v": 2 }]).await.unwrap();

        let rows = storage.raw_find_all("d", &Query::eq("_id", "a")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_i32("v").unwrap(), 2);
        assert_eq!(storage.uploads().await, vec![("d".to_string(), 2), ("d".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_traverse_sorted_pages() {
        let storage = InMemoryStorage::new();
        storage
            .seed(
                "tx",
                vec![
                    doc! { "_id": "1", "modifiedOn": 30_i64 },
                    doc! { "_id": "2", "modifiedOn": 10_i64 },
                    doc! { "_id": "3", "modifiedOn": 20_i64 },
                ],
            )
            .await
            .unwrap();

        let mut cursor = storage
            .traverse("tx", &Query::All, Some(Sort::ascending("modifiedOn")))
            .await
            .unwrap();
        let first = cursor.next(2).await.unwrap();
        let second = cursor.next(2).await.unwrap();
        let third = cursor.next(2).await.unwrap();

        let ids: Vec<&str> = first.iter().chain(second.iter()).map(|r| r.get_str("_id").unwrap()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_failure() {
        let storage = InMemoryStorage::new();
        storage.seed("d", vec![doc! { "_id": "a" }, doc! { "_id": "b" }]).await.unwrap();
        assert_eq!(storage.raw_delete_many("d", &Query::All).await.unwrap(), 2);
        assert_eq!(storage.raw_delete_many("missing", &Query::All).await.unwrap(), 0);

        storage.set_fail_uploads(true);
        assert!(storage.upload("d", vec![doc! { "_id": "c" }]).await.is_err());
        assert!(storage.rows("d").await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_domain_only() {
        let storage = InMemoryStorage::new();
        storage.set_failing_domain(Some("d"));
        assert!(storage.upload("d", vec![doc! { "_id": "a" }]).await.is_err());
        storage.upload("other", vec![doc! { "_id": "a" }]).await.unwrap();

        storage.set_failing_domain(None);
        storage.upload("d", vec![doc! { "_id": "a" }]).await.unwrap();
        assert_eq!(storage.rows("d").await.len(), 1);
    }

    #[test]
    fn test_close_keeps_rows() {
        let storage = InMemoryStorage::new();
        tokio_test::block_on(async {
            storage.seed("d", vec![doc! { "_id": "a" }]).await.unwrap();
            storage.close().await.unwrap();
        });
        assert!(storage.is_closed());
        assert_eq!(tokio_test::block_on(storage.rows("d")).len(), 1);
    }

    #[tokio::test]
    async fn test_provider_isolates_workspaces() {
        let provider = InMemoryStorageProvider::new();
        let a = provider.open("ws-a").await.unwrap();
        a.upload("d", vec![doc! { "_id": "x" }]).await.unwrap();

        assert_eq!(provider.workspace("ws-a").rows("d").await.len(), 1);
        assert!(provider.workspace("ws-b").rows("d").await.is_empty());
    }
}
