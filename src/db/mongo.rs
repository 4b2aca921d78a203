//! MongoDB storage adapter
//!
//! One database per workspace, one collection per domain.

use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures_util::TryStreamExt;
use mongodb::{Client, Cursor, Database};
use tracing::{debug, info};

use super::{LowLevelStorage, Query, Row, Sort, StorageCursor, StorageProvider};
use crate::types::{RatingError, Result};

/// Rows per `update` command, well below the server's write batch limit
const UPSERT_BATCH: usize = 1_000;

/// Shared MongoDB connection
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_prefix: String,
}

impl MongoClient {
    /// Connect and verify the server is reachable
    pub async fn new(uri: &str, db_prefix: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // Fail fast on an unreachable server
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| RatingError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| RatingError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB");

        Ok(Self {
            client,
            db_prefix: db_prefix.to_string(),
        })
    }

    /// Database name of a workspace
    pub fn db_name(&self, workspace: &str) -> String {
        if self.db_prefix.is_empty() {
            workspace.to_string()
        } else {
            format!("{}_{}", self.db_prefix, workspace)
        }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl StorageProvider for MongoClient {
    async fn open(&self, workspace: &str) -> Result<Arc<dyn LowLevelStorage>> {
        let db = self.client.database(&self.db_name(workspace));
        Ok(Arc::new(MongoStorage { db }))
    }
}

/// Storage of one workspace
pub struct MongoStorage {
    db: Database,
}

impl MongoStorage {
    fn collection(&self, domain: &str) -> mongodb::Collection<Document> {
        self.db.collection::<Document>(domain)
    }
}

#[async_trait]
impl LowLevelStorage for MongoStorage {
    async fn raw_find_all(&self, domain: &str, query: &Query) -> Result<Vec<Row>> {
        let cursor = self.collection(domain).find(query.to_filter()).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn upload(&self, domain: &str, rows: Vec<Row>) -> Result<()> {
        let count = rows.len();
        let mut rows = rows;
        while !rows.is_empty() {
            let rest = rows.split_off(rows.len().min(UPSERT_BATCH));
            let reply = self.db.run_command(upsert_command(domain, rows)?).await?;
            check_write_reply(&reply)?;
            rows = rest;
        }
        debug!(domain, count, "Uploaded rows");
        Ok(())
    }

    async fn raw_delete_many(&self, domain: &str, query: &Query) -> Result<u64> {
        let result = self.collection(domain).delete_many(query.to_filter()).await?;
        Ok(result.deleted_count)
    }

    async fn traverse(
        &self,
        domain: &str,
        query: &Query,
        sort: Option<Sort>,
    ) -> Result<Box<dyn StorageCursor>> {
        let collection = self.collection(domain);
        let mut find = collection.find(query.to_filter());
        if let Some(sort) = sort {
            find = find.sort(sort.to_document());
        }
        let cursor = find.await?;
        Ok(Box::new(MongoCursor {
            cursor: Some(cursor),
        }))
    }

    async fn close(&self) -> Result<()> {
        // The client is shared between workspaces and outlives this handle
        Ok(())
    }
}

/// Unordered `update` command replacing every row by `_id`, inserting missing ones
fn upsert_command(collection: &str, rows: Vec<Row>) -> Result<Document> {
    let updates = rows
        .into_iter()
        .map(|row| {
            let id = row
                .get("_id")
                .cloned()
                .ok_or_else(|| RatingError::BadRequest("Row without _id".into()))?;
            Ok(Bson::Document(doc! { "q": { "_id": id }, "u": row, "upsert": true }))
        })
        .collect::<Result<Vec<Bson>>>()?;

    Ok(doc! {
        "update": collection,
        "updates": updates,
        "ordered": false,
    })
}

/// Per-row failures come back in an otherwise successful reply
fn check_write_reply(reply: &Document) -> Result<()> {
    if let Ok(errors) = reply.get_array("writeErrors") {
        if let Some(first) = errors.first() {
            return Err(RatingError::Database(format!(
                "{} rows failed to upload, first: {}",
                errors.len(),
                first
            )));
        }
    }
    if let Ok(concern) = reply.get_document("writeConcernError") {
        return Err(RatingError::Database(format!("Write concern failed: {}", concern)));
    }
    Ok(())
}

/// Paged view over a MongoDB cursor
pub struct MongoCursor {
    cursor: Option<Cursor<Document>>,
}

#[async_trait]
impl StorageCursor for MongoCursor {
    async fn next(&mut self, page_size: usize) -> Result<Vec<Row>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(Vec::new());
        };

        let mut page = Vec::with_capacity(page_size);
        while page.len() < page_size {
            match cursor.try_next().await? {
                Some(row) => page.push(row),
                None => {
                    self.cursor = None;
                    break;
                }
            }
        }
        Ok(page)
    }

    async fn close(&mut self) -> Result<()> {
        self.cursor = None;
        Ok(())
    }
}
