//! Durable storage seam
//!
//! The calculator only needs four raw operations over untyped rows, so the
//! adapters stay thin: MongoDB in production, an in-memory map in dev mode
//! and tests.

pub mod memory;
pub mod mongo;

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use serde::{de::DeserializeOwned, Serialize};

use crate::types::{RatingError, Result};

pub use memory::{InMemoryStorage, InMemoryStorageProvider};
pub use mongo::{MongoClient, MongoStorage};

/// Untyped stored row
pub type Row = Document;

/// Row filter understood by every adapter
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Every row of the domain
    All,
    /// Field equals value
    Eq(String, Bson),
    /// Field equals any of the values
    In(String, Vec<Bson>),
    /// All sub-queries match
    And(Vec<Query>),
}

impl Query {
    pub fn eq(field: &str, value: impl Into<Bson>) -> Self {
        Self::Eq(field.to_string(), value.into())
    }

    pub fn within<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        Self::In(field.to_string(), values.into_iter().map(Into::into).collect())
    }

    /// MongoDB filter document
    pub fn to_filter(&self) -> Document {
        match self {
            Query::All => Document::new(),
            Query::Eq(field, value) => doc! { field.as_str(): value.clone() },
            Query::In(field, values) => doc! { field.as_str(): { "$in": values.clone() } },
            Query::And(queries) => {
                let parts: Vec<Document> = queries.iter().map(Query::to_filter).collect();
                doc! { "$and": parts }
            }
        }
    }

    /// Evaluate against a row in memory
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Query::All => true,
            Query::Eq(field, value) => row.get(field) == Some(value),
            Query::In(field, values) => match row.get(field) {
                Some(v) => values.contains(v),
                None => false,
            },
            Query::And(queries) => queries.iter().all(|q| q.matches(row)),
        }
    }
}

/// Sort by one field; ties are broken by `_id`
#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    pub field: String,
    pub ascending: bool,
}

impl Sort {
    pub fn ascending(field: &str) -> Self {
        Self {
            field: field.to_string(),
            ascending: true,
        }
    }

    pub fn descending(field: &str) -> Self {
        Self {
            field: field.to_string(),
            ascending: false,
        }
    }

    pub fn to_document(&self) -> Document {
        let order = if self.ascending { 1 } else { -1 };
        doc! { self.field.as_str(): order, "_id": 1 }
    }
}

/// Paged cursor over a traversal
#[async_trait]
pub trait StorageCursor: Send {
    /// Next page of at most `page_size` rows; empty once exhausted
    async fn next(&mut self, page_size: usize) -> Result<Vec<Row>>;

    async fn close(&mut self) -> Result<()>;
}

/// Raw storage of one workspace
#[async_trait]
pub trait LowLevelStorage: Send + Sync {
    async fn raw_find_all(&self, domain: &str, query: &Query) -> Result<Vec<Row>>;

    /// Overwrite-upsert rows by `_id`
    async fn upload(&self, domain: &str, rows: Vec<Row>) -> Result<()>;

    async fn raw_delete_many(&self, domain: &str, query: &Query) -> Result<u64>;

    async fn traverse(
        &self,
        domain: &str,
        query: &Query,
        sort: Option<Sort>,
    ) -> Result<Box<dyn StorageCursor>>;

    async fn close(&self) -> Result<()>;
}

/// Opens the storage of a workspace
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn open(&self, workspace: &str) -> Result<Arc<dyn LowLevelStorage>>;
}

/// Decode a row into a typed value
pub fn from_row<T: DeserializeOwned>(row: Row) -> Result<T> {
    Ok(bson::from_document(row)?)
}

/// Encode a typed value into a row
pub fn to_row<T: Serialize>(value: &T) -> Result<Row> {
    Ok(bson::to_document(value)?)
}

/// Decode rows, skipping and logging the ones that do not fit `T`
pub fn decode_rows<T: DeserializeOwned>(domain: &str, rows: Vec<Row>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match bson::from_document::<T>(row) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(domain, "Skipping malformed row: {}", e);
                None
            }
        })
        .collect()
}

/// String form of a row's `_id`
pub fn row_id(row: &Row) -> Result<String> {
    match row.get("_id") {
        Some(Bson::String(s)) => Ok(s.clone()),
        Some(Bson::ObjectId(oid)) => Ok(oid.to_hex()),
        Some(other) => Ok(other.to_string()),
        None => Err(RatingError::BadRequest("Row without _id".into())),
    }
}

/// Ordering of two field values the way a document store sorts them
pub(crate) fn compare_values(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    fn number(v: &Bson) -> Option<f64> {
        match v {
            Bson::Int32(i) => Some(*i as f64),
            Bson::Int64(i) => Some(*i as f64),
            Bson::Double(d) => Some(*d),
            Bson::DateTime(d) => Some(d.timestamp_millis() as f64),
            _ => None,
        }
    }

    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (number(a), number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => match (a, b) {
                (Bson::String(x), Bson::String(y)) => x.cmp(y),
                _ => a.to_string().cmp(&b.to_string()),
            },
        },
    }
}
