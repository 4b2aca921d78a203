//! Bounded per-calculator caches
//!
//! Both caches belong to one calculator and die with it.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::model::{AccountId, IdentityId, PersonRating};

pub const DEFAULT_AGGREGATE_CACHE_SIZE: usize = 1_000;
pub const DEFAULT_PARENT_CACHE_SIZE: usize = 10_000;

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

/// Recently used aggregates keyed by account
pub struct AggregateCache {
    inner: LruCache<AccountId, PersonRating>,
}

impl AggregateCache {
    pub fn new(size: usize) -> Self {
        Self {
            inner: LruCache::new(capacity(size)),
        }
    }

    pub fn get(&mut self, account: &str) -> Option<&PersonRating> {
        self.inner.get(account)
    }

    pub fn put(&mut self, rating: PersonRating) {
        self.inner.put(rating.account_id.clone(), rating);
    }

    pub fn contains(&self, account: &str) -> bool {
        self.inner.contains(account)
    }

    /// Account of a cached aggregate that has seen this identity
    pub fn find_by_identity(&self, identity: &str) -> Option<AccountId> {
        self.inner
            .iter()
            .find(|(_, rating)| rating.author_identities.contains_key(identity))
            .map(|(account, _)| account.clone())
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Author identity of recently created documents, keyed by document ID
pub struct ParentCache {
    inner: LruCache<String, IdentityId>,
}

impl ParentCache {
    pub fn new(size: usize) -> Self {
        Self {
            inner: LruCache::new(capacity(size)),
        }
    }

    pub fn get(&mut self, object_id: &str) -> Option<&IdentityId> {
        self.inner.get(object_id)
    }

    pub fn put(&mut self, object_id: impl Into<String>, author: impl Into<IdentityId>) {
        self.inner.put(object_id.into(), author.into());
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
