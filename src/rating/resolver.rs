//! Person resolver
//!
//! Maps raw author identities to accounts. Lookups go through the seeded
//! identity map, then the aggregate cache, then one batched call to the
//! identity service. Anything the service cannot resolve is remembered as
//! missing for the life of the calculator.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::cache::AggregateCache;
use crate::db::{decode_rows, LowLevelStorage, Query};
use crate::model::{
    AccountId, IdentityId, PersonDoc, SocialIdentityDoc, CLASS_PERSON, CLASS_SOCIAL_IDENTITY,
    DOMAIN_CHANNEL, DOMAIN_CONTACT,
};
use crate::services::IdentityService;
use crate::types::Result;

/// Pseudo-identities that never belong to a person
pub const RESERVED_IDENTITIES: &[&str] = &[
    "core:account:System",
    "core:account:ConfigUser",
    "guest:account:Guest",
];

pub struct PersonResolver {
    identities: HashMap<IdentityId, AccountId>,
    missing: HashSet<IdentityId>,
    service: Arc<dyn IdentityService>,
}

impl PersonResolver {
    pub fn new(service: Arc<dyn IdentityService>) -> Self {
        Self {
            identities: HashMap::new(),
            missing: HashSet::new(),
            service,
        }
    }

    /// Reserved and blank identities resolve to nobody
    pub fn is_excluded(identity: &str) -> bool {
        identity.trim().is_empty() || RESERVED_IDENTITIES.contains(&identity)
    }

    pub fn insert(&mut self, identity: impl Into<IdentityId>, account: impl Into<AccountId>) {
        self.identities.insert(identity.into(), account.into());
    }

    pub fn is_missing(&self, identity: &str) -> bool {
        self.missing.contains(identity)
    }

    pub fn known(&self) -> usize {
        self.identities.len()
    }

    /// Seed the identity map from stored social identities joined with persons
    pub async fn seed(&mut self, storage: &dyn LowLevelStorage, page_size: usize) -> Result<usize> {
        let mut cursor = storage
            .traverse(DOMAIN_CHANNEL, &Query::eq("_class", CLASS_SOCIAL_IDENTITY), None)
            .await?;

        let mut seeded = 0;
        let result: Result<()> = async {
            loop {
                let rows = cursor.next(page_size).await?;
                if rows.is_empty() {
                    break;
                }
                let page: Vec<SocialIdentityDoc> = decode_rows(DOMAIN_CHANNEL, rows);
                let persons: Vec<String> = page.iter().map(|s| s.attached_to.clone()).collect();

                let contacts: HashMap<String, AccountId> = decode_rows::<PersonDoc>(
                    DOMAIN_CONTACT,
                    storage
                        .raw_find_all(
                            DOMAIN_CONTACT,
                            &Query::And(vec![
                                Query::eq("_class", CLASS_PERSON),
                                Query::within("_id", persons),
                            ]),
                        )
                        .await?,
                )
                .into_iter()
                .filter_map(|p| p.person_uuid.map(|account| (p.id, account)))
                .collect();

                for social in page {
                    if let Some(account) = contacts.get(&social.attached_to) {
                        self.identities.insert(social.id, account.clone());
                        seeded += 1;
                    }
                }
            }
            Ok(())
        }
        .await;

        cursor.close().await?;
        result?;

        info!(seeded, "Seeded identity map");
        Ok(seeded)
    }

    /// Resolve a set of identities with at most one identity-service call
    pub async fn resolve_batch(
        &mut self,
        identities: &BTreeSet<IdentityId>,
        cache: &AggregateCache,
    ) -> HashMap<IdentityId, AccountId> {
        let mut resolved = HashMap::new();
        let mut to_fetch: Vec<IdentityId> = Vec::new();

        for identity in identities {
            if Self::is_excluded(identity) || self.missing.contains(identity) {
                continue;
            }
            if let Some(account) = self.identities.get(identity) {
                resolved.insert(identity.clone(), account.clone());
                continue;
            }
            if let Some(account) = cache.find_by_identity(identity) {
                self.identities.insert(identity.clone(), account.clone());
                resolved.insert(identity.clone(), account);
                continue;
            }
            to_fetch.push(identity.clone());
        }

        if to_fetch.is_empty() {
            return resolved;
        }

        let fetched = if to_fetch.len() == 1 {
            self.service
                .resolve_single(&to_fetch[0])
                .await
                .map(|account| account.map(|a| (to_fetch[0].clone(), a)).into_iter().collect())
        } else {
            self.service.resolve_batch(&to_fetch).await
        };

        match fetched {
            Ok(found) => {
                for identity in to_fetch {
                    match found.get(&identity) {
                        Some(account) => {
                            self.identities.insert(identity.clone(), account.clone());
                            resolved.insert(identity, account.clone());
                        }
                        None => {
                            debug!(identity = %identity, "No person for identity");
                            self.missing.insert(identity);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(missing = ?to_fetch, "Failed to resolve identities: {}", e);
                self.missing.extend(to_fetch);
            }
        }

        resolved
    }

    /// Resolve one identity through the same layers as a batch
    pub async fn resolve(&mut self, identity: &str, cache: &AggregateCache) -> Option<AccountId> {
        let set: BTreeSet<IdentityId> = std::iter::once(identity.to_string()).collect();
        self.resolve_batch(&set, cache).await.remove(identity)
    }
}
