//! Persistent store boundary for canonical opportunities.

use std::collections::HashMap;

use async_trait::async_trait;
use govcon_core::CanonicalOpportunity;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("natural key {natural_key} already belongs to record {existing_id}")]
    DuplicateKey {
        natural_key: String,
        existing_id: Uuid,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("encoding opportunity fields: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Minimal store contract the reconciliation stage depends on.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn find_by_natural_key(
        &self,
        natural_key: &str,
    ) -> Result<Option<CanonicalOpportunity>, StoreError>;

    /// Persists a record and returns the stored version. A record whose natural
    /// key already belongs to a different id is rejected.
    async fn save(&self, record: CanonicalOpportunity) -> Result<CanonicalOpportunity, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

/// Process-local store keyed by natural key. Enforces the same uniqueness
/// constraint as the Postgres table.
#[derive(Debug, Default)]
pub struct InMemoryOpportunityStore {
    records: RwLock<HashMap<String, CanonicalOpportunity>>,
}

impl InMemoryOpportunityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records ordered by natural key.
    pub async fn snapshot(&self) -> Vec<CanonicalOpportunity> {
        let records = self.records.read().await;
        let mut out: Vec<_> = records.values().cloned().collect();
        out.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        out
    }
}

#[async_trait]
impl OpportunityStore for InMemoryOpportunityStore {
    async fn find_by_natural_key(
        &self,
        natural_key: &str,
    ) -> Result<Option<CanonicalOpportunity>, StoreError> {
        Ok(self.records.read().await.get(natural_key).cloned())
    }

    async fn save(&self, record: CanonicalOpportunity) -> Result<CanonicalOpportunity, StoreError> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&record.natural_key) {
            if existing.id != record.id {
                return Err(StoreError::DuplicateKey {
                    natural_key: record.natural_key.clone(),
                    existing_id: existing.id,
                });
            }
        }
        records.insert(record.natural_key.clone(), record.clone());
        Ok(record)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.records.read().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use govcon_core::{CandidateIdentity, OpportunityCandidate, OpportunityFields};

    fn record(number: &str, title: &str) -> CanonicalOpportunity {
        let candidate = OpportunityCandidate {
            source_id: "sam-opportunities".into(),
            identity: CandidateIdentity::Solicitation {
                solicitation_number: Some(number.into()),
            },
            observed_at: Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap(),
            fields: OpportunityFields {
                title: Some(title.into()),
                ..Default::default()
            },
        };
        let key = candidate.natural_key().unwrap();
        CanonicalOpportunity::from_candidate(&key, &candidate, candidate.observed_at)
    }

    #[tokio::test]
    async fn save_then_find_by_natural_key() {
        let store = InMemoryOpportunityStore::new();
        let saved = store.save(record("SOL-1", "Widgets")).await.unwrap();

        let found = store.find_by_natural_key("SOL-1").await.unwrap().unwrap();
        assert_eq!(found.id, saved.id);
        assert!(store.find_by_natural_key("SOL-2").await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn resaving_same_id_updates_in_place() {
        let store = InMemoryOpportunityStore::new();
        let mut saved = store.save(record("SOL-1", "Widgets")).await.unwrap();
        saved.fields.title = Some("Gadgets".into());
        store.save(saved.clone()).await.unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].fields.title.as_deref(), Some("Gadgets"));
    }

    #[tokio::test]
    async fn second_record_for_same_key_is_rejected() {
        let store = InMemoryOpportunityStore::new();
        let first = store.save(record("SOL-1", "Widgets")).await.unwrap();
        let err = store.save(record("SOL-1", "Duplicate")).await.unwrap_err();

        match err {
            StoreError::DuplicateKey { existing_id, .. } => assert_eq!(existing_id, first.id),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
