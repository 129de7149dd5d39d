//! Natural-key upsert of normalized candidates into the canonical store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use govcon_core::{CanonicalOpportunity, NaturalKey, OpportunityCandidate, ReconcileOutcome, SkipReason};
use govcon_storage::{OpportunityStore, StoreError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

/// Per-key mutex plus the number of callers holding or waiting on it.
type LockMap = HashMap<String, (Arc<tokio::sync::Mutex<()>>, usize)>;

/// One async mutex per natural key currently being reconciled. Entries are
/// removed once nobody holds or waits on them, including waiters whose future
/// was dropped before the lock was granted.
#[derive(Debug, Default)]
struct KeyLocks {
    inner: Arc<Mutex<LockMap>>,
}

/// Registered before the lock is awaited, so dropping a pending `lock` future
/// still releases the entry.
struct KeyGuard {
    key: String,
    locks: Arc<Mutex<LockMap>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let (mutex, users) = map.entry(key.to_string()).or_default();
            *users += 1;
            mutex.clone()
        };
        let mut guard = KeyGuard {
            key: key.to_string(),
            locks: self.inner.clone(),
            held: None,
        };
        guard.held = Some(mutex.lock_owned().await);
        guard
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, users)) = map.get_mut(&self.key) {
            *users -= 1;
            if *users == 0 {
                map.remove(&self.key);
            }
        }
    }
}

/// Reconciliation stage. Same-key upserts are serialized even across
/// concurrent runs sharing one reconciler.
pub struct Reconciler {
    store: Arc<dyn OpportunityStore>,
    locks: KeyLocks,
}

impl Reconciler {
    pub fn new(store: Arc<dyn OpportunityStore>) -> Self {
        Self {
            store,
            locks: KeyLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn OpportunityStore> {
        &self.store
    }

    /// Creates or updates the canonical record for the candidate's natural key.
    /// Never fails: missing identity and store errors become `Skipped`.
    pub async fn reconcile(&self, candidate: &OpportunityCandidate) -> ReconcileOutcome {
        let Some(key) = candidate.natural_key() else {
            warn!(
                source_id = %candidate.source_id,
                title = candidate.fields.title.as_deref().unwrap_or("<untitled>"),
                "candidate has no natural key; skipped"
            );
            return ReconcileOutcome::Skipped(SkipReason::IdentityMissing);
        };

        let _guard = self.locks.lock(key.as_str()).await;
        match self.upsert(&key, candidate).await {
            Ok(outcome) => {
                debug!(natural_key = %key, ?outcome, "reconciled");
                outcome
            }
            Err(err) => {
                warn!(natural_key = %key, error = %err, "reconciliation failed; skipped");
                ReconcileOutcome::Skipped(SkipReason::StoreFailure)
            }
        }
    }

    async fn upsert(
        &self,
        key: &NaturalKey,
        candidate: &OpportunityCandidate,
    ) -> Result<ReconcileOutcome, StoreError> {
        let now = Utc::now();
        match self.store.find_by_natural_key(key.as_str()).await? {
            Some(mut existing) => {
                existing.apply_observation(candidate, now);
                self.store.save(existing).await?;
                Ok(ReconcileOutcome::Updated)
            }
            None => {
                let record = CanonicalOpportunity::from_candidate(key, candidate, now);
                let new_id = record.id;
                let stored = self.store.save(record).await?;
                // Another process may have created the key between lookup and
                // write; the store merged into its row instead.
                if stored.id == new_id {
                    Ok(ReconcileOutcome::Created)
                } else {
                    Ok(ReconcileOutcome::Updated)
                }
            }
        }
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{candidate_for, sam_candidate, FlakyStore};
    use govcon_core::{CandidateIdentity, OpportunityFields};
    use govcon_storage::InMemoryOpportunityStore;

    #[tokio::test]
    async fn second_observation_updates_title_and_keeps_identifier() {
        let store = Arc::new(InMemoryOpportunityStore::new());
        let reconciler = Reconciler::new(store.clone());

        let first = reconciler.reconcile(&sam_candidate("SOL-1", "Original title")).await;
        let created = store.find_by_natural_key("SOL-1").await.unwrap().unwrap();
        let second = reconciler.reconcile(&sam_candidate("SOL-1", "Updated title")).await;

        assert_eq!(first, ReconcileOutcome::Created);
        assert_eq!(second, ReconcileOutcome::Updated);
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, created.id);
        assert_eq!(snapshot[0].fields.title.as_deref(), Some("Updated title"));
        assert!(snapshot[0].updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn blank_solicitation_number_is_skipped_and_never_persisted() {
        let store = Arc::new(InMemoryOpportunityStore::new());
        let reconciler = Reconciler::new(store.clone());

        let outcome = reconciler.reconcile(&sam_candidate("  ", "No identity")).await;

        assert_eq!(outcome, ReconcileOutcome::Skipped(SkipReason::IdentityMissing));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn absent_fields_do_not_erase_known_values() {
        let store = Arc::new(InMemoryOpportunityStore::new());
        let reconciler = Reconciler::new(store.clone());
        let identity = CandidateIdentity::Solicitation {
            solicitation_number: Some("SOL-9".into()),
        };

        reconciler
            .reconcile(&candidate_for(
                identity.clone(),
                OpportunityFields {
                    title: Some("Bridge repair".into()),
                    naics_code: Some("237310".into()),
                    set_aside: Some("8(a) Set-Aside".into()),
                    ..Default::default()
                },
            ))
            .await;
        reconciler
            .reconcile(&candidate_for(
                identity,
                OpportunityFields {
                    title: Some("Bridge repair, amended".into()),
                    ..Default::default()
                },
            ))
            .await;

        let record = store.find_by_natural_key("SOL-9").await.unwrap().unwrap();
        assert_eq!(record.fields.title.as_deref(), Some("Bridge repair, amended"));
        assert_eq!(record.fields.naics_code.as_deref(), Some("237310"));
        assert_eq!(record.fields.set_aside.as_deref(), Some("8(a) Set-Aside"));
    }

    #[tokio::test]
    async fn store_failure_skips_one_candidate_only() {
        let store = Arc::new(FlakyStore::failing_on("SOL-BAD"));
        let reconciler = Reconciler::new(store.clone());

        let bad = reconciler.reconcile(&sam_candidate("SOL-BAD", "Broken")).await;
        let good = reconciler.reconcile(&sam_candidate("SOL-OK", "Fine")).await;

        assert_eq!(bad, ReconcileOutcome::Skipped(SkipReason::StoreFailure));
        assert_eq!(good, ReconcileOutcome::Created);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_same_key_reconciles_create_one_record() {
        let store = Arc::new(InMemoryOpportunityStore::new());
        let reconciler = Arc::new(Reconciler::new(store.clone()));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let reconciler = reconciler.clone();
            tasks.spawn(async move {
                reconciler
                    .reconcile(&sam_candidate("SOL-RACE", &format!("Observation {i}")))
                    .await
            });
        }
        let mut outcomes = Vec::new();
        while let Some(outcome) = tasks.join_next().await {
            outcomes.push(outcome.unwrap());
        }

        let created = outcomes
            .iter()
            .filter(|o| **o == ReconcileOutcome::Created)
            .count();
        assert_eq!(created, 1);
        assert_eq!(outcomes.len() - created, 15);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(reconciler.held_locks(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_releases_its_key_entry() {
        let locks = KeyLocks::default();

        let holder = locks.lock("SOL-1").await;
        let mut waiter = Box::pin(locks.lock("SOL-1"));
        assert!(futures::poll!(&mut waiter).is_pending());
        assert_eq!(locks.len(), 1);

        drop(waiter);
        assert_eq!(locks.len(), 1);
        drop(holder);
        assert_eq!(locks.len(), 0);

        let again = locks.lock("SOL-1").await;
        assert_eq!(locks.len(), 1);
        drop(again);
        assert_eq!(locks.len(), 0);
    }
}
