use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{Error, MembershipRegistry, ReplicaRecord};

/// Process-local registry.
///
/// Clones share one store, so several trackers in one process (tests,
/// local development, single-host deployments) see each other.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    records: Arc<Mutex<BTreeMap<String, i64>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current expiry for `replica_id`, if a record exists.
    pub fn expiry_of(&self, replica_id: &str) -> Option<i64> {
        self.inspect().get(replica_id).copied()
    }

    pub fn len(&self) -> usize {
        self.inspect().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, i64>>, Error> {
        self.records
            .lock()
            .map_err(|_| Error::Registry("in-memory registry lock poisoned".to_string()))
    }

    // Read-only helpers report the stored records even after a poisoning panic.
    fn inspect(&self) -> MutexGuard<'_, BTreeMap<String, i64>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MembershipRegistry for InMemoryRegistry {
    async fn upsert_heartbeat(&self, replica_id: &str, expires_at: i64) -> Result<(), Error> {
        self.lock()?.insert(replica_id.to_string(), expires_at);
        Ok(())
    }

    async fn delete_if_expired(
        &self,
        replica_id: &str,
        observed_expires_at: i64,
    ) -> Result<bool, Error> {
        let mut records = self.lock()?;
        match records.get(replica_id) {
            Some(&current) if current == observed_expires_at => {
                records.remove(replica_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_all_sorted_by_id(&self) -> Result<Vec<ReplicaRecord>, Error> {
        Ok(self
            .lock()?
            .iter()
            .map(|(id, expires_at)| ReplicaRecord::new(id.clone(), *expires_at))
            .collect())
    }
}
