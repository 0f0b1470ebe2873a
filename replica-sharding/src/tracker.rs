use arc_swap::ArcSwap;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::MembershipRegistry;

/// This replica's view of the fleet, published as one immutable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub replica_count: u32,
    /// Zero-based position in the sorted member list, `-1` while unknown.
    pub replica_index: i32,
    /// Sorted ids seen at the last successful refresh.
    pub members: Vec<String>,
}

impl MembershipSnapshot {
    pub const UNINITIALIZED: MembershipSnapshot = MembershipSnapshot {
        replica_count: 0,
        replica_index: -1,
        members: Vec::new(),
    };

    pub fn assigned(members: Vec<String>, replica_index: i32) -> Self {
        Self {
            replica_count: u32::try_from(members.len()).unwrap_or(u32::MAX),
            replica_index,
            members,
        }
    }

    /// True when ownership cannot be computed and every agent passes.
    pub fn is_pass_through(&self) -> bool {
        self.replica_count <= 1 || self.replica_index < 0
    }
}

impl Default for MembershipSnapshot {
    fn default() -> Self {
        Self::UNINITIALIZED
    }
}

/// Result of one refresh run. The snapshot is only replaced on `Updated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated { changed: bool },
    StoreUnavailable,
    MembershipInconsistent,
}

/// Snapshots on both sides of a refresh that changed the assignment.
///
/// Captured under the refresh lock, so consecutive changes chain exactly.
#[derive(Debug, Clone)]
pub struct MembershipChange {
    pub previous: Arc<MembershipSnapshot>,
    pub current: Arc<MembershipSnapshot>,
}

/// Keeps this replica's heartbeat alive and recomputes its position.
pub struct MembershipTracker {
    registry: Arc<dyn MembershipRegistry>,
    replica_id: String,
    ttl: Duration,
    snapshot: Arc<ArcSwap<MembershipSnapshot>>,
    last_written_expiry: AtomicI64,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl MembershipTracker {
    pub fn new(
        registry: Arc<dyn MembershipRegistry>,
        replica_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            registry,
            replica_id: replica_id.into(),
            ttl,
            snapshot: Arc::new(ArcSwap::from_pointee(MembershipSnapshot::UNINITIALIZED)),
            last_written_expiry: AtomicI64::new(0),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.snapshot.load_full()
    }

    /// Shared handle for lock-free readers such as filters.
    pub fn snapshot_reader(&self) -> Arc<ArcSwap<MembershipSnapshot>> {
        self.snapshot.clone()
    }

    /// Expiry written by the last successful heartbeat, `0` if none.
    pub fn last_written_expiry(&self) -> i64 {
        self.last_written_expiry.load(Ordering::Acquire)
    }

    pub(crate) fn registry(&self) -> &Arc<dyn MembershipRegistry> {
        &self.registry
    }

    pub async fn refresh(&self) -> RefreshOutcome {
        self.refresh_at(Utc::now().timestamp_millis()).await
    }

    /// [`refresh`](Self::refresh) with an explicit clock, in epoch milliseconds.
    ///
    /// Heartbeat, prune expired peers, then reload and locate this replica.
    /// Failures leave the previous snapshot in place.
    pub async fn refresh_at(&self, now_ms: i64) -> RefreshOutcome {
        self.refresh_tracked_at(now_ms).await.0
    }

    /// [`refresh`](Self::refresh), also returning the snapshots it swapped.
    pub async fn refresh_tracked(&self) -> (RefreshOutcome, Option<MembershipChange>) {
        self.refresh_tracked_at(Utc::now().timestamp_millis()).await
    }

    pub async fn refresh_tracked_at(
        &self,
        now_ms: i64,
    ) -> (RefreshOutcome, Option<MembershipChange>) {
        let _guard = self.refresh_lock.lock().await;

        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now_ms.saturating_add(ttl_ms);
        if let Err(e) = self
            .registry
            .upsert_heartbeat(&self.replica_id, expires_at)
            .await
        {
            tracing::error!(replica_id = %self.replica_id, "Heartbeat failed: {}", e);
            return (RefreshOutcome::StoreUnavailable, None);
        }
        self.last_written_expiry.store(expires_at, Ordering::Release);

        match self.registry.list_all_sorted_by_id().await {
            Ok(records) => {
                for record in records.iter().filter(|r| r.is_expired(now_ms)) {
                    self.prune(&record.replica_id, record.heartbeat_expires_at)
                        .await;
                }
            }
            Err(e) => {
                tracing::error!(replica_id = %self.replica_id, "Failed to scan replicas: {}", e);
                return (RefreshOutcome::StoreUnavailable, None);
            }
        }

        let members: Vec<String> = match self.registry.list_all_sorted_by_id().await {
            Ok(records) => records.into_iter().map(|r| r.replica_id).collect(),
            Err(e) => {
                tracing::error!(replica_id = %self.replica_id, "Failed to list replicas: {}", e);
                return (RefreshOutcome::StoreUnavailable, None);
            }
        };

        let Some(position) = members.iter().position(|id| id == &self.replica_id) else {
            tracing::error!(
                replica_id = %self.replica_id,
                count = members.len(),
                "Own replica missing from membership, keeping previous assignment"
            );
            return (RefreshOutcome::MembershipInconsistent, None);
        };

        let next = MembershipSnapshot::assigned(
            members,
            i32::try_from(position).unwrap_or(i32::MAX),
        );
        let previous = self.snapshot.load_full();
        if *previous == next {
            tracing::trace!(count = next.replica_count, "Refresh: no membership changes");
            return (RefreshOutcome::Updated { changed: false }, None);
        }

        tracing::info!(
            replica_id = %self.replica_id,
            count = next.replica_count,
            index = next.replica_index,
            previous_count = previous.replica_count,
            previous_index = previous.replica_index,
            "Replica assignment changed"
        );
        let current = Arc::new(next);
        self.snapshot.store(current.clone());
        (
            RefreshOutcome::Updated { changed: true },
            Some(MembershipChange { previous, current }),
        )
    }

    async fn prune(&self, replica_id: &str, observed_expires_at: i64) {
        match self
            .registry
            .delete_if_expired(replica_id, observed_expires_at)
            .await
        {
            Ok(true) => tracing::info!(
                pruned = replica_id,
                expired_at = observed_expires_at,
                "Removed expired replica"
            ),
            Ok(false) => tracing::debug!(
                replica = replica_id,
                "Expired replica renewed or removed concurrently, skipping"
            ),
            Err(e) => tracing::warn!(replica = replica_id, "Failed to remove expired replica: {}", e),
        }
    }
}
