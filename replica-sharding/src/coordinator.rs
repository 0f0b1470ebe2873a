use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    AgentDescriptor, MembershipChange, MembershipRegistry, MembershipSnapshot, MembershipTracker,
    RefreshOutcome, ReplicaShardingFilter, ShardingConfig, ShardingFilter,
};

/// Membership change event.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Joined(String),
    Left(String),
}

/// Runs the heartbeat loop for one replica and answers ownership questions.
///
/// The registry is only touched by the background task (and explicit
/// [`refresh`](Self::refresh) calls). [`owns`](Self::owns) is a lock-free
/// snapshot read.
pub struct ShardingCoordinator {
    tracker: Arc<MembershipTracker>,
    filter: ReplicaShardingFilter,
    cancel_token: CancellationToken,
    task_handle: Option<tokio::task::JoinHandle<()>>,
    event_tx: broadcast::Sender<MembershipEvent>,
}

impl ShardingCoordinator {
    /// Register this replica and start the heartbeat task.
    ///
    /// Never fails: if the first refresh cannot reach the registry the
    /// coordinator starts in pass-through mode and retries on schedule.
    pub async fn start(registry: Arc<dyn MembershipRegistry>, config: &ShardingConfig) -> Self {
        let config = config.clone().validated();
        let tracker = Arc::new(MembershipTracker::new(
            registry,
            config.resolved_replica_id(),
            config.replica_ttl(),
        ));

        let filter = ReplicaShardingFilter::new(
            tracker.snapshot_reader(),
            config.resolve_key_extractor(),
            config.resolve_strategy(),
        );

        let outcome = tracker.refresh().await;
        tracing::info!(
            replica_id = %tracker.replica_id(),
            strategy = filter.strategy_name(),
            sharding_key = filter.key_name(),
            count = filter.replica_count(),
            index = filter.replica_index(),
            ?outcome,
            "Sharding coordinator started"
        );

        let cancel_token = CancellationToken::new();
        // Broadcast channel for membership events (16 capacity is enough for bursts)
        let (event_tx, _) = broadcast::channel(16);

        let task_handle = Self::spawn_heartbeat_task(
            tracker.clone(),
            cancel_token.clone(),
            event_tx.clone(),
            config.heartbeat_interval(),
        );

        Self {
            tracker,
            filter,
            cancel_token,
            task_handle: Some(task_handle),
            event_tx,
        }
    }

    fn spawn_heartbeat_task(
        tracker: Arc<MembershipTracker>,
        cancel_token: CancellationToken,
        event_tx: broadcast::Sender<MembershipEvent>,
        heartbeat_interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(heartbeat_interval);
            // A slow refresh delays the next tick instead of bunching runs.
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; start already refreshed.
            timer.tick().await;
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Heartbeat task shutting down");
                        break;
                    }

                    _ = timer.tick() => {
                        match tracker.refresh_tracked().await {
                            (RefreshOutcome::Updated { .. }, change) => {
                                if consecutive_failures > 0 {
                                    tracing::info!(
                                        failures = consecutive_failures,
                                        "Membership refresh recovered"
                                    );
                                }
                                consecutive_failures = 0;
                                if let Some(change) = change {
                                    publish_changes(&change, &event_tx);
                                }
                            }
                            (outcome, _) => {
                                consecutive_failures += 1;
                                tracing::warn!(
                                    failures = consecutive_failures,
                                    ?outcome,
                                    "Membership refresh failed, keeping previous assignment"
                                );
                            }
                        }
                    }
                }
            }
        })
    }

    /// Whether this replica should run `agent`.
    pub fn owns(&self, agent: &AgentDescriptor) -> bool {
        self.filter.owns(agent)
    }

    /// Filter handle that can outlive the coordinator's borrow.
    pub fn filter(&self) -> ReplicaShardingFilter {
        self.filter.clone()
    }

    pub fn replica_id(&self) -> &str {
        self.tracker.replica_id()
    }

    pub fn replica_count(&self) -> u32 {
        self.filter.replica_count()
    }

    pub fn replica_index(&self) -> i32 {
        self.filter.replica_index()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.filter.strategy_name()
    }

    pub fn key_name(&self) -> &'static str {
        self.filter.key_name()
    }

    pub fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.tracker.snapshot()
    }

    /// Subscribe to membership change events.
    ///
    /// Events are broadcast after the snapshot has been replaced.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.event_tx.subscribe()
    }

    /// Refresh now instead of waiting for the next tick.
    ///
    /// Serialized with the background task's runs.
    pub async fn refresh(&self) -> RefreshOutcome {
        let (outcome, change) = self.tracker.refresh_tracked().await;
        if let Some(change) = change {
            publish_changes(&change, &self.event_tx);
        }
        outcome
    }

    /// Stop the heartbeat task and remove this replica's record.
    ///
    /// Peers pick up the smaller fleet on their next refresh instead of
    /// waiting for the TTL. A failed removal is logged; the record then
    /// expires normally.
    pub async fn shutdown(mut self) {
        // Stop heartbeats first so the record is not re-created after removal.
        self.cancel_token.cancel();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }

        let replica_id = self.tracker.replica_id().to_string();
        let last_expiry = self.tracker.last_written_expiry();
        if last_expiry == 0 {
            tracing::debug!(%replica_id, "No heartbeat written, nothing to deregister");
            return;
        }

        match self
            .tracker
            .registry()
            .delete_if_expired(&replica_id, last_expiry)
            .await
        {
            Ok(true) => tracing::info!(%replica_id, "Deregistered replica"),
            Ok(false) => tracing::warn!(%replica_id, "Replica record already gone or changed"),
            Err(e) => tracing::warn!(%replica_id, "Failed to deregister replica: {}", e),
        }
    }
}

impl Drop for ShardingCoordinator {
    fn drop(&mut self) {
        // Without an explicit shutdown the task would keep heartbeating.
        self.cancel_token.cancel();
    }
}

fn publish_changes(change: &MembershipChange, event_tx: &broadcast::Sender<MembershipEvent>) {
    let previous: BTreeSet<&String> = change.previous.members.iter().collect();
    let current: BTreeSet<&String> = change.current.members.iter().collect();

    for id in current.difference(&previous) {
        tracing::debug!(id = %id, "Replica joined");
        let _ = event_tx.send(MembershipEvent::Joined((*id).clone()));
    }
    for id in previous.difference(&current) {
        tracing::debug!(id = %id, "Replica left");
        let _ = event_tx.send(MembershipEvent::Left((*id).clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryRegistry;

    fn config(id: &str) -> ShardingConfig {
        ShardingConfig {
            strategy: "canonical-modulo".to_string(),
            replica_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_membership_event_variants() {
        let joined = MembershipEvent::Joined("abc-123".to_string());
        let left = MembershipEvent::Left("xyz-789".to_string());
        assert_eq!(joined, MembershipEvent::Joined("abc-123".to_string()));
        assert_eq!(left, MembershipEvent::Left("xyz-789".to_string()));
    }

    #[test]
    fn test_publish_changes_diffs_members() {
        let (tx, mut rx) = broadcast::channel(16);
        let change = MembershipChange {
            previous: Arc::new(MembershipSnapshot::assigned(vec!["a".into(), "b".into()], 0)),
            current: Arc::new(MembershipSnapshot::assigned(vec!["a".into(), "c".into()], 0)),
        };

        publish_changes(&change, &tx);

        assert_eq!(rx.try_recv().unwrap(), MembershipEvent::Joined("c".into()));
        assert_eq!(rx.try_recv().unwrap(), MembershipEvent::Left("b".into()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_coordinator_starts_and_handles_keys() {
        let registry = InMemoryRegistry::new();
        let coordinator = ShardingCoordinator::start(Arc::new(registry.clone()), &config("r1")).await;

        // Solo replica handles everything
        assert_eq!(coordinator.replica_count(), 1);
        assert_eq!(coordinator.replica_index(), 0);
        assert_eq!(coordinator.strategy_name(), "canonical-modulo");
        assert_eq!(coordinator.key_name(), "account");
        assert!(coordinator.owns(&AgentDescriptor::type_only("any")));
        assert!(registry.expiry_of("r1").is_some());

        coordinator.shutdown().await;
        assert_eq!(registry.expiry_of("r1"), None);
    }

    #[tokio::test]
    async fn test_refresh_emits_join_and_leave_events() {
        let registry = InMemoryRegistry::new();
        let coord1 = ShardingCoordinator::start(Arc::new(registry.clone()), &config("r1")).await;
        let mut rx = coord1.subscribe();

        let coord2 = ShardingCoordinator::start(Arc::new(registry.clone()), &config("r2")).await;
        coord1.refresh().await;

        assert_eq!(rx.recv().await.unwrap(), MembershipEvent::Joined("r2".into()));
        assert_eq!(coord1.replica_count(), 2);

        coord2.shutdown().await;
        coord1.refresh().await;
        assert_eq!(rx.recv().await.unwrap(), MembershipEvent::Left("r2".into()));
        assert_eq!(coord1.replica_count(), 1);

        coord1.shutdown().await;
    }

    #[tokio::test]
    async fn test_overlapping_refreshes_announce_a_join_once() {
        let registry = InMemoryRegistry::new();
        let coordinator = ShardingCoordinator::start(Arc::new(registry.clone()), &config("r1")).await;
        let mut rx = coordinator.subscribe();

        registry
            .upsert_heartbeat("r2", chrono::Utc::now().timestamp_millis() + 60_000)
            .await
            .unwrap();
        let outcomes = tokio::join!(
            coordinator.refresh(),
            coordinator.refresh(),
            coordinator.refresh(),
            coordinator.refresh()
        );

        let changed = [outcomes.0, outcomes.1, outcomes.2, outcomes.3]
            .iter()
            .filter(|o| **o == RefreshOutcome::Updated { changed: true })
            .count();
        assert_eq!(changed, 1);
        assert_eq!(rx.try_recv().unwrap(), MembershipEvent::Joined("r2".into()));
        assert!(rx.try_recv().is_err());

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_task_picks_up_new_replica() {
        let registry = InMemoryRegistry::new();
        let mut fast = config("r1");
        fast.heartbeat_interval_seconds = 1;
        fast.replica_ttl_seconds = 10;
        let coord1 = ShardingCoordinator::start(Arc::new(registry.clone()), &fast).await;
        assert_eq!(coord1.replica_count(), 1);

        registry
            .upsert_heartbeat("r0", chrono::Utc::now().timestamp_millis() + 60_000)
            .await
            .unwrap();

        let start = std::time::Instant::now();
        while coord1.replica_count() != 2 {
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "background refresh didn't detect r0"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(coord1.replica_index(), 1);

        coord1.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_registry_starts_in_pass_through() {
        struct DownRegistry;

        #[async_trait::async_trait]
        impl MembershipRegistry for DownRegistry {
            async fn upsert_heartbeat(&self, _: &str, _: i64) -> Result<(), crate::Error> {
                Err(crate::Error::Registry("down".into()))
            }
            async fn delete_if_expired(&self, _: &str, _: i64) -> Result<bool, crate::Error> {
                Err(crate::Error::Registry("down".into()))
            }
            async fn list_all_sorted_by_id(&self) -> Result<Vec<crate::ReplicaRecord>, crate::Error> {
                Err(crate::Error::Registry("down".into()))
            }
        }

        let coordinator = ShardingCoordinator::start(Arc::new(DownRegistry), &config("r1")).await;
        assert_eq!(coordinator.replica_count(), 0);
        assert_eq!(coordinator.replica_index(), -1);
        assert!(coordinator.owns(&AgentDescriptor::type_only("any").with_account("acct-1")));
        assert_eq!(coordinator.refresh().await, RefreshOutcome::StoreUnavailable);

        coordinator.shutdown().await;
    }
}
