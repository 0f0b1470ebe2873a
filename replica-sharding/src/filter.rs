use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::{AgentDescriptor, MembershipSnapshot, ShardingKeyExtractor, ShardingStrategy};

/// Decides whether this replica should run an agent.
pub trait ShardingFilter: Send + Sync {
    fn owns(&self, agent: &AgentDescriptor) -> bool;

    /// Ownership check when only the agent type is known.
    fn owns_agent_type(&self, agent_type: &str) -> bool {
        self.owns(&AgentDescriptor::type_only(agent_type))
    }
}

/// Filter used when sharding is disabled: every replica runs every agent.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopShardingFilter;

impl ShardingFilter for NoopShardingFilter {
    fn owns(&self, _agent: &AgentDescriptor) -> bool {
        true
    }
}

/// Ownership from the latest membership snapshot.
///
/// Reads are lock-free and never touch the registry. Without reliable
/// membership (fewer than two replicas, or no index yet) every agent passes.
#[derive(Clone)]
pub struct ReplicaShardingFilter {
    snapshot: Arc<ArcSwap<MembershipSnapshot>>,
    extractor: Arc<dyn ShardingKeyExtractor>,
    strategy: Arc<dyn ShardingStrategy>,
}

impl ReplicaShardingFilter {
    pub fn new(
        snapshot: Arc<ArcSwap<MembershipSnapshot>>,
        extractor: Arc<dyn ShardingKeyExtractor>,
        strategy: Arc<dyn ShardingStrategy>,
    ) -> Self {
        Self {
            snapshot,
            extractor,
            strategy,
        }
    }

    pub fn replica_count(&self) -> u32 {
        self.snapshot.load().replica_count
    }

    pub fn replica_index(&self) -> i32 {
        self.snapshot.load().replica_index
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn key_name(&self) -> &'static str {
        self.extractor.name()
    }
}

impl ShardingFilter for ReplicaShardingFilter {
    fn owns(&self, agent: &AgentDescriptor) -> bool {
        if agent.is_core_provider() {
            return true;
        }

        let snapshot = self.snapshot.load();
        if snapshot.is_pass_through() {
            return true;
        }

        let key = self.extractor.extract_key(agent);
        self.strategy.owner_index(&key, snapshot.replica_count) == snapshot.replica_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{key, strategy};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn filter_with(snapshot: MembershipSnapshot, strategy_name: &str) -> ReplicaShardingFilter {
        ReplicaShardingFilter::new(
            Arc::new(ArcSwap::from_pointee(snapshot)),
            key::by_name("account"),
            strategy::by_name(strategy_name),
        )
    }

    fn members(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("replica-{:02}", i)).collect()
    }

    fn agent(account: &str) -> AgentDescriptor {
        AgentDescriptor::new("aws", format!("{}/us-east-1/ClusterCachingAgent", account))
            .with_account(account)
    }

    #[test]
    fn test_uninitialized_snapshot_passes_everything() {
        let filter = filter_with(MembershipSnapshot::UNINITIALIZED, "canonical-modulo");
        for i in 0..100 {
            assert!(filter.owns(&agent(&format!("acct-{}", i))));
        }
    }

    #[test]
    fn test_single_replica_passes_everything() {
        let filter = filter_with(MembershipSnapshot::assigned(members(1), 0), "jump");
        for i in 0..100 {
            assert!(filter.owns(&agent(&format!("acct-{}", i))));
        }
    }

    #[test]
    fn test_negative_index_passes_everything() {
        let snapshot = MembershipSnapshot {
            replica_count: 4,
            replica_index: -1,
            members: members(4),
        };
        let filter = filter_with(snapshot, "modulo");
        for i in 0..100 {
            assert!(filter.owns(&agent(&format!("acct-{}", i))));
        }
    }

    #[test]
    fn test_core_provider_bypasses_sharding() {
        for name in strategy::known_names() {
            for index in 0..3 {
                let filter = filter_with(MembershipSnapshot::assigned(members(3), index), name);
                for i in 0..50 {
                    assert!(filter.owns(&agent(&format!("acct-{}", i)).core()));
                    assert!(filter.owns(&AgentDescriptor::new(
                        crate::CORE_PROVIDER_NAME,
                        format!("CleanupAgent-{}", i)
                    )));
                }
            }
        }
    }

    #[test]
    fn test_exactly_one_index_owns_each_key() {
        let count = 5;
        for name in strategy::known_names() {
            let filters: Vec<_> = (0..count)
                .map(|index| {
                    filter_with(MembershipSnapshot::assigned(members(count), index as i32), name)
                })
                .collect();

            let mut rng = StdRng::seed_from_u64(17);
            let mut per_index = vec![0usize; count];
            for _ in 0..10_000 {
                let account = format!("{:016x}", rng.gen::<u64>());
                let agent = agent(&account);
                let owners: Vec<usize> = (0..count).filter(|i| filters[*i].owns(&agent)).collect();
                assert_eq!(owners.len(), 1, "{}: account {} owners {:?}", name, account, owners);
                per_index[owners[0]] += 1;
            }
            assert!(per_index.iter().all(|n| *n > 0), "{}: {:?}", name, per_index);
        }
    }

    #[test]
    fn test_modulo_negative_remainder_lands_on_absolute_index() {
        let filters: Vec<_> = (0..3)
            .map(|index| filter_with(MembershipSnapshot::assigned(members(3), index), "modulo"))
            .collect();
        // Account hashes to i32::MIN: raw remainder -2, run by index 2.
        let agent = agent("polygenelubricants");
        let owners: Vec<bool> = filters.iter().map(|f| f.owns(&agent)).collect();
        assert_eq!(owners, vec![false, false, true]);
    }

    #[test]
    fn test_snapshot_swap_is_visible_to_filter() {
        let cell = Arc::new(ArcSwap::from_pointee(MembershipSnapshot::UNINITIALIZED));
        let filter = ReplicaShardingFilter::new(
            cell.clone(),
            key::by_name("region"),
            strategy::by_name("jump"),
        );
        assert_eq!(filter.replica_count(), 0);
        assert_eq!(filter.replica_index(), -1);

        cell.store(Arc::new(MembershipSnapshot::assigned(members(4), 2)));
        assert_eq!(filter.replica_count(), 4);
        assert_eq!(filter.replica_index(), 2);
        assert_eq!(filter.strategy_name(), "jump");
        assert_eq!(filter.key_name(), "region");
    }

    #[test]
    fn test_owns_agent_type_uses_type_only_stub() {
        let filters: Vec<_> = (0..3)
            .map(|index| {
                ReplicaShardingFilter::new(
                    Arc::new(ArcSwap::from_pointee(MembershipSnapshot::assigned(members(3), index))),
                    key::by_name("agent-type"),
                    strategy::by_name("canonical-modulo"),
                )
            })
            .collect();
        let owners = filters
            .iter()
            .filter(|f| f.owns_agent_type("prod/us-east-1/ClusterCachingAgent"))
            .count();
        assert_eq!(owners, 1);
    }

    #[test]
    fn test_noop_filter_owns_everything() {
        let filter = NoopShardingFilter;
        assert!(filter.owns(&agent("acct-1")));
        assert!(filter.owns_agent_type("anything"));
    }
}
