use std::sync::Arc;

use crate::{AgentDescriptor, Error};

pub const DEFAULT_KEY_NAME: &str = "account";

/// Derives the shard key for an agent.
///
/// Extractors are total: a missing field yields an empty key, which still
/// maps to exactly one owner.
pub trait ShardingKeyExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract_key(&self, agent: &AgentDescriptor) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AccountKeyExtractor;

impl ShardingKeyExtractor for AccountKeyExtractor {
    fn name(&self) -> &'static str {
        "account"
    }

    fn extract_key(&self, agent: &AgentDescriptor) -> String {
        agent.account().unwrap_or_default().to_string()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RegionKeyExtractor;

impl ShardingKeyExtractor for RegionKeyExtractor {
    fn name(&self) -> &'static str {
        "region"
    }

    fn extract_key(&self, agent: &AgentDescriptor) -> String {
        agent.region().unwrap_or_default().to_string()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AgentTypeKeyExtractor;

impl ShardingKeyExtractor for AgentTypeKeyExtractor {
    fn name(&self) -> &'static str {
        "agent-type"
    }

    fn extract_key(&self, agent: &AgentDescriptor) -> String {
        agent.agent_type().to_string()
    }
}

type ExtractorFactory = fn() -> Arc<dyn ShardingKeyExtractor>;

fn account() -> Arc<dyn ShardingKeyExtractor> {
    Arc::new(AccountKeyExtractor)
}

fn region() -> Arc<dyn ShardingKeyExtractor> {
    Arc::new(RegionKeyExtractor)
}

fn agent_type() -> Arc<dyn ShardingKeyExtractor> {
    Arc::new(AgentTypeKeyExtractor)
}

const EXTRACTORS: &[(&str, ExtractorFactory)] = &[
    ("account", account),
    ("region", region),
    ("agent-type", agent_type),
];

/// Names accepted by [`by_name`].
pub fn known_names() -> impl Iterator<Item = &'static str> {
    EXTRACTORS.iter().map(|(name, _)| *name)
}

/// Resolve an extractor by configuration name.
pub fn try_by_name(name: &str) -> Result<Arc<dyn ShardingKeyExtractor>, Error> {
    let wanted = name.trim().to_ascii_lowercase();
    EXTRACTORS
        .iter()
        .find(|(known, _)| *known == wanted)
        .map(|(_, factory)| factory())
        .ok_or_else(|| Error::Config(format!("unknown sharding key '{}'", name)))
}

/// Resolve an extractor by configuration name, falling back to `account`.
pub fn by_name(name: &str) -> Arc<dyn ShardingKeyExtractor> {
    try_by_name(name).unwrap_or_else(|e| {
        tracing::warn!(fallback = DEFAULT_KEY_NAME, "{}, using fallback", e);
        account()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentDescriptor {
        AgentDescriptor::new("aws", "prod/us-west-2/ClusterCachingAgent")
            .with_account("prod")
            .with_region("us-west-2")
    }

    #[test]
    fn test_extractors_read_their_field() {
        assert_eq!(AccountKeyExtractor.extract_key(&agent()), "prod");
        assert_eq!(RegionKeyExtractor.extract_key(&agent()), "us-west-2");
        assert_eq!(
            AgentTypeKeyExtractor.extract_key(&agent()),
            "prod/us-west-2/ClusterCachingAgent"
        );
    }

    #[test]
    fn test_missing_field_yields_empty_key() {
        let bare = AgentDescriptor::type_only("SomeAgent");
        assert_eq!(AccountKeyExtractor.extract_key(&bare), "");
        assert_eq!(RegionKeyExtractor.extract_key(&bare), "");
    }

    #[test]
    fn test_by_name_resolves_every_known_name() {
        for name in known_names() {
            assert_eq!(by_name(name).name(), name);
        }
        assert_eq!(by_name(" Agent-Type ").name(), "agent-type");
    }

    #[test]
    fn test_try_by_name_reports_unknown_key() {
        assert!(try_by_name("region").is_ok());
        assert!(matches!(try_by_name("cluster"), Err(Error::Config(_))));
    }

    #[test]
    fn test_by_name_unknown_falls_back_to_account() {
        assert_eq!(by_name("cluster").name(), "account");
        assert_eq!(by_name("").name(), "account");
    }
}
