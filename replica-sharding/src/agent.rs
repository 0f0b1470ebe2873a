//! Agent descriptors as seen by the sharding layer.
//!
//! The sharding core never runs agents. It only reads the handful of fields
//! that key extractors and the core-provider bypass need.

/// Provider name whose agents run on every replica.
pub const CORE_PROVIDER_NAME: &str = "CoreProvider";

/// Provider name used when only an agent type string is known.
pub const UNKNOWN_PROVIDER_NAME: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDescriptor {
    provider_name: String,
    agent_type: String,
    account: Option<String>,
    region: Option<String>,
    core_provider: bool,
}

impl AgentDescriptor {
    pub fn new(provider_name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            agent_type: agent_type.into(),
            account: None,
            region: None,
            core_provider: false,
        }
    }

    /// Stub for ownership checks where only the agent type is available
    /// (e.g. cleanup of agents this process never registered).
    pub fn type_only(agent_type: impl Into<String>) -> Self {
        Self::new(UNKNOWN_PROVIDER_NAME, agent_type)
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Mark the agent as belonging to a core provider, exempting it from sharding.
    pub fn core(mut self) -> Self {
        self.core_provider = true;
        self
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn is_core_provider(&self) -> bool {
        self.core_provider || self.provider_name == CORE_PROVIDER_NAME
    }
}
