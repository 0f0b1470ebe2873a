//! Coordinator-free sharding of caching agents across a dynamic replica fleet.
//!
//! This crate provides:
//! - Heartbeat-based membership through a shared table (no leader, no locks)
//! - Pluggable ownership strategies (`modulo`, `canonical-modulo`, `jump`)
//! - Pluggable shard keys (`account`, `region`, `agent-type`)
//! - Lock-free ownership checks against an atomically swapped snapshot
//! - Pass-through degraded mode: when membership is unknown, every replica
//!   runs every agent rather than risk an agent running nowhere
//!
//! # Example
//!
//! ```rust,ignore
//! use replica_sharding::{AgentDescriptor, PgMembershipRegistry, ShardingConfig, ShardingCoordinator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ShardingConfig::from_env().validated();
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     // Optional: provisioning normally creates the table
//!     replica_sharding::setup(&pool, &config.table_name()).await?;
//!
//!     let registry = Arc::new(PgMembershipRegistry::with_table(pool, config.table_name()));
//!     let coordinator = ShardingCoordinator::start(registry, &config).await;
//!
//!     let agent = AgentDescriptor::new("aws", "prod/us-east-1/ClusterCachingAgent")
//!         .with_account("prod")
//!         .with_region("us-east-1");
//!     if coordinator.owns(&agent) {
//!         // Run the agent
//!     }
//!
//!     // Removes this replica's record so peers rebalance right away
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Failure Detection
//!
//! - **Graceful shutdown**: peers see the smaller fleet on their next refresh
//! - **Crash/kill -9**: peers prune the record once its TTL passes
//!   (default 60s, at least twice the heartbeat interval)
//!
//! During membership changes two replicas may briefly both own an agent, or
//! briefly neither. Agents must tolerate that.

mod agent;
mod config;
mod coordinator;
mod error;
mod filter;
pub mod key;
mod memory;
mod registry;
pub mod strategy;
mod tracker;

pub use agent::{AgentDescriptor, CORE_PROVIDER_NAME, UNKNOWN_PROVIDER_NAME};
pub use config::{default_replica_id, ShardingConfig};
pub use coordinator::{MembershipEvent, ShardingCoordinator};
pub use error::Error;
pub use filter::{NoopShardingFilter, ReplicaShardingFilter, ShardingFilter};
pub use key::ShardingKeyExtractor;
pub use memory::InMemoryRegistry;
pub use registry::{MembershipRegistry, PgMembershipRegistry, ReplicaRecord, DEFAULT_TABLE};
pub use strategy::ShardingStrategy;
pub use tracker::{MembershipChange, MembershipSnapshot, MembershipTracker, RefreshOutcome};

use sqlx::PgPool;

/// Create the registry table if it doesn't exist.
///
/// Safe to call multiple times (uses IF NOT EXISTS). `table` is interpolated
/// into SQL and must come from [`ShardingConfig::table_name`].
///
/// # Example
///
/// ```rust,ignore
/// replica_sharding::setup(&pool, "caching_replicas").await?;
/// ```
pub async fn setup(pool: &PgPool, table: &str) -> Result<(), Error> {
    sqlx::query(&schema_table_sql(table)).execute(pool).await?;
    Ok(())
}

/// `CREATE TABLE` statement for a registry table.
pub fn schema_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    \
         replica_id TEXT PRIMARY KEY,\n    \
         last_heartbeat_expiry BIGINT NOT NULL\n)",
        table
    )
}
