use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use uuid::Uuid;

use crate::{key, registry, strategy, ShardingKeyExtractor, ShardingStrategy};

pub const DEFAULT_REPLICA_TTL_SECS: u64 = 60;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

const MAX_TABLE_SUFFIX_LEN: usize = 32;

static DEFAULT_REPLICA_ID: OnceLock<String> = OnceLock::new();

/// Sharding options. Every field has a default, so partial config works.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ShardingConfig {
    pub enabled: bool,
    pub strategy: String,
    pub sharding_key: String,
    pub replica_ttl_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    /// Namespaces the registry table so independent groups can coexist.
    pub table_suffix: Option<String>,
    pub replica_id: Option<String>,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: strategy::DEFAULT_STRATEGY_NAME.to_string(),
            sharding_key: key::DEFAULT_KEY_NAME.to_string(),
            replica_ttl_seconds: DEFAULT_REPLICA_TTL_SECS,
            heartbeat_interval_seconds: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            table_suffix: None,
            replica_id: None,
        }
    }
}

impl ShardingConfig {
    /// Load from `SHARDING_*` and `REPLICA_ID` environment variables.
    ///
    /// Unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: parse_env("SHARDING_ENABLED", defaults.enabled),
            strategy: env::var("SHARDING_STRATEGY").unwrap_or(defaults.strategy),
            sharding_key: env::var("SHARDING_KEY").unwrap_or(defaults.sharding_key),
            replica_ttl_seconds: parse_env(
                "SHARDING_REPLICA_TTL_SECONDS",
                defaults.replica_ttl_seconds,
            ),
            heartbeat_interval_seconds: parse_env(
                "SHARDING_HEARTBEAT_INTERVAL_SECONDS",
                defaults.heartbeat_interval_seconds,
            ),
            table_suffix: env::var("SHARDING_TABLE_SUFFIX").ok().filter(|s| !s.is_empty()),
            replica_id: env::var("REPLICA_ID").ok().filter(|s| !s.is_empty()),
        }
    }

    /// Apply fallbacks for values that would break the heartbeat protocol.
    pub fn validated(mut self) -> Self {
        if self.heartbeat_interval_seconds == 0 {
            tracing::warn!(
                fallback = DEFAULT_HEARTBEAT_INTERVAL_SECS,
                "Heartbeat interval must be positive, using default"
            );
            self.heartbeat_interval_seconds = DEFAULT_HEARTBEAT_INTERVAL_SECS;
        }

        // A single missed heartbeat must not get a live replica pruned.
        let min_ttl = self.heartbeat_interval_seconds.saturating_mul(2);
        if self.replica_ttl_seconds < min_ttl {
            tracing::warn!(
                ttl_secs = self.replica_ttl_seconds,
                interval_secs = self.heartbeat_interval_seconds,
                adjusted_ttl_secs = min_ttl,
                "Replica TTL too short for heartbeat interval, raising it"
            );
            self.replica_ttl_seconds = min_ttl;
        }

        if let Some(suffix) = &self.table_suffix {
            if !is_valid_table_suffix(suffix) {
                tracing::warn!(
                    table_suffix = %suffix,
                    "Invalid table suffix (expected [a-z0-9_], max 32 chars), ignoring"
                );
                self.table_suffix = None;
            }
        }

        self
    }

    pub fn replica_ttl(&self) -> Duration {
        Duration::from_secs(self.replica_ttl_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn table_name(&self) -> String {
        match &self.table_suffix {
            Some(suffix) => format!("{}_{}", registry::DEFAULT_TABLE, suffix),
            None => registry::DEFAULT_TABLE.to_string(),
        }
    }

    pub fn resolve_strategy(&self) -> Arc<dyn ShardingStrategy> {
        strategy::by_name(&self.strategy)
    }

    pub fn resolve_key_extractor(&self) -> Arc<dyn ShardingKeyExtractor> {
        key::by_name(&self.sharding_key)
    }

    /// Configured replica id, or the process-wide generated one.
    pub fn resolved_replica_id(&self) -> String {
        self.replica_id
            .clone()
            .unwrap_or_else(|| default_replica_id().to_string())
    }
}

/// Process-wide replica id: `REPLICA_ID`, else `{HOSTNAME or "local"}-{8 hex chars}`.
///
/// The random part keeps a restarted pod with a reused hostname from
/// inheriting its predecessor's row.
pub fn default_replica_id() -> &'static str {
    DEFAULT_REPLICA_ID.get_or_init(|| {
        if let Some(explicit) = env::var("REPLICA_ID").ok().filter(|s| !s.is_empty()) {
            return explicit;
        }
        let host = env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "local".to_string());
        let uuid = Uuid::new_v4().simple().to_string();
        format!("{}-{}", host, &uuid[..8])
    })
}

fn is_valid_table_suffix(suffix: &str) -> bool {
    !suffix.is_empty()
        && suffix.len() <= MAX_TABLE_SUFFIX_LEN
        && suffix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

fn parse_env<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "Unparsable config value, using default");
            default
        }),
        Err(_) => default,
    }
}
