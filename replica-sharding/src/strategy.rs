//! Ownership strategies: map a shard key and a replica count to an owner index.
//!
//! | Strategy           | Range            | Keys moved on `n -> n+1` |
//! |--------------------|------------------|--------------------------|
//! | `modulo`           | `(-n, n)` raw    | nearly all               |
//! | `canonical-modulo` | `[0, n)`         | nearly all               |
//! | `jump`             | `[0, n)`         | about `1/(n+1)`          |
//!
//! All three hash keys with [`legacy_string_hash`] so that owner assignments
//! stay identical to fleets already running the legacy scheme. Ownership is
//! decided on [`ShardingStrategy::owner_index`], which folds the raw `modulo`
//! remainder onto `[0, n)` the same way the legacy placement did.

use std::sync::Arc;

use crate::Error;

pub const DEFAULT_STRATEGY_NAME: &str = "modulo";

pub trait ShardingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Raw owner for `key`. Callers guarantee `replica_count > 0`.
    fn compute_owner(&self, key: &str, replica_count: u32) -> i32;

    /// Replica index that runs `key`, always in `[0, replica_count)`.
    ///
    /// Negative raw owners map to their absolute value (`|hash % n|`).
    fn owner_index(&self, key: &str, replica_count: u32) -> i32 {
        self.compute_owner(key, replica_count).abs()
    }
}

/// 32-bit polynomial string hash (`h = 31 * h + unit`) over UTF-16 code units.
pub fn legacy_string_hash(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

fn bucket_count(replica_count: u32) -> i32 {
    i32::try_from(replica_count).unwrap_or(i32::MAX).max(1)
}

/// Signed remainder of the legacy hash.
///
/// Keys with a negative hash get a negative raw owner. [`owner_index`]
/// folds it to `|hash % n|`, which is where existing fleets place those keys.
///
/// [`owner_index`]: ShardingStrategy::owner_index
#[derive(Debug, Default, Clone, Copy)]
pub struct ModuloStrategy;

impl ShardingStrategy for ModuloStrategy {
    fn name(&self) -> &'static str {
        "modulo"
    }

    fn compute_owner(&self, key: &str, replica_count: u32) -> i32 {
        legacy_string_hash(key) % bucket_count(replica_count)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CanonicalModuloStrategy;

impl ShardingStrategy for CanonicalModuloStrategy {
    fn name(&self) -> &'static str {
        "canonical-modulo"
    }

    fn compute_owner(&self, key: &str, replica_count: u32) -> i32 {
        legacy_string_hash(key).rem_euclid(bucket_count(replica_count))
    }
}

/// Jump consistent hash (Lamping & Veach), seeded with the sign-extended legacy hash.
#[derive(Debug, Default, Clone, Copy)]
pub struct JumpStrategy;

impl JumpStrategy {
    const LCG_MULTIPLIER: u64 = 2_862_933_555_777_941_757;

    pub fn bucket(seed: u64, buckets: i32) -> i32 {
        let mut state = seed;
        let mut candidate: i32 = 0;
        loop {
            state = state.wrapping_mul(Self::LCG_MULTIPLIER).wrapping_add(1);
            let step = ((state >> 33) + 1) as f64 / (1u64 << 31) as f64;
            // Float to int casts saturate, so a tiny step ends the walk.
            let next = (f64::from(candidate + 1) / step) as i32;
            if (0..buckets).contains(&next) {
                candidate = next;
            } else {
                return candidate;
            }
        }
    }
}

impl ShardingStrategy for JumpStrategy {
    fn name(&self) -> &'static str {
        "jump"
    }

    fn compute_owner(&self, key: &str, replica_count: u32) -> i32 {
        let seed = i64::from(legacy_string_hash(key)) as u64;
        Self::bucket(seed, bucket_count(replica_count))
    }
}

type StrategyFactory = fn() -> Arc<dyn ShardingStrategy>;

fn modulo() -> Arc<dyn ShardingStrategy> {
    Arc::new(ModuloStrategy)
}

fn canonical_modulo() -> Arc<dyn ShardingStrategy> {
    Arc::new(CanonicalModuloStrategy)
}

fn jump() -> Arc<dyn ShardingStrategy> {
    Arc::new(JumpStrategy)
}

const STRATEGIES: &[(&str, StrategyFactory)] = &[
    ("modulo", modulo),
    ("canonical-modulo", canonical_modulo),
    ("jump", jump),
];

/// Names accepted by [`by_name`].
pub fn known_names() -> impl Iterator<Item = &'static str> {
    STRATEGIES.iter().map(|(name, _)| *name)
}

/// Resolve a strategy by configuration name.
pub fn try_by_name(name: &str) -> Result<Arc<dyn ShardingStrategy>, Error> {
    let wanted = name.trim().to_ascii_lowercase();
    STRATEGIES
        .iter()
        .find(|(known, _)| *known == wanted)
        .map(|(_, factory)| factory())
        .ok_or_else(|| Error::Config(format!("unknown sharding strategy '{}'", name)))
}

/// Resolve a strategy by configuration name, falling back to `modulo`.
pub fn by_name(name: &str) -> Arc<dyn ShardingStrategy> {
    try_by_name(name).unwrap_or_else(|e| {
        tracing::warn!(fallback = DEFAULT_STRATEGY_NAME, "{}, using fallback", e);
        modulo()
    })
}
