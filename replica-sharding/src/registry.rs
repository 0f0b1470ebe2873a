use async_trait::async_trait;
use sqlx::PgPool;

use crate::Error;

pub const DEFAULT_TABLE: &str = "caching_replicas";

/// One live replica as stored in the shared registry.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ReplicaRecord {
    pub replica_id: String,
    /// Epoch milliseconds after which peers may prune this record.
    #[sqlx(rename = "last_heartbeat_expiry")]
    pub heartbeat_expires_at: i64,
}

impl ReplicaRecord {
    pub fn new(replica_id: impl Into<String>, heartbeat_expires_at: i64) -> Self {
        Self {
            replica_id: replica_id.into(),
            heartbeat_expires_at,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.heartbeat_expires_at < now_ms
    }
}

/// Shared store that replicas use as their rendezvous point.
///
/// Every error is treated as transient by callers.
#[async_trait]
pub trait MembershipRegistry: Send + Sync {
    /// Insert the record for `replica_id`, or move its expiry if it exists.
    async fn upsert_heartbeat(&self, replica_id: &str, expires_at: i64) -> Result<(), Error>;

    /// Delete the record only if its expiry still equals `observed_expires_at`.
    ///
    /// Returns `false` when the record was renewed or removed in the meantime.
    async fn delete_if_expired(
        &self,
        replica_id: &str,
        observed_expires_at: i64,
    ) -> Result<bool, Error>;

    /// All records ordered by `replica_id`, byte-wise ascending.
    async fn list_all_sorted_by_id(&self) -> Result<Vec<ReplicaRecord>, Error>;
}

/// PostgreSQL-backed registry.
///
/// Works through transaction-mode poolers since it only issues single
/// statements.
#[derive(Clone)]
pub struct PgMembershipRegistry {
    pool: PgPool,
    table: String,
}

impl PgMembershipRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self::with_table(pool, DEFAULT_TABLE)
    }

    /// Use a namespaced table, e.g. from [`crate::ShardingConfig::table_name`].
    ///
    /// The name is interpolated into SQL, so it must come from validated config.
    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl MembershipRegistry for PgMembershipRegistry {
    async fn upsert_heartbeat(&self, replica_id: &str, expires_at: i64) -> Result<(), Error> {
        sqlx::query(&format!(
            "INSERT INTO {} (replica_id, last_heartbeat_expiry) VALUES ($1, $2) \
             ON CONFLICT (replica_id) DO UPDATE \
             SET last_heartbeat_expiry = EXCLUDED.last_heartbeat_expiry",
            self.table
        ))
        .bind(replica_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_if_expired(
        &self,
        replica_id: &str,
        observed_expires_at: i64,
    ) -> Result<bool, Error> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE replica_id = $1 AND last_heartbeat_expiry = $2",
            self.table
        ))
        .bind(replica_id)
        .bind(observed_expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_all_sorted_by_id(&self) -> Result<Vec<ReplicaRecord>, Error> {
        // COLLATE "C" keeps the order byte-wise regardless of database locale.
        let rows: Vec<ReplicaRecord> = sqlx::query_as(&format!(
            "SELECT replica_id, last_heartbeat_expiry FROM {} \
             ORDER BY replica_id COLLATE \"C\"",
            self.table
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
